//! Incremental decoder for `text/event-stream` bodies.
//!
//! Only the `data` field matters to the card backend; `event`, `id` and
//! `retry` lines are accepted and dropped.

use thiserror::Error;

/// Longest line accepted while waiting for its newline. Card images arrive
/// base64-encoded on a single `data` line, so this sits well above the
/// normalized image cap.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("event stream line exceeds {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

#[derive(Debug)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
    max_line: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self { buf: Vec::new(), data: Vec::new(), max_line }
    }

    /// Feeds one network chunk and returns the `data` payload of every
    /// event completed by it, in arrival order. Fails once the unterminated
    /// tail grows past the line limit; the decoder is unusable afterwards.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, LineTooLong> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            if pos > self.max_line {
                return Err(self.overflow());
            }
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (&*line, ""),
            };
            if field == "data" {
                self.data.push(value.to_string());
            }
        }
        if self.buf.len() > self.max_line {
            return Err(self.overflow());
        }
        Ok(events)
    }

    fn overflow(&mut self) -> LineTooLong {
        self.buf = Vec::new();
        self.data.clear();
        LineTooLong { limit: self.max_line }
    }
}
