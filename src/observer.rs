use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::StreamExt;
use tokio::{sync::mpsc, task::AbortHandle};
use tracing::{debug, error, info, warn};

use crate::{
    client::{GenerationBackend, GENERIC_ERROR},
    models::{decode_image_b64, truncate_for_log, FailureCause, JobHandle, ProgressFrame, StreamEvent},
};

pub const CONNECTION_ERROR: &str = "Connection error. Please try again.";
pub const TIMEOUT_ERROR: &str = "Generation is taking longer than expected. Please try again.";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_POLL_ATTEMPTS: u32 = 60;

/// How job completion is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverStrategy {
    Push,
    Poll { interval: Duration, max_attempts: u32 },
}

impl ObserverStrategy {
    pub fn poll() -> Self {
        ObserverStrategy::Poll { interval: DEFAULT_POLL_INTERVAL, max_attempts: DEFAULT_POLL_ATTEMPTS }
    }
}

/// Turns a job handle into a lazy, cancellable sequence of progress frames
/// that ends after the first terminal frame.
pub trait Observer: Send + Sync {
    fn observe(&self, job: JobHandle) -> Observation;
}

pub fn observer_for(strategy: ObserverStrategy, backend: Arc<dyn GenerationBackend>) -> Arc<dyn Observer> {
    match strategy {
        ObserverStrategy::Push => Arc::new(PushObserver::new(backend)),
        ObserverStrategy::Poll { interval, max_attempts } => Arc::new(PollObserver::new(backend, interval, max_attempts)),
    }
}

/// Cancels an observation from outside the task that consumes it.
#[derive(Debug, Clone)]
pub struct ObservationHandle {
    cancelled: Arc<AtomicBool>,
    task: AbortHandle,
}

impl ObservationHandle {
    /// Stops the producer (closing the subscription or dropping the pending
    /// poll) and guarantees no frame is handed out afterwards.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!("Observation cancelled");
        }
        self.task.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct Observation {
    frames: mpsc::UnboundedReceiver<ProgressFrame>,
    handle: ObservationHandle,
    finished: bool,
}

impl Observation {
    fn spawn<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(FrameSink) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, frames) = mpsc::unbounded_channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let sink = FrameSink { tx, cancelled: cancelled.clone() };
        let task = tokio::spawn(producer(sink));
        Self { frames, handle: ObservationHandle { cancelled, task: task.abort_handle() }, finished: false }
    }

    pub fn handle(&self) -> ObservationHandle {
        self.handle.clone()
    }

    /// Next frame in arrival order; `None` once a terminal frame has been
    /// returned or the observation was cancelled.
    pub async fn next(&mut self) -> Option<ProgressFrame> {
        if self.finished || self.handle.is_cancelled() {
            return None;
        }
        let frame = self.frames.recv().await;
        if self.handle.is_cancelled() {
            self.finish();
            return None;
        }
        match frame {
            Some(frame) => {
                if frame.is_terminal() {
                    self.finish();
                }
                Some(frame)
            }
            None => {
                self.finish();
                None
            }
        }
    }

    pub fn cancel(&mut self) {
        self.handle.cancel();
        self.finish();
    }

    fn finish(&mut self) {
        self.finished = true;
        self.frames.close();
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        self.handle.task.abort();
    }
}

/// Producer side of an observation.
struct FrameSink {
    tx: mpsc::UnboundedSender<ProgressFrame>,
    cancelled: Arc<AtomicBool>,
}

impl FrameSink {
    /// False once nobody is listening any more.
    fn send(&self, frame: ProgressFrame) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(frame).is_ok()
    }

    fn is_closed(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.tx.is_closed()
    }
}

fn failed(cause: FailureCause, message: impl Into<String>) -> ProgressFrame {
    ProgressFrame::Failed { cause, message: message.into() }
}

// --- Push ---

pub struct PushObserver {
    backend: Arc<dyn GenerationBackend>,
}

impl PushObserver {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }
}

impl Observer for PushObserver {
    fn observe(&self, job: JobHandle) -> Observation {
        let backend = self.backend.clone();
        Observation::spawn(move |sink| run_push(backend, job, sink))
    }
}

async fn run_push(backend: Arc<dyn GenerationBackend>, job: JobHandle, sink: FrameSink) {
    let mut events = match backend.subscribe(&job).await {
        Ok(events) => events,
        Err(e) => {
            error!("❌ Could not subscribe to job {}: {}", job, e);
            sink.send(failed(FailureCause::Transport, CONNECTION_ERROR));
            return;
        }
    };
    info!("📡 Subscribed to job {}", job);

    while let Some(item) = events.next().await {
        let raw = match item {
            Ok(raw) => raw,
            Err(e) => {
                error!("❌ Event stream error for job {}: {}", job, e);
                sink.send(failed(FailureCause::Transport, CONNECTION_ERROR));
                return;
            }
        };
        let Some(frame) = parse_push_message(&raw) else {
            continue;
        };
        let terminal = frame.is_terminal();
        if !sink.send(frame) || terminal {
            debug!("Closing event stream for job {}", job);
            return;
        }
    }

    warn!("Event stream for job {} ended without a result", job);
    sink.send(failed(FailureCause::Transport, CONNECTION_ERROR));
}

/// Maps one pushed message to a frame. Malformed or unknown messages are
/// logged and yield nothing.
pub fn parse_push_message(raw: &str) -> Option<ProgressFrame> {
    let event: StreamEvent = match serde_json::from_str(raw) {
        Ok(event) => event,
        Err(e) => {
            warn!("Ignoring malformed stream message ({}): {}", e, truncate_for_log(raw));
            return None;
        }
    };
    match event {
        StreamEvent::Partial { image_base64, partial_index } => match decode_image_b64(&image_base64) {
            Ok(image) => {
                info!("🖼️ Partial image {} ({} bytes)", partial_index, image.len());
                Some(ProgressFrame::Partial { image, index: partial_index })
            }
            Err(e) => {
                warn!("Ignoring partial image with bad base64 ({}): {}", e, truncate_for_log(&image_base64));
                None
            }
        },
        StreamEvent::Complete { image_base64 } => match decode_image_b64(&image_base64) {
            Ok(image) => {
                info!("✅ Card complete ({} bytes)", image.len());
                Some(ProgressFrame::Complete { image })
            }
            Err(e) => {
                warn!("Ignoring final image with bad base64 ({}): {}", e, truncate_for_log(&image_base64));
                None
            }
        },
        StreamEvent::Error { message } => {
            let message = message.filter(|m| !m.trim().is_empty()).unwrap_or_else(|| GENERIC_ERROR.to_string());
            error!("❌ Backend reported failure: {}", message);
            Some(failed(FailureCause::Backend, message))
        }
        StreamEvent::Other => {
            debug!("Ignoring stream event: {}", truncate_for_log(raw));
            None
        }
    }
}

// --- Poll ---

pub struct PollObserver {
    backend: Arc<dyn GenerationBackend>,
    interval: Duration,
    max_attempts: u32,
}

impl PollObserver {
    pub fn new(backend: Arc<dyn GenerationBackend>, interval: Duration, max_attempts: u32) -> Self {
        Self { backend, interval, max_attempts }
    }
}

impl Observer for PollObserver {
    fn observe(&self, job: JobHandle) -> Observation {
        let backend = self.backend.clone();
        let (interval, max_attempts) = (self.interval, self.max_attempts);
        Observation::spawn(move |sink| run_poll(backend, job, interval, max_attempts, sink))
    }
}

/// Attempt `n` is issued `n * interval` after acceptance, counting from the
/// moment the previous attempt settled. No attempt past `max_attempts`.
async fn run_poll(
    backend: Arc<dyn GenerationBackend>,
    job: JobHandle,
    interval: Duration,
    max_attempts: u32,
    sink: FrameSink,
) {
    for attempt in 1..=max_attempts {
        tokio::time::sleep(interval).await;
        if sink.is_closed() {
            return;
        }

        let status = match backend.status(&job).await {
            Ok(status) => status,
            Err(e) => {
                error!("❌ Status request for job {} failed: {}", job, e);
                sink.send(failed(FailureCause::Transport, GENERIC_ERROR));
                return;
            }
        };

        match status.status.as_str() {
            "complete" => match status.image_base64.as_deref().map(decode_image_b64) {
                Some(Ok(image)) => {
                    info!("✅ Job {} complete after {} attempts", job, attempt);
                    sink.send(ProgressFrame::Complete { image });
                    return;
                }
                Some(Err(e)) => {
                    error!("❌ Job {} complete but image is unreadable: {}", job, e);
                    sink.send(failed(FailureCause::Backend, GENERIC_ERROR));
                    return;
                }
                None => debug!("Job {} complete without an image yet", job),
            },
            "error" => {
                let message = status
                    .status_description
                    .filter(|d| !d.trim().is_empty())
                    .unwrap_or_else(|| GENERIC_ERROR.to_string());
                error!("❌ Job {} failed: {}", job, message);
                sink.send(failed(FailureCause::Backend, message));
                return;
            }
            other => debug!("Job {} is '{}' (attempt {}/{})", job, other, attempt, max_attempts),
        }
    }

    warn!("Job {} still running after {} attempts, giving up", job, max_attempts);
    sink.send(failed(FailureCause::Timeout, TIMEOUT_ERROR));
}
