use std::fmt;

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hard cap on the normalized upload, checked after any transcoding.
pub const MAX_IMAGE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Png,
    Jpeg,
    /// HEIC/HEIF camera format; never survives normalization.
    Heic,
}

impl MediaType {
    pub fn mime(self) -> &'static str {
        match self {
            MediaType::Png => "image/png",
            MediaType::Jpeg => "image/jpeg",
            MediaType::Heic => "image/heic",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/png" => Some(MediaType::Png),
            "image/jpeg" | "image/jpg" => Some(MediaType::Jpeg),
            "image/heic" | "image/heif" => Some(MediaType::Heic),
            _ => None,
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some(MediaType::Png),
            "jpg" | "jpeg" => Some(MediaType::Jpeg),
            "heic" | "heif" => Some(MediaType::Heic),
            _ => None,
        }
    }
}

/// A file exactly as the visitor picked it.
#[derive(Debug, Clone)]
pub struct UploadCandidate {
    pub bytes: Bytes,
    /// Declared type; browsers often leave this empty for HEIC.
    pub content_type: String,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "data_url", rename_all = "snake_case")]
pub enum Preview {
    DataUrl(String),
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    pub bytes: Bytes,
    pub media_type: MediaType,
    pub file_name: String,
    pub preview: Preview,
}

impl NormalizedImage {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// One submit action. Built by the session, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub text: String,
    pub image: NormalizedImage,
    pub correlation_id: Uuid,
    pub holiday_theme: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for JobHandle {
    fn from(id: Uuid) -> Self {
        JobHandle(id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Accepted(JobHandle),
    Immediate(Bytes),
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// Subscription broke or a status request failed.
    Transport,
    /// Backend reported the job as failed.
    Backend,
    /// Poll budget ran out.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressFrame {
    Partial { image: Bytes, index: u32 },
    Complete { image: Bytes },
    Failed { cause: FailureCause, message: String },
}

impl ProgressFrame {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressFrame::Partial { .. })
    }
}

/// Partial form edit sent by the page; absent fields stay as they are.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FormUpdate {
    #[serde(default)]
    pub skills: Option<String>,
    #[serde(default)]
    pub holiday_message: Option<String>,
    #[serde(default)]
    pub holiday_theme: Option<bool>,
}

// --- Wire shapes ---

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ImmediateBody {
    pub image_base64: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AcceptedBody {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Partial {
        image_base64: String,
        #[serde(default)]
        partial_index: u32,
    },
    Complete {
        image_base64: String,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default)]
    pub status_description: Option<String>,
}

pub fn decode_image_b64(data: &str) -> Result<Bytes, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map(Bytes::from)
}

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

// Keeps image payloads out of the logs.
pub(crate) fn truncate_for_log(s: &str) -> String {
    if s.len() > 50 {
        let cut = (0..=50).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...[{} chars total]", &s[..cut], s.len())
    } else {
        s.to_string()
    }
}
