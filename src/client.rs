use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream, StreamExt};
use reqwest::{
    multipart::{Form, Part},
    Client, StatusCode, Url,
};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    models::{
        decode_image_b64, truncate_for_log, AcceptedBody, ErrorBody, GenerationOutcome, GenerationRequest,
        ImmediateBody, JobHandle, StatusResponse,
    },
    sse::SseDecoder,
};

/// Upper bound for the submit call. The stream and status calls are not
/// bounded here; the observers own their lifetimes.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Shown whenever the backend gives us nothing more specific.
pub const GENERIC_ERROR: &str = "Uh oh. Something went wrong... Please try again or contact us.";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("status={status} body={body}")]
    Status { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(String),
}

/// Where the job handle for an accepted submission comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobHandleSource {
    /// The client-generated `session_id` doubles as the handle.
    Correlation,
    /// The 202 body carries `task_id` (or `session_id`).
    Server,
}

/// `data` payloads of a push subscription, in arrival order.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<String, BackendError>> + Send>>;

/// Everything the core needs from the card backend.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Exactly one network call; never fails, failures become `Rejected`.
    async fn submit(&self, request: &GenerationRequest) -> GenerationOutcome;
    async fn subscribe(&self, job: &JobHandle) -> Result<EventStream, BackendError>;
    async fn status(&self, job: &JobHandle) -> Result<StatusResponse, BackendError>;
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    job_handles: JobHandleSource,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, job_handles: JobHandleSource) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client: Client::new(), base_url, job_handles }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base}/{endpoint}/{job}`, with the job id escaped as one path segment.
    fn job_url(&self, endpoint: &str, job: &JobHandle) -> Result<Url, BackendError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| BackendError::Http(format!("invalid base url '{}': {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| BackendError::Http(format!("base url '{}' cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .push(endpoint)
            .push(&job.0);
        Ok(url)
    }

    fn multipart(request: &GenerationRequest) -> Result<Form, reqwest::Error> {
        let image = Part::bytes(request.image.bytes.to_vec())
            .file_name(request.image.file_name.clone())
            .mime_str(request.image.media_type.mime())?;
        Ok(Form::new()
            .text("text", request.text.clone())
            .part("image", image)
            .text("session_id", request.correlation_id.to_string())
            .text("holiday_theme", request.holiday_theme.to_string()))
    }

    fn accepted(&self, request: &GenerationRequest, body: &str) -> GenerationOutcome {
        match self.job_handles {
            JobHandleSource::Correlation => GenerationOutcome::Accepted(JobHandle::from(request.correlation_id)),
            JobHandleSource::Server => {
                let parsed: AcceptedBody = if body.trim().is_empty() {
                    AcceptedBody::default()
                } else {
                    serde_json::from_str(body).unwrap_or_else(|e| {
                        warn!("Unreadable 202 body ({}): {}", e, truncate_for_log(body));
                        AcceptedBody::default()
                    })
                };
                match parsed.task_id.or(parsed.session_id) {
                    Some(id) if !id.is_empty() => GenerationOutcome::Accepted(JobHandle(id)),
                    _ => {
                        error!("❌ Backend accepted the job but returned no job id");
                        GenerationOutcome::Rejected(GENERIC_ERROR.to_string())
                    }
                }
            }
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpBackend {
    async fn submit(&self, request: &GenerationRequest) -> GenerationOutcome {
        let url = format!("{}/generate-hero-card", self.base_url);
        info!(
            "🔗 Submitting session {} to {} ({} bytes image, holiday_theme={})",
            request.correlation_id,
            url,
            request.image.size(),
            request.holiday_theme
        );

        let form = match Self::multipart(request) {
            Ok(form) => form,
            Err(e) => {
                error!("❌ Could not build multipart body: {}", e);
                return GenerationOutcome::Rejected(GENERIC_ERROR.to_string());
            }
        };

        let response = match self.client.post(&url).timeout(SUBMIT_TIMEOUT).multipart(form).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("❌ Submit failed: {}", e);
                return GenerationOutcome::Rejected(GENERIC_ERROR.to_string());
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        info!("📥 Submit response status: {}", status);

        if status == StatusCode::ACCEPTED {
            return self.accepted(request, &body);
        }

        if status.is_success() {
            let image = serde_json::from_str::<ImmediateBody>(&body)
                .map_err(|e| e.to_string())
                .and_then(|b| decode_image_b64(&b.image_base64).map_err(|e| e.to_string()));
            return match image {
                Ok(bytes) => {
                    info!("✅ Backend answered with an immediate card ({} bytes)", bytes.len());
                    GenerationOutcome::Immediate(bytes)
                }
                Err(e) => {
                    error!("❌ Unreadable immediate result: {}: {}", e, truncate_for_log(&body));
                    GenerationOutcome::Rejected(GENERIC_ERROR.to_string())
                }
            };
        }

        error!("❌ API Error response: status={} body={}", status, truncate_for_log(&body));
        let reason = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.error)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| GENERIC_ERROR.to_string());
        GenerationOutcome::Rejected(reason)
    }

    async fn subscribe(&self, job: &JobHandle) -> Result<EventStream, BackendError> {
        let url = self.job_url("stream", job)?;
        info!("🔗 Opening event stream: {}", url);
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status: status.as_u16(), body });
        }

        let mut decoder = SseDecoder::new();
        let events = response
            .bytes_stream()
            .map(move |chunk| match chunk {
                Ok(bytes) => match decoder.feed(&bytes) {
                    Ok(events) => events.into_iter().map(Ok).collect::<Vec<_>>(),
                    Err(e) => vec![Err(BackendError::Decode(e.to_string()))],
                },
                Err(e) => vec![Err(BackendError::Http(e.to_string()))],
            })
            .flat_map(stream::iter);
        Ok(Box::pin(events))
    }

    async fn status(&self, job: &JobHandle) -> Result<StatusResponse, BackendError> {
        let url = self.job_url("status", job)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BackendError::Http(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| BackendError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(BackendError::Status { status: status.as_u16(), body });
        }
        serde_json::from_str(&body)
            .map_err(|e| BackendError::Decode(format!("{}: {}", e, truncate_for_log(&body))))
    }
}
