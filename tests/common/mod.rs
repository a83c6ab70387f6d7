#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hero_card::client::{BackendError, EventStream, GenerationBackend};
use hero_card::models::{GenerationOutcome, GenerationRequest, JobHandle, StatusResponse};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

pub type PushSender = mpsc::UnboundedSender<Result<String, BackendError>>;

/// In-memory backend: scripted submit outcome, a push channel the test
/// feeds by hand, and a queue of status responses (pending once exhausted).
pub struct FakeBackend {
    outcome: Mutex<GenerationOutcome>,
    submitted: Mutex<Vec<GenerationRequest>>,
    push: Mutex<Option<mpsc::UnboundedReceiver<Result<String, BackendError>>>>,
    statuses: Mutex<VecDeque<Result<StatusResponse, BackendError>>>,
    status_calls: AtomicUsize,
    subscribed: Mutex<Vec<JobHandle>>,
    stall_submits: AtomicBool,
}

impl FakeBackend {
    pub fn new(outcome: GenerationOutcome) -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(outcome),
            submitted: Mutex::new(Vec::new()),
            push: Mutex::new(None),
            statuses: Mutex::new(VecDeque::new()),
            status_calls: AtomicUsize::new(0),
            subscribed: Mutex::new(Vec::new()),
            stall_submits: AtomicBool::new(false),
        })
    }

    pub fn accepting(job: &str) -> Arc<Self> {
        Self::new(GenerationOutcome::Accepted(JobHandle(job.to_string())))
    }

    pub fn push_channel(&self) -> PushSender {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.push.lock() = Some(rx);
        tx
    }

    /// Every later submit hangs without ever answering.
    pub fn stall_submits(&self) {
        self.stall_submits.store(true, Ordering::SeqCst);
    }

    pub fn script_statuses(&self, items: Vec<Result<StatusResponse, BackendError>>) {
        self.statuses.lock().extend(items);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<GenerationRequest> {
        self.submitted.lock().clone()
    }

    pub fn subscribed(&self) -> Vec<JobHandle> {
        self.subscribed.lock().clone()
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    async fn submit(&self, request: &GenerationRequest) -> GenerationOutcome {
        self.submitted.lock().push(request.clone());
        if self.stall_submits.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.outcome.lock().clone()
    }

    async fn subscribe(&self, job: &JobHandle) -> Result<EventStream, BackendError> {
        self.subscribed.lock().push(job.clone());
        let rx = self
            .push
            .lock()
            .take()
            .ok_or_else(|| BackendError::Http("connection refused".into()))?;
        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    async fn status(&self, _job: &JobHandle) -> Result<StatusResponse, BackendError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses.lock().pop_front().unwrap_or_else(|| Ok(pending()))
    }
}

pub fn pending() -> StatusResponse {
    StatusResponse { status: "pending".into(), image_base64: None, status_description: None }
}

pub fn status_complete(b64: &str) -> StatusResponse {
    StatusResponse { status: "complete".into(), image_base64: Some(b64.into()), status_description: None }
}

pub fn status_error(description: &str) -> StatusResponse {
    StatusResponse { status: "error".into(), image_base64: None, status_description: Some(description.into()) }
}

// "hi" / "done" / "p1" in base64
pub const HI_B64: &str = "aGk=";
pub const DONE_B64: &str = "ZG9uZQ==";

pub fn partial(index: u32) -> Result<String, BackendError> {
    Ok(json!({ "type": "partial", "image_base64": HI_B64, "partial_index": index }).to_string())
}

pub fn complete() -> Result<String, BackendError> {
    Ok(json!({ "type": "complete", "image_base64": DONE_B64 }).to_string())
}

pub fn backend_error(message: &str) -> Result<String, BackendError> {
    Ok(json!({ "type": "error", "message": message }).to_string())
}

pub fn png_bytes(side: u32) -> Bytes {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(side, side, image::Rgb([16, 191, 122])));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    Bytes::from(buf.into_inner())
}
