use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    client::{GenerationBackend, HttpBackend, GENERIC_ERROR},
    config::Config,
    models::{FormUpdate, GenerationOutcome, UploadCandidate},
    normalize::{NormalizationError, Normalizer},
    observer::{observer_for, Observation, Observer},
    session::{CardDownload, Session, SessionError, SessionView, ViewState},
};

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Upload(#[from] NormalizationError),
}

/// Wires normalizer, backend and observer to one session. Every state
/// change goes through the session lock, which is never held across an
/// await, so updates apply one at a time in completion order.
#[derive(Clone)]
pub struct CardService {
    session: SharedSession,
    normalizer: Normalizer,
    backend: Arc<dyn GenerationBackend>,
    observer: Arc<dyn Observer>,
}

impl CardService {
    pub fn new(backend: Arc<dyn GenerationBackend>, observer: Arc<dyn Observer>) -> Self {
        Self { session: Arc::default(), normalizer: Normalizer::default(), backend, observer }
    }

    pub fn from_config(config: &Config) -> Self {
        let backend: Arc<dyn GenerationBackend> = Arc::new(HttpBackend::new(config.api_url.clone(), config.job_handles));
        let observer = observer_for(config.strategy, backend.clone());
        Self::new(backend, observer)
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn snapshot(&self) -> SessionView {
        self.session.lock().snapshot()
    }

    pub fn update_form(&self, update: FormUpdate) -> SessionView {
        let mut session = self.session.lock();
        if let Some(skills) = update.skills {
            session.set_skills(skills);
        }
        if let Some(message) = update.holiday_message {
            session.set_holiday_message(&message);
        }
        if let Some(on) = update.holiday_theme {
            session.set_holiday_theme(on);
        }
        session.snapshot()
    }

    /// Normalizes the file and hands the result to the session. A rejected
    /// file is recorded on the session and also returned as the error. A
    /// result that lands after a reset is discarded.
    pub async fn upload(&self, candidate: UploadCandidate) -> Result<SessionView, ServiceError> {
        let epoch = {
            let session = self.session.lock();
            if *session.view() != ViewState::Form {
                return Err(SessionError::Busy.into());
            }
            session.epoch()
        };
        let result = self.normalizer.normalize(candidate).await;
        let mut session = self.session.lock();
        if session.epoch() != epoch {
            debug!("Dropping upload that finished after a session reset");
            return Ok(session.snapshot());
        }
        session.image_selected(result.clone())?;
        result?;
        Ok(session.snapshot())
    }

    /// Submits the current form. Returns once the backend has answered; an
    /// accepted job keeps being observed in the background.
    pub async fn generate(&self) -> Result<SessionView, ServiceError> {
        let request = self.session.lock().begin_submit()?;
        let correlation_id = request.correlation_id;
        let mut guard = SubmitGuard { session: &self.session, correlation_id, armed: true };

        let outcome = self.backend.submit(&request).await;
        guard.armed = false;
        let job = self.session.lock().apply_outcome(correlation_id, outcome);

        if let Some(job) = job {
            info!("📡 Observing job {} for request {}", job, correlation_id);
            let observation = self.observer.observe(job);
            let attached = self.session.lock().attach_observation(correlation_id, observation.handle());
            if attached {
                tokio::spawn(pump(self.session.clone(), correlation_id, observation));
            }
        }
        Ok(self.snapshot())
    }

    pub fn regenerate(&self) -> SessionView {
        let mut session = self.session.lock();
        session.regenerate();
        session.snapshot()
    }

    pub fn dismiss_error(&self) -> SessionView {
        let mut session = self.session.lock();
        session.dismiss_error();
        session.snapshot()
    }

    pub fn download(&self) -> Option<CardDownload> {
        self.session.lock().download()
    }

    pub fn share_url(&self) -> Option<String> {
        self.session.lock().share_url()
    }

    /// Releases any live subscription or pending poll.
    pub fn shutdown(&self) {
        self.session.lock().regenerate();
    }
}

/// Resolves a submission whose future was dropped before the backend
/// answered, so the session does not stay in progress forever.
struct SubmitGuard<'a> {
    session: &'a SharedSession,
    correlation_id: Uuid,
    armed: bool,
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Submission {} abandoned before the backend answered", self.correlation_id);
            self.session
                .lock()
                .apply_outcome(self.correlation_id, GenerationOutcome::Rejected(GENERIC_ERROR.to_string()));
        }
    }
}

async fn pump(session: SharedSession, correlation_id: Uuid, mut observation: Observation) {
    while let Some(frame) = observation.next().await {
        let applied = session.lock().apply_frame(correlation_id, frame);
        if !applied {
            observation.cancel();
            break;
        }
    }
    debug!("Observation for request {} finished", correlation_id);
}
