use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_with::skip_serializing_none;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    models::{data_url, GenerationOutcome, GenerationRequest, JobHandle, NormalizedImage, Preview, ProgressFrame},
    normalize::NormalizationError,
    observer::ObservationHandle,
};

pub const HOLIDAY_MESSAGE_MAX_CHARS: usize = 30;

/// Download names are `rails-hero-<unix millis>.png` in both themes.
pub const DOWNLOAD_PREFIX: &str = "rails-hero";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Please fill in your main skills and upload an image")]
    MissingSkillsInput,
    #[error("Please add a holiday message and upload an image")]
    MissingHolidayInput,
    #[error("A card is already being generated")]
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialPreview {
    pub image: Bytes,
    pub index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ViewState {
    /// Shows the form, with `Session::error` when the last attempt failed.
    #[default]
    Form,
    InProgress { latest: Option<PartialPreview> },
    Result { image: Bytes },
}

/// The only owner of what the visitor sees. Normalizer, submitter and
/// observer results reach it through the methods below, tagged with the
/// correlation id they belong to so late arrivals from an abandoned attempt
/// are dropped.
#[derive(Debug, Default)]
pub struct Session {
    skills: String,
    holiday_message: String,
    holiday_theme: bool,
    image: Option<NormalizedImage>,
    view: ViewState,
    error: Option<String>,
    correlation_id: Option<Uuid>,
    observation: Option<ObservationHandle>,
    /// Bumped by every reset; lets slow work started earlier detect it.
    epoch: u64,
}

#[derive(Debug, Clone)]
pub struct CardDownload {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Bytes,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn image(&self) -> Option<&NormalizedImage> {
        self.image.as_ref()
    }

    pub fn skills(&self) -> &str {
        &self.skills
    }

    pub fn holiday_message(&self) -> &str {
        &self.holiday_message
    }

    pub fn holiday_theme(&self) -> bool {
        self.holiday_theme
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_observing(&self) -> bool {
        self.observation.is_some()
    }

    pub fn set_skills(&mut self, skills: impl Into<String>) {
        self.skills = skills.into();
    }

    /// Truncated to `HOLIDAY_MESSAGE_MAX_CHARS` characters.
    pub fn set_holiday_message(&mut self, message: &str) {
        self.holiday_message = message.chars().take(HOLIDAY_MESSAGE_MAX_CHARS).collect();
    }

    pub fn set_holiday_theme(&mut self, on: bool) {
        self.holiday_theme = on;
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }

    /// A new selection fully replaces the previous image; a rejected one
    /// leaves it in place and surfaces the message.
    pub fn image_selected(&mut self, result: Result<NormalizedImage, NormalizationError>) -> Result<(), SessionError> {
        if self.view != ViewState::Form {
            return Err(SessionError::Busy);
        }
        match result {
            Ok(image) => {
                self.image = Some(image);
                self.error = None;
            }
            Err(e) => {
                warn!("Upload rejected: {:?}", e);
                self.error = Some(e.to_string());
            }
        }
        Ok(())
    }

    /// Form → InProgress. Returns the request to hand to the submitter.
    pub fn begin_submit(&mut self) -> Result<GenerationRequest, SessionError> {
        if self.view != ViewState::Form {
            return Err(SessionError::Busy);
        }
        let text = if self.holiday_theme { &self.holiday_message } else { &self.skills };
        let image = match (&self.image, text.trim().is_empty()) {
            (Some(image), false) => image.clone(),
            _ => {
                let err = if self.holiday_theme {
                    SessionError::MissingHolidayInput
                } else {
                    SessionError::MissingSkillsInput
                };
                self.error = Some(err.to_string());
                return Err(err);
            }
        };

        let correlation_id = Uuid::new_v4();
        let request = GenerationRequest {
            text: text.clone(),
            image,
            correlation_id,
            holiday_theme: self.holiday_theme,
        };
        self.error = None;
        self.correlation_id = Some(correlation_id);
        self.view = ViewState::InProgress { latest: None };
        info!("🚀 Submitting card request {}", correlation_id);
        Ok(request)
    }

    fn is_current(&self, correlation_id: Uuid) -> bool {
        self.correlation_id == Some(correlation_id) && matches!(self.view, ViewState::InProgress { .. })
    }

    /// Applies the submitter's answer. Returns the job to observe when the
    /// backend accepted the request asynchronously.
    pub fn apply_outcome(&mut self, correlation_id: Uuid, outcome: GenerationOutcome) -> Option<JobHandle> {
        if !self.is_current(correlation_id) {
            debug!("Dropping outcome for stale request {}", correlation_id);
            return None;
        }
        match outcome {
            GenerationOutcome::Accepted(job) => Some(job),
            GenerationOutcome::Immediate(image) => {
                self.finish(image);
                None
            }
            GenerationOutcome::Rejected(reason) => {
                self.fail(reason);
                None
            }
        }
    }

    /// Takes ownership of the observation for `correlation_id`. A handle for
    /// an attempt that is no longer current is cancelled on the spot.
    pub fn attach_observation(&mut self, correlation_id: Uuid, handle: ObservationHandle) -> bool {
        if !self.is_current(correlation_id) {
            handle.cancel();
            return false;
        }
        if let Some(previous) = self.observation.replace(handle) {
            previous.cancel();
        }
        true
    }

    /// Returns false when the frame was dropped as stale.
    pub fn apply_frame(&mut self, correlation_id: Uuid, frame: ProgressFrame) -> bool {
        if !self.is_current(correlation_id) {
            debug!("Dropping frame for stale request {}", correlation_id);
            return false;
        }
        match frame {
            ProgressFrame::Partial { image, index } => {
                self.view = ViewState::InProgress { latest: Some(PartialPreview { image, index }) };
            }
            ProgressFrame::Complete { image } => self.finish(image),
            ProgressFrame::Failed { message, .. } => self.fail(message),
        }
        true
    }

    fn finish(&mut self, image: Bytes) {
        info!("✅ Card ready ({} bytes)", image.len());
        self.release_observation();
        self.view = ViewState::Result { image };
    }

    fn fail(&mut self, message: String) {
        warn!("Generation failed: {}", message);
        self.release_observation();
        self.correlation_id = None;
        self.error = Some(message);
        self.view = ViewState::Form;
    }

    fn release_observation(&mut self) {
        if let Some(handle) = self.observation.take() {
            handle.cancel();
        }
    }

    /// Back to the state of a fresh page load, from any view.
    pub fn regenerate(&mut self) {
        self.release_observation();
        let epoch = self.epoch.wrapping_add(1);
        *self = Session { epoch, ..Session::default() };
        info!("🔄 Session reset");
    }

    pub fn result_image(&self) -> Option<&Bytes> {
        match &self.view {
            ViewState::Result { image } => Some(image),
            _ => None,
        }
    }

    pub fn download(&self) -> Option<CardDownload> {
        self.download_at(Utc::now())
    }

    pub fn download_at(&self, at: DateTime<Utc>) -> Option<CardDownload> {
        let bytes = self.result_image()?.clone();
        Some(CardDownload {
            file_name: format!("{}-{}.png", DOWNLOAD_PREFIX, at.timestamp_millis()),
            content_type: "image/png",
            bytes,
        })
    }

    pub fn share_url(&self) -> Option<String> {
        let card = if self.holiday_theme { "holiday card" } else { "hero card" };
        let text = format!("Get your {} at https://fastruby.io", card);
        reqwest::Url::parse_with_params(
            "https://www.linkedin.com/feed/",
            &[("shareActive", "true"), ("mini", "true"), ("text", text.as_str())],
        )
        .ok()
        .map(|url| url.to_string())
    }

    pub fn snapshot(&self) -> SessionView {
        let (view, partial, result) = match &self.view {
            ViewState::Form => (ViewKind::Form, None, None),
            ViewState::InProgress { latest } => (ViewKind::InProgress, latest.as_ref(), None),
            ViewState::Result { image } => (ViewKind::Result, None, Some(data_url("image/png", image))),
        };
        SessionView {
            view,
            skills: self.skills.clone(),
            holiday_message: self.holiday_message.clone(),
            holiday_theme: self.holiday_theme,
            error: self.error.clone(),
            image_file_name: self.image.as_ref().map(|i| i.file_name.clone()),
            image_preview: self.image.as_ref().map(|i| i.preview.clone()),
            partial_image: partial.map(|p| data_url("image/png", &p.image)),
            partial_index: partial.map(|p| p.index),
            progress_caption: partial.map(|p| progress_caption(p.index)),
            result_image: result,
            correlation_id: self.correlation_id,
        }
    }
}

pub fn progress_caption(index: u32) -> &'static str {
    match index {
        1 => "Working on your masterpiece...",
        2 => "Making it really awesome, one pixel at a time...",
        _ => "Hang on just a little longer, perfecting the details...",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Form,
    InProgress,
    Result,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub view: ViewKind,
    pub skills: String,
    pub holiday_message: String,
    pub holiday_theme: bool,
    pub error: Option<String>,
    pub image_file_name: Option<String>,
    pub image_preview: Option<Preview>,
    pub partial_image: Option<String>,
    pub partial_index: Option<u32>,
    pub progress_caption: Option<&'static str>,
    pub result_image: Option<String>,
    pub correlation_id: Option<Uuid>,
}
