use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::{codecs::jpeg::JpegEncoder, ImageFormat};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{data_url, MediaType, NormalizedImage, Preview, UploadCandidate, MAX_IMAGE_BYTES};

/// JPEG quality used when transcoding camera formats.
pub const TRANSCODE_QUALITY: u8 = 90;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("Please upload a PNG, JPG, or HEIC image. Other formats are not supported.")]
    UnsupportedType,
    #[error("Failed to convert HEIC image. Please convert to JPG or PNG and try again.")]
    TranscodeFailed { reason: String },
    #[error("Image too large. Maximum size is 4MB.")]
    TooLarge { size: usize },
    #[error("Failed to read image file")]
    PreviewFailed,
    #[error("Failed to process image. Please try a different file.")]
    Processing { reason: String },
}

/// Converts a camera-format upload into JPEG bytes.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn to_jpeg(&self, bytes: Bytes, quality: u8) -> Result<Bytes, NormalizationError>;
}

/// Transcoder backed by the `image` crate decoders. It can only handle
/// containers one of the enabled decoders understands; anything else
/// surfaces as `TranscodeFailed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageTranscoder;

#[async_trait]
impl Transcoder for ImageTranscoder {
    async fn to_jpeg(&self, bytes: Bytes, quality: u8) -> Result<Bytes, NormalizationError> {
        tokio::task::spawn_blocking(move || {
            let decoded = image::load_from_memory(&bytes)
                .map_err(|e| NormalizationError::TranscodeFailed { reason: e.to_string() })?;
            let rgb = decoded.to_rgb8();
            let mut out = Vec::new();
            JpegEncoder::new_with_quality(&mut out, quality)
                .encode_image(&rgb)
                .map_err(|e| NormalizationError::TranscodeFailed { reason: e.to_string() })?;
            Ok(Bytes::from(out))
        })
        .await
        .map_err(|e| NormalizationError::Processing { reason: format!("transcode task: {}", e) })?
    }
}

#[derive(Clone)]
pub struct Normalizer {
    transcoder: Arc<dyn Transcoder>,
    lenient_preview: bool,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(Arc::new(ImageTranscoder))
    }
}

impl Normalizer {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self { transcoder, lenient_preview: false }
    }

    /// When set, an image whose preview cannot be rendered is accepted with
    /// `Preview::Unavailable` instead of failing with `PreviewFailed`.
    pub fn lenient_preview(mut self, lenient: bool) -> Self {
        self.lenient_preview = lenient;
        self
    }

    pub async fn normalize(&self, candidate: UploadCandidate) -> Result<NormalizedImage, NormalizationError> {
        let detected = detect_media_type(&candidate);
        debug!(
            file_name = %candidate.file_name,
            content_type = %candidate.content_type,
            size = candidate.bytes.len(),
            ?detected,
            "Normalizing upload"
        );
        let media_type = detected.ok_or(NormalizationError::UnsupportedType)?;

        let (bytes, media_type, file_name) = if media_type == MediaType::Heic {
            info!("HEIC upload '{}', converting to JPEG", candidate.file_name);
            let jpeg = self.transcoder.to_jpeg(candidate.bytes, TRANSCODE_QUALITY).await.map_err(|e| {
                warn!("HEIC conversion failed: {:?}", e);
                e
            })?;
            (jpeg, MediaType::Jpeg, jpeg_file_name(&candidate.file_name))
        } else {
            (candidate.bytes, media_type, candidate.file_name)
        };

        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(NormalizationError::TooLarge { size: bytes.len() });
        }

        let (media_type, preview) = match sniff_renderable(&bytes) {
            Some(actual) => (actual, Preview::DataUrl(data_url(actual.mime(), &bytes))),
            None if self.lenient_preview => {
                warn!("No preview for '{}', continuing without one", file_name);
                (media_type, Preview::Unavailable)
            }
            None => return Err(NormalizationError::PreviewFailed),
        };

        info!("Image ready: {} ({} bytes, {})", file_name, bytes.len(), media_type.mime());
        Ok(NormalizedImage { bytes, media_type, file_name, preview })
    }
}

/// The declared type is checked first; the extension is consulted as well
/// because browsers rarely declare HEIC correctly.
pub fn detect_media_type(candidate: &UploadCandidate) -> Option<MediaType> {
    let declared = MediaType::from_mime(&candidate.content_type);
    let by_name = MediaType::from_file_name(&candidate.file_name);
    if declared == Some(MediaType::Heic) || by_name == Some(MediaType::Heic) {
        return Some(MediaType::Heic);
    }
    declared.or(by_name)
}

fn sniff_renderable(bytes: &[u8]) -> Option<MediaType> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Png => Some(MediaType::Png),
        ImageFormat::Jpeg => Some(MediaType::Jpeg),
        _ => None,
    }
}

fn jpeg_file_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    for ext in [".heic", ".heif"] {
        if lower.ends_with(ext) {
            return format!("{}.jpg", &name[..name.len() - ext.len()]);
        }
    }
    name.to_string()
}
