use image::DynamicImage;
use thiserror::Error;
use tracing::debug;

use crate::{decode_upload, CaptionRequest, ModelHandle};

/// Why a caption request failed. These are results, not faults: nothing a
/// request does can take the process down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptionFailure {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("caption model is unavailable")]
    ModelUnavailable,
    #[error("caption generation failed: {0}")]
    Generation(String),
}

/// One-shot caption production against a previously acquired handle.
///
/// Single best-effort attempt per call: no retries (retry lives in the
/// loader), no caching, no state carried between requests.
pub struct CaptionService {
    handle: ModelHandle,
}

impl CaptionService {
    pub fn new(handle: ModelHandle) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    /// Captions a raw JPEG/PNG upload.
    pub fn caption_upload(
        &self,
        bytes: &[u8],
        request: &CaptionRequest,
    ) -> Result<String, CaptionFailure> {
        let image = decode_upload(bytes)?;
        self.caption_image(&image, request)
    }

    /// Captions an already-decoded image.
    pub fn caption_image(
        &self,
        image: &DynamicImage,
        request: &CaptionRequest,
    ) -> Result<String, CaptionFailure> {
        let model = match &self.handle {
            ModelHandle::Ready(model) => model,
            ModelHandle::Unavailable => return Err(CaptionFailure::ModelUnavailable),
        };

        let caption = model
            .caption(image, request)
            .map_err(|e| CaptionFailure::Generation(format!("{e:#}")))?;
        let caption = caption.trim();
        if caption.is_empty() {
            return Err(CaptionFailure::Generation(
                "model produced an empty caption".into(),
            ));
        }
        debug!(len = caption.len(), "caption produced");
        Ok(caption.to_string())
    }
}
