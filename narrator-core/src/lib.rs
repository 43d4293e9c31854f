pub mod device_map;
pub mod loader;
mod loader_factory;
mod util;

mod blip;
mod service;

pub use blip::{BlipLoader, BlipModel, BlipVariant};
pub use device_map::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
use serde::{Deserialize, Serialize};
pub use service::*;
pub use util::decode_upload;
pub(crate) use util::select_best_device;

/// Default cap on generated caption length, in tokens.
pub const DEFAULT_MAX_TOKENS: usize = 30;

/// Per-request generation options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptionRequest {
    /// Cap on the number of generated tokens; `None` uses [`DEFAULT_MAX_TOKENS`].
    pub max_tokens: Option<usize>,
}

/// A loaded captioning model: one decoded image in, one caption out.
///
/// Implementations must be safe for concurrent read-only use; anything the
/// underlying inference mutates per pass belongs behind interior locking.
pub trait CaptionModel: Send + Sync {
    fn caption(&self, image: &DynamicImage, request: &CaptionRequest) -> anyhow::Result<String>;
}
