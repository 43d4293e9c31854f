use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use std::sync::Arc;
use tracing::info;

use crate::blip::BlipVariant;
use crate::{BlipLoader, CaptionModel, DeviceMap, Loader};

/// Enum of supported captioner families
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    Blip,
    // Add more families as they become available
}

impl ModelType {
    /// Detect model family from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        if model_name.to_uppercase().contains("BLIP") {
            Some(ModelType::Blip)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub enum ModelVariant {
    Blip(BlipVariant),
}

impl ModelVariant {
    /// Detect model variant from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("BLIP") {
            Some(ModelVariant::Blip(if name_upper.contains("LARGE") {
                BlipVariant::Large
            } else {
                BlipVariant::Base
            }))
        } else {
            None
        }
    }
}

/// Load a captioning model based on its name, automatically detecting the
/// appropriate loader. One acquisition attempt; retry belongs to the caller.
pub async fn load_captioner(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn CaptionModel>> {
    let model_type = ModelType::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported captioning model: {}", model_name))?;
    let model_variant = ModelVariant::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model variant: {}", model_name))?;

    info!(
        "Loading model: {} (detected type: {:?}/variant: {:?})",
        model_name, model_type, model_variant
    );

    match model_type {
        ModelType::Blip => {
            let model = BlipLoader::load(model_variant, api, device_map).await?;
            Ok(Arc::new(model))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_blip_variants_from_hub_names() {
        assert_eq!(
            ModelType::from_name("Salesforce/blip-image-captioning-large"),
            Some(ModelType::Blip)
        );
        assert!(matches!(
            ModelVariant::from_name("Salesforce/blip-image-captioning-large"),
            Some(ModelVariant::Blip(BlipVariant::Large))
        ));
        assert!(matches!(
            ModelVariant::from_name("Salesforce/blip-image-captioning-base"),
            Some(ModelVariant::Blip(BlipVariant::Base))
        ));
        assert!(ModelVariant::from_name("google/t5-v1_1-xxl").is_none());
    }
}
