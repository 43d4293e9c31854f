use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::blip::{self, BlipForConditionalGeneration, VisionConfig};
use candle_transformers::models::blip_text;
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::loader_factory::ModelVariant;
use crate::{
    select_best_device, CaptionModel, CaptionRequest, DeviceMap, Loader, DEFAULT_MAX_TOKENS,
};

// BOS/SEP of the BERT vocabulary BLIP's text decoder generates over.
const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;

/// Hard bound on the decode loop regardless of the requested cap.
const DECODE_LIMIT: usize = 1000;

const IMAGE_SIZE: usize = 384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlipVariant {
    Base,
    Large,
}

impl BlipVariant {
    pub fn repo_id(self) -> &'static str {
        match self {
            BlipVariant::Base => "Salesforce/blip-image-captioning-base",
            BlipVariant::Large => "Salesforce/blip-image-captioning-large",
        }
    }

    fn config(self) -> blip::Config {
        match self {
            BlipVariant::Base => blip_base_config(),
            BlipVariant::Large => blip::Config::image_captioning_large(),
        }
    }
}

fn blip_base_config() -> blip::Config {
    let text_config = blip_text::Config {
        vocab_size: 30524,
        hidden_size: 768,
        encoder_hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 768,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        max_position_embeddings: 512,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-12,
        is_decoder: true,
    };
    let vision_config = VisionConfig {
        hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 512,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        image_size: 384,
        patch_size: 16,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-5,
    };

    blip::Config {
        text_config,
        vision_config,
        projection_dim: 512,
        image_text_hidden_size: 256,
    }
}

// The decoder KV cache and the sampler make a generation pass `&mut` even
// though each pass is logically read-only, hence the interior lock.
struct BlipInner {
    model: BlipForConditionalGeneration,
    logits_processor: LogitsProcessor,
}

pub struct BlipModel {
    tokenizer: Tokenizer,
    inner: Mutex<BlipInner>,
    device: Device,
}

impl CaptionModel for BlipModel {
    fn caption(&self, image: &DynamicImage, request: &CaptionRequest) -> Result<String> {
        let max_tokens = request
            .max_tokens
            .unwrap_or(DEFAULT_MAX_TOKENS)
            .min(DECODE_LIMIT);
        let pixels = preprocess(image, &self.device)?;

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("caption model state poisoned"))?;

        let image_embeds = pixels.unsqueeze(0)?.apply(inner.model.vision_model())?;

        // Stale cache entries from a previous pass would corrupt this one.
        inner.model.text_decoder().reset_kv_cache();

        let mut token_ids = vec![BOS_TOKEN_ID];
        for index in 0..max_tokens {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = inner.model.text_decoder().forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = inner.logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }

        let caption = self
            .tokenizer
            .decode(&token_ids, true)
            .map_err(|e| anyhow!("failed to decode caption tokens: {e}"))?;
        debug!(tokens = token_ids.len(), "generated caption");
        Ok(caption)
    }
}

/// Scales, center-crops to 384x384 and normalizes with the CLIP mean/std
/// BLIP was trained with; yields a CHW float tensor on `device`.
fn preprocess(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = image
        .resize_to_fill(
            IMAGE_SIZE as u32,
            IMAGE_SIZE as u32,
            image::imageops::FilterType::Triangle,
        )
        .to_rgb8();
    let data = img.into_raw();
    let data =
        Tensor::from_vec(data, (IMAGE_SIZE, IMAGE_SIZE, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let mean =
        Tensor::new(&[0.48145466f32, 0.4578275, 0.40821073], &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&[0.26862954f32, 0.261_302_6, 0.275_777_1], &Device::Cpu)?
        .reshape((3, 1, 1))?;
    let normalized = (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;
    Ok(normalized.to_device(device)?)
}

pub struct BlipLoader;

impl Loader for BlipLoader {
    type Model = BlipModel;

    async fn load(variant: ModelVariant, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        let ModelVariant::Blip(variant) = variant;

        let device = select_best_device(device_map).context("failed to set up device")?;

        let repo = api.repo(hf_hub::Repo::model(variant.repo_id().to_string()));

        let tokenizer_file = repo
            .get("tokenizer.json")
            .await
            .context("failed to get BLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(anyhow::Error::msg)
            .context("failed to load BLIP tokenizer")?;

        let model_file = repo
            .get("model.safetensors")
            .await
            .context("failed to get BLIP model file")?;
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[model_file], DType::F32, &device)
                .context("failed to build BLIP var builder")?
        };
        let model = BlipForConditionalGeneration::new(&variant.config(), vb)
            .context("failed to load BLIP model")?;

        // Fixed seed, no temperature: captioning decodes greedily.
        let logits_processor = LogitsProcessor::new(1337, None, None);

        Ok(BlipModel {
            tokenizer,
            inner: Mutex::new(BlipInner {
                model,
                logits_processor,
            }),
            device,
        })
    }
}
