use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::{
    generation::LogitsProcessor,
    models::{blip, blip_text},
};
use image::{imageops::FilterType, DynamicImage};
use sdxl_lora_common::{load_tensors_from_file, load_tokenizer, FileData, FileLoader, ModelSource};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::{Captioner, CaptionerConfig};
use crate::error::CaptionError;

const IMAGE_SIZE: u32 = 384;
/// `[DEC]`, the first token of every caption.
const DECODER_START_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;
const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const CLIP_STD: [f32; 3] = [0.26862954, 0.2613026, 0.2757771];

fn base_config() -> blip::Config {
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
    let vision_config = blip::VisionConfig {
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

#[derive(Deserialize, Default)]
struct BlipJson {
    #[serde(default)]
    vision_config: VisionJson,
}

#[derive(Deserialize)]
struct VisionJson {
    hidden_size: usize,
}

impl Default for VisionJson {
    fn default() -> Self {
        Self { hidden_size: 768 }
    }
}

/// Pick the BLIP variant described by a `config.json`.
fn blip_config(json: &str) -> Result<blip::Config, String> {
    let cfg: BlipJson =
        serde_json::from_str(json).map_err(|e| format!("unreadable config.json: {e}"))?;
    match cfg.vision_config.hidden_size {
        768 => Ok(base_config()),
        1024 => Ok(blip::Config::image_captioning_large()),
        other => Err(format!("unknown BLIP vision width {other}")),
    }
}

/// RGB image to a normalized `(3, 384, 384)` tensor.
fn preprocess(image: &DynamicImage) -> candle_core::Result<Tensor> {
    let image = image
        .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::CatmullRom)
        .to_rgb8();
    let size = IMAGE_SIZE as usize;
    let data = Tensor::from_vec(image.into_raw(), (size, size, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&CLIP_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&CLIP_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)
}

pub(super) struct BlipCaptioner {
    model: blip::BlipForConditionalGeneration,
    tokenizer: Tokenizer,
    logits_processor: LogitsProcessor,
    device: Device,
}

impl BlipCaptioner {
    pub(super) fn load(config: &CaptionerConfig) -> Result<Self, CaptionError> {
        let model_id = &config.model_id;
        let unavailable = |source: anyhow::Error| CaptionError::Unavailable {
            model_id: model_id.clone(),
            source,
        };
        let incompatible = |reason: String| CaptionError::Incompatible {
            model_id: model_id.clone(),
            reason,
        };

        info!("loading captioning model `{model_id}`.");
        let mut loader = FileLoader::from_model_source(
            &ModelSource::from_model_id(model_id),
            config.silent,
            &config.token,
            None,
        )
        .map_err(unavailable)?;

        let config_json = loader
            .read_file("config.json")
            .and_then(|file| file.read_to_string())
            .map_err(unavailable)?;
        let blip_config = blip_config(&config_json).map_err(incompatible)?;
        let tokenizer = loader
            .read_file("tokenizer.json")
            .and_then(|file| load_tokenizer(&file))
            .map_err(unavailable)?;

        let device = &config.device;
        let vb = match loader.read_file("model.safetensors") {
            Ok(weights) => {
                let tensors = load_tensors_from_file(&weights, Some(DType::F32), device, config.silent)
                    .map_err(|e| incompatible(e.to_string()))?;
                VarBuilder::from_tensors(tensors, DType::F32, device)
            }
            Err(e) => {
                debug!("no `model.safetensors` ({e}), trying `pytorch_model.bin`.");
                let weights = loader.read_file("pytorch_model.bin").map_err(unavailable)?;
                let FileData::Path(path) = weights else {
                    return Err(incompatible("packed PyTorch weights are not supported".to_string()));
                };
                VarBuilder::from_pth(path, DType::F32, device).map_err(|e| incompatible(e.to_string()))?
            }
        };

        let model = blip::BlipForConditionalGeneration::new(&blip_config, vb)
            .map_err(|e| incompatible(e.to_string()))?;
        info!("captioning model loaded on {device:?}.");

        Ok(Self {
            model,
            tokenizer,
            logits_processor: LogitsProcessor::new(0, None, None),
            device: device.clone(),
        })
    }
}

impl Captioner for BlipCaptioner {
    fn caption(&mut self, image: &DynamicImage, max_new_tokens: usize) -> Result<String> {
        let pixels = preprocess(image)?.to_device(&self.device)?;
        let image_embeds = pixels.unsqueeze(0)?.apply(self.model.vision_model())?;

        self.model.text_decoder().reset_kv_cache();
        let mut token_ids = vec![DECODER_START_TOKEN_ID];
        for index in 0..max_new_tokens {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .text_decoder()
                .forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = self.logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }

        self.tokenizer
            .decode(&token_ids, true)
            .map_err(anyhow::Error::msg)
    }
}
