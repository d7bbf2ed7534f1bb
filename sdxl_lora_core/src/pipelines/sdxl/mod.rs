#[cfg(feature = "single-file")]
mod checkpoint;
mod scheduler;

use std::{borrow::Cow, collections::HashMap, ops::Deref, path::Path};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    clip::{self, ClipTextTransformer},
    ddim::DDIMSchedulerConfig,
    schedulers::SchedulerConfig,
    unet_2d::{BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig},
    vae::{AutoEncoderKL, AutoEncoderKLConfig},
};
use sdxl_lora_common::{load_tensors, load_tokenizer, FileLoader, ModelSource, NiceProgressBar};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use scheduler::scheduler_config;

use super::{
    ComponentElem, ComponentName, DiffusionGenerationParams, LoadContext, Loader, ModelPipeline,
    SeededGenerator,
};
use crate::{
    capability::{Capability, PipelineCapabilities},
    convert::SDXL_LAYERS_PER_BLOCK,
    lora::{Binding, KeyIndex, LoraAdapter, LoraTarget},
};

const CLIP_L_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const CLIP_G_TOKENIZER_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";
const DEFAULT_VAE_SCALE: f64 = 0.13025;
const LATENT_CHANNELS: usize = 4;
/// Slices of the attention batch computed at once when attention slicing is on.
const ATTENTION_SLICE_SIZE: usize = 2;

fn unet_config(sliced_attention_size: Option<usize>) -> UNet2DConditionModelConfig {
    let bc = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim,
    };
    UNet2DConditionModelConfig {
        blocks: vec![
            bc(320, None, 5),
            bc(640, Some(2), 10),
            bc(1280, Some(10), 20),
        ],
        center_input_sample: false,
        cross_attention_dim: 2048,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: SDXL_LAYERS_PER_BLOCK,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size,
        use_linear_projection: true,
    }
}

fn vae_config() -> AutoEncoderKLConfig {
    AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: LATENT_CHANNELS,
        norm_num_groups: 32,
        use_quant_conv: true,
        use_post_quant_conv: true,
    }
}

#[derive(Deserialize)]
struct VaeJson {
    scaling_factor: Option<f64>,
}

/// Weights of every SDXL component in the diffusers layout, kept on the CPU.
#[derive(Debug, Default)]
pub(crate) struct SdxlWeights {
    pub unet: HashMap<String, Tensor>,
    pub vae: HashMap<String, Tensor>,
    pub text_encoder: HashMap<String, Tensor>,
    pub text_encoder_2: HashMap<String, Tensor>,
}

impl SdxlWeights {
    fn for_target(&self, target: LoraTarget) -> &HashMap<String, Tensor> {
        match target {
            LoraTarget::Unet => &self.unet,
            LoraTarget::TextEncoder => &self.text_encoder,
            LoraTarget::TextEncoder2 => &self.text_encoder_2,
        }
    }
}

struct AttachedLora {
    adapter: LoraAdapter,
    bindings: HashMap<LoraTarget, Binding>,
}

/// Host weights plus the attached adapter; builds device modules on demand.
struct WeightStore {
    weights: SdxlWeights,
    lora: Option<AttachedLora>,
    device: Device,
    dtype: DType,
}

impl WeightStore {
    fn tensors(&self, target: LoraTarget, strength: f64) -> Result<Cow<'_, HashMap<String, Tensor>>> {
        let base = self.weights.for_target(target);
        let binding = self
            .lora
            .as_ref()
            .and_then(|lora| Some((&lora.adapter, lora.bindings.get(&target)?)))
            .filter(|(_, binding)| !binding.is_empty());
        match binding {
            Some((adapter, binding)) => Ok(Cow::Owned(adapter.merge(base, binding, strength)?)),
            None => Ok(Cow::Borrowed(base)),
        }
    }

    fn build_unet(&self, strength: f64, sliced_attention_size: Option<usize>) -> Result<UNet2DConditionModel> {
        let vb = VarBuilder::from_tensors(
            self.tensors(LoraTarget::Unet, strength)?.into_owned(),
            self.dtype,
            &self.device,
        );
        Ok(UNet2DConditionModel::new(
            vb,
            LATENT_CHANNELS,
            LATENT_CHANNELS,
            false,
            unet_config(sliced_attention_size),
        )?)
    }

    fn build_clip(&self, target: LoraTarget, config: &clip::Config, strength: f64) -> Result<ClipTextTransformer> {
        let vb = VarBuilder::from_tensors(
            self.tensors(target, strength)?.into_owned(),
            self.dtype,
            &self.device,
        );
        Ok(ClipTextTransformer::new(vb, config)?)
    }

    /// The VAE always runs in F32; it overflows in F16.
    fn build_vae(&self) -> Result<AutoEncoderKL> {
        let vb = VarBuilder::from_tensors(self.weights.vae.clone(), DType::F32, &self.device);
        Ok(AutoEncoderKL::new(vb, 3, 3, vae_config())?)
    }
}

/// Device modules kept between calls. Emptied whenever they would no longer match the weights.
#[derive(Default)]
struct ModuleCache {
    strength: Option<f64>,
    unet: Option<UNet2DConditionModel>,
    clip: Option<ClipTextTransformer>,
    clip2: Option<ClipTextTransformer>,
    vae: Option<AutoEncoderKL>,
}

impl ModuleCache {
    fn clear_adapted(&mut self) {
        self.unet = None;
        self.clip = None;
        self.clip2 = None;
    }
}

enum Resident<'a, T> {
    Cached(&'a T),
    Transient(T),
}

impl<T> Deref for Resident<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self {
            Self::Cached(module) => module,
            Self::Transient(module) => module,
        }
    }
}

/// Use the cached module in `slot`, building it first if needed. With `keep == false` the module is built
/// for this use only and dropped afterwards.
fn resident<'a, T>(
    slot: &'a mut Option<T>,
    keep: bool,
    build: impl FnOnce() -> Result<T>,
) -> Result<Resident<'a, T>> {
    if !keep {
        return Ok(Resident::Transient(build()?));
    }
    let module = match slot.take() {
        Some(module) => module,
        None => build()?,
    };
    Ok(Resident::Cached(slot.insert(module)))
}

/// Pad with `pad_id` up to `max_len`, or truncate keeping the final (end of text) token.
fn pad_or_truncate(mut tokens: Vec<u32>, max_len: usize, pad_id: u32) -> Vec<u32> {
    if tokens.len() > max_len {
        warn!("prompt is longer than {max_len} tokens and was truncated.");
        let last = tokens.last().copied().unwrap_or(pad_id);
        tokens.truncate(max_len.saturating_sub(1));
        tokens.push(last);
    }
    tokens.resize(max_len, pad_id);
    tokens
}

fn tokenize(tokenizer: &Tokenizer, config: &clip::Config, prompt: &str, device: &Device) -> Result<Tensor> {
    let pad_with = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
    let pad_id = tokenizer
        .token_to_id(pad_with)
        .with_context(|| format!("Tokenizer has no padding token `{pad_with}`."))?;
    let tokens = tokenizer
        .encode(prompt, true)
        .map_err(anyhow::Error::msg)?
        .get_ids()
        .to_vec();
    let tokens = pad_or_truncate(tokens, config.max_position_embeddings, pad_id);
    Ok(Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?)
}

fn fetch_tokenizer(repo: &str, ctx: &LoadContext) -> Result<Tokenizer> {
    info!("fetching tokenizer from `{repo}`.");
    let mut loader = FileLoader::from_model_source(
        &ModelSource::ModelId(repo.to_string()),
        ctx.silent,
        &ctx.token,
        None,
    )?;
    load_tokenizer(&loader.read_file("tokenizer.json")?)
}

/// Weights and config text of a model component.
fn model_component(
    components: &HashMap<ComponentName, ComponentElem>,
    name: ComponentName,
    dtype: DType,
    silent: bool,
) -> Result<(HashMap<String, Tensor>, Option<String>)> {
    let Some(ComponentElem::Model {
        safetensors,
        config,
    }) = components.get(&name)
    else {
        anyhow::bail!("Expected model component `{name}` with safetensors weights.");
    };
    let tensors = load_tensors(safetensors.values(), Some(dtype), &Device::Cpu, silent)?;
    let config = config.as_ref().map(|c| c.read_to_string()).transpose()?;
    Ok((tensors, config))
}

fn component_tokenizer(
    components: &HashMap<ComponentName, ComponentElem>,
    name: ComponentName,
    fallback_repo: &str,
    ctx: &LoadContext,
) -> Result<Tokenizer> {
    match components.get(&name).and_then(|c| c.file("tokenizer.json")) {
        Some(file) => load_tokenizer(file),
        None => {
            debug!("component `{name}` has no `tokenizer.json`.");
            fetch_tokenizer(fallback_repo, ctx)
                .with_context(|| missing_tokenizer_message(&name, fallback_repo))
        }
    }
}

fn missing_tokenizer_message(name: &ComponentName, repo: &str) -> String {
    format!(
        "`{name}/tokenizer.json` is missing and could not be fetched from `{repo}`. \
         To load offline, copy `tokenizer.json` from `{repo}` into `{name}/`."
    )
}

pub(crate) struct SdxlLoader;

impl Loader for SdxlLoader {
    fn name(&self) -> &'static str {
        "stable-diffusion-xl"
    }

    fn required_component_names(&self) -> Vec<ComponentName> {
        vec![
            ComponentName::Scheduler,
            ComponentName::TextEncoder(1),
            ComponentName::TextEncoder(2),
            ComponentName::Tokenizer(1),
            ComponentName::Tokenizer(2),
            ComponentName::Unet,
            ComponentName::Vae,
        ]
    }

    fn load_from_components(
        &self,
        components: HashMap<ComponentName, ComponentElem>,
        ctx: &LoadContext,
    ) -> Result<Box<dyn ModelPipeline>> {
        let (unet, _) = model_component(&components, ComponentName::Unet, ctx.dtype, ctx.silent)?;
        let (vae, vae_config) =
            model_component(&components, ComponentName::Vae, DType::F32, ctx.silent)?;
        let (text_encoder, _) =
            model_component(&components, ComponentName::TextEncoder(1), ctx.dtype, ctx.silent)?;
        let (text_encoder_2, _) =
            model_component(&components, ComponentName::TextEncoder(2), ctx.dtype, ctx.silent)?;

        let vae_scale = match vae_config {
            Some(json) => serde_json::from_str::<VaeJson>(&json)?
                .scaling_factor
                .unwrap_or(DEFAULT_VAE_SCALE),
            None => DEFAULT_VAE_SCALE,
        };
        let scheduler_json = components
            .get(&ComponentName::Scheduler)
            .and_then(|c| c.file("scheduler_config.json"))
            .map(|f| f.read_to_string())
            .transpose()?;

        let tokenizer =
            component_tokenizer(&components, ComponentName::Tokenizer(1), CLIP_L_TOKENIZER_REPO, ctx)?;
        let tokenizer_2 =
            component_tokenizer(&components, ComponentName::Tokenizer(2), CLIP_G_TOKENIZER_REPO, ctx)?;

        Ok(Box::new(SdxlPipeline::new(
            SdxlWeights {
                unet,
                vae,
                text_encoder,
                text_encoder_2,
            },
            [tokenizer, tokenizer_2],
            scheduler_config(scheduler_json.as_deref())?,
            vae_scale,
            ctx,
        )))
    }

    #[cfg(feature = "single-file")]
    fn load_from_checkpoint(&self, path: &Path, ctx: &LoadContext) -> Result<Box<dyn ModelPipeline>> {
        let weights = checkpoint::load_checkpoint(path, ctx.dtype, ctx.silent)?;
        let tokenizer = fetch_tokenizer(CLIP_L_TOKENIZER_REPO, ctx)?;
        let tokenizer_2 = fetch_tokenizer(CLIP_G_TOKENIZER_REPO, ctx)?;
        Ok(Box::new(SdxlPipeline::new(
            weights,
            [tokenizer, tokenizer_2],
            scheduler_config(None)?,
            DEFAULT_VAE_SCALE,
            ctx,
        )))
    }

    #[cfg(not(feature = "single-file"))]
    fn load_from_checkpoint(&self, _path: &Path, _ctx: &LoadContext) -> Result<Box<dyn ModelPipeline>> {
        Err(crate::error::LoadError::missing_single_file().into())
    }
}

pub struct SdxlPipeline {
    store: WeightStore,
    cache: ModuleCache,
    tokenizer: Tokenizer,
    tokenizer_2: Tokenizer,
    clip_config: clip::Config,
    clip2_config: clip::Config,
    scheduler: DDIMSchedulerConfig,
    vae_scale: f64,
    sliced_attention_size: Option<usize>,
    offload: bool,
    silent: bool,
}

impl SdxlPipeline {
    fn new(
        weights: SdxlWeights,
        [tokenizer, tokenizer_2]: [Tokenizer; 2],
        scheduler: DDIMSchedulerConfig,
        vae_scale: f64,
        ctx: &LoadContext,
    ) -> Self {
        info!(
            unet = weights.unet.len(),
            vae = weights.vae.len(),
            text_encoder = weights.text_encoder.len(),
            text_encoder_2 = weights.text_encoder_2.len(),
            "SDXL weights loaded"
        );
        Self {
            store: WeightStore {
                weights,
                lora: None,
                device: ctx.device.clone(),
                dtype: ctx.dtype,
            },
            cache: ModuleCache::default(),
            tokenizer,
            tokenizer_2,
            clip_config: clip::Config::sdxl(),
            clip2_config: clip::Config::sdxl2(),
            scheduler,
            vae_scale,
            sliced_attention_size: None,
            offload: false,
            silent: ctx.silent,
        }
    }

    /// Encode prompts with both text encoders, concatenated on the feature axis.
    fn encode_prompts(&mut self, prompts: &[&str], strength: f64) -> Result<Vec<Tensor>> {
        let keep = !self.offload;
        let device = self.store.device.clone();

        let hidden = {
            let clip = resident(&mut self.cache.clip, keep, || {
                self.store
                    .build_clip(LoraTarget::TextEncoder, &self.clip_config, strength)
            })?;
            prompts
                .iter()
                .map(|p| Ok(clip.forward(&tokenize(&self.tokenizer, &self.clip_config, p, &device)?)?))
                .collect::<Result<Vec<_>>>()?
        };
        let hidden_2 = {
            let clip = resident(&mut self.cache.clip2, keep, || {
                self.store
                    .build_clip(LoraTarget::TextEncoder2, &self.clip2_config, strength)
            })?;
            prompts
                .iter()
                .map(|p| {
                    Ok(clip.forward(&tokenize(&self.tokenizer_2, &self.clip2_config, p, &device)?)?)
                })
                .collect::<Result<Vec<_>>>()?
        };

        hidden
            .iter()
            .zip(&hidden_2)
            .map(|(a, b)| Ok(Tensor::cat(&[a, b], D::Minus1)?))
            .collect()
    }
}

impl ModelPipeline for SdxlPipeline {
    fn capabilities(&self) -> PipelineCapabilities {
        PipelineCapabilities {
            attention_slicing: Capability::Supported,
            cpu_offload: Capability::from_support(!self.store.device.is_cpu()),
        }
    }

    fn load_lora(&mut self, adapter: LoraAdapter) -> Result<()> {
        let mut bindings = HashMap::new();
        let mut matched = 0;
        for target in [
            LoraTarget::Unet,
            LoraTarget::TextEncoder,
            LoraTarget::TextEncoder2,
        ] {
            let index = KeyIndex::new(self.store.weights.for_target(target).keys());
            let binding = adapter.bind(target, &index, SDXL_LAYERS_PER_BLOCK);
            matched += binding.len();
            bindings.insert(target, binding);
        }
        if matched == 0 {
            anyhow::bail!(
                "None of the {} layers of LoRA `{}` match the base model.",
                adapter.len(),
                adapter.name()
            );
        }
        info!(adapter = adapter.name(), matched, "LoRA adapter attached");

        self.store.lora = Some(AttachedLora { adapter, bindings });
        self.cache.clear_adapted();
        self.cache.strength = None;
        Ok(())
    }

    fn enable_attention_slicing(&mut self) -> Result<()> {
        if self.cache.unet.is_some() {
            anyhow::bail!("Attention slicing must be enabled before the first generation.");
        }
        self.sliced_attention_size = Some(ATTENTION_SLICE_SIZE);
        Ok(())
    }

    fn enable_cpu_offload(&mut self) -> Result<()> {
        if self.store.device.is_cpu() {
            anyhow::bail!("CPU offload needs an accelerator device.");
        }
        self.offload = true;
        self.cache = ModuleCache::default();
        Ok(())
    }

    fn forward(
        &mut self,
        prompt: &str,
        negative_prompt: Option<&str>,
        params: &DiffusionGenerationParams,
    ) -> Result<Tensor> {
        let strength = params.lora_scale;
        if self.store.lora.is_some() && self.cache.strength != Some(strength) {
            self.cache.clear_adapted();
            self.cache.strength = Some(strength);
        }
        let keep = !self.offload;
        let use_guidance = params.guidance_scale > 1.;

        let mut prompts = vec![prompt];
        if let Some(negative_prompt) = negative_prompt.filter(|_| use_guidance) {
            prompts.push(negative_prompt);
        }
        let mut embeddings = self.encode_prompts(&prompts, strength)?;
        let cond = embeddings.remove(0);
        let text_embeddings = if use_guidance {
            let uncond = match embeddings.pop() {
                Some(negative) => negative,
                None => cond.zeros_like()?,
            };
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        let text_embeddings = text_embeddings.to_dtype(self.store.dtype)?;

        let mut scheduler = self.scheduler.build(params.num_steps)?;
        let latents = SeededGenerator::new(params.seed, &self.store.device).randn(
            (1, LATENT_CHANNELS, params.height / 8, params.width / 8),
            self.store.dtype,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?;

        {
            let (sliced_attention_size, silent) = (self.sliced_attention_size, self.silent);
            let unet = resident(&mut self.cache.unet, keep, || {
                self.store.build_unet(strength, sliced_attention_size)
            })?;
            let timesteps = scheduler.timesteps().to_vec();
            let steps = NiceProgressBar::<_, 'g'>(timesteps.iter(), "Denoise loop").silent(silent);
            for &timestep in steps {
                let latent_model_input = if use_guidance {
                    Tensor::cat(&[&latents, &latents], 0)?
                } else {
                    latents.clone()
                };
                let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
                let noise_pred =
                    unet.forward(&latent_model_input, timestep as f64, &text_embeddings)?;
                let noise_pred = if use_guidance {
                    let chunks = noise_pred.chunk(2, 0)?;
                    let (uncond, text) = (&chunks[0], &chunks[1]);
                    (uncond + ((text - uncond)? * params.guidance_scale)?)?
                } else {
                    noise_pred
                };
                latents = scheduler.step(&noise_pred, timestep, &latents)?;
            }
        }

        let vae = resident(&mut self.cache.vae, keep, || self.store.build_vae())?;
        let latents = (latents.to_dtype(DType::F32)? / self.vae_scale)?;
        let img = vae.decode(&latents)?;
        let img = ((img / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (img.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        Ok(img)
    }
}
