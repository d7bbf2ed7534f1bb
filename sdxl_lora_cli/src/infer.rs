use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use sdxl_lora_core::{
    run_generation, DeviceSpec, DiffusionGenerationParams, GenerationJob, LoadOptions,
    ModelDType, ModelSource, Optimizations, Pipeline, RunStamp, SeedPolicy, TokenSource,
};

/// Generate images with an SDXL base model and a LoRA adapter.
#[derive(Debug, Parser)]
#[command(name = "infer_sdxl_lora")]
pub struct Args {
    /// Diffusers directory, `.dduf` archive or single-file `.safetensors` checkpoint.
    #[arg(long)]
    pub base_model: PathBuf,

    /// LoRA `.safetensors` file.
    #[arg(long)]
    pub lora: PathBuf,

    #[arg(long)]
    pub prompt: String,

    /// Empty for none.
    #[arg(long, default_value = "")]
    pub negative_prompt: String,

    #[arg(long, default_value = "/workspace/outputs")]
    pub out_dir: PathBuf,

    #[arg(long, default_value_t = 1)]
    pub num_images: usize,

    /// Seed of the first image, the following images count up. Negative draws a random seed per image.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub seed: i64,

    #[arg(long, default_value_t = 30)]
    pub steps: usize,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 7.0)]
    pub cfg: f64,

    #[arg(long, default_value_t = 1024)]
    pub width: usize,

    #[arg(long, default_value_t = 1024)]
    pub height: usize,

    /// Strength of the LoRA adapter.
    #[arg(long, default_value_t = 0.8)]
    pub lora_scale: f64,

    /// `cpu`, `cuda[:N]` or `metal[:N]`. Empty selects the best available device.
    #[arg(long, default_value = "")]
    pub device: DeviceSpec,

    /// Keep weights in host memory and move each component to the device only while it runs.
    #[arg(long)]
    pub cpu_offload: bool,

    #[arg(long)]
    pub attention_slicing: bool,

    #[arg(long, value_enum, default_value_t = ModelDType::Auto)]
    pub dtype: ModelDType,

    /// Hugging Face token source: `literal:<token>`, `env[:VAR]`, `path:<file>`, `cache` or `none`.
    #[arg(long, default_value = "cache")]
    pub token_source: TokenSource,
}

impl Args {
    pub fn job(&self) -> GenerationJob {
        GenerationJob {
            prompt: self.prompt.clone(),
            negative_prompt: Some(self.negative_prompt.clone()).filter(|p| !p.is_empty()),
            out_dir: self.out_dir.clone(),
            num_images: self.num_images,
            seed: SeedPolicy::from_arg(self.seed),
            params: DiffusionGenerationParams {
                height: self.height,
                width: self.width,
                num_steps: self.steps,
                guidance_scale: self.cfg,
                lora_scale: self.lora_scale,
                seed: 0,
            },
        }
    }

    /// The LoRA file as a directory plus a file name.
    pub fn lora_location(&self) -> anyhow::Result<(&Path, &str)> {
        let dir = self
            .lora
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let weight_name = self
            .lora
            .file_name()
            .and_then(|name| name.to_str())
            .with_context(|| format!("Invalid LoRA path `{}`", self.lora.display()))?;
        Ok((dir, weight_name))
    }
}

pub fn run(args: Args) -> anyhow::Result<()> {
    let job = args.job();
    job.params.validate()?;
    std::fs::create_dir_all(&job.out_dir).with_context(|| {
        format!("Failed to create output directory `{}`", job.out_dir.display())
    })?;

    let mut pipeline = Pipeline::load(
        ModelSource::from_path(&args.base_model),
        &LoadOptions {
            device: args.device,
            dtype: args.dtype,
            silent: false,
            token: args.token_source.clone(),
            revision: None,
        },
    )?;

    let (dir, weight_name) = args.lora_location()?;
    pipeline.load_lora_weights(dir, weight_name)?;
    pipeline.apply_optimizations(Optimizations {
        attention_slicing: args.attention_slicing,
        cpu_offload: args.cpu_offload,
    })?;

    run_generation(&mut pipeline, &job, &RunStamp::now(), &mut rand::thread_rng())?;
    Ok(())
}
