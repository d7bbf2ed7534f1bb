//! Core crate of sdxl_lora: SDXL + LoRA text-to-image generation and BLIP image captioning.
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use sdxl_lora_core::{
//!     run_generation, DiffusionGenerationParams, GenerationJob, LoadOptions, ModelSource, Optimizations,
//!     Pipeline, RunStamp, SeedPolicy,
//! };
//!
//! let mut pipeline = Pipeline::load(
//!     ModelSource::from_path("stable-diffusion-xl-base-1.0"),
//!     &LoadOptions::default(),
//! )?;
//! pipeline.load_lora_weights(Path::new("loras"), "subject.safetensors")?;
//! pipeline.apply_optimizations(Optimizations {
//!     attention_slicing: true,
//!     cpu_offload: false,
//! })?;
//!
//! let job = GenerationJob {
//!     prompt: "a photo of sksSubject on a beach".to_string(),
//!     negative_prompt: None,
//!     out_dir: "outputs".into(),
//!     num_images: 2,
//!     seed: SeedPolicy::Fixed(10),
//!     params: DiffusionGenerationParams::default(),
//! };
//! run_generation(&mut pipeline, &job, &RunStamp::now(), &mut rand::thread_rng())?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod capability;
pub mod caption;
mod convert;
mod error;
mod generation;
mod lora;
mod pipelines;
mod util;

pub use capability::{Capability, LoaderCapabilities, PipelineCapabilities};
pub use error::{CaptionError, LoadError};
pub use generation::{
    output_file_name, run_generation, GenerationJob, RunStamp, SeedPolicy, MAX_RANDOM_SEED,
};
pub use lora::{LoraAdapter, LoraTarget};
pub use pipelines::{
    DiffusionGenerationParams, LoadOptions, LoadRoute, ModelPipeline, Optimizations, Pipeline,
    SeededGenerator,
};
pub use sdxl_lora_common::{ModelSource, TokenSource};
pub use util::{DeviceSpec, ModelDType, TryIntoDType};
