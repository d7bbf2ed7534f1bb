mod sampling;
mod sdxl;

use std::{
    collections::HashMap,
    fmt::Display,
    path::{Path, PathBuf},
};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, RgbImage};
use sdxl::SdxlLoader;
use serde::Deserialize;

use sdxl_lora_common::{FileData, FileLoader, ModelSource, NiceProgressBar, PackedFormat, TokenSource};
use tracing::{debug, info};

pub use sampling::SeededGenerator;

use crate::{
    capability::{LoaderCapabilities, PipelineCapabilities},
    error::LoadError,
    lora::LoraAdapter,
    util::{DeviceSpec, ModelDType, TryIntoDType},
};

/// Generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffusionGenerationParams {
    pub height: usize,
    pub width: usize,
    /// The number of denoising steps. More denoising steps usually lead to a higher quality image at the
    /// expense of slower inference but depends on the model being used.
    pub num_steps: usize,
    /// Higher guidance scale encourages to generate images that are closely linked to the text `prompt`,
    /// usually at the expense of lower image quality.
    pub guidance_scale: f64,
    /// Strength of the attached LoRA adapter, applied on every call.
    pub lora_scale: f64,
    /// Seed for the initial latent noise.
    pub seed: u64,
}

impl Default for DiffusionGenerationParams {
    fn default() -> Self {
        Self {
            height: 1024,
            width: 1024,
            num_steps: 30,
            guidance_scale: 7.0,
            lora_scale: 0.8,
            seed: 0,
        }
    }
}

impl DiffusionGenerationParams {
    pub fn validate(&self) -> Result<()> {
        if self.height == 0 || self.width == 0 || self.height % 8 != 0 || self.width % 8 != 0 {
            anyhow::bail!(
                "Expected width and height to be nonzero multiples of 8, got {}x{}.",
                self.width,
                self.height
            );
        }
        if self.num_steps == 0 {
            anyhow::bail!("Expected at least one denoising step.");
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) enum ComponentElem {
    Model {
        safetensors: HashMap<String, FileData>,
        config: Option<FileData>,
    },
    Config {
        files: HashMap<String, FileData>,
    },
    Other {
        files: HashMap<String, FileData>,
    },
}

impl ComponentElem {
    /// Find a file of this component by its file name.
    pub(crate) fn file(&self, file_name: &str) -> Option<&FileData> {
        let files = match self {
            Self::Model { safetensors, config } => {
                if let Some(config) = config.as_ref().filter(|c| c.name().ends_with(file_name)) {
                    return Some(config);
                }
                safetensors
            }
            Self::Config { files } | Self::Other { files } => files,
        };
        files
            .iter()
            .find(|(name, _)| Path::new(name).file_name().is_some_and(|n| n == file_name))
            .map(|(_, data)| data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentName {
    Scheduler,
    TextEncoder(usize),
    Tokenizer(usize),
    Unet,
    Vae,
}

impl Display for ComponentName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduler => write!(f, "scheduler"),
            Self::Unet => write!(f, "unet"),
            Self::Vae => write!(f, "vae"),
            Self::TextEncoder(1) => write!(f, "text_encoder"),
            Self::TextEncoder(x) => write!(f, "text_encoder_{x}"),
            Self::Tokenizer(1) => write!(f, "tokenizer"),
            Self::Tokenizer(x) => write!(f, "tokenizer_{x}"),
        }
    }
}

/// Everything a loader needs besides the model files.
pub(crate) struct LoadContext {
    pub device: Device,
    pub dtype: DType,
    pub silent: bool,
    pub token: TokenSource,
}

pub(crate) trait Loader {
    fn name(&self) -> &'static str;
    fn required_component_names(&self) -> Vec<ComponentName>;
    fn load_from_components(
        &self,
        components: HashMap<ComponentName, ComponentElem>,
        ctx: &LoadContext,
    ) -> Result<Box<dyn ModelPipeline>>;
    fn load_from_checkpoint(&self, path: &Path, ctx: &LoadContext) -> Result<Box<dyn ModelPipeline>>;
}

/// A loaded text-to-image model.
pub trait ModelPipeline {
    /// Optional memory-saving strategies, resolved when the model was loaded.
    fn capabilities(&self) -> PipelineCapabilities {
        PipelineCapabilities::default()
    }

    fn load_lora(&mut self, adapter: LoraAdapter) -> Result<()>;

    fn enable_attention_slicing(&mut self) -> Result<()> {
        anyhow::bail!("This pipeline does not implement attention slicing.")
    }

    fn enable_cpu_offload(&mut self) -> Result<()> {
        anyhow::bail!("This pipeline does not implement CPU offloading.")
    }

    /// Run one generation, returning a `(batch, 3, height, width)` u8 image tensor.
    fn forward(
        &mut self,
        prompt: &str,
        negative_prompt: Option<&str>,
        params: &DiffusionGenerationParams,
    ) -> Result<Tensor>;
}

#[derive(Clone, Debug, Deserialize)]
struct ModelIndex {
    #[serde(rename = "_class_name")]
    name: String,
}

/// How a model source is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadRoute {
    /// Component directories read through a [`FileLoader`]: local directories, hub repos and DDUF archives.
    Components,
    /// An original-layout checkpoint converted key by key.
    Checkpoint(PathBuf),
}

impl LoadRoute {
    /// Decide how to load `source` without reading it. Packed single files need the `from_single_file`
    /// capability; without it this fails immediately.
    pub fn resolve(source: &ModelSource, caps: &LoaderCapabilities) -> Result<Self, LoadError> {
        let ModelSource::SingleFile(path) = source else {
            return Ok(Self::Components);
        };
        if caps.single_file != crate::capability::Capability::Supported {
            return Err(LoadError::missing_single_file());
        }
        if !path.is_file() {
            return Err(LoadError::NotFound(path.clone()));
        }
        match source.packed_format() {
            Some(PackedFormat::Dduf) => Ok(Self::Components),
            Some(PackedFormat::Checkpoint) => Ok(Self::Checkpoint(path.clone())),
            None => Err(LoadError::UnsupportedFormat(path.clone())),
        }
    }
}

/// Options for [`Pipeline::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub device: DeviceSpec,
    pub dtype: ModelDType,
    pub silent: bool,
    /// Only applicable for Hugging Face downloads.
    pub token: TokenSource,
    /// Only applicable for Hugging Face model IDs.
    pub revision: Option<String>,
}

/// Memory-saving strategies requested by the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Optimizations {
    pub attention_slicing: bool,
    pub cpu_offload: bool,
}

/// Safetensors files to load for a model component. Files of a named variant (`*.fp16.safetensors`) are
/// only used when the component has no default weights.
fn select_weight_files(files: &[String]) -> Vec<String> {
    let safetensors = files
        .iter()
        .filter(|file| file.ends_with(".safetensors"))
        .cloned()
        .collect::<Vec<_>>();
    let default = safetensors
        .iter()
        .filter(|file| {
            let name = Path::new(file.as_str())
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            name.matches('.').count() == 1
        })
        .cloned()
        .collect::<Vec<_>>();
    if default.is_empty() {
        safetensors
    } else {
        default
    }
}

/// Represents the model and provides methods to load and interact with it.
pub struct Pipeline {
    model: Box<dyn ModelPipeline>,
}

impl Pipeline {
    /// Load the model.
    pub fn load(source: ModelSource, options: &LoadOptions) -> Result<Self> {
        Self::load_with_capabilities(source, options, &LoaderCapabilities::detect())
    }

    /// Load the model with an explicit description of what this build can load.
    pub fn load_with_capabilities(
        source: ModelSource,
        options: &LoadOptions,
        caps: &LoaderCapabilities,
    ) -> Result<Self> {
        info!("loading from source: {source}.");
        let route = LoadRoute::resolve(&source, caps)?;

        let device = options.device.resolve(options.silent)?;
        let ctx = LoadContext {
            dtype: options.dtype.try_into_dtype(&device, options.silent)?,
            device,
            silent: options.silent,
            token: options.token.clone(),
        };

        let model = match route {
            LoadRoute::Checkpoint(path) => {
                let model_loader = SdxlLoader;
                info!("model architecture is: {}", model_loader.name());
                model_loader.load_from_checkpoint(&path, &ctx)?
            }
            LoadRoute::Components => {
                let mut loader = FileLoader::from_model_source(
                    &source,
                    options.silent,
                    &options.token,
                    options.revision.clone(),
                )?;
                let files = loader.list_files()?;

                if !files.contains(&"model_index.json".to_string()) {
                    anyhow::bail!("Expected `model_index.json` file present.");
                }

                let ModelIndex { name } =
                    serde_json::from_str(&loader.read_file("model_index.json")?.read_to_string()?)?;

                let model_loader: Box<dyn Loader> = match name.as_str() {
                    "StableDiffusionXLPipeline" => Box::new(SdxlLoader),
                    other => anyhow::bail!("Unexpected loader type `{other:?}`."),
                };

                info!("model architecture is: {}", model_loader.name());

                let mut components = HashMap::new();
                for component in NiceProgressBar::<_, 'g'>(
                    model_loader.required_component_names().into_iter(),
                    "Loading components",
                )
                .silent(options.silent)
                {
                    let dir = format!("{component}/");
                    let files_for_component = files
                        .iter()
                        .filter(|file| file.starts_with(&dir))
                        .filter(|file| !file.ends_with('/'))
                        .cloned()
                        .collect::<Vec<_>>();
                    if files_for_component.is_empty() {
                        debug!("component `{component}` is not present in the source.");
                        continue;
                    }

                    // Try to determine the component's type.
                    // 1) Model: models contain .safetensors and potentially a config.json
                    // 2) Config: general config, a file ends with .json
                    // 3) Other: doesn't have safetensors and is not all json
                    let component_elem = if files_for_component
                        .iter()
                        .any(|file| file.ends_with(".safetensors"))
                    {
                        let mut safetensors = HashMap::new();
                        for file in select_weight_files(&files_for_component) {
                            let data = loader.read_file(&file)?;
                            safetensors.insert(file, data);
                        }
                        let config = format!("{dir}config.json");
                        let config = if files_for_component.contains(&config) {
                            Some(loader.read_file(&config)?)
                        } else {
                            None
                        };
                        ComponentElem::Model {
                            safetensors,
                            config,
                        }
                    } else if files_for_component
                        .iter()
                        .all(|file| file.ends_with(".json"))
                    {
                        let mut files = HashMap::new();
                        for file in files_for_component {
                            let data = loader.read_file(&file)?;
                            files.insert(file, data);
                        }
                        ComponentElem::Config { files }
                    } else {
                        let mut files = HashMap::new();
                        for file in files_for_component {
                            let data = loader.read_file(&file)?;
                            files.insert(file, data);
                        }
                        ComponentElem::Other { files }
                    };
                    components.insert(component, component_elem);
                }

                model_loader.load_from_components(components, &ctx)?
            }
        };

        Ok(Self { model })
    }

    /// Wrap an already constructed model.
    pub fn from_model(model: Box<dyn ModelPipeline>) -> Self {
        Self { model }
    }

    pub fn capabilities(&self) -> PipelineCapabilities {
        self.model.capabilities()
    }

    /// Attach the LoRA adapter stored at `dir/weight_name`.
    pub fn load_lora_weights(&mut self, dir: &Path, weight_name: &str) -> Result<()> {
        let adapter = LoraAdapter::load(dir, weight_name)?;
        self.model.load_lora(adapter)
    }

    /// Apply the requested memory-saving strategies that the model does not declare unsupported.
    ///
    /// Attention slicing is best effort: a failure is logged at debug level and otherwise ignored.
    /// A CPU offload failure is returned.
    pub fn apply_optimizations(&mut self, requested: Optimizations) -> Result<()> {
        let caps = self.model.capabilities();
        if requested.attention_slicing {
            if !caps.attention_slicing.may_attempt() {
                debug!("attention slicing is unsupported by this pipeline, skipping.");
            } else if let Err(e) = self.model.enable_attention_slicing() {
                debug!("attention slicing could not be enabled: {e}");
            } else {
                info!("attention slicing enabled.");
            }
        }
        if requested.cpu_offload {
            if caps.cpu_offload.may_attempt() {
                self.model.enable_cpu_offload()?;
                info!("cpu offload enabled.");
            } else {
                debug!("cpu offload is unsupported by this pipeline, skipping.");
            }
        }
        Ok(())
    }

    /// Generate images for a prompt.
    pub fn forward(
        &mut self,
        prompt: &str,
        negative_prompt: Option<&str>,
        params: &DiffusionGenerationParams,
    ) -> Result<Vec<DynamicImage>> {
        params.validate()?;
        let img = self.model.forward(prompt, negative_prompt, params)?;

        let (_b, c, h, w) = img.dims4()?;
        if c != 3 {
            anyhow::bail!("Expected 3 channels in image output");
        }
        let mut images = Vec::new();
        for b_img in img.chunk(img.dim(0)?, 0)? {
            let flattened = b_img
                .squeeze(0)?
                .permute((1, 2, 0))?
                .to_dtype(DType::U8)?
                .flatten_all()?;
            #[allow(clippy::cast_possible_truncation)]
            images.push(DynamicImage::ImageRgb8(
                RgbImage::from_raw(w as u32, h as u32, flattened.to_vec1::<u8>()?)
                    .ok_or(anyhow::anyhow!("RgbImage has invalid capacity."))?,
            ));
        }
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use sdxl_lora_common::ModelSource;

    use super::{select_weight_files, DiffusionGenerationParams, LoadRoute};
    use crate::{
        capability::{Capability, LoaderCapabilities},
        error::LoadError,
    };

    #[test]
    fn prefers_default_weights_over_variants() {
        let files = vec![
            "unet/config.json".to_string(),
            "unet/diffusion_pytorch_model.fp16.safetensors".to_string(),
            "unet/diffusion_pytorch_model.safetensors".to_string(),
        ];
        assert_eq!(
            select_weight_files(&files),
            vec!["unet/diffusion_pytorch_model.safetensors".to_string()]
        );
        let fp16_only = vec!["vae/diffusion_pytorch_model.fp16.safetensors".to_string()];
        assert_eq!(select_weight_files(&fp16_only), fp16_only);
    }

    #[test]
    fn directories_load_by_components() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let caps = LoaderCapabilities {
            single_file: Capability::Unsupported,
        };
        let route = LoadRoute::resolve(&ModelSource::from_path(dir.path()), &caps)?;
        assert_eq!(route, LoadRoute::Components);
        Ok(())
    }

    #[test]
    fn single_files_need_the_capability() {
        let caps = LoaderCapabilities {
            single_file: Capability::Unsupported,
        };
        let source = ModelSource::SingleFile(PathBuf::from("/nonexistent/model.safetensors"));
        let err = LoadRoute::resolve(&source, &caps).unwrap_err();
        assert!(matches!(err, LoadError::MissingCapability { .. }));
        assert!(err.to_string().contains("from_single_file"));
    }

    #[test]
    fn single_files_are_routed_by_format() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let caps = LoaderCapabilities {
            single_file: Capability::Supported,
        };
        let ckpt = dir.path().join("model.safetensors");
        std::fs::write(&ckpt, b"")?;
        assert_eq!(
            LoadRoute::resolve(&ModelSource::from_path(&ckpt), &caps)?,
            LoadRoute::Checkpoint(ckpt.clone())
        );

        let ckpt = dir.path().join("model.ckpt");
        std::fs::write(&ckpt, b"")?;
        assert!(matches!(
            LoadRoute::resolve(&ModelSource::from_path(&ckpt), &caps),
            Err(LoadError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            LoadRoute::resolve(
                &ModelSource::from_path(dir.path().join("missing.safetensors")),
                &caps
            ),
            Err(LoadError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn rejects_sizes_the_latents_cannot_express() {
        let params = DiffusionGenerationParams {
            width: 1020,
            ..Default::default()
        };
        assert!(params.validate().is_err());
        assert!(DiffusionGenerationParams::default().validate().is_ok());
    }
}
