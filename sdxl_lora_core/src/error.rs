use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while resolving how to load a base model, before any weights are read.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("This build does not support `{capability}`. {hint}")]
    MissingCapability {
        capability: &'static str,
        hint: &'static str,
    },
    #[error("Unsupported single-file format `{}`, expected a `.safetensors` checkpoint or a `.dduf` archive.", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("Base model `{}` does not exist.", .0.display())]
    NotFound(PathBuf),
}

impl LoadError {
    pub fn missing_single_file() -> Self {
        Self::MissingCapability {
            capability: "from_single_file",
            hint: "Pass a diffusers-format directory to --base-model, or rebuild with the `single-file` feature.",
        }
    }
}

/// Errors raised by the captioning module.
///
/// `NotInstalled` and `Unavailable` mean the captioning model cannot be obtained at all; `Incompatible`
/// means it was obtained but cannot be used.
#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("Captioning is not installed in this build. Rebuild with `--features {feature}` to enable the BLIP captioner.")]
    NotInstalled { feature: &'static str },
    #[error("Could not fetch captioning model `{model_id}`: {source}")]
    Unavailable {
        model_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("Captioning model `{model_id}` is incompatible: {reason}")]
    Incompatible { model_id: String, reason: String },
}
