use std::path::PathBuf;

use clap::Parser;
use sdxl_lora_core::{
    caption::{
        caption_directory, ensure_image_dir, load_captioner, CaptionOptions, CaptionerConfig,
        DEFAULT_CAPTION_MODEL,
    },
    DeviceSpec, TokenSource,
};
use tracing::info;

/// Caption every image of a directory with BLIP, writing a `.txt` file next to each image.
#[derive(Debug, Parser)]
#[command(name = "caption_images")]
pub struct Args {
    /// Directory of images, searched recursively.
    #[arg(long)]
    pub images: PathBuf,

    /// Text put before every caption, e.g. a trigger token.
    #[arg(long, default_value = "")]
    pub prefix: String,

    /// Replace existing caption files.
    #[arg(long)]
    pub overwrite: bool,

    /// Maximum number of generated caption tokens.
    #[arg(long, default_value_t = 40)]
    pub max_new_tokens: usize,

    /// Hugging Face model ID or local directory of the BLIP model.
    #[arg(long, default_value = DEFAULT_CAPTION_MODEL)]
    pub model_id: String,

    /// `cpu`, `cuda[:N]` or `metal[:N]`. Empty selects the best available device.
    #[arg(long, default_value = "")]
    pub device: DeviceSpec,

    /// Hugging Face token source: `literal:<token>`, `env[:VAR]`, `path:<file>`, `cache` or `none`.
    #[arg(long, default_value = "cache")]
    pub token_source: TokenSource,
}

pub fn run(args: Args) -> anyhow::Result<()> {
    ensure_image_dir(&args.images)?;

    let config = CaptionerConfig {
        model_id: args.model_id,
        device: args.device.resolve(false)?,
        token: args.token_source,
        silent: false,
    };
    let mut captioner = load_captioner(&config)?;

    let options = CaptionOptions {
        prefix: args.prefix,
        overwrite: args.overwrite,
        max_new_tokens: args.max_new_tokens,
    };
    let summary = caption_directory(&args.images, captioner.as_mut(), &options)?;
    info!(
        "captioned {} images, skipped {}.",
        summary.captioned, summary.skipped
    );
    Ok(())
}
