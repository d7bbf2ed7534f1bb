//! Captioning of a directory of images: every supported image gets a sibling `.txt` file with its caption.

#[cfg(feature = "caption")]
mod blip;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use image::DynamicImage;
use sdxl_lora_common::TokenSource;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::CaptionError;

/// Extensions (compared case-insensitively) of the files that are captioned.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];

pub const DEFAULT_CAPTION_MODEL: &str = "Salesforce/blip-image-captioning-base";

/// Produces a caption for one image.
pub trait Captioner {
    /// Generate at most `max_new_tokens` tokens of caption text, with special tokens removed.
    fn caption(&mut self, image: &DynamicImage, max_new_tokens: usize) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionOptions {
    /// Prepended to every caption, separated by one space. Ignored when blank.
    pub prefix: String,
    /// Replace caption files that already exist.
    pub overwrite: bool,
    pub max_new_tokens: usize,
}

impl Default for CaptionOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            overwrite: false,
            max_new_tokens: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptionSummary {
    pub captioned: usize,
    pub skipped: usize,
}

/// Where and how to obtain the captioning model.
#[derive(Debug, Clone)]
pub struct CaptionerConfig {
    /// A Hugging Face model ID or a local directory.
    pub model_id: String,
    pub device: Device,
    pub token: TokenSource,
    pub silent: bool,
}

impl CaptionerConfig {
    pub fn new(device: Device) -> Self {
        Self {
            model_id: DEFAULT_CAPTION_MODEL.to_string(),
            device,
            token: TokenSource::default(),
            silent: false,
        }
    }
}

pub fn ensure_image_dir(path: &Path) -> Result<(), CaptionError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(CaptionError::NotADirectory(path.to_path_buf()))
    }
}

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// All supported image files below `dir`, recursively, in sorted path order.
pub fn iter_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if entry.path().is_file() && is_supported_image(entry.path()) {
            images.push(entry.into_path());
        }
    }
    Ok(images)
}

pub fn caption_path_for(image: &Path) -> PathBuf {
    image.with_extension("txt")
}

pub fn format_caption(prefix: &str, caption: &str) -> String {
    let (prefix, caption) = (prefix.trim(), caption.trim());
    if prefix.is_empty() {
        format!("{caption}\n")
    } else {
        format!("{prefix} {caption}\n")
    }
}

/// Decode by content. Training sets often carry images whose extension lies about the format.
fn open_image(path: &Path) -> Result<DynamicImage> {
    Ok(image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?)
}

fn captioned_line(image: &Path, caption: &Path) -> String {
    let name = |path: &Path| path.file_name().unwrap_or_default().to_string_lossy().into_owned();
    format!("[captioned] {} -> {}", name(image), name(caption))
}

/// Caption every image below `dir`. The first failure aborts the run.
pub fn caption_directory(
    dir: &Path,
    captioner: &mut dyn Captioner,
    options: &CaptionOptions,
) -> Result<CaptionSummary> {
    ensure_image_dir(dir)?;
    let mut summary = CaptionSummary::default();

    for path in iter_images(dir)? {
        let out = caption_path_for(&path);
        if out.exists() && !options.overwrite {
            debug!("caption exists for `{}`, skipping.", path.display());
            summary.skipped += 1;
            continue;
        }

        let image = open_image(&path)
            .with_context(|| format!("Failed to open image `{}`", path.display()))?;
        let image = DynamicImage::ImageRgb8(image.to_rgb8());
        let caption = captioner.caption(&image, options.max_new_tokens)?;
        let caption = caption.trim();
        std::fs::write(&out, format_caption(&options.prefix, caption))
            .with_context(|| format!("Failed to write `{}`", out.display()))?;

        debug!("`{}`: {caption}", path.display());
        println!("{}", captioned_line(&path, &out));
        summary.captioned += 1;
    }

    info!(
        captioned = summary.captioned,
        skipped = summary.skipped,
        "captioning done"
    );
    Ok(summary)
}

/// Load the captioning model. Done once, before any image is read.
pub fn load_captioner(config: &CaptionerConfig) -> Result<Box<dyn Captioner>, CaptionError> {
    #[cfg(feature = "caption")]
    {
        Ok(Box::new(blip::BlipCaptioner::load(config)?))
    }
    #[cfg(not(feature = "caption"))]
    {
        let _ = config;
        Err(CaptionError::NotInstalled { feature: "caption" })
    }
}
