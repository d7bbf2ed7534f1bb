//! The txt2img run: one image per iteration, each with its own seed, saved under a per-run timestamp.

use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use rand::Rng;
use tracing::info;

use crate::pipelines::{DiffusionGenerationParams, Pipeline};

/// Largest seed drawn by [`SeedPolicy::Random`].
pub const MAX_RANDOM_SEED: u64 = (1 << 31) - 1;

/// How the seed of each image of a run is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPolicy {
    /// Image `i` uses `base + i`.
    Fixed(u64),
    /// Every image draws a fresh seed in `0..=MAX_RANDOM_SEED`.
    Random,
}

impl SeedPolicy {
    /// Negative values select random seeds.
    pub fn from_arg(seed: i64) -> Self {
        match u64::try_from(seed) {
            Ok(seed) => Self::Fixed(seed),
            Err(_) => Self::Random,
        }
    }

    pub fn seed_for<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> u64 {
        match self {
            Self::Fixed(base) => base.saturating_add(index as u64),
            Self::Random => rng.gen_range(0..=MAX_RANDOM_SEED),
        }
    }
}

/// Timestamp shared by every output file of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStamp(String);

impl RunStamp {
    pub fn now() -> Self {
        Self(chrono::Local::now().format("%Y%m%d_%H%M%S").to_string())
    }

    pub fn from_string<S: ToString>(stamp: S) -> Self {
        Self(stamp.to_string())
    }
}

impl Display for RunStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn output_file_name(stamp: &RunStamp, index: usize, seed: u64) -> String {
    format!("sdxl_lora_{stamp}_{index:02}_seed{seed}.png")
}

/// Everything one run of the inference tool produces images from.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub out_dir: PathBuf,
    pub num_images: usize,
    pub seed: SeedPolicy,
    /// Shared by every image; `seed` is replaced per image.
    pub params: DiffusionGenerationParams,
}

/// Generate `job.num_images` images and save them to `job.out_dir`, returning the written paths.
pub fn run_generation<R: Rng + ?Sized>(
    pipeline: &mut Pipeline,
    job: &GenerationJob,
    stamp: &RunStamp,
    rng: &mut R,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(&job.out_dir).with_context(|| {
        format!("Failed to create output directory `{}`", job.out_dir.display())
    })?;

    let mut written = Vec::with_capacity(job.num_images);
    for index in 0..job.num_images {
        let seed = job.seed.seed_for(index, rng);
        let params = DiffusionGenerationParams {
            seed,
            ..job.params.clone()
        };
        info!(index, seed, "generating image");

        let images = pipeline.forward(&job.prompt, job.negative_prompt.as_deref(), &params)?;
        let Some(image) = images.first() else {
            anyhow::bail!("Pipeline returned no image.");
        };
        let path = job.out_dir.join(output_file_name(stamp, index, seed));
        save(image, &path)?;
        println!("{}", path.display());
        written.push(path);
    }
    Ok(written)
}

fn save(image: &image::DynamicImage, path: &Path) -> Result<()> {
    image
        .save(path)
        .with_context(|| format!("Failed to save `{}`", path.display()))
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::{output_file_name, RunStamp, SeedPolicy, MAX_RANDOM_SEED};

    #[test]
    fn negative_seeds_are_random() {
        assert_eq!(SeedPolicy::from_arg(-1), SeedPolicy::Random);
        assert_eq!(SeedPolicy::from_arg(-42), SeedPolicy::Random);
        assert_eq!(SeedPolicy::from_arg(0), SeedPolicy::Fixed(0));
    }

    #[test]
    fn fixed_seeds_count_up() {
        let mut rng = StdRng::seed_from_u64(0);
        let policy = SeedPolicy::Fixed(10);
        assert_eq!(policy.seed_for(0, &mut rng), 10);
        assert_eq!(policy.seed_for(1, &mut rng), 11);
        assert_eq!(SeedPolicy::Fixed(u64::MAX).seed_for(3, &mut rng), u64::MAX);
    }

    #[test]
    fn random_seeds_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(3);
        for i in 0..100 {
            assert!(SeedPolicy::Random.seed_for(i, &mut rng) <= MAX_RANDOM_SEED);
        }
    }

    #[test]
    fn file_names() {
        let stamp = RunStamp::from_string("20240102_030405");
        assert_eq!(
            output_file_name(&stamp, 3, 12),
            "sdxl_lora_20240102_030405_03_seed12.png"
        );
        assert_eq!(RunStamp::now().to_string().len(), "20240102_030405".len());
    }
}
