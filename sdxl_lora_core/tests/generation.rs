use std::{cell::RefCell, rc::Rc};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use sdxl_lora_core::{
    run_generation, Capability, DiffusionGenerationParams, GenerationJob, LoraAdapter,
    ModelPipeline, Optimizations, Pipeline, PipelineCapabilities, RunStamp, SeedPolicy,
    MAX_RANDOM_SEED,
};

/// Records every call instead of running a model.
#[derive(Default)]
struct FakePipeline {
    seeds: Rc<RefCell<Vec<u64>>>,
    negative_prompts: Rc<RefCell<Vec<Option<String>>>>,
    slicing_fails: bool,
    offload_fails: bool,
}

impl ModelPipeline for FakePipeline {
    fn capabilities(&self) -> PipelineCapabilities {
        PipelineCapabilities {
            attention_slicing: Capability::Unknown,
            cpu_offload: Capability::Supported,
        }
    }

    fn load_lora(&mut self, _adapter: LoraAdapter) -> Result<()> {
        Ok(())
    }

    fn enable_attention_slicing(&mut self) -> Result<()> {
        if self.slicing_fails {
            anyhow::bail!("no slicing here");
        }
        Ok(())
    }

    fn enable_cpu_offload(&mut self) -> Result<()> {
        if self.offload_fails {
            anyhow::bail!("no offload here");
        }
        Ok(())
    }

    fn forward(
        &mut self,
        _prompt: &str,
        negative_prompt: Option<&str>,
        params: &DiffusionGenerationParams,
    ) -> Result<Tensor> {
        self.seeds.borrow_mut().push(params.seed);
        self.negative_prompts
            .borrow_mut()
            .push(negative_prompt.map(str::to_string));
        Ok(Tensor::zeros((1, 3, 8, 8), DType::U8, &Device::Cpu)?)
    }
}

fn job(out_dir: &std::path::Path, num_images: usize, seed: SeedPolicy) -> GenerationJob {
    GenerationJob {
        prompt: "a photo of sksSubject".to_string(),
        negative_prompt: None,
        out_dir: out_dir.to_path_buf(),
        num_images,
        seed,
        params: DiffusionGenerationParams {
            width: 64,
            height: 64,
            num_steps: 2,
            ..Default::default()
        },
    }
}

fn file_names(paths: &[std::path::PathBuf]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn fixed_seeds_count_up_per_image() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let out_dir = dir.path().join("nested/outputs");
    let fake = FakePipeline::default();
    let seeds = fake.seeds.clone();
    let mut pipeline = Pipeline::from_model(Box::new(fake));

    let stamp = RunStamp::from_string("20240101_120000");
    let written = run_generation(
        &mut pipeline,
        &job(&out_dir, 2, SeedPolicy::from_arg(10)),
        &stamp,
        &mut StdRng::seed_from_u64(0),
    )?;

    assert_eq!(*seeds.borrow(), vec![10, 11]);
    assert_eq!(
        file_names(&written),
        vec![
            "sdxl_lora_20240101_120000_00_seed10.png",
            "sdxl_lora_20240101_120000_01_seed11.png"
        ]
    );
    assert!(written.iter().all(|p| p.is_file()));
    Ok(())
}

#[test]
fn random_seeds_come_from_the_random_source() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fake = FakePipeline::default();
    let seeds = fake.seeds.clone();
    let mut pipeline = Pipeline::from_model(Box::new(fake));

    let rng = StdRng::seed_from_u64(777);
    let mut expected_rng = rng.clone();
    let expected = (0..3)
        .map(|_| expected_rng.gen_range(0..=MAX_RANDOM_SEED))
        .collect::<Vec<_>>();

    let stamp = RunStamp::from_string("20240101_120000");
    let written = run_generation(
        &mut pipeline,
        &job(dir.path(), 3, SeedPolicy::from_arg(-1)),
        &stamp,
        &mut rng.clone(),
    )?;

    assert_eq!(*seeds.borrow(), expected);
    for (i, (name, seed)) in file_names(&written).iter().zip(&expected).enumerate() {
        assert_eq!(name, &format!("sdxl_lora_20240101_120000_{i:02}_seed{seed}.png"));
    }
    Ok(())
}

#[test]
fn failed_attention_slicing_does_not_abort_generation() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fake = FakePipeline {
        slicing_fails: true,
        ..Default::default()
    };
    let seeds = fake.seeds.clone();
    let mut pipeline = Pipeline::from_model(Box::new(fake));

    pipeline.apply_optimizations(Optimizations {
        attention_slicing: true,
        cpu_offload: false,
    })?;
    let written = run_generation(
        &mut pipeline,
        &job(dir.path(), 1, SeedPolicy::Fixed(5)),
        &RunStamp::now(),
        &mut StdRng::seed_from_u64(0),
    )?;
    assert_eq!(written.len(), 1);
    assert_eq!(*seeds.borrow(), vec![5]);
    Ok(())
}

#[test]
fn failed_cpu_offload_is_reported() {
    let mut pipeline = Pipeline::from_model(Box::new(FakePipeline {
        offload_fails: true,
        ..Default::default()
    }));
    let err = pipeline
        .apply_optimizations(Optimizations {
            attention_slicing: false,
            cpu_offload: true,
        })
        .unwrap_err();
    assert!(err.to_string().contains("no offload here"));
}

#[test]
fn negative_prompt_is_passed_through() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fake = FakePipeline::default();
    let negative_prompts = fake.negative_prompts.clone();
    let mut pipeline = Pipeline::from_model(Box::new(fake));

    let mut job = job(dir.path(), 1, SeedPolicy::Fixed(0));
    job.negative_prompt = Some("blurry".to_string());
    run_generation(
        &mut pipeline,
        &job,
        &RunStamp::now(),
        &mut StdRng::seed_from_u64(0),
    )?;
    assert_eq!(*negative_prompts.borrow(), vec![Some("blurry".to_string())]);
    Ok(())
}

#[test]
fn invalid_sizes_fail_before_generation() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fake = FakePipeline::default();
    let seeds = fake.seeds.clone();
    let mut pipeline = Pipeline::from_model(Box::new(fake));

    let mut job = job(dir.path(), 1, SeedPolicy::Fixed(0));
    job.params.width = 100;
    assert!(run_generation(
        &mut pipeline,
        &job,
        &RunStamp::now(),
        &mut StdRng::seed_from_u64(0)
    )
    .is_err());
    assert!(seeds.borrow().is_empty());
    Ok(())
}
