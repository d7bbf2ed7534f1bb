use anyhow::Result;
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    schedulers::{BetaSchedule, PredictionType},
};
use serde::Deserialize;
use tracing::debug;

/// The subset of a diffusers `scheduler_config.json` that shapes the noise schedule.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SchedulerJson {
    #[serde(rename = "_class_name")]
    class_name: String,
    beta_start: f64,
    beta_end: f64,
    beta_schedule: String,
    steps_offset: usize,
    prediction_type: String,
    num_train_timesteps: usize,
}

impl Default for SchedulerJson {
    fn default() -> Self {
        Self {
            class_name: "EulerDiscreteScheduler".to_string(),
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "scaled_linear".to_string(),
            steps_offset: 1,
            prediction_type: "epsilon".to_string(),
            num_train_timesteps: 1000,
        }
    }
}

/// DDIM settings for SDXL. The noise schedule follows `scheduler_config.json` when given; the sampler is
/// always DDIM.
pub(crate) fn scheduler_config(json: Option<&str>) -> Result<DDIMSchedulerConfig> {
    let cfg: SchedulerJson = match json {
        Some(json) => serde_json::from_str(json)?,
        None => SchedulerJson::default(),
    };
    debug!(
        "noise schedule from `{}`: {} betas in [{}, {}].",
        cfg.class_name, cfg.beta_schedule, cfg.beta_start, cfg.beta_end
    );

    let beta_schedule = match cfg.beta_schedule.as_str() {
        "linear" => BetaSchedule::Linear,
        "scaled_linear" => BetaSchedule::ScaledLinear,
        "squaredcos_cap_v2" => BetaSchedule::SquaredcosCapV2,
        other => anyhow::bail!("Unsupported beta schedule `{other}`."),
    };
    let prediction_type = match cfg.prediction_type.as_str() {
        "epsilon" => PredictionType::Epsilon,
        "v_prediction" => PredictionType::VPrediction,
        "sample" => PredictionType::Sample,
        other => anyhow::bail!("Unsupported prediction type `{other}`."),
    };

    Ok(DDIMSchedulerConfig {
        beta_start: cfg.beta_start,
        beta_end: cfg.beta_end,
        beta_schedule,
        steps_offset: cfg.steps_offset,
        prediction_type,
        train_timesteps: cfg.num_train_timesteps,
        ..Default::default()
    })
}
