//! Command line front ends of sdxl_lora: `caption_images` and `infer_sdxl_lora`.

pub mod caption;
pub mod infer;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Log to stderr at `INFO` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
