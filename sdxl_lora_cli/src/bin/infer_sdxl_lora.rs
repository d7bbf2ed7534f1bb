use clap::Parser;
use sdxl_lora_cli::infer::{run, Args};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    sdxl_lora_cli::init_logging();
    run(args)
}
