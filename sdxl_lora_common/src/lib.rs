//! Shared plumbing for `sdxl_lora`: where model files come from, how they are read and how their tensors
//! are loaded.

mod model_source;
mod progress;
mod safetensors;
mod tokenizer;
mod tokens;
mod varbuilder_loading;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub use model_source::*;
pub use progress::{IterWithProgress, NiceProgressBar};
pub use safetensors::BytesSafetensors;
pub use tokenizer::load_tokenizer;
pub use tokens::{get_token, TokenRetrievalError, TokenSource};
pub use varbuilder_loading::{load_tensors, load_tensors_from_file};
