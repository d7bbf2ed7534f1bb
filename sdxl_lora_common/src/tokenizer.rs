use tokenizers::Tokenizer;

use crate::FileData;

/// Load a `tokenizer.json`, whether it lives on disk or inside a DDUF archive.
pub fn load_tokenizer(file: &FileData) -> anyhow::Result<Tokenizer> {
    Tokenizer::from_bytes(file.bytes()?).map_err(anyhow::Error::msg)
}
