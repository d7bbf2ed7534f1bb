//! Utilities for loading tensor maps from safetensors storage, ready for `VarBuilder::from_tensors`.

use std::collections::HashMap;

use candle_core::{safetensors::MmapedSafetensors, DType, Device, Result, Tensor};

use crate::{progress::IterWithProgress, safetensors::BytesSafetensors, FileData};

trait TensorLoaderBackend {
    fn get_names(&self) -> Vec<String>;
    fn load_name(&self, name: &str, device: &Device) -> Result<Tensor>;
}

struct SafetensorBackend(MmapedSafetensors);

impl TensorLoaderBackend for SafetensorBackend {
    fn get_names(&self) -> Vec<String> {
        self.0
            .tensors()
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>()
    }
    fn load_name(&self, name: &str, device: &Device) -> Result<Tensor> {
        self.0.load(name, device)
    }
}

struct BytesSafetensorBackend<'a>(BytesSafetensors<'a>);

impl TensorLoaderBackend for BytesSafetensorBackend<'_> {
    fn get_names(&self) -> Vec<String> {
        self.0
            .tensors()
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>()
    }
    fn load_name(&self, name: &str, device: &Device) -> Result<Tensor> {
        self.0.load(name, device)
    }
}

/// Load every tensor of several safetensors files into one map.
/// Floating point tensors are cast to `dtype` when one is given; integer tensors keep their type.
/// Set `silent` to not show a progress bar.
pub fn load_tensors<'a>(
    files: impl IntoIterator<Item = &'a FileData>,
    dtype: Option<DType>,
    device: &Device,
    silent: bool,
) -> Result<HashMap<String, Tensor>> {
    let mut ws = HashMap::new();
    for file in files {
        ws.extend(load_tensors_from_file(file, dtype, device, silent)?);
    }
    Ok(ws)
}

pub fn load_tensors_from_file(
    file: &FileData,
    dtype: Option<DType>,
    device: &Device,
    silent: bool,
) -> Result<HashMap<String, Tensor>> {
    match file.extension().and_then(|ext| ext.to_str()) {
        Some("safetensors") => (),
        other => candle_core::bail!(
            "Unexpected extension `{other:?}` for `{}`, expected `.safetensors`.",
            file.name().display()
        ),
    }

    let tensors: Box<dyn TensorLoaderBackend + '_> = match file {
        FileData::Dduf {
            name,
            data,
            start,
            end,
        } => {
            let Some(bytes) = data.as_ref().get(*start..*end) else {
                candle_core::bail!(
                    "DDUF entry `{}` spans bytes {start}..{end}, past the end of the archive.",
                    name.display()
                )
            };
            Box::new(BytesSafetensorBackend(BytesSafetensors::new(bytes)?))
        }
        FileData::Path(path) => Box::new(SafetensorBackend(unsafe {
            MmapedSafetensors::new(path)?
        })),
    };

    let mut loaded_tensors = HashMap::new();
    for name in tensors.get_names().into_iter().with_progress(silent) {
        let tensor = tensors.load_name(&name, device)?;
        let tensor = match dtype {
            Some(dtype) if tensor.dtype().is_float() => tensor.to_dtype(dtype)?,
            _ => tensor,
        };
        loaded_tensors.insert(name, tensor);
    }

    Ok(loaded_tensors)
}
