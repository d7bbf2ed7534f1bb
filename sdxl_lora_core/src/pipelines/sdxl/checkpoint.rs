//! Loading an original-layout SDXL checkpoint (`.safetensors` holding every component).

use std::{collections::HashMap, path::Path};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use sdxl_lora_common::{load_tensors_from_file, FileData};
use tracing::{debug, info};

use super::SdxlWeights;
use crate::convert::{
    convert_open_clip_key, convert_unet_key, convert_vae_key, is_vae_attention_projection,
    OpenClipKey, CLIP_G_PREFIX, CLIP_L_PREFIX, SDXL_LAYERS_PER_BLOCK, SDXL_VAE_BLOCKS, UNET_PREFIX,
    VAE_PREFIX,
};

pub(crate) fn load_checkpoint(path: &Path, dtype: DType, silent: bool) -> Result<SdxlWeights> {
    info!("converting single-file checkpoint `{}`.", path.display());
    let tensors = load_tensors_from_file(
        &FileData::Path(path.to_path_buf()),
        None,
        &Device::Cpu,
        silent,
    )?;
    split_checkpoint(tensors, dtype)
}

fn cast(tensor: Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype().is_float() {
        Ok(tensor.to_dtype(dtype)?)
    } else {
        Ok(tensor)
    }
}

/// Split a checkpoint's tensors by component and rename them to the diffusers layout.
pub(crate) fn split_checkpoint(tensors: HashMap<String, Tensor>, dtype: DType) -> Result<SdxlWeights> {
    let mut weights = SdxlWeights::default();
    let mut unused = 0usize;

    for (key, tensor) in tensors {
        if let Some(rest) = key.strip_prefix(UNET_PREFIX) {
            match convert_unet_key(rest, SDXL_LAYERS_PER_BLOCK) {
                Some(name) => {
                    weights.unet.insert(name, cast(tensor, dtype)?);
                }
                None => unused += 1,
            }
        } else if let Some(rest) = key.strip_prefix(VAE_PREFIX) {
            let Some(name) = convert_vae_key(rest, SDXL_VAE_BLOCKS) else {
                unused += 1;
                continue;
            };
            let tensor = if is_vae_attention_projection(&name) && tensor.rank() == 4 {
                let (out_dim, in_dim, _, _) = tensor.dims4()?;
                tensor.reshape((out_dim, in_dim))?
            } else {
                tensor
            };
            weights.vae.insert(name, cast(tensor, DType::F32)?);
        } else if let Some(rest) = key.strip_prefix(CLIP_L_PREFIX) {
            weights
                .text_encoder
                .insert(rest.to_string(), cast(tensor, dtype)?);
        } else if let Some(rest) = key.strip_prefix(CLIP_G_PREFIX) {
            match convert_open_clip_key(rest) {
                OpenClipKey::Renamed(name) => {
                    weights.text_encoder_2.insert(name, cast(tensor, dtype)?);
                }
                OpenClipKey::FusedQkv { prefix, suffix } => {
                    let chunks = tensor.chunk(3, 0)?;
                    for (proj, chunk) in ["q_proj", "k_proj", "v_proj"].into_iter().zip(chunks) {
                        weights.text_encoder_2.insert(
                            format!("{prefix}.{proj}.{suffix}"),
                            cast(chunk.contiguous()?, dtype)?,
                        );
                    }
                }
                OpenClipKey::Unused => unused += 1,
            }
        } else {
            unused += 1;
        }
    }
    debug!("{unused} checkpoint tensors are not used.");

    for (component, map) in [
        ("unet", &weights.unet),
        ("vae", &weights.vae),
        ("text_encoder", &weights.text_encoder),
        ("text_encoder_2", &weights.text_encoder_2),
    ] {
        if map.is_empty() {
            anyhow::bail!("Checkpoint has no `{component}` weights; is this an SDXL checkpoint?");
        }
    }
    Ok(weights)
}
