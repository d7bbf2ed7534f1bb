//! Key mapping from the original single-checkpoint (SGM) layout to the diffusers layout.
//!
//! Dotted keys (`input_blocks.4.1.proj_in.weight`) come from checkpoints; underscored module names
//! (`input_blocks_4_1_proj_in`) come from kohya LoRA files. Both go through the same block arithmetic.

pub(crate) const SDXL_LAYERS_PER_BLOCK: usize = 2;
pub(crate) const SDXL_VAE_BLOCKS: usize = 4;

pub(crate) const UNET_PREFIX: &str = "model.diffusion_model.";
pub(crate) const VAE_PREFIX: &str = "first_stage_model.";
pub(crate) const CLIP_L_PREFIX: &str = "conditioner.embedders.0.transformer.";
pub(crate) const CLIP_G_PREFIX: &str = "conditioner.embedders.1.model.";

const UNET_TOP_LEVEL: &[(&str, &str)] = &[
    ("time_embed.0", "time_embedding.linear_1"),
    ("time_embed.2", "time_embedding.linear_2"),
    ("label_emb.0.0", "add_embedding.linear_1"),
    ("label_emb.0.2", "add_embedding.linear_2"),
    ("input_blocks.0.0", "conv_in"),
    ("out.0", "conv_norm_out"),
    ("out.2", "conv_out"),
];

const UNET_RESNET: &[(&str, &str)] = &[
    ("in_layers.0", "norm1"),
    ("in_layers.2", "conv1"),
    ("out_layers.0", "norm2"),
    ("out_layers.3", "conv2"),
    ("emb_layers.1", "time_emb_proj"),
    ("skip_connection", "conv_shortcut"),
];

const UNET_DOWNSAMPLER: &[(&str, &str)] = &[("op", "conv")];

const VAE_TOP_LEVEL: &[(&str, &str)] = &[
    ("conv_in", "conv_in"),
    ("conv_out", "conv_out"),
    ("norm_out", "conv_norm_out"),
    ("mid.block_1", "mid_block.resnets.0"),
    ("mid.block_2", "mid_block.resnets.1"),
];

const VAE_RESNET: &[(&str, &str)] = &[("nin_shortcut", "conv_shortcut")];

const VAE_ATTENTION: &[(&str, &str)] = &[
    ("norm", "group_norm"),
    ("q", "to_q"),
    ("k", "to_k"),
    ("v", "to_v"),
    ("proj_out", "to_out.0"),
];

const OPEN_CLIP_LAYER: &[(&str, &str)] = &[
    ("ln_1", "layer_norm1"),
    ("ln_2", "layer_norm2"),
    ("mlp.c_fc", "mlp.fc1"),
    ("mlp.c_proj", "mlp.fc2"),
    ("attn.out_proj", "self_attn.out_proj"),
];

/// Replace the first matching `from` prefix of `key` by its `to`. A prefix only matches whole segments,
/// separated by `sep`. With `sep == '_'` the table's dots are read as underscores.
fn rename_prefix(key: &str, table: &[(&str, &str)], sep: char) -> Option<String> {
    for (from, to) in table {
        let (from, to) = if sep == '.' {
            (from.to_string(), to.to_string())
        } else {
            (from.replace('.', "_"), to.replace('.', "_"))
        };
        if let Some(rest) = key.strip_prefix(&from) {
            if rest.is_empty() {
                return Some(to);
            }
            if rest.starts_with(sep) {
                return Some(format!("{to}{rest}"));
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Resnet,
    Attention,
    Downsampler,
    Upsampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Input,
    Middle,
    Output,
}

/// The diffusers module prefix of one SGM UNet sub-block. `head` is the first segment after the address,
/// which tells a resampler apart from the block's main module.
fn block_prefix(
    kind: BlockKind,
    i: usize,
    j: usize,
    head: &str,
    layers_per_block: usize,
) -> Option<(String, Role)> {
    let stride = layers_per_block + 1;
    match kind {
        BlockKind::Input => {
            let (block, layer) = (i.checked_sub(1)? / stride, (i - 1) % stride);
            match (j, head) {
                (0, "op") => Some((
                    format!("down_blocks.{block}.downsamplers.0"),
                    Role::Downsampler,
                )),
                (0, _) => Some((format!("down_blocks.{block}.resnets.{layer}"), Role::Resnet)),
                (1, _) => Some((
                    format!("down_blocks.{block}.attentions.{layer}"),
                    Role::Attention,
                )),
                _ => None,
            }
        }
        BlockKind::Middle => match j {
            0 => Some(("mid_block.resnets.0".to_string(), Role::Resnet)),
            1 => Some(("mid_block.attentions.0".to_string(), Role::Attention)),
            2 => Some(("mid_block.resnets.1".to_string(), Role::Resnet)),
            _ => None,
        },
        BlockKind::Output => {
            let (block, layer) = (i / stride, i % stride);
            match (j, head) {
                (0, _) => Some((format!("up_blocks.{block}.resnets.{layer}"), Role::Resnet)),
                (1 | 2, "conv") => Some((format!("up_blocks.{block}.upsamplers.0"), Role::Upsampler)),
                (1, _) => Some((
                    format!("up_blocks.{block}.attentions.{layer}"),
                    Role::Attention,
                )),
                _ => None,
            }
        }
    }
}

fn block_rest(rest: &str, role: Role, sep: char) -> String {
    let table = match role {
        Role::Resnet => UNET_RESNET,
        Role::Downsampler => UNET_DOWNSAMPLER,
        Role::Attention | Role::Upsampler => return rest.to_string(),
    };
    rename_prefix(rest, table, sep).unwrap_or_else(|| rest.to_string())
}

/// Split `input_blocks.4.1.rest`, `middle_block.1.rest` or `output_blocks.2.2.rest` (with `sep` between
/// segments) into its address and the remainder.
fn split_block(key: &str, sep: char) -> Option<(BlockKind, usize, usize, &str)> {
    let kinds = [
        ("input_blocks", BlockKind::Input),
        ("middle_block", BlockKind::Middle),
        ("output_blocks", BlockKind::Output),
    ];
    let (kind, tail) = kinds.iter().find_map(|(name, kind)| {
        key.strip_prefix(name)
            .and_then(|tail| tail.strip_prefix(sep))
            .map(|tail| (*kind, tail))
    })?;

    fn next_index(tail: &str, sep: char) -> Option<(usize, &str)> {
        let (index, rest) = tail.split_once(sep)?;
        Some((index.parse().ok()?, rest))
    }
    match kind {
        BlockKind::Middle => {
            let (j, rest) = next_index(tail, sep)?;
            Some((kind, 0, j, rest))
        }
        BlockKind::Input | BlockKind::Output => {
            let (i, tail) = next_index(tail, sep)?;
            let (j, rest) = next_index(tail, sep)?;
            Some((kind, i, j, rest))
        }
    }
}

fn convert_unet(key: &str, layers_per_block: usize, sep: char) -> Option<String> {
    if let Some(renamed) = rename_prefix(key, UNET_TOP_LEVEL, sep) {
        return Some(renamed);
    }
    let (kind, i, j, rest) = split_block(key, sep)?;
    let head = rest.split(sep).next().unwrap_or_default();
    let (prefix, role) = block_prefix(kind, i, j, head, layers_per_block)?;
    let prefix = if sep == '.' {
        prefix
    } else {
        prefix.replace('.', "_")
    };
    Some(format!("{prefix}{sep}{}", block_rest(rest, role, sep)))
}

/// Convert a checkpoint UNet key (with `model.diffusion_model.` already stripped).
pub(crate) fn convert_unet_key(key: &str, layers_per_block: usize) -> Option<String> {
    convert_unet(key, layers_per_block, '.')
}

/// Convert a kohya UNet module name in SGM naming (with `lora_unet_` already stripped) to the underscored
/// diffusers module name.
pub(crate) fn convert_kohya_unet_name(name: &str, layers_per_block: usize) -> Option<String> {
    convert_unet(name, layers_per_block, '_')
}

/// Convert a checkpoint VAE key (with `first_stage_model.` already stripped).
/// `num_blocks` is the number of resolution levels; the decoder's `up` levels are stored in reverse.
pub(crate) fn convert_vae_key(key: &str, num_blocks: usize) -> Option<String> {
    let (side, rest) = key.split_once('.')?;
    if matches!(side, "quant_conv" | "post_quant_conv") {
        return Some(key.to_string());
    }
    if !matches!(side, "encoder" | "decoder") {
        return None;
    }

    let resnet = |rest: &str| rename_prefix(rest, VAE_RESNET, '.').unwrap_or_else(|| rest.to_string());
    let converted = if let Some(renamed) = rename_prefix(rest, VAE_TOP_LEVEL, '.') {
        renamed
    } else if let Some(attn) = rest.strip_prefix("mid.attn_1.") {
        format!(
            "mid_block.attentions.0.{}",
            rename_prefix(attn, VAE_ATTENTION, '.')?
        )
    } else {
        let segments = rest.splitn(5, '.').collect::<Vec<_>>();
        match segments.as_slice() {
            ["down", i, "block", j, rest] => format!("down_blocks.{i}.resnets.{j}.{}", resnet(*rest)),
            ["down", i, "downsample", rest @ ..] => {
                format!("down_blocks.{i}.downsamplers.0.{}", rest.join("."))
            }
            ["up", i, "block", j, rest] => {
                let block = num_blocks.checked_sub(1 + i.parse::<usize>().ok()?)?;
                format!("up_blocks.{block}.resnets.{j}.{}", resnet(*rest))
            }
            ["up", i, "upsample", rest @ ..] => {
                let block = num_blocks.checked_sub(1 + i.parse::<usize>().ok()?)?;
                format!("up_blocks.{block}.upsamplers.0.{}", rest.join("."))
            }
            _ => return None,
        }
    };
    Some(format!("{side}.{converted}"))
}

/// The VAE attention projections are 1x1 convolutions in checkpoints and linear layers in diffusers.
pub(crate) fn is_vae_attention_projection(key: &str) -> bool {
    key.contains("mid_block.attentions.0.to_") && key.ends_with(".weight")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OpenClipKey {
    Renamed(String),
    /// A fused `in_proj` tensor to split into `q_proj`, `k_proj` and `v_proj` under `prefix`.
    FusedQkv {
        prefix: String,
        suffix: &'static str,
    },
    Unused,
}

/// Convert an OpenCLIP text tower key (with `conditioner.embedders.1.model.` already stripped) to the
/// transformers CLIP layout.
pub(crate) fn convert_open_clip_key(key: &str) -> OpenClipKey {
    match key {
        "token_embedding.weight" => {
            return OpenClipKey::Renamed("text_model.embeddings.token_embedding.weight".to_string())
        }
        "positional_embedding" => {
            return OpenClipKey::Renamed(
                "text_model.embeddings.position_embedding.weight".to_string(),
            )
        }
        _ => (),
    }
    if let Some(rest) = key.strip_prefix("ln_final.") {
        return OpenClipKey::Renamed(format!("text_model.final_layer_norm.{rest}"));
    }
    let Some(rest) = key.strip_prefix("transformer.resblocks.") else {
        return OpenClipKey::Unused;
    };
    let Some((layer, rest)) = rest.split_once('.') else {
        return OpenClipKey::Unused;
    };
    let prefix = format!("text_model.encoder.layers.{layer}");
    match rest {
        "attn.in_proj_weight" => OpenClipKey::FusedQkv {
            prefix: format!("{prefix}.self_attn"),
            suffix: "weight",
        },
        "attn.in_proj_bias" => OpenClipKey::FusedQkv {
            prefix: format!("{prefix}.self_attn"),
            suffix: "bias",
        },
        rest => match rename_prefix(rest, OPEN_CLIP_LAYER, '.') {
            Some(renamed) => OpenClipKey::Renamed(format!("{prefix}.{renamed}")),
            None => OpenClipKey::Unused,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unet_blocks() {
        let cases = [
            ("input_blocks.0.0.weight", "conv_in.weight"),
            ("time_embed.2.bias", "time_embedding.linear_2.bias"),
            ("label_emb.0.0.weight", "add_embedding.linear_1.weight"),
            (
                "input_blocks.1.0.in_layers.2.weight",
                "down_blocks.0.resnets.0.conv1.weight",
            ),
            (
                "input_blocks.3.0.op.weight",
                "down_blocks.0.downsamplers.0.conv.weight",
            ),
            (
                "input_blocks.4.1.transformer_blocks.0.attn1.to_q.weight",
                "down_blocks.1.attentions.0.transformer_blocks.0.attn1.to_q.weight",
            ),
            (
                "input_blocks.5.0.skip_connection.bias",
                "down_blocks.1.resnets.1.conv_shortcut.bias",
            ),
            (
                "middle_block.2.emb_layers.1.weight",
                "mid_block.resnets.1.time_emb_proj.weight",
            ),
            (
                "middle_block.1.proj_out.weight",
                "mid_block.attentions.0.proj_out.weight",
            ),
            (
                "output_blocks.2.2.conv.weight",
                "up_blocks.0.upsamplers.0.conv.weight",
            ),
            (
                "output_blocks.5.1.norm.weight",
                "up_blocks.1.attentions.2.norm.weight",
            ),
            (
                "output_blocks.8.0.out_layers.3.weight",
                "up_blocks.2.resnets.2.conv2.weight",
            ),
            ("out.2.bias", "conv_out.bias"),
        ];
        for (sgm, diffusers) in cases {
            assert_eq!(
                convert_unet_key(sgm, SDXL_LAYERS_PER_BLOCK).as_deref(),
                Some(diffusers),
                "{sgm}"
            );
        }
        assert_eq!(convert_unet_key("bogus.0.weight", SDXL_LAYERS_PER_BLOCK), None);
    }

    #[test]
    fn kohya_sgm_names() {
        assert_eq!(
            convert_kohya_unet_name(
                "input_blocks_4_1_transformer_blocks_0_attn1_to_q",
                SDXL_LAYERS_PER_BLOCK
            )
            .as_deref(),
            Some("down_blocks_1_attentions_0_transformer_blocks_0_attn1_to_q")
        );
        assert_eq!(
            convert_kohya_unet_name("output_blocks_2_2_conv", SDXL_LAYERS_PER_BLOCK).as_deref(),
            Some("up_blocks_0_upsamplers_0_conv")
        );
        assert_eq!(
            convert_kohya_unet_name("input_blocks_1_0_emb_layers_1", SDXL_LAYERS_PER_BLOCK)
                .as_deref(),
            Some("down_blocks_0_resnets_0_time_emb_proj")
        );
        assert_eq!(
            convert_kohya_unet_name("middle_block_1_proj_in", SDXL_LAYERS_PER_BLOCK).as_deref(),
            Some("mid_block_attentions_0_proj_in")
        );
        assert_eq!(
            convert_kohya_unet_name("down_blocks_0_resnets_0_conv1", SDXL_LAYERS_PER_BLOCK),
            None
        );
    }

    #[test]
    fn vae_levels_are_reversed_in_the_decoder() {
        let cases = [
            (
                "encoder.down.1.block.0.nin_shortcut.weight",
                "encoder.down_blocks.1.resnets.0.conv_shortcut.weight",
            ),
            (
                "encoder.down.0.downsample.conv.bias",
                "encoder.down_blocks.0.downsamplers.0.conv.bias",
            ),
            (
                "decoder.up.0.block.2.conv2.weight",
                "decoder.up_blocks.3.resnets.2.conv2.weight",
            ),
            (
                "decoder.up.3.upsample.conv.weight",
                "decoder.up_blocks.0.upsamplers.0.conv.weight",
            ),
            (
                "decoder.mid.attn_1.proj_out.weight",
                "decoder.mid_block.attentions.0.to_out.0.weight",
            ),
            (
                "encoder.mid.block_2.norm1.bias",
                "encoder.mid_block.resnets.1.norm1.bias",
            ),
            ("encoder.norm_out.weight", "encoder.conv_norm_out.weight"),
            ("post_quant_conv.weight", "post_quant_conv.weight"),
        ];
        for (sgm, diffusers) in cases {
            assert_eq!(
                convert_vae_key(sgm, SDXL_VAE_BLOCKS).as_deref(),
                Some(diffusers),
                "{sgm}"
            );
        }
        assert!(is_vae_attention_projection(
            "decoder.mid_block.attentions.0.to_q.weight"
        ));
        assert!(!is_vae_attention_projection(
            "decoder.mid_block.attentions.0.group_norm.weight"
        ));
    }

    #[test]
    fn open_clip_layers() {
        assert_eq!(
            convert_open_clip_key("transformer.resblocks.3.mlp.c_fc.weight"),
            OpenClipKey::Renamed("text_model.encoder.layers.3.mlp.fc1.weight".to_string())
        );
        assert_eq!(
            convert_open_clip_key("transformer.resblocks.0.attn.in_proj_bias"),
            OpenClipKey::FusedQkv {
                prefix: "text_model.encoder.layers.0.self_attn".to_string(),
                suffix: "bias"
            }
        );
        assert_eq!(
            convert_open_clip_key("positional_embedding"),
            OpenClipKey::Renamed("text_model.embeddings.position_embedding.weight".to_string())
        );
        assert_eq!(convert_open_clip_key("text_projection"), OpenClipKey::Unused);
    }
}
