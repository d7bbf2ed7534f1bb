//! LoRA adapters: parsing the common safetensors layouts and merging them into base weights as
//! `W' = W + strength * (alpha / rank) * (up @ down)`.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    path::Path,
};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use sdxl_lora_common::{load_tensors_from_file, FileData};
use tracing::{debug, info, warn};

use crate::convert::convert_kohya_unet_name;

/// The pipeline component a LoRA layer modifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LoraTarget {
    Unet,
    TextEncoder,
    TextEncoder2,
}

impl Display for LoraTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unet => write!(f, "unet"),
            Self::TextEncoder => write!(f, "text_encoder"),
            Self::TextEncoder2 => write!(f, "text_encoder_2"),
        }
    }
}

/// How a layer addresses its module.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum ModuleName {
    /// Underscored kohya name, in diffusers (`down_blocks_1_attentions_0_proj_in`) or SGM
    /// (`input_blocks_4_1_proj_in`) naming.
    Kohya(String),
    /// Dotted diffusers module path (`down_blocks.1.attentions.0.proj_in`).
    Dotted(String),
}

impl Display for ModuleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kohya(name) | Self::Dotted(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Down,
    Up,
    Alpha,
}

const SUFFIXES: &[(&str, Part)] = &[
    (".lora_down.weight", Part::Down),
    (".lora_up.weight", Part::Up),
    (".lora_A.weight", Part::Down),
    (".lora_B.weight", Part::Up),
    (".lora.down.weight", Part::Down),
    (".lora.up.weight", Part::Up),
    ("_lora.down.weight", Part::Down),
    ("_lora.up.weight", Part::Up),
    (".alpha", Part::Alpha),
];

fn split_key(key: &str) -> Option<(String, Part)> {
    SUFFIXES.iter().find_map(|(suffix, part)| {
        key.strip_suffix(suffix).map(|module| {
            // Attention-processor layout: `attn1.processor.to_q_lora.down.weight`.
            let module = match module.split_once(".processor.") {
                Some((attn, proj)) if proj == "to_out" => format!("{attn}.to_out.0"),
                Some((attn, proj)) => format!("{attn}.{proj}"),
                None => module.to_string(),
            };
            (module, *part)
        })
    })
}

fn classify(module: &str) -> (LoraTarget, ModuleName) {
    let kohya = [
        ("lora_unet_", LoraTarget::Unet),
        ("lora_te1_", LoraTarget::TextEncoder),
        ("lora_te2_", LoraTarget::TextEncoder2),
        ("lora_te_", LoraTarget::TextEncoder),
    ];
    for (prefix, target) in kohya {
        if let Some(name) = module.strip_prefix(prefix) {
            return (target, ModuleName::Kohya(name.to_string()));
        }
    }
    let dotted = [
        ("unet.", LoraTarget::Unet),
        ("text_encoder_2.", LoraTarget::TextEncoder2),
        ("text_encoder.", LoraTarget::TextEncoder),
    ];
    for (prefix, target) in dotted {
        if let Some(name) = module.strip_prefix(prefix) {
            return (target, ModuleName::Dotted(name.to_string()));
        }
    }
    (LoraTarget::Unet, ModuleName::Dotted(module.to_string()))
}

/// One low-rank pair for a single module.
#[derive(Debug)]
pub struct LoraLayer {
    target: LoraTarget,
    module: ModuleName,
    down: Tensor,
    up: Tensor,
    alpha: Option<f64>,
}

impl LoraLayer {
    pub fn rank(&self) -> Result<usize> {
        Ok(self.down.dim(0)?)
    }

    /// The weight delta at `strength`, shaped like the base weight and computed on `device`.
    pub fn delta(&self, shape: &[usize], strength: f64, device: &Device) -> Result<Tensor> {
        let rank = self.rank()?;
        let scale = strength * self.alpha.unwrap_or(rank as f64) / rank as f64;
        let down = self.down.to_device(device)?.flatten_from(1)?;
        let up = self.up.to_device(device)?.flatten_from(1)?;
        let delta = up.matmul(&down)?;
        if delta.elem_count() != shape.iter().product::<usize>() {
            anyhow::bail!(
                "LoRA layer `{}` has shape {:?} which does not fit the base weight {shape:?}.",
                self.module,
                delta.dims()
            );
        }
        Ok((delta.reshape(shape)? * scale)?)
    }
}

/// Maps underscored module names to the weight keys of one base component.
pub struct KeyIndex {
    underscored: HashMap<String, String>,
}

impl KeyIndex {
    pub fn new<'a>(keys: impl IntoIterator<Item = &'a String>) -> Self {
        let underscored = keys
            .into_iter()
            .filter_map(|key| {
                key.strip_suffix(".weight")
                    .map(|module| (module.replace('.', "_"), key.clone()))
            })
            .collect();
        Self { underscored }
    }

    fn resolve(&self, module: &ModuleName, target: LoraTarget, layers_per_block: usize) -> Option<&String> {
        let name = match module {
            ModuleName::Dotted(path) => path.replace('.', "_"),
            ModuleName::Kohya(name) => name.clone(),
        };
        if let Some(key) = self.underscored.get(&name) {
            return Some(key);
        }
        match (module, target) {
            (ModuleName::Kohya(name), LoraTarget::Unet) => {
                let converted = convert_kohya_unet_name(name, layers_per_block)?;
                self.underscored.get(&converted)
            }
            _ => None,
        }
    }
}

/// Layers of one adapter bound to the weight keys of one component, as `(base key, layer index)`.
pub type Binding = Vec<(String, usize)>;

/// A parsed LoRA adapter file. Tensors are kept on the CPU in F32 until merged.
#[derive(Debug)]
pub struct LoraAdapter {
    name: String,
    layers: Vec<LoraLayer>,
}

impl LoraAdapter {
    /// Load an adapter from `dir/weight_name`.
    pub fn load(dir: &Path, weight_name: &str) -> Result<Self> {
        let path = dir.join(weight_name);
        info!(path = %path.display(), "loading LoRA adapter");
        let tensors = load_tensors_from_file(
            &FileData::Path(path.clone()),
            Some(DType::F32),
            &Device::Cpu,
            true,
        )
        .with_context(|| format!("Failed to read LoRA file `{}`", path.display()))?;
        let adapter = Self::from_tensors(weight_name, tensors)?;
        info!(
            path = %path.display(),
            layers = adapter.layers.len(),
            "LoRA adapter loaded"
        );
        Ok(adapter)
    }

    pub fn from_tensors<S: ToString>(name: S, tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut downs = BTreeMap::new();
        let mut ups = BTreeMap::new();
        let mut alphas = HashMap::new();
        for (key, tensor) in tensors {
            let Some((module, part)) = split_key(&key) else {
                debug!(key = %key, "ignoring tensor that is not part of a LoRA pair");
                continue;
            };
            match part {
                Part::Down => {
                    downs.insert(module, tensor);
                }
                Part::Up => {
                    ups.insert(module, tensor);
                }
                Part::Alpha => {
                    let alpha = tensor
                        .flatten_all()?
                        .to_dtype(DType::F64)?
                        .to_vec1::<f64>()?
                        .first()
                        .copied();
                    if let Some(alpha) = alpha {
                        alphas.insert(module, alpha);
                    }
                }
            }
        }

        let mut layers = Vec::new();
        for (module, down) in downs {
            let Some(up) = ups.remove(&module) else {
                warn!(layer = %module, "LoRA down tensor without matching up tensor");
                continue;
            };
            let alpha = alphas.get(&module).copied();
            let (target, module) = classify(&module);
            layers.push(LoraLayer {
                target,
                module,
                down,
                up,
                alpha,
            });
        }
        for module in ups.keys() {
            warn!(layer = %module, "LoRA up tensor without matching down tensor");
        }
        if layers.is_empty() {
            anyhow::bail!("No LoRA layers found in `{}`.", name.to_string());
        }

        Ok(Self {
            name: name.to_string(),
            layers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Bind the layers that target `target` to the weight keys in `index`. Unresolved layers are logged
    /// and skipped.
    pub fn bind(&self, target: LoraTarget, index: &KeyIndex, layers_per_block: usize) -> Binding {
        let mut binding = Vec::new();
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.target != target {
                continue;
            }
            match index.resolve(&layer.module, target, layers_per_block) {
                Some(key) => binding.push((key.clone(), i)),
                None => debug!(layer = %layer.module, %target, "LoRA layer matches no base weight"),
            }
        }
        let wanted = self.layers.iter().filter(|l| l.target == target).count();
        if binding.len() < wanted {
            warn!(
                %target,
                matched = binding.len(),
                total = wanted,
                "some LoRA layers did not match the base model"
            );
        }
        binding
    }

    /// A copy of `base` with every bound weight replaced by its merged value at `strength`.
    pub fn merge(
        &self,
        base: &HashMap<String, Tensor>,
        binding: &Binding,
        strength: f64,
    ) -> Result<HashMap<String, Tensor>> {
        let mut merged = base.clone();
        for (key, layer) in binding {
            let Some(weight) = base.get(key) else {
                anyhow::bail!("Base weight `{key}` is missing.");
            };
            let delta = self.layers[*layer].delta(weight.dims(), strength, weight.device())?;
            let updated = (weight.to_dtype(DType::F32)? + delta)?.to_dtype(weight.dtype())?;
            merged.insert(key.clone(), updated);
        }
        Ok(merged)
    }
}
