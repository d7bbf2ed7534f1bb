use std::{fmt::Display, str::FromStr};

use anyhow::Result;
use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    Device,
};
use tracing::info;

/// A compute device as named on the command line: empty for automatic selection, `cpu`, `cuda`,
/// `cuda:N`, `metal` or `metal:N`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceSpec {
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl FromStr for DeviceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid device ordinal in `{s}`"))?;
                (kind.to_string(), ordinal)
            }
            None => (s.clone(), 0),
        };
        match kind.as_str() {
            "" | "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(ordinal)),
            "metal" | "mps" => Ok(Self::Metal(ordinal)),
            _ => Err(format!(
                "Unknown device `{s}`, expected one of cpu, cuda, cuda:N, metal"
            )),
        }
    }
}

impl Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(n) => write!(f, "cuda:{n}"),
            Self::Metal(n) => write!(f, "metal:{n}"),
        }
    }
}

impl DeviceSpec {
    /// Open the device. `Auto` prefers CUDA, then Metal, then the CPU.
    pub fn resolve(&self, silent: bool) -> Result<Device> {
        let device = match self {
            Self::Auto if cuda_is_available() => Device::new_cuda(0)?,
            Self::Auto if metal_is_available() => Device::new_metal(0)?,
            Self::Auto | Self::Cpu => Device::Cpu,
            Self::Cuda(n) => Device::new_cuda(*n)?,
            Self::Metal(n) => Device::new_metal(*n)?,
        };
        if !silent {
            info!("using device {:?}.", device.location());
        }
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::DeviceSpec;

    #[test]
    fn parses_device_strings() {
        assert_eq!("".parse(), Ok(DeviceSpec::Auto));
        assert_eq!("cpu".parse(), Ok(DeviceSpec::Cpu));
        assert_eq!("CUDA".parse(), Ok(DeviceSpec::Cuda(0)));
        assert_eq!("cuda:1".parse(), Ok(DeviceSpec::Cuda(1)));
        assert_eq!("metal".parse(), Ok(DeviceSpec::Metal(0)));
        assert!("cuda:x".parse::<DeviceSpec>().is_err());
        assert!("tpu".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn cpu_resolves_without_accelerators() -> anyhow::Result<()> {
        assert!(DeviceSpec::Cpu.resolve(true)?.is_cpu());
        Ok(())
    }
}
