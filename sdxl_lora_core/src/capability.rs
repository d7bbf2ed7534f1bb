//! Optional capabilities, resolved once when a loader or pipeline is created.

use std::fmt::Display;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Capability {
    Supported,
    Unsupported,
    /// Not declared either way. Requests are attempted and the outcome decides.
    #[default]
    Unknown,
}

impl Capability {
    pub fn from_support(supported: bool) -> Self {
        if supported {
            Self::Supported
        } else {
            Self::Unsupported
        }
    }

    /// Whether a request for this capability should be attempted at all.
    pub fn may_attempt(&self) -> bool {
        !matches!(self, Self::Unsupported)
    }
}

impl Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supported => write!(f, "supported"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// What this build can load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderCapabilities {
    /// Packed single-file weights (`from_single_file`): DDUF archives and original-layout checkpoints.
    pub single_file: Capability,
}

impl LoaderCapabilities {
    pub fn detect() -> Self {
        Self {
            single_file: Capability::from_support(cfg!(feature = "single-file")),
        }
    }
}

/// Memory-saving strategies a loaded pipeline offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCapabilities {
    pub attention_slicing: Capability,
    pub cpu_offload: Capability,
}

#[cfg(test)]
mod tests {
    use super::{Capability, LoaderCapabilities};

    #[test]
    fn unknown_is_attempted() {
        assert!(Capability::Supported.may_attempt());
        assert!(Capability::Unknown.may_attempt());
        assert!(!Capability::Unsupported.may_attempt());
    }

    #[test]
    fn single_file_follows_the_build() {
        let expected = if cfg!(feature = "single-file") {
            Capability::Supported
        } else {
            Capability::Unsupported
        };
        assert_eq!(LoaderCapabilities::detect().single_file, expected);
    }
}
