//! Variants and the factory that instantiates miniature cores.

use std::str::FromStr;
use std::sync::{Arc, Once};

use thiserror::Error;

use cpulink_protocol::{api_version_supported, CoreFactory, CoreModel, Environment, API_VERSION};

use crate::core::MiniCore;

/// Provider name the factory registers under.
pub const PROVIDER: &str = "cpulink-minicore";

/// Variant names the factory can instantiate, in preference order.
pub const VARIANT_NAMES: [&str; 2] = ["mini32", "mini64"];

/// Named configuration of the miniature core requested at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// 32-bit registers.
    Mini32,
    /// 64-bit registers, same instruction encodings.
    Mini64,
}

impl Variant {
    /// Register width in bytes for this variant.
    #[must_use]
    pub const fn reg_width(self) -> usize {
        match self {
            Self::Mini32 => 4,
            Self::Mini64 => 8,
        }
    }

    /// Architecture name reported by cores of this variant.
    #[must_use]
    pub const fn arch_name(self) -> &'static str {
        match self {
            Self::Mini32 => "mini32",
            Self::Mini64 => "mini64",
        }
    }
}

/// Error raised when a variant name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown core variant {0:?}")]
pub struct UnknownVariant(
    /// The rejected variant name.
    pub String,
);

impl FromStr for Variant {
    type Err = UnknownVariant;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "mini32" => Ok(Self::Mini32),
            "mini64" => Ok(Self::Mini64),
            other => Err(UnknownVariant(other.to_owned())),
        }
    }
}

/// Factory for miniature cores.
///
/// Creation through a supported historical protocol version emits a
/// compatibility notice exactly once per factory instance; the one-shot
/// state is owned here rather than hidden in a global.
pub struct MiniCoreFactory {
    compat_notice: Once,
}

impl MiniCoreFactory {
    /// Creates the factory.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            compat_notice: Once::new(),
        }
    }
}

impl Default for MiniCoreFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreFactory for MiniCoreFactory {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn variants(&self) -> &[&str] {
        &VARIANT_NAMES
    }

    fn create(
        &self,
        api_version: u64,
        env: Arc<dyn Environment>,
        variant: &str,
    ) -> Option<Box<dyn CoreModel>> {
        if !api_version_supported(api_version) {
            return None;
        }
        if api_version != API_VERSION {
            self.compat_notice.call_once(|| {
                eprintln!(
                    "{PROVIDER}: protocol version {api_version} is deprecated, \
                     current is {API_VERSION}"
                );
            });
        }

        let variant = Variant::from_str(variant).ok()?;
        Some(Box::new(MiniCore::new(env, variant)))
    }
}
