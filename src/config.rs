//! Pool selection.
//!
//! # Environment Variables
//!
//! - `DEVPOOL_POOL_KIND`: `vmm` (default) or `legacy`
//! - `DEVPOOL_VMM_MAX_SIZE`: address space bound of VMM pools, in bytes

use std::str::FromStr;

use crate::{error::ConfigError, vmm::VMM_MAX_SIZE};

/// Environment variable selecting the pool strategy
const POOL_KIND_ENV: &str = "DEVPOOL_POOL_KIND";

/// Environment variable overriding the VMM address space bound
const VMM_MAX_SIZE_ENV: &str = "DEVPOOL_VMM_MAX_SIZE";

/// Pool strategy a device context is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolKind {
    /// Reserved address range with bump allocation
    #[default]
    Vmm,
    /// Best-fit table of natively allocated blocks
    Legacy,
}

impl FromStr for PoolKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vmm" => Ok(PoolKind::Vmm),
            "legacy" | "leg" => Ok(PoolKind::Legacy),
            _ => Err(ConfigError::InvalidPoolKind(s.to_string())),
        }
    }
}

/// Static pool configuration of a [`crate::DeviceContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub kind: PoolKind,
    /// Address space bound of VMM pools
    pub vmm_max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            kind: PoolKind::default(),
            vmm_max_size: VMM_MAX_SIZE,
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(kind) = lookup(POOL_KIND_ENV) {
            config.kind = kind.parse()?;
        }

        if let Some(value) = lookup(VMM_MAX_SIZE_ENV) {
            config.vmm_max_size = match value.trim().parse::<usize>() {
                Ok(size) if size > 0 => size,
                _ => return Err(ConfigError::InvalidSize { var: VMM_MAX_SIZE_ENV, value }),
            };
        }

        Ok(config)
    }
}
