//! Error types for the device pool.
//!
//! Only a narrow set of failures is recoverable here: the one-time device
//! enumeration, configuration parsing and logging setup. Everything that breaks
//! a pool invariant is fatal and goes through [`fatal`].

use thiserror::Error;

/// Failure reported by a [`crate::platform::DevicePlatform`] call.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The native call returned an error code
    #[error("{call} failed with code {code}")]
    Native { call: &'static str, code: i32 },

    /// The platform could not provide `size` bytes
    #[error("out of device memory: requested {size} bytes")]
    OutOfMemory { size: usize },

    /// The device index is not known to the platform
    #[error("invalid device: {0}")]
    InvalidDevice(u32),

    /// A physical handle was mapped over a range of a different size
    #[error("physical handle of {handle_size} bytes cannot back a {size} bytes range")]
    SizeMismatch { handle_size: usize, size: usize },
}

/// Failure while reading [`crate::config::PoolConfig`] from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Unknown pool kind
    #[error("invalid pool kind: {0} (expected \"vmm\" or \"legacy\")")]
    InvalidPoolKind(String),

    /// Size that doesn't parse as bytes
    #[error("invalid size for {var}: {value}")]
    InvalidSize { var: &'static str, value: String },
}

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Invalid filter directive
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    /// Another global subscriber is already installed
    #[error("failed to install subscriber: {0}")]
    InstallFailed(String),
}

/// Reports an unrecoverable pool error and panics.
///
/// Pool failures are either caller contract violations or resource exhaustion
/// the pool has no strategy for, so they never travel up as `Result`.
#[cold]
#[track_caller]
pub fn fatal(what: &str, err: impl std::fmt::Display) -> ! {
    tracing::error!("devpool fatal error: {what}: {err}");
    panic!("{what}: {err}");
}
