//! Logging initialization using the `tracing` ecosystem.
//!
//! The pools only emit `tracing` events. Binaries that want to see them call
//! [`init_logging`] once at startup.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "devpool=trace")
//! - `DEVPOOL_LOG_LEVEL`: Fallback filter when `RUST_LOG` is unset

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

use crate::error::LoggingError;

/// Global flag to track if tracing has been initialized
static LOGGING_INITIALIZED: OnceCell<()> = OnceCell::new();

/// Default log level when no environment variable is set
const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable for log level override
const LOG_LEVEL_ENV: &str = "DEVPOOL_LOG_LEVEL";

/// Installs a global fmt subscriber. Calling it again is a no-op.
pub fn init_logging() -> Result<(), LoggingError> {
    LOGGING_INITIALIZED
        .get_or_try_init(|| {
            let filter = build_filter(std::env::var(LOG_LEVEL_ENV).ok())?;

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .try_init()
                .map_err(|e| LoggingError::InstallFailed(e.to_string()))
        })
        .map(|_| ())
}

fn build_filter(fallback: Option<String>) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let directives = fallback.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    EnvFilter::try_new(&directives).map_err(|e| LoggingError::InvalidFilter(format!("{directives}: {e}")))
}
