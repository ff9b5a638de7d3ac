//! Console logging setup
//!
//! The crate itself only emits `tracing` events; binaries embedding it call
//! [`init_logging`] once to get them printed.

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{MasterError, Result};

/// Install a fmt subscriber filtered at `level` (`trace`..`error`)
///
/// `RUST_LOG`, when set, wins over `level`. Calling this when a global
/// subscriber already exists is not an error.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => level_filter(level)?,
    };

    if fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
    {
        tracing::info!("Logger initialized at {}", level);
    }
    Ok(())
}

fn level_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level.to_ascii_lowercase())
        .map_err(|e| MasterError::config(format!("invalid log level '{level}': {e}")))
}
