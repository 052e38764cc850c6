//! Tracing subscriber setup for binaries and tests embedding the engine.

use tracing_subscriber::{fmt, EnvFilter};

use crate::types::{CoreError, Result};

/// Installs a global fmt subscriber filtered by `filter` (e.g. `"chainstore=debug"`).
pub fn init_logging(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| CoreError::Invalid(format!("invalid log filter: {e}")))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| CoreError::Invalid("logging already initialized".into()))
}
