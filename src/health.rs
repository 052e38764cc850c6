//! Engine health state. A failed batch panics the engine until recovery heals it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::types::{CoreError, Result};

/// Coarse health of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Batches may be applied.
    Healthy,
    /// A batch failed; every further apply fails fast.
    Panicked,
}

/// Snapshot of the health state for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Current status.
    pub status: HealthStatus,
    /// Message of the failure that panicked the engine, if any.
    pub cause: Option<String>,
    /// Number of times the engine has panicked since it was opened.
    pub panic_count: u64,
}

#[derive(Debug, Default)]
struct HealthState {
    cause: Option<String>,
    panic_count: u64,
}

/// Shared panic flag consulted before every batch.
#[derive(Debug, Default)]
pub struct DatabaseHealth {
    state: Mutex<HealthState>,
}

impl DatabaseHealth {
    /// Creates a healthy instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the engine as failed. The first cause is kept.
    pub fn panic(&self, cause: &CoreError) {
        let mut state = self.state.lock();
        state.panic_count += 1;
        if state.cause.is_none() {
            error!(cause = %cause, "health.panic");
            state.cause = Some(cause.to_string());
        }
    }

    /// Fails with [`CoreError::Panicked`] when a previous batch failed.
    pub fn assert_healthy(&self) -> Result<()> {
        match &self.state.lock().cause {
            None => Ok(()),
            Some(cause) => Err(CoreError::Panicked(cause.clone())),
        }
    }

    /// Whether batches may currently be applied.
    pub fn is_healthy(&self) -> bool {
        self.state.lock().cause.is_none()
    }

    /// Clears the failed state after the caller has run recovery.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        if let Some(cause) = state.cause.take() {
            info!(cause = %cause, "health.healed");
        }
    }

    /// Returns a serializable snapshot.
    pub fn report(&self) -> HealthReport {
        let state = self.state.lock();
        HealthReport {
            status: if state.cause.is_some() {
                HealthStatus::Panicked
            } else {
                HealthStatus::Healthy
            },
            cause: state.cause.clone(),
            panic_count: state.panic_count,
        }
    }
}
