//! Engine configuration.

use serde::Deserialize;

use crate::types::{CoreError, Result};

/// Default degree at which a sparse node converts to the dense layout.
pub const DEFAULT_DENSE_NODE_THRESHOLD: u64 = 50;
/// Default number of hops after which chain walks start tracking visited ids.
pub const DEFAULT_CYCLE_DETECTION_THRESHOLD: u64 = 100_000;
/// Default per-direction degree at which a group switches to external degrees.
pub const DEFAULT_EXTERNAL_DEGREES_THRESHOLD: u64 = 10;

/// Runtime lock/consistency verification strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    /// Commands are applied without re-checking locks or before-images.
    Off,
    /// Every record command is checked against the store and the lock client.
    Strict,
}

impl Default for VerificationMode {
    fn default() -> Self {
        if cfg!(any(debug_assertions, feature = "strict-verification")) {
            VerificationMode::Strict
        } else {
            VerificationMode::Off
        }
    }
}

/// Configuration options supplied when opening a [`crate::engine::RecordStorageEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Degree at which a sparse node is converted to relationship groups.
    pub dense_node_threshold: u64,
    /// Hops before chain walks switch to visited-id tracking.
    pub cycle_detection_threshold: u64,
    /// Lock/consistency verification strategy for applied commands.
    pub verification: VerificationMode,
    /// Whether after-images are checked for dangling references on apply.
    pub consistency_check_on_apply: bool,
    /// Per-direction degree at which a group keeps its degree in the counts store.
    pub external_degrees_threshold: u64,
    /// Maximum buffered index updates before an early flush; 0 means unlimited.
    pub index_flush_batch_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dense_node_threshold: DEFAULT_DENSE_NODE_THRESHOLD,
            cycle_detection_threshold: DEFAULT_CYCLE_DETECTION_THRESHOLD,
            verification: VerificationMode::default(),
            consistency_check_on_apply: false,
            external_degrees_threshold: DEFAULT_EXTERNAL_DEGREES_THRESHOLD,
            index_flush_batch_limit: 0,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Verification and apply-time consistency checks enabled.
    pub fn strict() -> Self {
        Self {
            verification: VerificationMode::Strict,
            consistency_check_on_apply: true,
            ..Self::default()
        }
    }

    /// No runtime verification.
    pub fn production() -> Self {
        Self {
            verification: VerificationMode::Off,
            consistency_check_on_apply: false,
            ..Self::default()
        }
    }

    /// Sets the dense-node conversion threshold.
    pub fn dense_node_threshold(mut self, threshold: u64) -> Self {
        self.dense_node_threshold = threshold;
        self
    }

    /// Sets the cycle-detection hop threshold.
    pub fn cycle_detection_threshold(mut self, hops: u64) -> Self {
        self.cycle_detection_threshold = hops;
        self
    }

    /// Selects the verification strategy.
    pub fn verification(mut self, mode: VerificationMode) -> Self {
        self.verification = mode;
        self
    }

    /// Enables or disables consistency checks of applied after-images.
    pub fn consistency_check_on_apply(mut self, enabled: bool) -> Self {
        self.consistency_check_on_apply = enabled;
        self
    }

    /// Sets the degree at which group chains switch to external degrees.
    pub fn external_degrees_threshold(mut self, threshold: u64) -> Self {
        self.external_degrees_threshold = threshold;
        self
    }

    /// Caps buffered index updates per batch before an intermediate flush.
    pub fn index_flush_batch_limit(mut self, limit: usize) -> Self {
        self.index_flush_batch_limit = limit;
        self
    }

    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(input)
            .map_err(|err| CoreError::Invalid(format!("engine config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    /// Rejects settings the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.dense_node_threshold == 0 {
            return Err(CoreError::Invalid("dense_node_threshold must be positive".into()));
        }
        if self.cycle_detection_threshold == 0 {
            return Err(CoreError::Invalid(
                "cycle_detection_threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}
