//! Engine configuration.
//!
//! Every tunable has a default matching the deployed agent, so an empty JSON
//! object is a valid configuration:
//!
//! ```
//! use logmon::config::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "reconciler": { "staleness_secs": 90 } }"#).unwrap();
//! assert_eq!(config.reconciler.staleness_secs, 90);
//! assert_eq!(config.reconciler.cycle_ms, 60_000);
//! assert_eq!(config.monitor.publish_interval_ms, 1_000);
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LogmonError, LogmonResult, ValidationError};
use crate::monitor::FileMonitorConfig;
use crate::reconcile::ReconcilerConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Reconciliation, sweep and rule settings.
    pub reconciler: ReconcilerConfig,
    /// Per-monitor pipeline settings.
    pub monitor: FileMonitorConfig,
}

impl EngineConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// `LogmonError::Config` for malformed JSON, a validation error for a
    /// zero duration or capacity.
    pub fn from_json_str(json: &str) -> LogmonResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| LogmonError::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    ///
    /// I/O errors plus everything `from_json_str` reports.
    pub fn from_path(path: impl AsRef<Path>) -> LogmonResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw).map_err(|e| match e {
            LogmonError::Config { message } => LogmonError::config(format!("{}: {message}", path.display())),
            other => other,
        })
    }

    /// Checks every nested section.
    ///
    /// # Errors
    ///
    /// The first zero duration or capacity found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.reconciler.validate()?;
        self.monitor.validate()
    }
}
