//! Engine configuration.
//!
//! Loaded from JSON by the binary; library callers usually construct it
//! directly or rely on [`EngineConfig::default`].

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::BarrierMode;

/// Tunables of the cohort engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// How cohorts compute their status. [`BarrierMode::Counting`] is
    /// preferable for cohorts beyond a few hundred items.
    pub barrier: BarrierMode,
}

impl EngineConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults;
    /// unknown fields are rejected.
    pub fn from_json(text: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(text).map_err(|e| PipelineError::ConfigurationError {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_default() {
        assert_eq!(EngineConfig::from_json("{}").unwrap(), EngineConfig::default());
    }

    #[test]
    fn parses_counting_mode() {
        let config = EngineConfig::from_json(r#"{"barrier": "counting"}"#).unwrap();
        assert_eq!(config.barrier, BarrierMode::Counting);
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = EngineConfig::from_json(r#"{"barier": "scan"}"#).unwrap_err();
        assert!(matches!(err, PipelineError::ConfigurationError { .. }));
    }
}
