//! Tracker configuration.
//!
//! Each component owns its own config type; [`TrackerConfig`] bundles them so a
//! host can ship one JSON document. Every field has a default, so a partial
//! document (or `{}`) is valid.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};
use crate::filter::FilterConfig;
use crate::heatmap::HeatmapConfig;
use crate::history::HistoryConfig;
use crate::scheduler::SchedulerConfig;

/// Aggregate configuration for the whole tracker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub filter: FilterConfig,
    pub history: HistoryConfig,
    pub heatmap: HeatmapConfig,
    pub scheduler: SchedulerConfig,
}

impl TrackerConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TrackerConfig = serde_json::from_str(json)
            .map_err(|e| TrackerError::config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            TrackerError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        self.history.validate()?;
        self.heatmap.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = TrackerConfig::from_json_str("{}").unwrap();
        assert_eq!(config, TrackerConfig::default());
        assert_eq!(config.history.capacity, 1000);
        assert_eq!(config.filter.max_accuracy_meters, 50.0);
        assert_eq!(config.heatmap.saturation_count, 20.0);
    }

    #[test]
    fn test_partial_document() {
        let json = r#"{"history": {"capacity": 2000}, "heatmap": {"precision": 3}}"#;
        let config = TrackerConfig::from_json_str(json).unwrap();
        assert_eq!(config.history.capacity, 2000);
        assert_eq!(config.heatmap.precision, 3);
        assert_eq!(config.heatmap.saturation_count, 20.0);
        assert_eq!(config.filter, FilterConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let json = r#"{"history": {"capacity": 0}}"#;
        assert!(matches!(
            TrackerConfig::from_json_str(json),
            Err(TrackerError::Config { .. })
        ));

        let json = r#"{"heatmap": {"saturation_count": 0.0}}"#;
        assert!(TrackerConfig::from_json_str(json).is_err());

        assert!(TrackerConfig::from_json_str("[1, 2").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"filter": {{"min_distance_meters": 25.0}}}}"#).unwrap();

        let config = TrackerConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.filter.min_distance_meters, 25.0);

        assert!(TrackerConfig::from_json_file("/nonexistent/tracker.json").is_err());
    }
}
