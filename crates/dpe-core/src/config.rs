//! # Engine Configuration
//!
//! Every threshold the engine applies lives here, grouped by the component
//! that consumes it. All fields have defaults, so an empty YAML document is a
//! valid configuration.
//!
//! ## Sources
//!
//! 1. [`EngineConfig::default`]: the documented defaults.
//! 2. [`EngineConfig::from_yaml_str`] / [`EngineConfig::from_file`]:
//!    partial YAML overlays; missing fields keep their defaults.
//! 3. [`EngineConfig::with_env_overrides`]: a handful of `DPE_*`
//!    environment variables for operational tuning without a redeploy.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Policy evaluator thresholds.
    pub evaluator: EvaluatorConfig,
    /// Execution guard thresholds.
    pub guard: GuardConfig,
    /// Learning feedback windows.
    pub learning: LearningConfig,
    /// Orchestrator bridge settings.
    pub bridge: BridgeConfig,
}

/// Thresholds for scoring and system-wide abstention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Abstain when `current_risk_score` exceeds this.
    pub abstain_risk_threshold: f64,
    /// Abstain when `current_aggressiveness` exceeds this.
    pub abstain_aggressiveness_threshold: f64,
    /// Minimum applicability score for a policy to be considered.
    pub min_applicability_score: f64,
    /// Number of evaluation records retained for introspection.
    pub evaluation_log_capacity: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            abstain_risk_threshold: 0.75,
            abstain_aggressiveness_threshold: 0.85,
            min_applicability_score: 0.3,
            evaluation_log_capacity: 1_000,
        }
    }
}

/// Thresholds for the pre-execution guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Block when this many most-recent actions on an account are identical.
    pub pattern_repeat_threshold: usize,
    /// Number of most-recent inter-action intervals inspected for cadence.
    pub cadence_interval_count: usize,
    /// Block when those intervals fall into at most this many distinct
    /// whole-second buckets.
    pub cadence_max_distinct_buckets: usize,
    /// Per-account rolling history length.
    pub history_window: usize,
    /// Risk level at which a declared `risk_spike` abort condition fires.
    pub abort_risk_threshold: f64,
    /// Aggressiveness level at which a declared `aggressiveness_spike` abort
    /// condition fires.
    pub abort_aggressiveness_threshold: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            pattern_repeat_threshold: 3,
            cadence_interval_count: 5,
            cadence_max_distinct_buckets: 2,
            history_window: 100,
            abort_risk_threshold: 0.75,
            abort_aggressiveness_threshold: 0.85,
        }
    }
}

/// Windows used by the learning loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Outcomes per trend window (recent vs prior).
    pub trend_window: usize,
    /// Success-rate change that counts as improving/declining.
    pub trend_delta: f64,
    /// Number of top performers reported in system status.
    pub top_performer_count: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            trend_window: 10,
            trend_delta: 0.1,
            top_performer_count: 5,
        }
    }
}

/// Settings for the request/response bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Multiplier applied to a toxic policy's selection score.
    pub toxic_selection_penalty: f64,
    /// Number of recent responses retained for introspection.
    pub recent_request_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            toxic_selection_penalty: 0.1,
            recent_request_capacity: 100,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The YAML document could not be parsed.
    #[error("invalid configuration YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// The configuration file could not be read.
    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),
    /// An environment override did not parse.
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
    /// A value is outside its permitted range.
    #[error("configuration field {field} = {value} is out of range")]
    OutOfRange {
        /// Dotted field path.
        field: &'static str,
        /// Offending value.
        value: f64,
    },
}

impl EngineConfig {
    /// Parse a (possibly partial) YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Apply `DPE_*` environment overrides.
    ///
    /// Variables:
    /// - `DPE_ABSTAIN_RISK_THRESHOLD`
    /// - `DPE_ABSTAIN_AGGRESSIVENESS_THRESHOLD`
    /// - `DPE_MIN_APPLICABILITY_SCORE`
    /// - `DPE_PATTERN_REPEAT_THRESHOLD`
    /// - `DPE_TOXIC_SELECTION_PENALTY`
    /// - `DPE_RECENT_REQUEST_CAPACITY`
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup (used by tests).
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = parse_var(&lookup, "DPE_ABSTAIN_RISK_THRESHOLD")? {
            self.evaluator.abstain_risk_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "DPE_ABSTAIN_AGGRESSIVENESS_THRESHOLD")? {
            self.evaluator.abstain_aggressiveness_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "DPE_MIN_APPLICABILITY_SCORE")? {
            self.evaluator.min_applicability_score = v;
        }
        if let Some(v) = parse_var(&lookup, "DPE_PATTERN_REPEAT_THRESHOLD")? {
            self.guard.pattern_repeat_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "DPE_TOXIC_SELECTION_PENALTY")? {
            self.bridge.toxic_selection_penalty = v;
        }
        if let Some(v) = parse_var(&lookup, "DPE_RECENT_REQUEST_CAPACITY")? {
            self.bridge.recent_request_capacity = v;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check that every threshold lies in its permitted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = [
            ("evaluator.abstain_risk_threshold", self.evaluator.abstain_risk_threshold),
            (
                "evaluator.abstain_aggressiveness_threshold",
                self.evaluator.abstain_aggressiveness_threshold,
            ),
            ("evaluator.min_applicability_score", self.evaluator.min_applicability_score),
            ("guard.abort_risk_threshold", self.guard.abort_risk_threshold),
            (
                "guard.abort_aggressiveness_threshold",
                self.guard.abort_aggressiveness_threshold,
            ),
            ("learning.trend_delta", self.learning.trend_delta),
            ("bridge.toxic_selection_penalty", self.bridge.toxic_selection_penalty),
        ];
        for (field, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }
        let counts = [
            ("evaluator.evaluation_log_capacity", self.evaluator.evaluation_log_capacity),
            ("guard.pattern_repeat_threshold", self.guard.pattern_repeat_threshold),
            ("guard.cadence_interval_count", self.guard.cadence_interval_count),
            (
                "guard.cadence_max_distinct_buckets",
                self.guard.cadence_max_distinct_buckets,
            ),
            ("guard.history_window", self.guard.history_window),
            ("learning.trend_window", self.learning.trend_window),
            ("bridge.recent_request_capacity", self.bridge.recent_request_capacity),
        ];
        for (field, value) in counts {
            if value == 0 {
                return Err(ConfigError::OutOfRange {
                    field,
                    value: value as f64,
                });
            }
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.evaluator.abstain_risk_threshold, 0.75);
        assert_eq!(cfg.evaluator.abstain_aggressiveness_threshold, 0.85);
        assert_eq!(cfg.evaluator.min_applicability_score, 0.3);
        assert_eq!(cfg.guard.pattern_repeat_threshold, 3);
        assert_eq!(cfg.guard.cadence_interval_count, 5);
        assert_eq!(cfg.guard.cadence_max_distinct_buckets, 2);
        assert_eq!(cfg.guard.history_window, 100);
        assert_eq!(cfg.learning.trend_window, 10);
        assert_eq!(cfg.bridge.toxic_selection_penalty, 0.1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(EngineConfig::from_yaml_str("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn partial_yaml_overlays_defaults() {
        let cfg = EngineConfig::from_yaml_str(
            "guard:\n  pattern_repeat_threshold: 4\nbridge:\n  toxic_selection_penalty: 0.0\n",
        )
        .unwrap();
        assert_eq!(cfg.guard.pattern_repeat_threshold, 4);
        assert_eq!(cfg.guard.history_window, 100);
        assert_eq!(cfg.bridge.toxic_selection_penalty, 0.0);
        assert_eq!(cfg.evaluator, EvaluatorConfig::default());
    }

    #[test]
    fn yaml_out_of_range_rejected() {
        let err = EngineConfig::from_yaml_str("evaluator:\n  abstain_risk_threshold: 1.5\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }

    #[test]
    fn malformed_yaml_rejected() {
        assert!(matches!(
            EngineConfig::from_yaml_str("guard: [unclosed"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn overrides_apply_and_validate() {
        let cfg = EngineConfig::default()
            .with_overrides(|var| match var {
                "DPE_ABSTAIN_RISK_THRESHOLD" => Some("0.6".to_string()),
                "DPE_RECENT_REQUEST_CAPACITY" => Some("25".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(cfg.evaluator.abstain_risk_threshold, 0.6);
        assert_eq!(cfg.bridge.recent_request_capacity, 25);
    }

    #[test]
    fn unparseable_override_rejected() {
        let err = EngineConfig::default()
            .with_overrides(|var| (var == "DPE_PATTERN_REPEAT_THRESHOLD").then(|| "three".to_string()))
            .unwrap_err();
        assert!(format!("{err}").contains("DPE_PATTERN_REPEAT_THRESHOLD"));
    }

    #[test]
    fn zero_cadence_buckets_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.guard.cadence_max_distinct_buckets = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange {
                field: "guard.cadence_max_distinct_buckets",
                ..
            })
        ));
    }

    #[test]
    fn from_file_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "learning:\n  trend_window: 20\n").unwrap();
        let cfg = EngineConfig::from_file(&path).unwrap();
        assert_eq!(cfg.learning.trend_window, 20);
    }
}
