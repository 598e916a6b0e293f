//! Outcome facts reported by the orchestrator after an execution.

use chrono::{DateTime, Utc};
use dpe_core::DecisionContext;
use dpe_policy::{ActionType, SuccessSignal};
use serde::{Deserialize, Serialize};

/// Numeric effect measured after an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomeMetrics {
    /// Relative change in view velocity.
    pub velocity_lift: f64,
    /// Change in the account's risk score.
    pub risk_delta: f64,
    /// Relative change in engagement rate.
    pub engagement_change: f64,
}

impl OutcomeMetrics {
    /// Create a metrics record.
    pub fn new(velocity_lift: f64, risk_delta: f64, engagement_change: f64) -> Self {
        Self {
            velocity_lift,
            risk_delta,
            engagement_change,
        }
    }
}

/// One immutable outcome of one policy execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOutcome {
    /// Unique outcome id.
    pub outcome_id: String,
    /// Policy that was executed.
    pub policy_id: String,
    /// Action that was executed, if known.
    #[serde(default)]
    pub action_type: Option<ActionType>,
    /// When the outcome was observed.
    pub timestamp: DateTime<Utc>,
    /// Whether the execution achieved its goal.
    pub success: bool,
    /// Success signals observed.
    #[serde(default)]
    pub signals_achieved: Vec<SuccessSignal>,
    /// Measured effect.
    #[serde(default)]
    pub metrics: OutcomeMetrics,
    /// Context at decision time.
    #[serde(default)]
    pub context: DecisionContext,
    /// Set when the execution was aborted rather than completed.
    #[serde(default)]
    pub abort_reason: Option<String>,
}

impl PolicyOutcome {
    /// Create an outcome stamped now with a fresh id.
    pub fn new(policy_id: impl Into<String>, success: bool) -> Self {
        Self {
            outcome_id: uuid::Uuid::new_v4().to_string(),
            policy_id: policy_id.into(),
            action_type: None,
            timestamp: Utc::now(),
            success,
            signals_achieved: Vec::new(),
            metrics: OutcomeMetrics::default(),
            context: DecisionContext::new(),
            abort_reason: None,
        }
    }

    /// A failed outcome recording an aborted execution.
    pub fn aborted(policy_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut outcome = Self::new(policy_id, false);
        outcome.abort_reason = Some(reason.into());
        outcome
    }

    /// Builder: executed action.
    pub fn with_action(mut self, action_type: ActionType) -> Self {
        self.action_type = Some(action_type);
        self
    }

    /// Builder: observed signals.
    pub fn with_signals(mut self, signals: impl IntoIterator<Item = SuccessSignal>) -> Self {
        self.signals_achieved = signals.into_iter().collect();
        self
    }

    /// Builder: measured metrics.
    pub fn with_metrics(mut self, metrics: OutcomeMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Builder: context snapshot.
    pub fn with_context(mut self, context: DecisionContext) -> Self {
        self.context = context;
        self
    }

    /// Builder: observation time.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Storage key: `outcomes/{policy_id}/{timestamp_nanos}-{outcome_id}`.
    ///
    /// Nanoseconds are zero-padded so keys sort chronologically.
    pub fn storage_key(&self) -> String {
        let nanos = self.timestamp.timestamp_nanos_opt().unwrap_or_default().max(0);
        format!("outcomes/{}/{nanos:020}-{}", self.policy_id, self.outcome_id)
    }
}
