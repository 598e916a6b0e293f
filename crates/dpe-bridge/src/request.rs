//! Request and response values exchanged with the orchestrator.

use chrono::{DateTime, Utc};
use dpe_core::DecisionContext;
use dpe_guard::GuardResult;
use dpe_policy::{AbstainReason, Action, ActionType, PolicyScope};
use serde::{Deserialize, Serialize};

/// A request for permission to act.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Correlation id, echoed in the response.
    pub request_id: String,
    /// Flat decision context.
    pub context: DecisionContext,
    /// Restrict candidates to one scope.
    #[serde(default)]
    pub scope: Option<PolicyScope>,
    /// Ask for one specific action type.
    #[serde(default)]
    pub action_type: Option<ActionType>,
}

impl ActionRequest {
    /// Create a request with a fresh id.
    pub fn new(context: DecisionContext) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            context,
            scope: None,
            action_type: None,
        }
    }

    /// Builder: candidate scope.
    pub fn with_scope(mut self, scope: PolicyScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Builder: requested action type.
    pub fn with_action(mut self, action_type: ActionType) -> Self {
        self.action_type = Some(action_type);
        self
    }

    /// Builder: caller-supplied correlation id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

/// Decision state of a request. Every state except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionDecision {
    /// Not yet decided.
    Pending,
    /// A circuit breaker fired or no policy fits.
    Abstained,
    /// The selected policy does not authorize the requested action.
    Rejected,
    /// Every candidate action failed a guard check.
    Blocked,
    /// At least one action may execute.
    Approved,
    /// Approved actions await human sign-off.
    RequiresReview,
}

impl ActionDecision {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether the caller may execute the approved actions without review.
    pub fn may_execute(&self) -> bool {
        matches!(self, Self::Approved)
    }

    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Abstained => "ABSTAINED",
            Self::Rejected => "REJECTED",
            Self::Blocked => "BLOCKED",
            Self::Approved => "APPROVED",
            Self::RequiresReview => "REQUIRES_REVIEW",
        }
    }
}

impl std::fmt::Display for ActionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The engine's answer to one [`ActionRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    /// Echo of the request id.
    pub request_id: String,
    /// Terminal decision.
    pub decision: ActionDecision,
    /// Id of the selected policy, if selection happened.
    pub selected_policy: Option<String>,
    /// Actions that passed every guard check.
    pub approved_actions: Vec<Action>,
    /// Human-readable reasons, deduplicated, in first-seen order.
    pub block_reasons: Vec<String>,
    /// Remediation hints and operator advice, deduplicated.
    pub recommendations: Vec<String>,
    /// Abstention reasons when the decision is `ABSTAINED`.
    #[serde(default)]
    pub abstain_reasons: Vec<AbstainReason>,
    /// Learning-adjusted selection score of the chosen policy in [0, 1].
    pub confidence_score: f64,
    /// One representative guard result: the first approved action's, else
    /// the first evaluated.
    pub guard_result: Option<GuardResult>,
    /// Decision time.
    pub timestamp: DateTime<Utc>,
}

impl ActionResponse {
    pub(crate) fn new(request_id: &str, decision: ActionDecision, timestamp: DateTime<Utc>) -> Self {
        Self {
            request_id: request_id.to_string(),
            decision,
            selected_policy: None,
            approved_actions: Vec::new(),
            block_reasons: Vec::new(),
            recommendations: Vec::new(),
            abstain_reasons: Vec::new(),
            confidence_score: 0.0,
            guard_result: None,
            timestamp,
        }
    }

    pub(crate) fn add_block_reason(&mut self, reason: impl Into<String>) {
        push_unique(&mut self.block_reasons, reason.into());
    }

    pub(crate) fn add_recommendation(&mut self, recommendation: impl Into<String>) {
        push_unique(&mut self.recommendations, recommendation.into());
    }

    /// Action types approved, in policy order.
    pub fn approved_action_types(&self) -> Vec<ActionType> {
        self.approved_actions.iter().map(|a| a.action_type).collect()
    }
}

fn push_unique(list: &mut Vec<String>, item: String) {
    if !list.contains(&item) {
        list.push(item);
    }
}
