//! Introspection views served by the bridge.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dpe_guard::GuardStatus;
use dpe_learning::PolicyPerformance;
use dpe_policy::{AbGroup, AbTest, PolicyScope, PolicyStatus};
use serde::Serialize;

use crate::request::ActionDecision;

/// Engine-wide snapshot for dashboards and health checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    /// Registered policies across all statuses.
    pub policies_total: usize,
    /// Registered policies per status.
    pub policies_by_status: BTreeMap<PolicyStatus, usize>,
    /// Registered policies per scope.
    pub policies_by_scope: BTreeMap<PolicyScope, usize>,
    /// Abstaining share of retained evaluation records.
    pub abstention_rate: f64,
    /// Retained evaluation records.
    pub evaluations_recorded: usize,
    /// Policies currently rated toxic.
    pub toxic_policies: Vec<String>,
    /// Best non-toxic policies by learned multiplier.
    pub top_performers: Vec<PolicyPerformance>,
    /// Outcomes logged across all policies.
    pub total_outcomes: usize,
    /// Responses in the recent-request ring.
    pub recent_request_count: usize,
    /// Responses per decision since start.
    pub decision_counts: BTreeMap<ActionDecision, u64>,
    /// Guard counters.
    pub guard: GuardStatus,
    /// Running A/B tests.
    pub active_ab_tests: Vec<AbTest>,
    /// Snapshot time.
    pub generated_at: DateTime<Utc>,
}

/// Side-by-side learning comparison of one A/B test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbTestReport {
    /// The test compared.
    pub test: AbTest,
    /// Performance of the A arm, if it has outcomes.
    pub performance_a: Option<PolicyPerformance>,
    /// Performance of the B arm, if it has outcomes.
    pub performance_b: Option<PolicyPerformance>,
    /// Suggested winner: higher multiplier, ties broken by success rate.
    /// `None` while either arm lacks outcomes or the arms are level.
    pub suggested_winner: Option<AbGroup>,
}

impl AbTestReport {
    pub(crate) fn new(
        test: AbTest,
        performance_a: Option<PolicyPerformance>,
        performance_b: Option<PolicyPerformance>,
    ) -> Self {
        let suggested_winner = match (&performance_a, &performance_b) {
            (Some(a), Some(b)) => match a
                .confidence_multiplier
                .total_cmp(&b.confidence_multiplier)
                .then(a.success_rate.total_cmp(&b.success_rate))
            {
                Ordering::Greater => Some(AbGroup::A),
                Ordering::Less => Some(AbGroup::B),
                Ordering::Equal => None,
            },
            _ => None,
        };
        Self {
            test,
            performance_a,
            performance_b,
            suggested_winner,
        }
    }
}
