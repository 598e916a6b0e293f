//! # Policy Evaluator
//!
//! Scores every live policy against a decision context and decides
//! system-wide abstention.
//!
//! ## Abstention Circuit Breaker
//!
//! Evaluated before any policy-specific logic and overriding it. The engine
//! abstains when any of these hold:
//!
//! - `current_risk_score` above the configured risk threshold (0.75)
//! - `current_aggressiveness` above the aggressiveness threshold (0.85)
//! - `emergency_flag` set
//! - `shadowban_detected` set
//! - no policy scores at or above the minimum applicability score (0.3)
//!
//! ## Determinism
//!
//! Results are sorted by score descending, then confidence weight
//! descending, then policy id, so identical inputs always produce identical
//! rankings.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dpe_core::{keys, DecisionContext, EvaluatorConfig};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::evaluation_log::{EvaluationLog, EvaluationRecord};
use crate::model::{AccountState, Policy, PolicyScope};
use crate::registry::PolicyRegistry;

// ---------------------------------------------------------------------------
// Abstention
// ---------------------------------------------------------------------------

/// Why the engine declined to act.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbstainReason {
    /// Risk score above threshold.
    RiskTooHigh {
        /// Observed risk.
        risk: f64,
        /// Configured threshold.
        threshold: f64,
    },
    /// Aggressiveness above threshold.
    AggressivenessTooHigh {
        /// Observed aggressiveness.
        aggressiveness: f64,
        /// Configured threshold.
        threshold: f64,
    },
    /// The emergency flag is set.
    EmergencyFlag,
    /// The shadowban detector fired.
    ShadowbanDetected,
    /// No policy reached the minimum applicability score.
    NoViablePolicy {
        /// Minimum score that was required.
        min_score: f64,
    },
}

impl AbstainReason {
    /// Operator-facing hint for clearing this condition.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::RiskTooHigh { .. } => "wait for the risk score to fall before acting",
            Self::AggressivenessTooHigh { .. } => "reduce aggressiveness before acting",
            Self::EmergencyFlag => "clear the emergency flag once the incident is resolved",
            Self::ShadowbanDetected => "pause activity until distribution recovers",
            Self::NoViablePolicy { .. } => "register or enable a policy for this context",
        }
    }
}

impl std::fmt::Display for AbstainReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RiskTooHigh { risk, threshold } => {
                write!(f, "risk score {risk:.2} exceeds {threshold:.2}")
            }
            Self::AggressivenessTooHigh {
                aggressiveness,
                threshold,
            } => write!(f, "aggressiveness {aggressiveness:.2} exceeds {threshold:.2}"),
            Self::EmergencyFlag => f.write_str("emergency flag is set"),
            Self::ShadowbanDetected => f.write_str("shadowban detected"),
            Self::NoViablePolicy { min_score } => {
                write!(f, "no policy scored at least {min_score:.2}")
            }
        }
    }
}

/// Outcome of the abstention check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbstentionDecision {
    /// Whether to abstain.
    pub abstain: bool,
    /// Every triggered reason, circuit breakers first.
    pub reasons: Vec<AbstainReason>,
}

// ---------------------------------------------------------------------------
// PolicyEvaluation
// ---------------------------------------------------------------------------

/// A policy scored against one context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyEvaluation {
    /// The scored policy.
    pub policy: Policy,
    /// Applicability score in [0, 1].
    pub score: f64,
    /// Conditions satisfied.
    pub conditions_met: usize,
    /// Conditions declared.
    pub conditions_total: usize,
    /// Display strings of unsatisfied conditions.
    pub unmet_conditions: Vec<String>,
}

fn rank(a: &PolicyEvaluation, b: &PolicyEvaluation) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.policy.confidence_weight.total_cmp(&a.policy.confidence_weight))
        .then_with(|| a.policy.id.cmp(&b.policy.id))
}

// ---------------------------------------------------------------------------
// PolicyEvaluator
// ---------------------------------------------------------------------------

/// Contextual policy scorer with a bounded evaluation log.
pub struct PolicyEvaluator {
    registry: Arc<PolicyRegistry>,
    config: EvaluatorConfig,
    log: Mutex<EvaluationLog>,
}

impl PolicyEvaluator {
    /// Create an evaluator over a shared registry.
    pub fn new(registry: Arc<PolicyRegistry>, config: EvaluatorConfig) -> Self {
        let log = EvaluationLog::new(config.evaluation_log_capacity);
        Self {
            registry,
            config,
            log: Mutex::new(log),
        }
    }

    /// The registry being evaluated.
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Active thresholds.
    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    fn circuit_breakers(&self, ctx: &DecisionContext) -> Vec<AbstainReason> {
        let mut reasons = Vec::new();
        if let Some(risk) = ctx.risk_score() {
            if risk > self.config.abstain_risk_threshold {
                reasons.push(AbstainReason::RiskTooHigh {
                    risk,
                    threshold: self.config.abstain_risk_threshold,
                });
            }
        }
        if let Some(aggressiveness) = ctx.aggressiveness() {
            if aggressiveness > self.config.abstain_aggressiveness_threshold {
                reasons.push(AbstainReason::AggressivenessTooHigh {
                    aggressiveness,
                    threshold: self.config.abstain_aggressiveness_threshold,
                });
            }
        }
        if ctx.flag(keys::EMERGENCY_FLAG) {
            reasons.push(AbstainReason::EmergencyFlag);
        }
        if ctx.flag(keys::SHADOWBAN_DETECTED) {
            reasons.push(AbstainReason::ShadowbanDetected);
        }
        reasons
    }

    /// Score every live candidate in `scope`, best first. Read-only.
    fn score_all(
        &self,
        ctx: &DecisionContext,
        scope: Option<PolicyScope>,
        now: DateTime<Utc>,
    ) -> Vec<PolicyEvaluation> {
        let state = ctx.account_state().and_then(AccountState::parse);
        let mut evaluations: Vec<PolicyEvaluation> = self
            .registry
            .get_active_at(scope, state, None, now)
            .into_iter()
            .map(|policy| {
                let score = policy.calculate_applicability_score_at(ctx, now);
                let matched = policy.match_conditions(ctx);
                tracing::debug!(policy_id = %policy.id, score, met = matched.met, total = matched.total, "policy scored");
                PolicyEvaluation {
                    policy,
                    score,
                    conditions_met: matched.met,
                    conditions_total: matched.total,
                    unmet_conditions: matched.unmet,
                }
            })
            .collect();
        evaluations.sort_by(rank);
        evaluations
    }

    /// Full abstention check, including the no-viable-policy test. Read-only.
    pub fn abstention(&self, ctx: &DecisionContext, scope: Option<PolicyScope>) -> AbstentionDecision {
        self.abstention_at(ctx, scope, Utc::now())
    }

    /// [`Self::abstention`] evaluated at `now`.
    pub fn abstention_at(
        &self,
        ctx: &DecisionContext,
        scope: Option<PolicyScope>,
        now: DateTime<Utc>,
    ) -> AbstentionDecision {
        let mut reasons = self.circuit_breakers(ctx);
        let min_score = self.config.min_applicability_score;
        let viable = self
            .score_all(ctx, scope, now)
            .iter()
            .any(|e| e.score >= min_score);
        if !viable {
            reasons.push(AbstainReason::NoViablePolicy { min_score });
        }
        AbstentionDecision {
            abstain: !reasons.is_empty(),
            reasons,
        }
    }

    /// Whether the engine should do nothing for this context.
    pub fn should_abstain(&self, ctx: &DecisionContext) -> bool {
        self.abstention(ctx, None).abstain
    }

    /// Policies scoring at least `min_score` (default from configuration),
    /// best first. Appends an evaluation record.
    pub fn evaluate_context(
        &self,
        ctx: &DecisionContext,
        scope: Option<PolicyScope>,
        min_score: Option<f64>,
    ) -> Vec<PolicyEvaluation> {
        self.evaluate_context_at(ctx, scope, min_score, Utc::now())
    }

    /// [`Self::evaluate_context`] evaluated at `now`.
    pub fn evaluate_context_at(
        &self,
        ctx: &DecisionContext,
        scope: Option<PolicyScope>,
        min_score: Option<f64>,
        now: DateTime<Utc>,
    ) -> Vec<PolicyEvaluation> {
        let min_score = min_score.unwrap_or(self.config.min_applicability_score);
        let results: Vec<PolicyEvaluation> = self
            .score_all(ctx, scope, now)
            .into_iter()
            .filter(|e| e.score >= min_score)
            .collect();

        let mut reasons = self.circuit_breakers(ctx);
        if results.is_empty() {
            reasons.push(AbstainReason::NoViablePolicy { min_score });
        }
        let record = EvaluationRecord {
            timestamp: now,
            context: ctx.summary(),
            result_count: results.len(),
            top_score: results.first().map(|e| e.score),
            top_policy: results.first().map(|e| e.policy.id.clone()),
            abstained: !reasons.is_empty(),
            reasons,
        };
        tracing::debug!(
            results = record.result_count,
            top_score = ?record.top_score,
            abstained = record.abstained,
            "context evaluated"
        );
        self.log.lock().append(record);
        results
    }

    /// Log an abstention decided before scoring.
    pub fn record_abstention(&self, ctx: &DecisionContext, decision: &AbstentionDecision) {
        self.record_abstention_at(ctx, decision, Utc::now());
    }

    /// [`Self::record_abstention`] stamped with `now`.
    pub fn record_abstention_at(
        &self,
        ctx: &DecisionContext,
        decision: &AbstentionDecision,
        now: DateTime<Utc>,
    ) {
        let record = EvaluationRecord {
            timestamp: now,
            context: ctx.summary(),
            result_count: 0,
            top_score: None,
            top_policy: None,
            abstained: true,
            reasons: decision.reasons.clone(),
        };
        self.log.lock().append(record);
    }

    /// Read-only dashboard view: the `top_n` best-scoring live policies,
    /// including those below the threshold. No evaluation record is written.
    pub fn evaluate_policies(&self, ctx: &DecisionContext, top_n: usize) -> Vec<PolicyEvaluation> {
        self.evaluate_policies_at(ctx, top_n, Utc::now())
    }

    /// [`Self::evaluate_policies`] evaluated at `now`.
    pub fn evaluate_policies_at(
        &self,
        ctx: &DecisionContext,
        top_n: usize,
        now: DateTime<Utc>,
    ) -> Vec<PolicyEvaluation> {
        let mut all = self.score_all(ctx, None, now);
        all.truncate(top_n);
        all
    }

    /// The last `n` evaluation records, oldest first.
    pub fn recent_evaluations(&self, n: usize) -> Vec<EvaluationRecord> {
        self.log.lock().last_n(n).to_vec()
    }

    /// Fraction of retained evaluation records that abstained.
    pub fn abstention_rate(&self) -> f64 {
        self.log.lock().abstention_rate()
    }

    /// Number of retained evaluation records.
    pub fn evaluation_count(&self) -> usize {
        self.log.lock().len()
    }
}

impl std::fmt::Debug for PolicyEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEvaluator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("log", &*self.log.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, ActionType, Condition, CooldownRange, Operator, PolicyStatus};

    fn breakout_policy(id: &str, confidence: f64) -> Policy {
        Policy::new(id, id, PolicyScope::TiktokVideo)
            .with_states([AccountState::Growing, AccountState::Breakout])
            .with_condition(
                Condition::new("comments_to_breakout", Operator::Lte, 5).with_weight(1.5),
            )
            .with_condition(Condition::new("retention_ratio", Operator::Gt, 1.1).with_weight(1.2))
            .with_action(Action::new(ActionType::Comment, 3, CooldownRange::new(15, 45)))
            .with_confidence(confidence)
            .with_ceilings(0.6, 0.7)
            .with_status(PolicyStatus::Active)
    }

    fn evaluator_with(policies: Vec<Policy>) -> PolicyEvaluator {
        let registry = Arc::new(PolicyRegistry::in_memory());
        for p in policies {
            registry.register(p).unwrap();
        }
        PolicyEvaluator::new(registry, EvaluatorConfig::default())
    }

    fn scenario_a() -> DecisionContext {
        DecisionContext::new()
            .with("comments_to_breakout", 3)
            .with("retention_ratio", 1.15)
            .with(keys::CURRENT_RISK_SCORE, 0.2)
            .with(keys::CURRENT_AGGRESSIVENESS, 0.5)
    }

    #[test]
    fn scenario_a_ranks_breakout_policy() {
        let evaluator = evaluator_with(vec![breakout_policy("breakout_v1", 0.82)]);
        let results = evaluator.evaluate_context(&scenario_a(), None, None);
        assert_eq!(results.len(), 1);
        assert!((results[0].score - 0.874).abs() < 1e-9);
        assert_eq!(results[0].conditions_met, 2);
        assert!(!evaluator.should_abstain(&scenario_a()));
    }

    #[test]
    fn scenario_b_high_risk_abstains() {
        let evaluator = evaluator_with(vec![breakout_policy("breakout_v1", 0.82)]);
        let ctx = scenario_a().with(keys::CURRENT_RISK_SCORE, 0.8);
        let decision = evaluator.abstention(&ctx, None);
        assert!(decision.abstain);
        assert!(matches!(decision.reasons[0], AbstainReason::RiskTooHigh { .. }));
    }

    #[test]
    fn flags_trigger_abstention() {
        let evaluator = evaluator_with(vec![breakout_policy("breakout_v1", 0.82)]);
        let emergency = scenario_a().with(keys::EMERGENCY_FLAG, true);
        let shadowban = scenario_a().with(keys::SHADOWBAN_DETECTED, "true");
        let aggressive = scenario_a().with(keys::CURRENT_AGGRESSIVENESS, 0.9);
        assert!(evaluator.should_abstain(&emergency));
        assert!(evaluator.should_abstain(&shadowban));
        assert!(evaluator.should_abstain(&aggressive));
    }

    #[test]
    fn empty_registry_abstains_for_lack_of_policy() {
        let evaluator = evaluator_with(Vec::new());
        let decision = evaluator.abstention(&scenario_a(), None);
        assert_eq!(
            decision.reasons,
            vec![AbstainReason::NoViablePolicy { min_score: 0.3 }]
        );
    }

    #[test]
    fn malformed_context_never_panics() {
        let evaluator = evaluator_with(vec![breakout_policy("breakout_v1", 0.82)]);
        let ctx = DecisionContext::new()
            .with(keys::CURRENT_RISK_SCORE, "high")
            .with(keys::ACCOUNT_STATE, 7)
            .with("comments_to_breakout", vec![1, 2]);
        assert!(evaluator.evaluate_context(&ctx, None, None).is_empty());
        assert!(evaluator.should_abstain(&ctx));
    }

    #[test]
    fn results_sorted_and_thresholded() {
        let evaluator = evaluator_with(vec![
            breakout_policy("weak_v1", 0.1),
            breakout_policy("strong_v1", 0.9),
            breakout_policy("mid_v1", 0.5),
        ]);
        let ids: Vec<_> = evaluator
            .evaluate_context(&scenario_a(), None, Some(0.5))
            .into_iter()
            .map(|e| e.policy.id)
            .collect();
        // weak scores 0.37, below 0.5
        assert_eq!(ids, vec!["strong_v1", "mid_v1"]);
    }

    #[test]
    fn scope_filter_applies() {
        let evaluator = evaluator_with(vec![breakout_policy("breakout_v1", 0.82)]);
        assert!(evaluator
            .evaluate_context(&scenario_a(), Some(PolicyScope::YoutubeVideo), None)
            .is_empty());
    }

    #[test]
    fn evaluation_log_and_abstention_rate() {
        let evaluator = evaluator_with(vec![breakout_policy("breakout_v1", 0.82)]);
        evaluator.evaluate_context(&scenario_a(), None, None);
        evaluator.evaluate_context(&DecisionContext::new(), None, None);
        let records = evaluator.recent_evaluations(10);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].top_policy.as_deref(), Some("breakout_v1"));
        assert!(records[1].abstained);
        assert!((evaluator.abstention_rate() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn dashboard_view_is_read_only_and_includes_misses() {
        let evaluator = evaluator_with(vec![
            breakout_policy("breakout_v1", 0.82),
            breakout_policy("other_v1", 0.6),
        ]);
        let view = evaluator.evaluate_policies(&DecisionContext::new(), 5);
        assert_eq!(view.len(), 2);
        assert!(view.iter().all(|e| e.score == 0.0));
        assert_eq!(view[0].unmet_conditions.len(), 2);
        assert_eq!(evaluator.evaluation_count(), 0);
        assert_eq!(evaluator.evaluate_policies(&scenario_a(), 1).len(), 1);
    }

    #[test]
    fn record_abstention_is_logged() {
        let evaluator = evaluator_with(Vec::new());
        let decision = AbstentionDecision {
            abstain: true,
            reasons: vec![AbstainReason::EmergencyFlag],
        };
        evaluator.record_abstention(&DecisionContext::new(), &decision);
        assert_eq!(evaluator.abstention_rate(), 1.0);
    }

    #[test]
    fn injected_time_stamps_abstention_records() {
        let evaluator = evaluator_with(Vec::new());
        let decision = AbstentionDecision {
            abstain: true,
            reasons: vec![AbstainReason::EmergencyFlag],
        };
        let at = DateTime::parse_from_rfc3339("2026-02-03T04:05:06Z")
            .unwrap()
            .with_timezone(&Utc);
        evaluator.record_abstention_at(&DecisionContext::new(), &decision, at);
        assert_eq!(evaluator.recent_evaluations(1)[0].timestamp, at);
    }

    #[test]
    fn abstain_reason_display_and_serde() {
        let reason = AbstainReason::RiskTooHigh {
            risk: 0.8,
            threshold: 0.75,
        };
        assert_eq!(reason.to_string(), "risk score 0.80 exceeds 0.75");
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["reason"], "risk_too_high");
        assert!(!reason.remediation().is_empty());
    }
}
