//! # Orchestrator Bridge
//!
//! The single entry point for the orchestrator. One call to
//! [`OrchestratorBridge::request_action`] runs the whole decision protocol:
//!
//! ```text
//! PENDING ─ circuit breaker fired ───────────────▶ ABSTAINED
//!         ─ no policy scores high enough ────────▶ ABSTAINED
//!         ─ requested action not authorized ─────▶ REJECTED
//!         ─ every candidate action guard-blocked ▶ BLOCKED
//!         ─ ≥1 action passes, no review needed ──▶ APPROVED
//!         ─ ≥1 action passes, review required ───▶ REQUIRES_REVIEW
//! ```
//!
//! ## Selection
//!
//! Each scored policy competes on
//! `score × adjusted_confidence / raw_confidence`. Toxic policies are
//! multiplied by the configured penalty (0.1 by default) rather than
//! removed, so a toxic policy only wins when nothing else fits.
//!
//! ## Outcome Reporting
//!
//! After executing an approved action the caller reports back through
//! [`OrchestratorBridge::log_outcome`] or
//! [`OrchestratorBridge::abort_execution`]. Only `log_outcome` counts
//! against cooldowns and execution limits.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dpe_core::{DecisionContext, DpeError, EngineConfig, KeyValueStore, ValidationError};
use dpe_guard::{ExecutionGuard, GuardResult};
use dpe_learning::{LearningFeedback, PolicyOutcome, PolicyPerformance, PolicyTrend};
use dpe_policy::{AbGroup, ActionType, Policy, PolicyEvaluation, PolicyEvaluator, PolicyRegistry};
use parking_lot::Mutex;

use crate::request::{ActionDecision, ActionRequest, ActionResponse};
use crate::status::{AbTestReport, SystemStatus};

/// Bounded history of responses plus decision counters.
#[derive(Debug)]
struct RequestLog {
    recent: VecDeque<ActionResponse>,
    capacity: usize,
    decision_counts: BTreeMap<ActionDecision, u64>,
}

impl RequestLog {
    fn new(capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(capacity.min(1_024)),
            capacity: capacity.max(1),
            decision_counts: BTreeMap::new(),
        }
    }

    fn push(&mut self, response: ActionResponse) {
        *self.decision_counts.entry(response.decision).or_insert(0) += 1;
        if self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(response);
    }
}

/// A scored policy with its learning-adjusted selection score.
struct Candidate {
    evaluation: PolicyEvaluation,
    selection_score: f64,
    toxic: bool,
    trend: PolicyTrend,
}

/// Composes registry, evaluator, guard and learning into one protocol.
pub struct OrchestratorBridge {
    registry: Arc<PolicyRegistry>,
    evaluator: PolicyEvaluator,
    guard: ExecutionGuard,
    learning: LearningFeedback,
    config: EngineConfig,
    requests: Mutex<RequestLog>,
}

impl OrchestratorBridge {
    /// Assemble a bridge from an existing registry and learning loop.
    pub fn new(registry: Arc<PolicyRegistry>, learning: LearningFeedback, config: EngineConfig) -> Self {
        let evaluator = PolicyEvaluator::new(Arc::clone(&registry), config.evaluator.clone());
        let guard = ExecutionGuard::new(config.guard.clone());
        let requests = Mutex::new(RequestLog::new(config.bridge.recent_request_capacity));
        Self {
            registry,
            evaluator,
            guard,
            learning,
            config,
            requests,
        }
    }

    /// In-memory engine seeded with the standard policy catalog.
    pub fn with_defaults() -> Result<Self, DpeError> {
        let registry = Arc::new(PolicyRegistry::in_memory());
        registry.seed_standard_policies()?;
        Ok(Self::new(
            registry,
            LearningFeedback::in_memory(),
            EngineConfig::default(),
        ))
    }

    /// Resume an engine from a populated store: policies, lifecycle log,
    /// A/B tests and the outcome log are all replayed.
    pub fn from_store(store: Arc<dyn KeyValueStore>, config: EngineConfig) -> Result<Self, DpeError> {
        let registry = Arc::new(PolicyRegistry::load(Arc::clone(&store))?);
        let learning = LearningFeedback::load(store, config.learning.clone())?;
        Ok(Self::new(registry, learning, config))
    }

    /// Policy registry.
    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    /// Policy evaluator.
    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    /// Execution guard.
    pub fn guard(&self) -> &ExecutionGuard {
        &self.guard
    }

    /// Learning feedback loop.
    pub fn learning(&self) -> &LearningFeedback {
        &self.learning
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- Decision protocol --------------------------------------------------

    /// Decide a request right now.
    pub fn request_action(&self, request: &ActionRequest) -> ActionResponse {
        self.request_action_at(request, Utc::now())
    }

    /// Decide a request at `now`.
    pub fn request_action_at(&self, request: &ActionRequest, now: DateTime<Utc>) -> ActionResponse {
        let response = self.decide(request, now);
        tracing::info!(
            request_id = %response.request_id,
            decision = %response.decision,
            policy_id = ?response.selected_policy,
            approved = response.approved_actions.len(),
            confidence = response.confidence_score,
            "action request decided"
        );
        if matches!(response.decision, ActionDecision::Blocked | ActionDecision::Rejected) {
            tracing::warn!(
                request_id = %response.request_id,
                decision = %response.decision,
                reasons = ?response.block_reasons,
                "action request denied"
            );
        }
        self.requests.lock().push(response.clone());
        response
    }

    fn decide(&self, request: &ActionRequest, now: DateTime<Utc>) -> ActionResponse {
        let ctx = &request.context;

        let abstention = self.evaluator.abstention_at(ctx, request.scope, now);
        if abstention.abstain {
            self.evaluator.record_abstention_at(ctx, &abstention, now);
            let mut response =
                ActionResponse::new(&request.request_id, ActionDecision::Abstained, now);
            for reason in &abstention.reasons {
                response.add_block_reason(reason.to_string());
                response.add_recommendation(reason.remediation());
            }
            response.abstain_reasons = abstention.reasons;
            return response;
        }

        let evaluations = self.evaluator.evaluate_context_at(ctx, request.scope, None, now);
        let Some(candidate) = self.select(evaluations) else {
            let mut response =
                ActionResponse::new(&request.request_id, ActionDecision::Abstained, now);
            response.add_block_reason("no policy reached the minimum applicability score");
            response.add_recommendation("register or enable a policy for this context");
            return response;
        };

        let policy = &candidate.evaluation.policy;
        let mut response = ActionResponse::new(&request.request_id, ActionDecision::Pending, now);
        response.selected_policy = Some(policy.id.clone());
        response.confidence_score = candidate.selection_score.clamp(0.0, 1.0);
        self.add_policy_advice(&mut response, &candidate);

        let candidates = match request.action_type {
            Some(requested) => match policy.action(requested) {
                Some(action) => vec![action.clone()],
                None => {
                    response.decision = ActionDecision::Rejected;
                    response.add_block_reason(format!(
                        "policy {} does not authorize action {requested}",
                        policy.id
                    ));
                    response.add_recommendation(format!(
                        "request one of the authorized actions: {}",
                        authorized_actions(policy)
                    ));
                    return response;
                }
            },
            None => policy.actions.clone(),
        };

        let mut representative: Option<GuardResult> = None;
        for action in candidates {
            let result = self.guard.validate_execution_at(policy, &action, ctx, now);
            for block in &result.blocks {
                if block.code.is_action_specific() {
                    response.add_block_reason(format!("{}: {}", action.action_type, block));
                } else {
                    response.add_block_reason(block.to_string());
                }
                if let Some(hint) = &block.remediation {
                    response.add_recommendation(hint.clone());
                }
            }
            let replace = match &representative {
                None => true,
                Some(current) => result.allowed && !current.allowed,
            };
            if result.allowed {
                response.approved_actions.push(action);
            }
            if replace {
                representative = Some(result);
            }
        }
        response.guard_result = representative;

        response.decision = if response.approved_actions.is_empty() {
            ActionDecision::Blocked
        } else if policy.requires_supervisor_approval {
            response.add_recommendation("obtain supervisor sign-off before executing");
            ActionDecision::RequiresReview
        } else {
            ActionDecision::Approved
        };
        response
    }

    /// Pick the evaluation with the highest learning-adjusted score. Ties go
    /// to the evaluator's ranking order.
    fn select(&self, evaluations: Vec<PolicyEvaluation>) -> Option<Candidate> {
        let penalty = self.config.bridge.toxic_selection_penalty;
        let mut best: Option<Candidate> = None;
        for evaluation in evaluations {
            let policy = &evaluation.policy;
            let raw = policy.confidence_weight;
            let adjusted = self.learning.get_adjusted_confidence(policy);
            let ratio = if raw > 0.0 { adjusted / raw } else { adjusted };
            let toxic = self.learning.is_toxic(&policy.id);
            let mut selection_score = evaluation.score * ratio;
            if toxic {
                selection_score *= penalty;
            }
            tracing::debug!(
                policy_id = %policy.id,
                score = evaluation.score,
                adjusted,
                toxic,
                selection_score,
                "selection candidate"
            );
            if best
                .as_ref()
                .map_or(true, |b| selection_score > b.selection_score)
            {
                let trend = self.learning.trend(&policy.id);
                best = Some(Candidate {
                    evaluation,
                    selection_score,
                    toxic,
                    trend,
                });
            }
        }
        best
    }

    fn add_policy_advice(&self, response: &mut ActionResponse, candidate: &Candidate) {
        let policy = &candidate.evaluation.policy;
        if policy.requires_simulation {
            response.add_recommendation(format!(
                "run a simulation of {} before executing",
                policy.id
            ));
        }
        if candidate.toxic {
            response.add_recommendation(format!(
                "{} is rated toxic and was selected only as a last resort; review or disable it",
                policy.id
            ));
        }
        if candidate.trend == PolicyTrend::Declining {
            response.add_recommendation(format!(
                "success rate of {} is declining; review its conditions",
                policy.id
            ));
        }
    }

    // -- Outcome reporting --------------------------------------------------

    /// Report an executed action.
    ///
    /// The policy must be registered. The execution is recorded with the
    /// guard at the outcome's timestamp, then the outcome is appended to the
    /// learning log.
    pub fn log_outcome(
        &self,
        mut outcome: PolicyOutcome,
        action_type: ActionType,
        account_id: &str,
    ) -> Result<PolicyPerformance, DpeError> {
        if outcome.policy_id.is_empty() {
            return Err(ValidationError::EmptyField("policy_id").into());
        }
        if self.registry.get(&outcome.policy_id).is_none() {
            return Err(DpeError::policy_not_found(&outcome.policy_id));
        }
        outcome.action_type = Some(action_type);
        self.guard
            .record_execution_at(&outcome.policy_id, action_type, account_id, outcome.timestamp);
        self.learning.log_outcome(outcome)
    }

    /// Report an approved action that was not carried out. Logged as a
    /// failed outcome; guard counters are untouched.
    pub fn abort_execution(
        &self,
        policy_id: &str,
        reason: &str,
        context: DecisionContext,
    ) -> Result<PolicyPerformance, DpeError> {
        tracing::warn!(policy_id, reason, "execution aborted");
        self.learning
            .log_outcome(PolicyOutcome::aborted(policy_id, reason).with_context(context))
    }

    // -- Introspection ------------------------------------------------------

    /// Engine-wide status snapshot.
    pub fn get_system_status(&self) -> SystemStatus {
        let (recent_request_count, decision_counts) = {
            let log = self.requests.lock();
            (log.recent.len(), log.decision_counts.clone())
        };
        SystemStatus {
            policies_total: self.registry.len(),
            policies_by_status: self.registry.count_by_status(),
            policies_by_scope: self.registry.count_by_scope(),
            abstention_rate: self.evaluator.abstention_rate(),
            evaluations_recorded: self.evaluator.evaluation_count(),
            toxic_policies: self.learning.toxic_policies(),
            top_performers: self
                .learning
                .top_performers(self.config.learning.top_performer_count),
            total_outcomes: self.learning.total_outcomes(),
            recent_request_count,
            decision_counts,
            guard: self.guard.guard_status(),
            active_ab_tests: self.registry.active_ab_tests(),
            generated_at: Utc::now(),
        }
    }

    /// Learned performance of one policy.
    pub fn get_policy_performance(&self, policy_id: &str) -> Option<PolicyPerformance> {
        self.learning.performance(policy_id)
    }

    /// Read-only top-N dashboard view.
    pub fn evaluate_policies(&self, context: &DecisionContext, top_n: usize) -> Vec<PolicyEvaluation> {
        self.evaluator.evaluate_policies(context, top_n)
    }

    /// [`Self::evaluate_policies`] evaluated at `now`.
    pub fn evaluate_policies_at(
        &self,
        context: &DecisionContext,
        top_n: usize,
        now: DateTime<Utc>,
    ) -> Vec<PolicyEvaluation> {
        self.evaluator.evaluate_policies_at(context, top_n, now)
    }

    /// The last `n` responses, oldest first.
    pub fn recent_requests(&self, n: usize) -> Vec<ActionResponse> {
        let log = self.requests.lock();
        let skip = log.recent.len().saturating_sub(n);
        log.recent.iter().skip(skip).cloned().collect()
    }

    /// Compare the learning performance of both arms of an A/B test.
    pub fn ab_test_report(&self, test_id: &str) -> Result<AbTestReport, DpeError> {
        let test = self.registry.ab_test(test_id).ok_or_else(|| DpeError::NotFound {
            kind: "ab test",
            id: test_id.to_string(),
        })?;
        let performance_a = self.learning.performance(test.policy_for(AbGroup::A));
        let performance_b = self.learning.performance(test.policy_for(AbGroup::B));
        Ok(AbTestReport::new(test, performance_a, performance_b))
    }
}

fn authorized_actions(policy: &Policy) -> String {
    policy
        .actions
        .iter()
        .map(|a| a.action_type.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl std::fmt::Debug for OrchestratorBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBridge")
            .field("registry", &self.registry)
            .field("learning", &self.learning)
            .field("recent_requests", &self.requests.lock().recent.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use dpe_core::{keys, MemoryStore};
    use dpe_guard::BlockCode;
    use dpe_learning::OutcomeMetrics;
    use dpe_policy::{
        AccountState, Action, Condition, CooldownRange, Operator, PolicyScope, PolicyStatus,
    };

    fn push_policy(id: &str, confidence: f64) -> Policy {
        Policy::new(id, id, PolicyScope::TiktokVideo)
            .with_states([AccountState::Growing, AccountState::Breakout])
            .with_condition(Condition::new("comments_to_breakout", Operator::Lte, 5).with_weight(1.5))
            .with_condition(Condition::new("retention_ratio", Operator::Gt, 1.1).with_weight(1.2))
            .with_action(Action::new(ActionType::Comment, 3, CooldownRange::new(15, 45)))
            .with_action(Action::new(ActionType::Reply, 5, CooldownRange::new(5, 20)))
            .with_confidence(confidence)
            .with_ceilings(0.6, 0.7)
            .with_status(PolicyStatus::Active)
    }

    fn bridge_with(policies: Vec<Policy>) -> OrchestratorBridge {
        let registry = Arc::new(PolicyRegistry::in_memory());
        for p in policies {
            registry.register(p).unwrap();
        }
        OrchestratorBridge::new(registry, LearningFeedback::in_memory(), EngineConfig::default())
    }

    fn ctx() -> DecisionContext {
        DecisionContext::new()
            .with(keys::ACCOUNT_ID, "acct-1")
            .with(keys::ACCOUNT_STATE, "breakout")
            .with("comments_to_breakout", 3)
            .with("retention_ratio", 1.15)
            .with(keys::CURRENT_RISK_SCORE, 0.2)
            .with(keys::CURRENT_AGGRESSIVENESS, 0.5)
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn clean_request_is_approved() {
        let bridge = bridge_with(vec![push_policy("push_v1", 0.82)]);
        let response = bridge.request_action_at(&ActionRequest::new(ctx()), t0());
        assert_eq!(response.decision, ActionDecision::Approved);
        assert_eq!(response.selected_policy.as_deref(), Some("push_v1"));
        assert_eq!(
            response.approved_action_types(),
            vec![ActionType::Comment, ActionType::Reply]
        );
        assert!(response.guard_result.as_ref().unwrap().allowed);
        assert!((response.confidence_score - 0.874).abs() < 1e-9);
        assert!(response.block_reasons.is_empty());
    }

    #[test]
    fn high_risk_abstains_with_reason() {
        let bridge = bridge_with(vec![push_policy("push_v1", 0.82)]);
        let request = ActionRequest::new(ctx().with(keys::CURRENT_RISK_SCORE, 0.8));
        let response = bridge.request_action_at(&request, t0());
        assert_eq!(bridge.evaluator().recent_evaluations(1)[0].timestamp, t0());
        assert_eq!(response.decision, ActionDecision::Abstained);
        assert!(response.selected_policy.is_none());
        assert!(!response.block_reasons.is_empty());
        assert!(!response.recommendations.is_empty());
        assert_eq!(bridge.evaluator().evaluation_count(), 1);
    }

    #[test]
    fn unauthorized_action_is_rejected() {
        let bridge = bridge_with(vec![push_policy("push_v1", 0.82)]);
        let request = ActionRequest::new(ctx()).with_action(ActionType::Boost);
        let response = bridge.request_action_at(&request, t0());
        assert_eq!(response.decision, ActionDecision::Rejected);
        assert_eq!(response.selected_policy.as_deref(), Some("push_v1"));
        assert!(response.approved_actions.is_empty());
        assert!(response.block_reasons[0].contains("boost"));
    }

    #[test]
    fn requested_action_limits_candidates() {
        let bridge = bridge_with(vec![push_policy("push_v1", 0.82)]);
        let request = ActionRequest::new(ctx()).with_action(ActionType::Reply);
        let response = bridge.request_action_at(&request, t0());
        assert_eq!(response.approved_action_types(), vec![ActionType::Reply]);
    }

    #[test]
    fn cooldown_on_every_action_blocks() {
        let bridge = bridge_with(vec![push_policy("push_v1", 0.82)]);
        bridge
            .log_outcome(PolicyOutcome::new("push_v1", true).at(t0()), ActionType::Comment, "acct-1")
            .unwrap();
        bridge
            .log_outcome(
                PolicyOutcome::new("push_v1", true).at(t0() + Duration::minutes(1)),
                ActionType::Reply,
                "acct-1",
            )
            .unwrap();

        let response = bridge.request_action_at(&ActionRequest::new(ctx()), t0() + Duration::minutes(2));
        assert_eq!(response.decision, ActionDecision::Blocked);
        let guard = response.guard_result.unwrap();
        assert!(guard.is_blocked_by(BlockCode::CooldownActive));
        assert!(response.recommendations.iter().any(|r| r.starts_with("wait")));
    }

    #[test]
    fn partial_approval_keeps_block_reasons() {
        let bridge = bridge_with(vec![push_policy("push_v1", 0.82)]);
        bridge
            .log_outcome(PolicyOutcome::new("push_v1", true).at(t0()), ActionType::Comment, "acct-1")
            .unwrap();
        let response = bridge.request_action_at(&ActionRequest::new(ctx()), t0() + Duration::minutes(10));
        assert_eq!(response.decision, ActionDecision::Approved);
        assert_eq!(response.approved_action_types(), vec![ActionType::Reply]);
        assert!(response.guard_result.as_ref().unwrap().allowed);
        assert!(response.block_reasons.iter().any(|r| r.contains("COOLDOWN_ACTIVE")));
    }

    #[test]
    fn policy_wide_block_is_reported_once() {
        let bridge = bridge_with(vec![push_policy("push_v1", 0.82)]);
        let request = ActionRequest::new(ctx().with(keys::SUPERVISOR_BLOCK_ALL, true));
        let response = bridge.request_action_at(&request, t0());
        assert_eq!(response.decision, ActionDecision::Blocked);
        let supervisor: Vec<_> = response
            .block_reasons
            .iter()
            .filter(|r| r.contains("SUPERVISOR_BLOCK"))
            .collect();
        assert_eq!(supervisor.len(), 1);
        assert!(supervisor[0].starts_with("SUPERVISOR_BLOCK"));
    }

    #[test]
    fn action_specific_blocks_name_their_action() {
        let bridge = bridge_with(vec![push_policy("push_v1", 0.82)]);
        bridge
            .log_outcome(PolicyOutcome::new("push_v1", true).at(t0()), ActionType::Comment, "acct-1")
            .unwrap();
        let response = bridge.request_action_at(&ActionRequest::new(ctx()), t0() + Duration::minutes(10));
        assert!(response
            .block_reasons
            .iter()
            .any(|r| r.starts_with("comment: COOLDOWN_ACTIVE")));
    }

    #[test]
    fn supervisor_approval_downgrades_to_review() {
        let bridge = bridge_with(vec![push_policy("push_v1", 0.82).with_supervisor_approval(true)]);
        let response = bridge.request_action_at(&ActionRequest::new(ctx()), t0());
        assert_eq!(response.decision, ActionDecision::RequiresReview);
        assert_eq!(response.approved_actions.len(), 2);
        assert!(!response.decision.may_execute());
    }

    #[test]
    fn toxic_policy_loses_selection() {
        let weak = push_policy("steady_v1", 0.3);
        let strong = push_policy("toxic_v1", 0.95);
        let bridge = bridge_with(vec![weak, strong]);
        for i in 0..10 {
            bridge
                .learning()
                .log_outcome(
                    PolicyOutcome::new("toxic_v1", false)
                        .with_metrics(OutcomeMetrics::new(0.0, 0.4, -0.4))
                        .at(t0() - Duration::hours(10 - i)),
                )
                .unwrap();
        }
        assert!(bridge.learning().is_toxic("toxic_v1"));
        let response = bridge.request_action_at(&ActionRequest::new(ctx()), t0());
        assert_eq!(response.selected_policy.as_deref(), Some("steady_v1"));
    }

    #[test]
    fn simulation_requirement_is_recommended() {
        let bridge = bridge_with(vec![push_policy("push_v1", 0.82).with_simulation(true)]);
        let response = bridge.request_action_at(&ActionRequest::new(ctx()), t0());
        assert!(response.recommendations.iter().any(|r| r.contains("simulation")));
    }

    #[test]
    fn abort_does_not_touch_guard_counters() {
        let bridge = bridge_with(vec![push_policy("push_v1", 0.82)]);
        let perf = bridge.abort_execution("push_v1", "operator cancelled", ctx()).unwrap();
        assert_eq!(perf.total_outcomes, 1);
        assert_eq!(perf.aborted, 1);
        assert_eq!(bridge.guard().guard_status().executions_recorded, 0);
    }

    #[test]
    fn outcome_for_unknown_policy_is_rejected_before_recording() {
        let bridge = bridge_with(vec![push_policy("push_v1", 0.82)]);
        let empty = bridge
            .log_outcome(PolicyOutcome::new("", true).at(t0()), ActionType::Comment, "acct-1")
            .unwrap_err();
        assert!(matches!(
            empty,
            DpeError::Validation(ValidationError::EmptyField("policy_id"))
        ));
        let unknown = bridge
            .log_outcome(PolicyOutcome::new("ghost_v1", true).at(t0()), ActionType::Comment, "acct-1")
            .unwrap_err();
        assert!(matches!(unknown, DpeError::NotFound { .. }));

        assert_eq!(bridge.guard().guard_status().executions_recorded, 0);
        assert_eq!(bridge.guard().execution_stats("acct-1").total_executions, 0);
        assert_eq!(bridge.learning().total_outcomes(), 0);
    }

    #[test]
    fn log_outcome_propagates_store_failure() {
        let store = MemoryStore::new();
        let registry = Arc::new(PolicyRegistry::new(Arc::new(store.clone())));
        registry.register(push_policy("push_v1", 0.82)).unwrap();
        let learning = LearningFeedback::new(Arc::new(store.clone()), Default::default());
        let bridge = OrchestratorBridge::new(registry, learning, EngineConfig::default());

        store.set_unavailable(true);
        let err = bridge
            .log_outcome(PolicyOutcome::new("push_v1", true), ActionType::Comment, "acct-1")
            .unwrap_err();
        assert!(matches!(err, DpeError::Storage(_)));
        assert_eq!(bridge.learning().total_outcomes(), 0);
        assert_eq!(bridge.guard().guard_status().executions_recorded, 1);
    }

    #[test]
    fn recent_requests_ring_is_bounded() {
        let mut config = EngineConfig::default();
        config.bridge.recent_request_capacity = 3;
        let registry = Arc::new(PolicyRegistry::in_memory());
        registry.register(push_policy("push_v1", 0.82)).unwrap();
        let bridge = OrchestratorBridge::new(registry, LearningFeedback::in_memory(), config);
        for i in 0..5 {
            bridge.request_action_at(
                &ActionRequest::new(ctx()).with_request_id(format!("r{i}")),
                t0(),
            );
        }
        let recent = bridge.recent_requests(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].request_id, "r2");
        assert_eq!(bridge.recent_requests(1)[0].request_id, "r4");

        let status = bridge.get_system_status();
        assert_eq!(status.recent_request_count, 3);
        assert_eq!(status.decision_counts[&ActionDecision::Approved], 5);
    }

    #[test]
    fn ab_report_suggests_better_arm() {
        let bridge = bridge_with(vec![push_policy("arm_a_v1", 0.8), push_policy("arm_b_v1", 0.8)]);
        let test = bridge.registry().start_ab_test("arm_a_v1", "arm_b_v1").unwrap();
        for i in 0..5 {
            let at = t0() + Duration::minutes(i);
            bridge.learning().log_outcome(PolicyOutcome::new("arm_a_v1", true).at(at)).unwrap();
            bridge.learning().log_outcome(PolicyOutcome::new("arm_b_v1", i % 2 == 0).at(at)).unwrap();
        }
        let report = bridge.ab_test_report(&test.test_id).unwrap();
        assert_eq!(report.suggested_winner, Some(AbGroup::A));
        assert!(matches!(
            bridge.ab_test_report("missing"),
            Err(DpeError::NotFound { .. })
        ));
    }

    #[test]
    fn with_defaults_seeds_catalog() {
        let bridge = OrchestratorBridge::with_defaults().unwrap();
        let status = bridge.get_system_status();
        assert_eq!(status.policies_total, 5);
        assert_eq!(status.policies_by_status[&PolicyStatus::Active], 5);
    }

    #[test]
    fn from_store_resumes_policies_and_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(dpe_core::DirectoryStore::new(dir.path()));
        {
            let registry = Arc::new(PolicyRegistry::new(Arc::clone(&store)));
            registry.register(push_policy("push_v1", 0.82)).unwrap();
            let learning = LearningFeedback::new(Arc::clone(&store), Default::default());
            let bridge = OrchestratorBridge::new(registry, learning, EngineConfig::default());
            bridge
                .log_outcome(PolicyOutcome::new("push_v1", true).at(t0()), ActionType::Comment, "acct-1")
                .unwrap();
        }
        let resumed = OrchestratorBridge::from_store(store, EngineConfig::default()).unwrap();
        assert!(resumed.registry().get("push_v1").is_some());
        assert_eq!(resumed.get_policy_performance("push_v1").unwrap().total_outcomes, 1);
    }
}
