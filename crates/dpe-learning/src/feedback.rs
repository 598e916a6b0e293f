//! # Learning Feedback
//!
//! Owns the outcome log and the derived performance cache.
//!
//! `log_outcome` writes the outcome to the store first. Only after the write
//! succeeds is the outcome appended to the in-memory log and the policy's
//! performance recomputed, so the cache never reflects an outcome the store
//! does not hold.

use std::collections::BTreeMap;
use std::sync::Arc;

use dpe_core::{DpeError, KeyValueStore, LearningConfig, MemoryStore, StorageError, ValidationError};
use dpe_policy::Policy;
use parking_lot::RwLock;

use crate::outcome::PolicyOutcome;
use crate::performance::{PerformanceRating, PolicyPerformance, PolicyTrend};

const OUTCOME_PREFIX: &str = "outcomes/";

/// Adjusted confidence is clamped to this range.
const MIN_ADJUSTED_CONFIDENCE: f64 = 0.1;
const MAX_ADJUSTED_CONFIDENCE: f64 = 1.0;

#[derive(Default)]
struct LearningState {
    /// Outcomes per policy, oldest first.
    outcomes: BTreeMap<String, Vec<PolicyOutcome>>,
    performance: BTreeMap<String, PolicyPerformance>,
}

impl LearningState {
    fn push(&mut self, outcome: PolicyOutcome) {
        let log = self.outcomes.entry(outcome.policy_id.clone()).or_default();
        log.push(outcome);
        // Stable sort keeps insertion order for equal timestamps.
        log.sort_by_key(|o| o.timestamp);
    }

    fn recompute(&mut self, policy_id: &str, config: &LearningConfig) -> Option<PolicyPerformance> {
        let outcomes = self.outcomes.get(policy_id)?;
        let perf = PolicyPerformance::from_outcomes(policy_id, outcomes, config)?;
        self.performance.insert(policy_id.to_string(), perf.clone());
        Some(perf)
    }
}

/// Outcome log and per-policy performance.
pub struct LearningFeedback {
    store: Arc<dyn KeyValueStore>,
    config: LearningConfig,
    state: RwLock<LearningState>,
}

impl LearningFeedback {
    /// Create an empty feedback loop writing to `store`.
    pub fn new(store: Arc<dyn KeyValueStore>, config: LearningConfig) -> Self {
        Self {
            store,
            config,
            state: RwLock::new(LearningState::default()),
        }
    }

    /// Create an empty feedback loop over a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), LearningConfig::default())
    }

    /// Create a feedback loop and replay every outcome already in `store`.
    pub fn load(store: Arc<dyn KeyValueStore>, config: LearningConfig) -> Result<Self, DpeError> {
        let feedback = Self::new(store, config);
        feedback.rebuild_from_store()?;
        Ok(feedback)
    }

    /// Active configuration.
    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    // -- Writes -------------------------------------------------------------

    /// Record an outcome and return the policy's updated performance.
    ///
    /// A store failure leaves the in-memory log and performance untouched.
    pub fn log_outcome(&self, outcome: PolicyOutcome) -> Result<PolicyPerformance, DpeError> {
        if outcome.policy_id.is_empty() {
            return Err(ValidationError::EmptyField("policy_id").into());
        }
        self.store
            .put(&outcome.storage_key(), &serde_json::to_value(&outcome)?)?;

        let policy_id = outcome.policy_id.clone();
        let success = outcome.success;
        let mut state = self.state.write();
        state.push(outcome);
        let perf = state
            .recompute(&policy_id, &self.config)
            .ok_or_else(|| DpeError::policy_not_found(&policy_id))?;
        drop(state);

        tracing::info!(
            policy_id = %policy_id,
            success,
            total_outcomes = perf.total_outcomes,
            success_rate = perf.success_rate,
            rating = %perf.rating,
            multiplier = perf.confidence_multiplier,
            "outcome logged"
        );
        if perf.is_toxic() {
            tracing::warn!(
                policy_id = %policy_id,
                success_rate = perf.success_rate,
                avg_risk_delta = perf.avg_risk_delta,
                "policy rated toxic"
            );
        }
        Ok(perf)
    }

    /// Discard all cached state and replay the outcome log from the store.
    ///
    /// Returns the number of outcomes replayed. On failure the previous
    /// state is kept.
    pub fn rebuild_from_store(&self) -> Result<usize, DpeError> {
        let mut rebuilt = LearningState::default();
        let mut replayed = 0usize;
        for (key, doc) in self.store.list_prefix(OUTCOME_PREFIX)? {
            let outcome: PolicyOutcome =
                serde_json::from_value(doc).map_err(|e| StorageError::Corrupt {
                    key,
                    reason: e.to_string(),
                })?;
            rebuilt.push(outcome);
            replayed += 1;
        }
        let ids: Vec<String> = rebuilt.outcomes.keys().cloned().collect();
        for id in &ids {
            rebuilt.recompute(id, &self.config);
        }
        *self.state.write() = rebuilt;

        tracing::info!(outcomes = replayed, policies = ids.len(), "learning state rebuilt");
        Ok(replayed)
    }

    // -- Reads --------------------------------------------------------------

    /// Current performance of a policy, if it has any outcomes.
    pub fn performance(&self, policy_id: &str) -> Option<PolicyPerformance> {
        self.state.read().performance.get(policy_id).cloned()
    }

    /// Performance of every policy with outcomes, keyed by id.
    pub fn all_performance(&self) -> BTreeMap<String, PolicyPerformance> {
        self.state.read().performance.clone()
    }

    /// Confidence multiplier; 1.0 for a policy without outcomes.
    pub fn confidence_multiplier(&self, policy_id: &str) -> f64 {
        self.state
            .read()
            .performance
            .get(policy_id)
            .map(|p| p.confidence_multiplier)
            .unwrap_or(1.0)
    }

    /// Static confidence weight scaled by the learned multiplier, clamped
    /// to `[0.1, 1.0]`.
    pub fn get_adjusted_confidence(&self, policy: &Policy) -> f64 {
        (policy.confidence_weight * self.confidence_multiplier(&policy.id))
            .clamp(MIN_ADJUSTED_CONFIDENCE, MAX_ADJUSTED_CONFIDENCE)
    }

    /// Whether the policy is currently rated toxic.
    pub fn is_toxic(&self, policy_id: &str) -> bool {
        self.state
            .read()
            .performance
            .get(policy_id)
            .is_some_and(PolicyPerformance::is_toxic)
    }

    /// Ids of every toxic policy, sorted.
    pub fn toxic_policies(&self) -> Vec<String> {
        self.state
            .read()
            .performance
            .values()
            .filter(|p| p.is_toxic())
            .map(|p| p.policy_id.clone())
            .collect()
    }

    /// Best `n` non-toxic policies by multiplier, then success rate, then id.
    pub fn top_performers(&self, n: usize) -> Vec<PolicyPerformance> {
        let mut ranked: Vec<PolicyPerformance> = self
            .state
            .read()
            .performance
            .values()
            .filter(|p| !p.is_toxic())
            .cloned()
            .collect();
        ranked.sort_by(|a, b| {
            b.confidence_multiplier
                .total_cmp(&a.confidence_multiplier)
                .then(b.success_rate.total_cmp(&a.success_rate))
                .then_with(|| a.policy_id.cmp(&b.policy_id))
        });
        ranked.truncate(n);
        ranked
    }

    /// Outcomes of one policy, oldest first.
    pub fn outcomes_for(&self, policy_id: &str) -> Vec<PolicyOutcome> {
        self.state
            .read()
            .outcomes
            .get(policy_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Total outcomes across all policies.
    pub fn total_outcomes(&self) -> usize {
        self.state.read().outcomes.values().map(Vec::len).sum()
    }

    /// Trend label of one policy.
    pub fn trend(&self, policy_id: &str) -> PolicyTrend {
        self.state
            .read()
            .performance
            .get(policy_id)
            .map(|p| p.trend)
            .unwrap_or(PolicyTrend::InsufficientData)
    }

    /// Number of policies per rating.
    pub fn count_by_rating(&self) -> BTreeMap<PerformanceRating, usize> {
        let mut counts = BTreeMap::new();
        for perf in self.state.read().performance.values() {
            *counts.entry(perf.rating).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for LearningFeedback {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for LearningFeedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("LearningFeedback")
            .field("policies", &state.outcomes.len())
            .field("outcomes", &state.outcomes.values().map(Vec::len).sum::<usize>())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::OutcomeMetrics;
    use chrono::{Duration, Utc};
    use dpe_policy::PolicyScope;
    use proptest::prelude::*;

    fn log_n(feedback: &LearningFeedback, policy: &str, flags: &[bool], metrics: OutcomeMetrics) {
        let t0 = Utc::now();
        for (i, s) in flags.iter().enumerate() {
            feedback
                .log_outcome(
                    PolicyOutcome::new(policy, *s)
                        .with_metrics(metrics)
                        .at(t0 + Duration::minutes(i as i64)),
                )
                .unwrap();
        }
    }

    #[test]
    fn unknown_policy_has_neutral_multiplier() {
        let feedback = LearningFeedback::in_memory();
        assert_eq!(feedback.confidence_multiplier("nothing_v1"), 1.0);
        assert!(feedback.performance("nothing_v1").is_none());
        assert!(!feedback.is_toxic("nothing_v1"));
        assert_eq!(feedback.trend("nothing_v1"), PolicyTrend::InsufficientData);
    }

    #[test]
    fn toxic_policy_scenario() {
        let feedback = LearningFeedback::in_memory();
        log_n(&feedback, "toxic_v1", &[true, false, false, false, false, false, false, false, false, false], OutcomeMetrics::new(0.0, 0.35, -0.1));
        let perf = feedback.performance("toxic_v1").unwrap();
        assert!((perf.success_rate - 0.1).abs() < 1e-12);
        assert_eq!(perf.rating, PerformanceRating::Toxic);
        assert_eq!(perf.confidence_multiplier, 0.5);
        assert_eq!(feedback.toxic_policies(), vec!["toxic_v1".to_string()]);

        let policy = Policy::new("toxic_v1", "Toxic", PolicyScope::TiktokVideo).with_confidence(0.8);
        assert!((feedback.get_adjusted_confidence(&policy) - 0.4).abs() < 1e-12);
        assert!(feedback.top_performers(5).is_empty());
    }

    #[test]
    fn adjusted_confidence_is_clamped() {
        let feedback = LearningFeedback::in_memory();
        log_n(&feedback, "star_v1", &[true; 9], OutcomeMetrics::new(0.3, -0.1, 0.2));
        let star = Policy::new("star_v1", "Star", PolicyScope::TiktokVideo).with_confidence(0.9);
        assert_eq!(feedback.get_adjusted_confidence(&star), 1.0);

        let weak = Policy::new("weak_v1", "Weak", PolicyScope::TiktokVideo).with_confidence(0.05);
        assert_eq!(feedback.get_adjusted_confidence(&weak), 0.1);
    }

    #[test]
    fn store_failure_leaves_cache_untouched() {
        let store = MemoryStore::new();
        let feedback = LearningFeedback::new(Arc::new(store.clone()), LearningConfig::default());
        feedback.log_outcome(PolicyOutcome::new("p_v1", true)).unwrap();

        store.set_unavailable(true);
        let err = feedback.log_outcome(PolicyOutcome::new("p_v1", false)).unwrap_err();
        assert!(matches!(err, DpeError::Storage(_)));
        assert_eq!(feedback.total_outcomes(), 1);
        assert_eq!(feedback.performance("p_v1").unwrap().success_rate, 1.0);
    }

    #[test]
    fn empty_policy_id_is_rejected() {
        let feedback = LearningFeedback::in_memory();
        let err = feedback.log_outcome(PolicyOutcome::new("", true)).unwrap_err();
        assert!(matches!(err, DpeError::Validation(ValidationError::EmptyField("policy_id"))));
        assert_eq!(feedback.total_outcomes(), 0);
    }

    #[test]
    fn rebuild_reproduces_performance() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(dpe_core::DirectoryStore::new(dir.path()));
        let feedback = LearningFeedback::new(store.clone(), LearningConfig::default());
        log_n(&feedback, "a_v1", &[true, true, false, true], OutcomeMetrics::new(0.1, -0.02, 0.05));
        log_n(&feedback, "b_v1", &[false, false, true], OutcomeMetrics::new(0.0, 0.1, 0.0));
        let before = feedback.all_performance();

        let reloaded = LearningFeedback::load(store, LearningConfig::default()).unwrap();
        assert_eq!(reloaded.total_outcomes(), 7);
        assert_eq!(reloaded.all_performance(), before);
        assert_eq!(feedback.rebuild_from_store().unwrap(), 7);
        assert_eq!(feedback.all_performance(), before);
    }

    #[test]
    fn out_of_order_outcomes_are_sorted() {
        let feedback = LearningFeedback::in_memory();
        let t0 = Utc::now();
        feedback.log_outcome(PolicyOutcome::new("p_v1", true).at(t0 + Duration::hours(1))).unwrap();
        feedback.log_outcome(PolicyOutcome::new("p_v1", false).at(t0)).unwrap();
        let log = feedback.outcomes_for("p_v1");
        assert!(!log[0].success);
        assert!(log[1].success);
        assert_eq!(feedback.performance("p_v1").unwrap().last_outcome_at, Some(t0 + Duration::hours(1)));
    }

    #[test]
    fn top_performers_rank_by_multiplier() {
        let feedback = LearningFeedback::in_memory();
        log_n(&feedback, "excellent_v1", &[true; 9], OutcomeMetrics::new(0.2, -0.05, 0.1));
        log_n(&feedback, "good_v1", &[true, true, true, false], OutcomeMetrics::new(0.05, 0.0, 0.0));
        log_n(&feedback, "ok_v1", &[true, false], OutcomeMetrics::default());
        log_n(&feedback, "bad_v1", &[false; 5], OutcomeMetrics::default());

        let top: Vec<String> = feedback.top_performers(2).into_iter().map(|p| p.policy_id).collect();
        assert_eq!(top, vec!["excellent_v1".to_string(), "good_v1".to_string()]);
        assert_eq!(feedback.count_by_rating()[&PerformanceRating::Toxic], 1);
    }

    proptest! {
        // Same metrics, more successes in a history of equal length: the
        // multiplier never decreases.
        #[test]
        fn multiplier_is_monotone_in_successes(len in 1usize..30, a in 0usize..30, b in 0usize..30) {
            let lo = a.min(b).min(len);
            let hi = a.max(b).min(len);
            let metrics = OutcomeMetrics::new(0.05, -0.01, 0.02);
            let flags = |k: usize| -> Vec<bool> { (0..len).map(|i| i < k).collect() };

            let low = LearningFeedback::in_memory();
            log_n(&low, "p_v1", &flags(lo), metrics);
            let high = LearningFeedback::in_memory();
            log_n(&high, "p_v1", &flags(hi), metrics);

            prop_assert!(high.confidence_multiplier("p_v1") >= low.confidence_multiplier("p_v1"));
        }
    }
}
