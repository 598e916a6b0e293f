//! # Policy Registry
//!
//! Versioned storage and lifecycle management for policies.
//!
//! Every write goes to the [`KeyValueStore`] first and only then to the
//! in-memory index, so a failed write leaves the index at its last
//! known-good state and the error reaches the caller. Reads are served from
//! the index alone and keep working while the store is unavailable.
//!
//! ## Lifecycle
//!
//! ```text
//! Draft ──▶ Active ◀──▶ Testing
//!   │         │  ▲         │
//!   │         ▼  │ enable  │
//!   ├──────▶ Disabled      │
//!   ▼         │            ▼
//! Deprecated ◀┴──────── (A/B loser)
//!   │
//!   ▼
//! Archived (terminal)
//! ```
//!
//! Each transition is persisted as a full policy document plus a
//! [`LifecycleRecord`].
//!
//! ## Concurrency
//!
//! The index sits behind a single `parking_lot::RwLock`. Writers hold the
//! write lock across the store write, so registrations and transitions are
//! serialized.
//!
//! ## Failure Atomicity
//!
//! Every write reaches the store before the index changes. Lifecycle
//! records go first and policy documents after them; an A/B test record,
//! when present, is the final write. When a write
//! fails, the index is left as it was, policy documents already rewritten
//! by the same operation are restored, and a retry overwrites the same
//! keys.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dpe_core::{
    ContentDigest, DpeError, KeyValueStore, MemoryStore, StateTransitionError, StorageError,
    ValidationError,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::standard_policies;
use crate::model::{
    compare_version_strings, AbGroup, AccountState, Policy, PolicyScope, PolicyStatus,
};

const POLICY_PREFIX: &str = "policies/";
const DIGEST_PREFIX: &str = "digests/";
const LIFECYCLE_PREFIX: &str = "lifecycle/";
const AB_TEST_PREFIX: &str = "ab_tests/";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One status change of one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    /// Policy the record belongs to.
    pub policy_id: String,
    /// Previous status; `None` for the registration record.
    pub from: Option<PolicyStatus>,
    /// New status.
    pub to: PolicyStatus,
    /// Operator- or system-supplied reason.
    pub reason: String,
    /// When the change was applied.
    pub at: DateTime<Utc>,
}

/// An A/B test between two policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbTest {
    /// Test identifier.
    pub test_id: String,
    /// Policy in group A.
    pub policy_a: String,
    /// Policy in group B.
    pub policy_b: String,
    /// When the test started.
    pub started_at: DateTime<Utc>,
    /// When the test was concluded.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Id of the promoted policy.
    #[serde(default)]
    pub winner: Option<String>,
}

impl AbTest {
    /// Whether the test is still running.
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Policy id assigned to a group.
    pub fn policy_for(&self, group: AbGroup) -> &str {
        match group {
            AbGroup::A => &self.policy_a,
            AbGroup::B => &self.policy_b,
        }
    }
}

/// A single field that differs between two policy versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    /// Field name.
    pub field: &'static str,
    /// Rendered value in the older version.
    pub before: String,
    /// Rendered value in the newer version.
    pub after: String,
}

/// Field-level comparison of two policies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionDiff {
    /// First policy id.
    pub from_id: String,
    /// First policy version.
    pub from_version: String,
    /// Second policy id.
    pub to_id: String,
    /// Second policy version.
    pub to_version: String,
    /// Differing fields, in a fixed order.
    pub changes: Vec<FieldChange>,
}

impl VersionDiff {
    /// Whether no compared field differs.
    pub fn is_identical(&self) -> bool {
        self.changes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RegistryIndex {
    policies: BTreeMap<String, Policy>,
    /// Base id to policy ids, newest version first.
    by_base: BTreeMap<String, Vec<String>>,
    digests: BTreeMap<String, ContentDigest>,
    lifecycle: BTreeMap<String, Vec<LifecycleRecord>>,
    ab_tests: BTreeMap<String, AbTest>,
}

impl RegistryIndex {
    fn index(&mut self, policy: Policy) {
        let base = policy.base_id().to_string();
        let id = policy.id.clone();
        self.policies.insert(id.clone(), policy);
        let policies = &self.policies;
        let ids = self.by_base.entry(base).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
        ids.sort_by(|a, b| {
            compare_version_strings(version_of(policies, b), version_of(policies, a))
                .then_with(|| b.cmp(a))
        });
    }

    fn family(&self, base_id: &str) -> Vec<&Policy> {
        self.by_base
            .get(base_id)
            .map(|ids| ids.iter().filter_map(|id| self.policies.get(id)).collect())
            .unwrap_or_default()
    }

    fn in_active_test(&self, policy_id: &str) -> bool {
        self.ab_tests
            .values()
            .any(|t| t.is_active() && (t.policy_a == policy_id || t.policy_b == policy_id))
    }
}

fn version_of<'a>(policies: &'a BTreeMap<String, Policy>, id: &str) -> &'a str {
    policies
        .get(id)
        .map(|p| p.metadata.version.as_str())
        .unwrap_or("")
}

/// Check a status transition against the lifecycle graph.
fn check_transition(from: PolicyStatus, to: PolicyStatus) -> Result<(), StateTransitionError> {
    let reject = |reason: &str| {
        Err(StateTransitionError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        })
    };
    if from == to {
        return reject("policy already has this status");
    }
    if from == PolicyStatus::Archived {
        return reject("archived policies are terminal");
    }
    let allowed = match to {
        PolicyStatus::Draft => false,
        PolicyStatus::Active => matches!(
            from,
            PolicyStatus::Draft | PolicyStatus::Disabled | PolicyStatus::Testing
        ),
        PolicyStatus::Testing => matches!(from, PolicyStatus::Draft | PolicyStatus::Active),
        PolicyStatus::Disabled => matches!(
            from,
            PolicyStatus::Draft | PolicyStatus::Active | PolicyStatus::Testing
        ),
        PolicyStatus::Deprecated | PolicyStatus::Archived => true,
    };
    if allowed {
        Ok(())
    } else {
        reject("transition not permitted by the policy lifecycle")
    }
}

fn decode<T: DeserializeOwned>(key: String, doc: serde_json::Value) -> Result<T, StorageError> {
    serde_json::from_value(doc).map_err(|e| StorageError::Corrupt {
        key,
        reason: e.to_string(),
    })
}

fn policy_key(id: &str) -> String {
    format!("{POLICY_PREFIX}{id}")
}

/// Key of the next lifecycle record for `policy_id`.
fn lifecycle_key(index: &RegistryIndex, policy_id: &str) -> String {
    let seq = index.lifecycle.get(policy_id).map_or(0, Vec::len);
    format!("{LIFECYCLE_PREFIX}{policy_id}/{seq:08}")
}

/// A status change computed against the index but not yet written.
struct Transition {
    before: Policy,
    after: Policy,
    record: LifecycleRecord,
}

fn stage_status(
    index: &RegistryIndex,
    policy_id: &str,
    to: PolicyStatus,
    reason: &str,
    edit: impl FnOnce(&mut Policy),
) -> Result<Transition, DpeError> {
    let before = index
        .policies
        .get(policy_id)
        .cloned()
        .ok_or_else(|| DpeError::policy_not_found(policy_id))?;
    check_transition(before.status, to)?;
    let mut after = before.clone();
    after.status = to;
    edit(&mut after);
    let record = LifecycleRecord {
        policy_id: policy_id.to_string(),
        from: Some(before.status),
        to,
        reason: reason.to_string(),
        at: Utc::now(),
    };
    Ok(Transition {
        before,
        after,
        record,
    })
}

// ---------------------------------------------------------------------------
// PolicyRegistry
// ---------------------------------------------------------------------------

/// Versioned policy registry backed by a [`KeyValueStore`].
pub struct PolicyRegistry {
    store: Arc<dyn KeyValueStore>,
    index: RwLock<RegistryIndex>,
}

impl PolicyRegistry {
    /// Create an empty registry writing to `store`.
    ///
    /// Existing documents in the store are not read; use [`Self::load`] to
    /// resume from a populated store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            index: RwLock::new(RegistryIndex::default()),
        }
    }

    /// Create an empty registry over a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Rebuild a registry from the documents already in `store`.
    ///
    /// Policies without a stored digest get one computed from the loaded
    /// document.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Result<Self, DpeError> {
        let mut index = RegistryIndex::default();
        for (key, doc) in store.list_prefix(POLICY_PREFIX)? {
            let policy: Policy = decode(key, doc)?;
            index.index(policy);
        }
        for (key, doc) in store.list_prefix(DIGEST_PREFIX)? {
            let id = key.trim_start_matches(DIGEST_PREFIX).to_string();
            let digest: ContentDigest = decode(key, doc)?;
            index.digests.insert(id, digest);
        }
        for (id, policy) in &index.policies {
            if !index.digests.contains_key(id) {
                index.digests.insert(id.clone(), policy.content_digest()?);
            }
        }
        for (key, doc) in store.list_prefix(LIFECYCLE_PREFIX)? {
            let record: LifecycleRecord = decode(key, doc)?;
            index
                .lifecycle
                .entry(record.policy_id.clone())
                .or_default()
                .push(record);
        }
        for (key, doc) in store.list_prefix(AB_TEST_PREFIX)? {
            let test: AbTest = decode(key, doc)?;
            index.ab_tests.insert(test.test_id.clone(), test);
        }
        tracing::info!(
            policies = index.policies.len(),
            ab_tests = index.ab_tests.len(),
            "policy registry loaded"
        );
        Ok(Self {
            store,
            index: RwLock::new(index),
        })
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    // -- Writes -------------------------------------------------------------

    /// Validate, persist and index a policy. Returns its content digest.
    pub fn register(&self, policy: Policy) -> Result<ContentDigest, DpeError> {
        policy.validate()?;
        let mut index = self.index.write();
        let duplicate = index.policies.contains_key(&policy.id)
            || index.family(policy.base_id()).iter().any(|p| {
                compare_version_strings(&p.metadata.version, &policy.metadata.version)
                    == Ordering::Equal
            });
        if duplicate {
            return Err(ValidationError::DuplicatePolicy {
                id: policy.id.clone(),
                version: policy.metadata.version.clone(),
            }
            .into());
        }

        let digest = policy.content_digest()?;
        let record = LifecycleRecord {
            policy_id: policy.id.clone(),
            from: None,
            to: policy.status,
            reason: "registered".to_string(),
            at: Utc::now(),
        };
        self.store.put(
            &lifecycle_key(&index, &record.policy_id),
            &serde_json::to_value(&record)?,
        )?;
        self.store.put(
            &format!("{DIGEST_PREFIX}{}", policy.id),
            &serde_json::to_value(&digest)?,
        )?;
        self.store
            .put(&policy_key(&policy.id), &serde_json::to_value(&policy)?)?;

        tracing::info!(
            policy_id = %policy.id,
            version = %policy.metadata.version,
            status = %policy.status,
            digest = %digest,
            "policy registered"
        );
        index.digests.insert(policy.id.clone(), digest.clone());
        index.index(policy);
        index
            .lifecycle
            .entry(record.policy_id.clone())
            .or_default()
            .push(record);
        Ok(digest)
    }

    /// Register a new version of an existing family and deprecate the
    /// version it supersedes.
    ///
    /// The new version must order strictly after the latest registered one.
    /// `previous_version` is filled in when the caller left it empty.
    pub fn publish_version(&self, mut policy: Policy) -> Result<ContentDigest, DpeError> {
        let Some(latest) = self.get_latest(policy.base_id()) else {
            return self.register(policy);
        };
        if compare_version_strings(&policy.metadata.version, &latest.metadata.version)
            != Ordering::Greater
        {
            return Err(ValidationError::StaleVersion {
                base_id: policy.base_id().to_string(),
                version: policy.metadata.version.clone(),
                latest: latest.metadata.version.clone(),
            }
            .into());
        }
        if policy.metadata.previous_version.is_none() {
            policy.metadata.previous_version = Some(latest.metadata.version.clone());
        }
        let new_id = policy.id.clone();
        let digest = self.register(policy)?;
        if !matches!(
            latest.status,
            PolicyStatus::Deprecated | PolicyStatus::Archived
        ) {
            self.deprecate(&latest.id, &format!("superseded by {new_id}"))?;
        }
        Ok(digest)
    }

    /// Register every catalog policy that is not registered yet.
    pub fn seed_standard_policies(&self) -> Result<usize, DpeError> {
        let mut seeded = 0;
        for (id, policy) in standard_policies() {
            if self.get(&id).is_some() {
                continue;
            }
            self.register(policy)?;
            seeded += 1;
        }
        Ok(seeded)
    }

    /// Draft → Active.
    pub fn activate(&self, policy_id: &str) -> Result<Policy, DpeError> {
        let mut index = self.index.write();
        self.require_status(&index, policy_id, PolicyStatus::Draft, "activate")?;
        self.apply_status(&mut index, policy_id, PolicyStatus::Active, "activated", |_| {})
    }

    /// Move a policy to `deprecated`.
    pub fn deprecate(&self, policy_id: &str, reason: &str) -> Result<Policy, DpeError> {
        let mut index = self.index.write();
        self.apply_status(&mut index, policy_id, PolicyStatus::Deprecated, reason, |_| {})
    }

    /// Move a policy to `disabled`.
    pub fn disable(&self, policy_id: &str, reason: &str) -> Result<Policy, DpeError> {
        let mut index = self.index.write();
        self.apply_status(&mut index, policy_id, PolicyStatus::Disabled, reason, |_| {})
    }

    /// Disabled → Active. Only valid from `disabled`.
    pub fn enable(&self, policy_id: &str) -> Result<Policy, DpeError> {
        let mut index = self.index.write();
        self.require_status(&index, policy_id, PolicyStatus::Disabled, "enable")?;
        self.apply_status(&mut index, policy_id, PolicyStatus::Active, "re-enabled", |_| {})
    }

    /// Move a policy to the terminal `archived` status.
    pub fn archive(&self, policy_id: &str, reason: &str) -> Result<Policy, DpeError> {
        let mut index = self.index.write();
        self.apply_status(&mut index, policy_id, PolicyStatus::Archived, reason, |_| {})
    }

    /// Put two policies into an A/B test: both become `testing`, labelled
    /// with groups A and B.
    pub fn start_ab_test(&self, policy_a: &str, policy_b: &str) -> Result<AbTest, DpeError> {
        if policy_a == policy_b {
            return Err(DpeError::AbTest(format!(
                "policy {policy_a} cannot be tested against itself"
            )));
        }
        let mut index = self.index.write();
        for id in [policy_a, policy_b] {
            let policy = index
                .policies
                .get(id)
                .ok_or_else(|| DpeError::policy_not_found(id))?;
            if index.in_active_test(id) {
                return Err(DpeError::AbTest(format!(
                    "policy {id} is already in a running A/B test"
                )));
            }
            check_transition(policy.status, PolicyStatus::Testing)?;
        }

        let test = AbTest {
            test_id: Uuid::new_v4().to_string(),
            policy_a: policy_a.to_string(),
            policy_b: policy_b.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            winner: None,
        };
        let reason = format!("A/B test {}", test.test_id);
        let transitions = vec![
            stage_status(&index, policy_a, PolicyStatus::Testing, &reason, |p| {
                p.metadata.ab_test_group = Some(AbGroup::A);
            })?,
            stage_status(&index, policy_b, PolicyStatus::Testing, &reason, |p| {
                p.metadata.ab_test_group = Some(AbGroup::B);
            })?,
        ];
        self.commit(&mut index, transitions, Some(&test))?;
        tracing::info!(test_id = %test.test_id, policy_a, policy_b, "A/B test started");
        Ok(test)
    }

    /// Conclude an A/B test: the winner becomes `active`, the loser
    /// `deprecated`, and both lose their group label.
    pub fn end_ab_test(&self, test_id: &str, winner: AbGroup) -> Result<AbTest, DpeError> {
        let mut index = self.index.write();
        let mut test = index
            .ab_tests
            .get(test_id)
            .cloned()
            .ok_or_else(|| DpeError::NotFound {
                kind: "ab test",
                id: test_id.to_string(),
            })?;
        if !test.is_active() {
            return Err(DpeError::AbTest(format!("A/B test {test_id} already concluded")));
        }
        let loser_group = match winner {
            AbGroup::A => AbGroup::B,
            AbGroup::B => AbGroup::A,
        };
        let winner_id = test.policy_for(winner).to_string();
        let loser_id = test.policy_for(loser_group).to_string();
        for id in [&winner_id, &loser_id] {
            let status = index.policies.get(id.as_str()).map(|p| p.status);
            if status != Some(PolicyStatus::Testing) {
                return Err(DpeError::AbTest(format!(
                    "policy {id} is no longer under test"
                )));
            }
        }

        let transitions = vec![
            stage_status(
                &index,
                &winner_id,
                PolicyStatus::Active,
                &format!("won A/B test {test_id} against {loser_id}"),
                |p| p.metadata.ab_test_group = None,
            )?,
            stage_status(
                &index,
                &loser_id,
                PolicyStatus::Deprecated,
                &format!("lost A/B test {test_id} to {winner_id}"),
                |p| p.metadata.ab_test_group = None,
            )?,
        ];
        test.ended_at = Some(Utc::now());
        test.winner = Some(winner_id.clone());
        self.commit(&mut index, transitions, Some(&test))?;
        tracing::info!(test_id, winner = %winner_id, loser = %loser_id, "A/B test concluded");
        Ok(test)
    }

    fn require_status(
        &self,
        index: &RegistryIndex,
        policy_id: &str,
        required: PolicyStatus,
        operation: &str,
    ) -> Result<(), DpeError> {
        let current = index
            .policies
            .get(policy_id)
            .map(|p| p.status)
            .ok_or_else(|| DpeError::policy_not_found(policy_id))?;
        if current == required {
            Ok(())
        } else {
            Err(StateTransitionError::InvalidTransition {
                from: current.to_string(),
                to: PolicyStatus::Active.to_string(),
                reason: format!("{operation} is only valid from {required}"),
            }
            .into())
        }
    }

    fn apply_status(
        &self,
        index: &mut RegistryIndex,
        policy_id: &str,
        to: PolicyStatus,
        reason: &str,
        edit: impl FnOnce(&mut Policy),
    ) -> Result<Policy, DpeError> {
        let transition = stage_status(index, policy_id, to, reason, edit)?;
        let updated = transition.after.clone();
        self.commit(index, vec![transition], None)?;
        Ok(updated)
    }

    /// Persist staged transitions (and optionally an A/B test record), then
    /// apply them to the index. Nothing in the index changes unless every
    /// store write succeeded.
    fn commit(
        &self,
        index: &mut RegistryIndex,
        transitions: Vec<Transition>,
        test: Option<&AbTest>,
    ) -> Result<(), DpeError> {
        let mut written = 0;
        if let Err(err) = self.persist(index, &transitions, test, &mut written) {
            for transition in &transitions[..written] {
                self.restore(&transition.before);
            }
            tracing::warn!(error = %err, "registry write failed; index unchanged");
            return Err(err);
        }

        for Transition { before, after, record } in transitions {
            tracing::info!(
                policy_id = %after.id,
                from = %before.status,
                to = %after.status,
                reason = %record.reason,
                "policy status changed"
            );
            index.policies.insert(after.id.clone(), after);
            index
                .lifecycle
                .entry(record.policy_id.clone())
                .or_default()
                .push(record);
        }
        if let Some(test) = test {
            index.ab_tests.insert(test.test_id.clone(), test.clone());
        }
        Ok(())
    }

    fn persist(
        &self,
        index: &RegistryIndex,
        transitions: &[Transition],
        test: Option<&AbTest>,
        written: &mut usize,
    ) -> Result<(), DpeError> {
        for transition in transitions {
            self.store.put(
                &lifecycle_key(index, &transition.record.policy_id),
                &serde_json::to_value(&transition.record)?,
            )?;
        }
        for transition in transitions {
            self.store.put(
                &policy_key(&transition.after.id),
                &serde_json::to_value(&transition.after)?,
            )?;
            *written += 1;
        }
        if let Some(test) = test {
            self.store.put(
                &format!("{AB_TEST_PREFIX}{}", test.test_id),
                &serde_json::to_value(test)?,
            )?;
        }
        Ok(())
    }

    fn restore(&self, policy: &Policy) {
        let restored = serde_json::to_value(policy)
            .map_err(DpeError::from)
            .and_then(|doc| {
                self.store
                    .put(&policy_key(&policy.id), &doc)
                    .map_err(DpeError::from)
            });
        if let Err(err) = restored {
            tracing::warn!(policy_id = %policy.id, error = %err, "could not restore policy document");
        }
    }

    // -- Reads --------------------------------------------------------------

    /// Look up a policy by id.
    pub fn get(&self, policy_id: &str) -> Option<Policy> {
        self.index.read().policies.get(policy_id).cloned()
    }

    /// All policies, sorted by id.
    pub fn list(&self) -> Vec<Policy> {
        self.index.read().policies.values().cloned().collect()
    }

    /// Number of registered policies.
    pub fn len(&self) -> usize {
        self.index.read().policies.len()
    }

    /// Whether no policy is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live policies matching the optional filters, by confidence descending.
    pub fn get_active(
        &self,
        scope: Option<PolicyScope>,
        state: Option<AccountState>,
        ab_group: Option<AbGroup>,
    ) -> Vec<Policy> {
        self.get_active_at(scope, state, ab_group, Utc::now())
    }

    /// [`Self::get_active`] evaluated at `now`.
    pub fn get_active_at(
        &self,
        scope: Option<PolicyScope>,
        state: Option<AccountState>,
        ab_group: Option<AbGroup>,
        now: DateTime<Utc>,
    ) -> Vec<Policy> {
        let index = self.index.read();
        let mut active: Vec<Policy> = index
            .policies
            .values()
            .filter(|p| p.is_live_at(now))
            .filter(|p| scope.map_or(true, |s| p.scope == s))
            .filter(|p| state.map_or(true, |s| p.applicable_states.contains(&s)))
            .filter(|p| ab_group.map_or(true, |g| p.metadata.ab_test_group == Some(g)))
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.confidence_weight
                .total_cmp(&a.confidence_weight)
                .then_with(|| a.id.cmp(&b.id))
        });
        active
    }

    /// Newest registered version of a family.
    pub fn get_latest(&self, base_id: &str) -> Option<Policy> {
        self.index.read().family(base_id).first().map(|p| (*p).clone())
    }

    /// Every registered version of a family, oldest first.
    pub fn history(&self, base_id: &str) -> Vec<Policy> {
        let index = self.index.read();
        index.family(base_id).into_iter().rev().cloned().collect()
    }

    /// Digest recorded when the policy was registered.
    pub fn digest(&self, policy_id: &str) -> Option<ContentDigest> {
        self.index.read().digests.get(policy_id).cloned()
    }

    /// Status changes of one policy, oldest first.
    pub fn lifecycle_history(&self, policy_id: &str) -> Vec<LifecycleRecord> {
        self.index
            .read()
            .lifecycle
            .get(policy_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up an A/B test.
    pub fn ab_test(&self, test_id: &str) -> Option<AbTest> {
        self.index.read().ab_tests.get(test_id).cloned()
    }

    /// Running A/B tests, ordered by start time.
    pub fn active_ab_tests(&self) -> Vec<AbTest> {
        let mut tests: Vec<AbTest> = self
            .index
            .read()
            .ab_tests
            .values()
            .filter(|t| t.is_active())
            .cloned()
            .collect();
        tests.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        tests
    }

    /// Number of policies per status.
    pub fn count_by_status(&self) -> BTreeMap<PolicyStatus, usize> {
        let mut counts = BTreeMap::new();
        for policy in self.index.read().policies.values() {
            *counts.entry(policy.status).or_insert(0) += 1;
        }
        counts
    }

    /// Number of policies per scope.
    pub fn count_by_scope(&self) -> BTreeMap<PolicyScope, usize> {
        let mut counts = BTreeMap::new();
        for policy in self.index.read().policies.values() {
            *counts.entry(policy.scope).or_insert(0) += 1;
        }
        counts
    }

    /// Field-level differences between two registered policies.
    pub fn compare_versions(&self, id_a: &str, id_b: &str) -> Result<VersionDiff, DpeError> {
        let index = self.index.read();
        let a = index
            .policies
            .get(id_a)
            .ok_or_else(|| DpeError::policy_not_found(id_a))?;
        let b = index
            .policies
            .get(id_b)
            .ok_or_else(|| DpeError::policy_not_found(id_b))?;

        let states = |p: &Policy| {
            p.applicable_states
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(",")
        };
        let fields = [
            ("scope", a.scope.to_string(), b.scope.to_string()),
            ("applicable_states", states(a), states(b)),
            (
                "conditions",
                a.conditions.len().to_string(),
                b.conditions.len().to_string(),
            ),
            (
                "actions",
                a.actions.len().to_string(),
                b.actions.len().to_string(),
            ),
            (
                "confidence_weight",
                a.confidence_weight.to_string(),
                b.confidence_weight.to_string(),
            ),
            (
                "risk_ceiling",
                a.risk_ceiling.to_string(),
                b.risk_ceiling.to_string(),
            ),
            (
                "aggressiveness_ceiling",
                a.aggressiveness_ceiling.to_string(),
                b.aggressiveness_ceiling.to_string(),
            ),
            (
                "max_total_actions",
                a.max_total_actions.to_string(),
                b.max_total_actions.to_string(),
            ),
        ];
        let changes = fields
            .into_iter()
            .filter(|(_, before, after)| before != after)
            .map(|(field, before, after)| FieldChange {
                field,
                before,
                after,
            })
            .collect();
        Ok(VersionDiff {
            from_id: a.id.clone(),
            from_version: a.metadata.version.clone(),
            to_id: b.id.clone(),
            to_version: b.metadata.version.clone(),
            changes,
        })
    }

    /// Re-read every policy document from the store and return the ids whose
    /// content no longer matches the digest recorded at registration.
    ///
    /// Missing and undecodable documents count as mismatches. Store failures
    /// propagate.
    pub fn verify_integrity(&self) -> Result<Vec<String>, DpeError> {
        let expected: Vec<(String, ContentDigest)> = self
            .index
            .read()
            .digests
            .iter()
            .map(|(id, d)| (id.clone(), d.clone()))
            .collect();
        let mut mismatched = Vec::new();
        for (id, digest) in expected {
            let actual = match self.store.get(&policy_key(&id))? {
                Some(doc) => serde_json::from_value::<Policy>(doc)
                    .ok()
                    .and_then(|p| p.content_digest().ok()),
                None => None,
            };
            if actual.as_ref() != Some(&digest) {
                tracing::warn!(policy_id = %id, expected = %digest, "policy document failed integrity check");
                mismatched.push(id);
            }
        }
        Ok(mismatched)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.read();
        f.debug_struct("PolicyRegistry")
            .field("policies", &index.policies.len())
            .field("ab_tests", &index.ab_tests.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, ActionType, Condition, CooldownRange, Operator};
    use dpe_core::DirectoryStore;

    fn policy(id: &str, version: &str, confidence: f64) -> Policy {
        Policy::new(id, id, PolicyScope::TiktokVideo)
            .with_states([AccountState::Growing])
            .with_condition(Condition::new("views", Operator::Gte, 100))
            .with_action(Action::new(ActionType::Like, 5, CooldownRange::new(5, 10)))
            .with_confidence(confidence)
            .with_version(version)
            .with_status(PolicyStatus::Active)
    }

    fn registry_with_store() -> (PolicyRegistry, MemoryStore) {
        let store = MemoryStore::new();
        (PolicyRegistry::new(Arc::new(store.clone())), store)
    }

    #[test]
    fn register_and_get() {
        let (registry, store) = registry_with_store();
        let digest = registry.register(policy("push_v1", "1.0.0", 0.7)).unwrap();
        assert_eq!(registry.get("push_v1").unwrap().confidence_weight, 0.7);
        assert_eq!(registry.digest("push_v1"), Some(digest));
        assert!(store.get("policies/push_v1").unwrap().is_some());
        assert_eq!(registry.lifecycle_history("push_v1").len(), 1);
    }

    #[test]
    fn duplicate_id_rejected() {
        let registry = PolicyRegistry::in_memory();
        registry.register(policy("push_v1", "1.0.0", 0.7)).unwrap();
        let err = registry.register(policy("push_v1", "1.0.0", 0.9)).unwrap_err();
        assert!(matches!(
            err,
            DpeError::Validation(ValidationError::DuplicatePolicy { .. })
        ));
        assert_eq!(registry.get("push_v1").unwrap().confidence_weight, 0.7);
    }

    #[test]
    fn duplicate_version_in_family_rejected() {
        let registry = PolicyRegistry::in_memory();
        registry.register(policy("push_v1", "1.0.0", 0.7)).unwrap();
        let err = registry.register(policy("push_v2", "1.0", 0.7)).unwrap_err();
        assert!(matches!(err, DpeError::Validation(_)));
    }

    #[test]
    fn invalid_policy_never_reaches_store() {
        let (registry, store) = registry_with_store();
        let err = registry.register(policy("push_v1", "", 0.7)).unwrap_err();
        assert!(matches!(
            err,
            DpeError::Validation(ValidationError::EmptyField(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn store_failure_propagates_and_index_is_unchanged() {
        let (registry, store) = registry_with_store();
        store.set_unavailable(true);
        let err = registry.register(policy("push_v1", "1.0.0", 0.7)).unwrap_err();
        assert!(matches!(err, DpeError::Storage(StorageError::Unavailable(_))));
        assert!(registry.get("push_v1").is_none());
    }

    /// Store that refuses writes to keys under one prefix.
    struct FailingStore {
        inner: MemoryStore,
        fail_prefix: parking_lot::Mutex<Option<&'static str>>,
    }

    impl FailingStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                fail_prefix: parking_lot::Mutex::new(None),
            })
        }

        fn fail_writes_under(&self, prefix: Option<&'static str>) {
            *self.fail_prefix.lock() = prefix;
        }
    }

    impl KeyValueStore for FailingStore {
        fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StorageError> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
            match *self.fail_prefix.lock() {
                Some(prefix) if key.starts_with(prefix) => {
                    Err(StorageError::Unavailable(format!("writes to {prefix} refused")))
                }
                _ => self.inner.put(key, value),
            }
        }

        fn list_prefix(
            &self,
            prefix: &str,
        ) -> Result<Vec<(String, serde_json::Value)>, StorageError> {
            self.inner.list_prefix(prefix)
        }
    }

    #[test]
    fn failed_lifecycle_write_leaves_registration_retryable() {
        let store = FailingStore::new();
        let registry = PolicyRegistry::new(store.clone());
        store.fail_writes_under(Some(LIFECYCLE_PREFIX));

        let err = registry.register(policy("push_v1", "1.0.0", 0.7)).unwrap_err();
        assert!(matches!(err, DpeError::Storage(StorageError::Unavailable(_))));
        assert!(registry.get("push_v1").is_none());
        assert!(registry.digest("push_v1").is_none());
        assert!(store.get("policies/push_v1").unwrap().is_none());

        store.fail_writes_under(None);
        registry.register(policy("push_v1", "1.0.0", 0.7)).unwrap();
        assert_eq!(registry.lifecycle_history("push_v1").len(), 1);
        assert!(registry.verify_integrity().unwrap().is_empty());
    }

    #[test]
    fn failed_status_change_keeps_status_and_history() {
        let store = FailingStore::new();
        let registry = PolicyRegistry::new(store.clone());
        registry.register(policy("push_v1", "1.0.0", 0.7)).unwrap();

        store.fail_writes_under(Some(LIFECYCLE_PREFIX));
        assert!(registry.disable("push_v1", "pause").is_err());
        assert_eq!(registry.get("push_v1").unwrap().status, PolicyStatus::Active);
        assert_eq!(registry.lifecycle_history("push_v1").len(), 1);
        assert_eq!(
            store.get("policies/push_v1").unwrap().unwrap()["status"],
            "active"
        );

        store.fail_writes_under(None);
        registry.disable("push_v1", "pause").unwrap();
        assert_eq!(registry.lifecycle_history("push_v1").len(), 2);
    }

    #[test]
    fn failed_ab_test_start_leaves_both_policies_untouched() {
        let store = FailingStore::new();
        let registry = PolicyRegistry::new(store.clone());
        registry.register(policy("a_v1", "1", 0.6)).unwrap();
        registry.register(policy("b_v1", "1", 0.6)).unwrap();

        store.fail_writes_under(Some("policies/b_v1"));
        assert!(registry.start_ab_test("a_v1", "b_v1").is_err());
        for id in ["a_v1", "b_v1"] {
            let policy = registry.get(id).unwrap();
            assert_eq!(policy.status, PolicyStatus::Active);
            assert!(policy.metadata.ab_test_group.is_none());
            assert_eq!(
                store.get(&format!("policies/{id}")).unwrap().unwrap()["status"],
                "active"
            );
        }
        assert!(registry.active_ab_tests().is_empty());

        store.fail_writes_under(None);
        let test = registry.start_ab_test("a_v1", "b_v1").unwrap();
        assert_eq!(registry.active_ab_tests(), vec![test]);
        assert_eq!(registry.get("b_v1").unwrap().status, PolicyStatus::Testing);
    }

    #[test]
    fn reads_survive_store_outage() {
        let (registry, store) = registry_with_store();
        registry.register(policy("push_v1", "1.0.0", 0.7)).unwrap();
        store.set_unavailable(true);
        assert!(registry.get("push_v1").is_some());
        assert_eq!(registry.get_active(None, None, None).len(), 1);
        assert!(registry.disable("push_v1", "maintenance").is_err());
        assert_eq!(registry.get("push_v1").unwrap().status, PolicyStatus::Active);
    }

    #[test]
    fn get_active_filters_and_sorts() {
        let registry = PolicyRegistry::in_memory();
        registry.register(policy("low_v1", "1", 0.4)).unwrap();
        registry.register(policy("high_v1", "1", 0.9)).unwrap();
        registry
            .register(policy("draft_v1", "1", 0.95).with_status(PolicyStatus::Draft))
            .unwrap();
        registry
            .register(
                policy("insta_v1", "1", 0.8)
                    .with_states([AccountState::Stable]),
            )
            .unwrap();

        let ids: Vec<_> = registry
            .get_active(None, None, None)
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["high_v1", "insta_v1", "low_v1"]);

        let growing: Vec<_> = registry
            .get_active(Some(PolicyScope::TiktokVideo), Some(AccountState::Growing), None)
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(growing, vec!["high_v1", "low_v1"]);
        assert!(registry
            .get_active(Some(PolicyScope::YoutubeVideo), None, None)
            .is_empty());
    }

    #[test]
    fn expired_policies_are_not_active() {
        let registry = PolicyRegistry::in_memory();
        let now = Utc::now();
        registry
            .register(policy("old_v1", "1", 0.7).with_expiry(now - chrono::Duration::hours(1)))
            .unwrap();
        assert!(registry.get_active_at(None, None, None, now).is_empty());
    }

    #[test]
    fn enable_only_from_disabled() {
        let registry = PolicyRegistry::in_memory();
        registry.register(policy("push_v1", "1", 0.7)).unwrap();
        let err = registry.enable("push_v1").unwrap_err();
        assert!(format!("{err}").contains("only valid from disabled"));

        registry.disable("push_v1", "investigating").unwrap();
        assert_eq!(registry.get("push_v1").unwrap().status, PolicyStatus::Disabled);
        let enabled = registry.enable("push_v1").unwrap();
        assert_eq!(enabled.status, PolicyStatus::Active);
    }

    #[test]
    fn archived_is_terminal() {
        let registry = PolicyRegistry::in_memory();
        registry.register(policy("push_v1", "1", 0.7)).unwrap();
        registry.archive("push_v1", "retired").unwrap();
        assert!(registry.deprecate("push_v1", "again").is_err());
        assert!(registry.disable("push_v1", "again").is_err());
    }

    #[test]
    fn lifecycle_records_accumulate_and_persist() {
        let (registry, store) = registry_with_store();
        registry
            .register(policy("push_v1", "1", 0.7).with_status(PolicyStatus::Draft))
            .unwrap();
        registry.activate("push_v1").unwrap();
        registry.deprecate("push_v1", "replaced").unwrap();

        let history = registry.lifecycle_history("push_v1");
        let transitions: Vec<_> = history.iter().map(|r| (r.from, r.to)).collect();
        assert_eq!(
            transitions,
            vec![
                (None, PolicyStatus::Draft),
                (Some(PolicyStatus::Draft), PolicyStatus::Active),
                (Some(PolicyStatus::Active), PolicyStatus::Deprecated),
            ]
        );
        assert_eq!(store.list_prefix("lifecycle/push_v1/").unwrap().len(), 3);
    }

    #[test]
    fn load_restores_index_from_store() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let registry = PolicyRegistry::new(store.clone());
        registry.register(policy("push_v1", "1", 0.7)).unwrap();
        registry.disable("push_v1", "pause").unwrap();
        let test_a = policy("a_v1", "1", 0.6);
        let test_b = policy("b_v1", "1", 0.6);
        registry.register(test_a).unwrap();
        registry.register(test_b).unwrap();
        let test = registry.start_ab_test("a_v1", "b_v1").unwrap();

        let reloaded = PolicyRegistry::load(store).unwrap();
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.get("push_v1").unwrap().status, PolicyStatus::Disabled);
        assert_eq!(reloaded.lifecycle_history("push_v1").len(), 2);
        assert_eq!(reloaded.digest("push_v1"), registry.digest("push_v1"));
        assert_eq!(reloaded.active_ab_tests(), vec![test]);
    }

    #[test]
    fn directory_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(DirectoryStore::new(dir.path()));
        let registry = PolicyRegistry::new(store.clone());
        assert_eq!(registry.seed_standard_policies().unwrap(), 5);
        assert_eq!(registry.seed_standard_policies().unwrap(), 0);

        let reloaded = PolicyRegistry::load(store).unwrap();
        assert_eq!(reloaded.len(), 5);
        assert!(reloaded.verify_integrity().unwrap().is_empty());
    }

    #[test]
    fn ab_test_lifecycle() {
        let registry = PolicyRegistry::in_memory();
        registry.register(policy("a_v1", "1", 0.6)).unwrap();
        registry.register(policy("b_v1", "1", 0.6)).unwrap();

        let test = registry.start_ab_test("a_v1", "b_v1").unwrap();
        let a = registry.get("a_v1").unwrap();
        assert_eq!(a.status, PolicyStatus::Testing);
        assert_eq!(a.metadata.ab_test_group, Some(AbGroup::A));
        assert_eq!(
            registry.get_active(None, None, Some(AbGroup::B))[0].id,
            "b_v1"
        );
        assert!(registry.start_ab_test("a_v1", "b_v1").is_err());

        let ended = registry.end_ab_test(&test.test_id, AbGroup::B).unwrap();
        assert_eq!(ended.winner.as_deref(), Some("b_v1"));
        assert!(registry.active_ab_tests().is_empty());
        let a = registry.get("a_v1").unwrap();
        let b = registry.get("b_v1").unwrap();
        assert_eq!(a.status, PolicyStatus::Deprecated);
        assert_eq!(b.status, PolicyStatus::Active);
        assert_eq!(b.metadata.ab_test_group, None);
        assert!(registry
            .lifecycle_history("a_v1")
            .last()
            .unwrap()
            .reason
            .contains("lost A/B test"));
        assert!(registry.end_ab_test(&test.test_id, AbGroup::A).is_err());
    }

    #[test]
    fn ab_test_against_itself_rejected() {
        let registry = PolicyRegistry::in_memory();
        registry.register(policy("a_v1", "1", 0.6)).unwrap();
        assert!(matches!(
            registry.start_ab_test("a_v1", "a_v1"),
            Err(DpeError::AbTest(_))
        ));
        assert!(matches!(
            registry.end_ab_test("missing", AbGroup::A),
            Err(DpeError::NotFound { .. })
        ));
    }

    #[test]
    fn history_and_latest_follow_version_order() {
        let registry = PolicyRegistry::in_memory();
        registry.register(policy("push_v1", "1.2.0", 0.6)).unwrap();
        registry
            .publish_version(policy("push_v2", "1.10.0", 0.7))
            .unwrap();

        assert_eq!(registry.get_latest("push").unwrap().id, "push_v2");
        let history: Vec<_> = registry
            .history("push")
            .into_iter()
            .map(|p| p.metadata.version)
            .collect();
        assert_eq!(history, vec!["1.2.0", "1.10.0"]);

        let v1 = registry.get("push_v1").unwrap();
        assert_eq!(v1.status, PolicyStatus::Deprecated);
        let v2 = registry.get("push_v2").unwrap();
        assert_eq!(v2.metadata.previous_version.as_deref(), Some("1.2.0"));
    }

    #[test]
    fn publish_rejects_stale_version() {
        let registry = PolicyRegistry::in_memory();
        registry.register(policy("push_v2", "2.0.0", 0.6)).unwrap();
        let err = registry
            .publish_version(policy("push_v3", "1.9.0", 0.6))
            .unwrap_err();
        assert!(matches!(
            err,
            DpeError::Validation(ValidationError::StaleVersion { .. })
        ));
    }

    #[test]
    fn compare_versions_reports_changed_fields() {
        let registry = PolicyRegistry::in_memory();
        registry.register(policy("push_v1", "1", 0.6)).unwrap();
        registry
            .register(
                policy("push_v2", "2", 0.8)
                    .with_action(Action::new(ActionType::Share, 1, CooldownRange::new(60, 60))),
            )
            .unwrap();
        let diff = registry.compare_versions("push_v1", "push_v2").unwrap();
        let fields: Vec<_> = diff.changes.iter().map(|c| c.field).collect();
        assert_eq!(fields, vec!["actions", "confidence_weight"]);
        assert!(registry.compare_versions("push_v1", "push_v1").unwrap().is_identical());
    }

    #[test]
    fn verify_integrity_detects_tampering() {
        let (registry, store) = registry_with_store();
        registry.register(policy("push_v1", "1", 0.6)).unwrap();
        registry.register(policy("other_v1", "1", 0.6)).unwrap();

        let mut doc = store.get("policies/push_v1").unwrap().unwrap();
        doc["confidence_weight"] = serde_json::json!(1.0);
        store.put("policies/push_v1", &doc).unwrap();

        assert_eq!(registry.verify_integrity().unwrap(), vec!["push_v1"]);
    }

    #[test]
    fn status_change_keeps_digest_valid() {
        let registry = PolicyRegistry::in_memory();
        registry.register(policy("push_v1", "1", 0.6)).unwrap();
        registry.disable("push_v1", "pause").unwrap();
        assert!(registry.verify_integrity().unwrap().is_empty());
    }

    #[test]
    fn counts_by_status_and_scope() {
        let registry = PolicyRegistry::in_memory();
        registry.seed_standard_policies().unwrap();
        registry.disable("cold_start_warmup_v1", "off").unwrap();
        let by_status = registry.count_by_status();
        assert_eq!(by_status[&PolicyStatus::Active], 4);
        assert_eq!(by_status[&PolicyStatus::Disabled], 1);
        let by_scope = registry.count_by_scope();
        assert_eq!(by_scope[&PolicyScope::TiktokVideo], 2);
        assert_eq!(by_scope[&PolicyScope::CrossPlatform], 2);
    }
}
