//! # Execution Guard
//!
//! Runs ten independent checks for a (policy, action, context) triple and
//! collects every failure.
//!
//! ## State
//!
//! - last execution time per (policy, action type, account) and per
//!   (policy, account)
//! - execution counters per (policy, action type, account) and per
//!   (policy, account)
//! - a rolling per-account window of recent executions, read only by the
//!   pattern-repetition check
//!
//! ## Concurrency
//!
//! State sits behind one `parking_lot::RwLock`. [`ExecutionGuard::validate_execution`]
//! takes the read lock and never mutates, so concurrent validations are safe
//! and repeated validations are idempotent. [`ExecutionGuard::record_execution`]
//! takes the write lock, so recordings are serialized and a cooldown or
//! counter update can never be lost to a race.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use dpe_core::{keys, DecisionContext, GuardConfig};
use dpe_policy::{AccountState, Action, ActionType, Policy};
use parking_lot::RwLock;
use serde::Serialize;

use crate::checks::{BlockCode, CheckResult, GuardBlock, GuardCheck, GuardResult};

const UNKNOWN_ACCOUNT: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ActionKey {
    policy_id: String,
    action_type: ActionType,
    account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PolicyKey {
    policy_id: String,
    account_id: String,
}

#[derive(Debug, Clone)]
struct ExecutionEntry {
    at: DateTime<Utc>,
    policy_id: String,
    action_type: ActionType,
}

#[derive(Debug, Default)]
struct GuardState {
    last_action_execution: BTreeMap<ActionKey, DateTime<Utc>>,
    last_policy_execution: BTreeMap<PolicyKey, DateTime<Utc>>,
    action_counts: BTreeMap<ActionKey, u32>,
    total_counts: BTreeMap<PolicyKey, u32>,
    history: BTreeMap<String, VecDeque<ExecutionEntry>>,
    recorded: u64,
}

/// Per-account execution summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStats {
    /// Account summarized.
    pub account_id: String,
    /// Executions across every policy.
    pub total_executions: u32,
    /// Executions per policy.
    pub by_policy: BTreeMap<String, u32>,
    /// Executions per action type.
    pub by_action: BTreeMap<ActionType, u32>,
    /// Most recent execution.
    pub last_execution: Option<DateTime<Utc>>,
    /// Action types in the rolling window, oldest first.
    pub recent_actions: Vec<ActionType>,
}

/// Guard-wide counters for system status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardStatus {
    /// Executions recorded since start (or last reset).
    pub executions_recorded: u64,
    /// Accounts with a non-empty rolling window.
    pub accounts_tracked: usize,
    /// Distinct (policy, action, account) keys with a counter.
    pub action_keys_tracked: usize,
    /// Active thresholds.
    pub config: GuardConfig,
}

/// Pre-execution safety checks with recorded execution state.
#[derive(Debug)]
pub struct ExecutionGuard {
    config: GuardConfig,
    state: RwLock<GuardState>,
}

impl ExecutionGuard {
    /// Create a guard with the given thresholds.
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            state: RwLock::new(GuardState::default()),
        }
    }

    /// Active thresholds.
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Validate an action against the guard right now.
    pub fn validate_execution(
        &self,
        policy: &Policy,
        action: &Action,
        ctx: &DecisionContext,
    ) -> GuardResult {
        self.validate_execution_at(policy, action, ctx, Utc::now())
    }

    /// Validate an action against the guard at `now`. Read-only.
    pub fn validate_execution_at(
        &self,
        policy: &Policy,
        action: &Action,
        ctx: &DecisionContext,
        now: DateTime<Utc>,
    ) -> GuardResult {
        let account_id = ctx.account_id().unwrap_or(UNKNOWN_ACCOUNT).to_string();
        let action_key = ActionKey {
            policy_id: policy.id.clone(),
            action_type: action.action_type,
            account_id: account_id.clone(),
        };
        let policy_key = PolicyKey {
            policy_id: policy.id.clone(),
            account_id: account_id.clone(),
        };

        let mut warnings = Vec::new();
        let state = self.state.read();
        let outcomes = [
            (GuardCheck::PolicyStatus, check_policy_status(policy, now)),
            (
                GuardCheck::Cooldown,
                check_cooldown(&state, policy, action, &action_key, &policy_key, now),
            ),
            (
                GuardCheck::ActionLimit,
                check_action_limit(&state, action, &action_key),
            ),
            (
                GuardCheck::TotalLimit,
                check_total_limit(&state, policy, &policy_key),
            ),
            (
                GuardCheck::Aggressiveness,
                check_ceiling(
                    ctx.aggressiveness(),
                    keys::CURRENT_AGGRESSIVENESS,
                    policy.aggressiveness_ceiling,
                    BlockCode::AggressivenessCeilingExceeded,
                    &mut warnings,
                ),
            ),
            (
                GuardCheck::Risk,
                check_ceiling(
                    ctx.risk_score(),
                    keys::CURRENT_RISK_SCORE,
                    policy.risk_ceiling,
                    BlockCode::RiskCeilingExceeded,
                    &mut warnings,
                ),
            ),
            (
                GuardCheck::PatternRepetition,
                self.check_pattern(&state, &account_id),
            ),
            (
                GuardCheck::AccountState,
                check_account_state(policy, ctx, &mut warnings),
            ),
            (GuardCheck::SupervisorOverride, check_supervisor(ctx)),
            (
                GuardCheck::AbortConditions,
                self.check_abort_conditions(policy, ctx),
            ),
        ];
        drop(state);

        let mut checks = Vec::with_capacity(outcomes.len());
        let mut blocks = Vec::new();
        for (check, outcome) in outcomes {
            checks.push(CheckResult {
                check,
                passed: outcome.is_none(),
            });
            blocks.extend(outcome);
        }
        let allowed = blocks.is_empty();
        if !allowed {
            tracing::warn!(
                policy_id = %policy.id,
                action = %action.action_type,
                account_id = %account_id,
                codes = ?blocks.iter().map(|b| b.code.as_str()).collect::<Vec<_>>(),
                "execution blocked by guard"
            );
        }
        GuardResult {
            policy_id: policy.id.clone(),
            action_type: action.action_type,
            account_id,
            allowed,
            checks,
            blocks,
            warnings,
            checked_at: now,
        }
    }

    /// Record that an approved action ran right now.
    pub fn record_execution(&self, policy_id: &str, action_type: ActionType, account_id: &str) {
        self.record_execution_at(policy_id, action_type, account_id, Utc::now());
    }

    /// Record that an approved action ran at `at`.
    pub fn record_execution_at(
        &self,
        policy_id: &str,
        action_type: ActionType,
        account_id: &str,
        at: DateTime<Utc>,
    ) {
        let action_key = ActionKey {
            policy_id: policy_id.to_string(),
            action_type,
            account_id: account_id.to_string(),
        };
        let policy_key = PolicyKey {
            policy_id: policy_id.to_string(),
            account_id: account_id.to_string(),
        };

        let mut state = self.state.write();
        state.last_action_execution.insert(action_key.clone(), at);
        state.last_policy_execution.insert(policy_key.clone(), at);
        *state.action_counts.entry(action_key).or_insert(0) += 1;
        *state.total_counts.entry(policy_key).or_insert(0) += 1;
        let window = self.config.history_window;
        let history = state.history.entry(account_id.to_string()).or_default();
        history.push_back(ExecutionEntry {
            at,
            policy_id: policy_id.to_string(),
            action_type,
        });
        while history.len() > window {
            history.pop_front();
        }
        state.recorded += 1;
        tracing::info!(policy_id, action = %action_type, account_id, "execution recorded");
    }

    /// Clear cooldowns and counters of one policy across every account.
    ///
    /// The per-account rolling window is kept: repetition is a property of
    /// the account, not of the policy. Returns the number of cleared keys.
    pub fn reset_policy_counters(&self, policy_id: &str) -> usize {
        let mut state = self.state.write();
        let before = state.action_counts.len() + state.total_counts.len();
        state.last_action_execution.retain(|k, _| k.policy_id != policy_id);
        state.last_policy_execution.retain(|k, _| k.policy_id != policy_id);
        state.action_counts.retain(|k, _| k.policy_id != policy_id);
        state.total_counts.retain(|k, _| k.policy_id != policy_id);
        let cleared = before - (state.action_counts.len() + state.total_counts.len());
        tracing::info!(policy_id, cleared, "policy counters reset");
        cleared
    }

    /// Execution summary for one account.
    pub fn execution_stats(&self, account_id: &str) -> ExecutionStats {
        let state = self.state.read();
        let mut by_policy = BTreeMap::new();
        for (key, count) in &state.total_counts {
            if key.account_id == account_id {
                *by_policy.entry(key.policy_id.clone()).or_insert(0) += count;
            }
        }
        let mut by_action = BTreeMap::new();
        for (key, count) in &state.action_counts {
            if key.account_id == account_id {
                *by_action.entry(key.action_type).or_insert(0) += count;
            }
        }
        let history = state.history.get(account_id);
        ExecutionStats {
            account_id: account_id.to_string(),
            total_executions: by_policy.values().sum(),
            by_policy,
            by_action,
            last_execution: history.and_then(|h| h.back()).map(|e| e.at),
            recent_actions: history
                .map(|h| h.iter().map(|e| e.action_type).collect())
                .unwrap_or_default(),
        }
    }

    /// Guard-wide counters.
    pub fn guard_status(&self) -> GuardStatus {
        let state = self.state.read();
        GuardStatus {
            executions_recorded: state.recorded,
            accounts_tracked: state.history.values().filter(|h| !h.is_empty()).count(),
            action_keys_tracked: state.action_counts.len(),
            config: self.config.clone(),
        }
    }

    /// Policies that executed on an account within the rolling window.
    pub fn recent_policies(&self, account_id: &str) -> BTreeSet<String> {
        self.state
            .read()
            .history
            .get(account_id)
            .map(|h| h.iter().map(|e| e.policy_id.clone()).collect())
            .unwrap_or_default()
    }

    // -- Checks that need configuration --------------------------------------

    fn check_pattern(&self, state: &GuardState, account_id: &str) -> Option<GuardBlock> {
        let history = state.history.get(account_id)?;

        let repeat = self.config.pattern_repeat_threshold;
        if repeat > 0 && history.len() >= repeat {
            let mut recent = history.iter().rev().take(repeat);
            let first = recent.next().map(|e| e.action_type);
            if let Some(first) = first {
                if recent.all(|e| e.action_type == first) {
                    return Some(
                        GuardBlock::new(
                            BlockCode::PatternRepetition,
                            format!("last {repeat} actions on the account were all {first}"),
                        )
                        .with_remediation("vary the action type before repeating"),
                    );
                }
            }
        }

        let intervals = self.config.cadence_interval_count;
        if intervals > 0 && history.len() > intervals {
            let recent: Vec<DateTime<Utc>> = history
                .iter()
                .rev()
                .take(intervals + 1)
                .map(|e| e.at)
                .collect();
            let buckets: BTreeSet<i64> = recent
                .windows(2)
                .map(|w| (w[0] - w[1]).num_seconds())
                .collect();
            if buckets.len() <= self.config.cadence_max_distinct_buckets {
                return Some(
                    GuardBlock::new(
                        BlockCode::PatternRepetition,
                        format!(
                            "last {intervals} intervals fall into {} distinct second buckets",
                            buckets.len()
                        ),
                    )
                    .with_remediation("randomize the delay between actions"),
                );
            }
        }
        None
    }

    fn check_abort_conditions(&self, policy: &Policy, ctx: &DecisionContext) -> Option<GuardBlock> {
        let triggered: Vec<&str> = policy
            .abort_conditions
            .iter()
            .filter(|c| {
                c.is_triggered(
                    ctx,
                    self.config.abort_risk_threshold,
                    self.config.abort_aggressiveness_threshold,
                )
            })
            .map(|c| c.as_str())
            .collect();
        if triggered.is_empty() {
            None
        } else {
            Some(
                GuardBlock::new(
                    BlockCode::AbortConditionTriggered,
                    format!("abort conditions triggered: {}", triggered.join(", ")),
                )
                .with_remediation("resolve the abort condition before retrying"),
            )
        }
    }
}

impl Default for ExecutionGuard {
    fn default() -> Self {
        Self::new(GuardConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Stateless checks
// ---------------------------------------------------------------------------

fn check_policy_status(policy: &Policy, now: DateTime<Utc>) -> Option<GuardBlock> {
    if !policy.status.is_live() {
        return Some(
            GuardBlock::new(
                BlockCode::PolicyInactive,
                format!("policy {} is {}", policy.id, policy.status),
            )
            .with_remediation("select an active policy"),
        );
    }
    if policy.is_expired_at(now) {
        return Some(
            GuardBlock::new(BlockCode::PolicyInactive, format!("policy {} has expired", policy.id))
                .with_remediation("publish a new version of the policy"),
        );
    }
    None
}

/// Minutes until `last + wait` at `now`, rounded up; `None` once elapsed.
fn remaining_minutes(last: DateTime<Utc>, wait: Duration, now: DateTime<Utc>) -> Option<i64> {
    let elapsed = now - last;
    if elapsed >= wait {
        return None;
    }
    let remaining_ms = (wait - elapsed).num_milliseconds();
    Some((remaining_ms + 59_999) / 60_000)
}

fn check_cooldown(
    state: &GuardState,
    policy: &Policy,
    action: &Action,
    action_key: &ActionKey,
    policy_key: &PolicyKey,
    now: DateTime<Utc>,
) -> Option<GuardBlock> {
    let action_wait = state
        .last_action_execution
        .get(action_key)
        .and_then(|last| remaining_minutes(*last, action.cooldown.min_duration(), now));
    let policy_wait = state.last_policy_execution.get(policy_key).and_then(|last| {
        remaining_minutes(
            *last,
            Duration::minutes(i64::from(policy.global_cooldown_minutes)),
            now,
        )
    });
    let remaining = action_wait.max(policy_wait)?;
    let mut block = GuardBlock::new(
        BlockCode::CooldownActive,
        format!(
            "{} under {} is cooling down for {remaining} more minutes",
            action.action_type, policy.id
        ),
    )
    .with_remediation(format!("wait {remaining} minutes"));
    block.remaining_minutes = Some(remaining);
    Some(block)
}

fn check_action_limit(state: &GuardState, action: &Action, key: &ActionKey) -> Option<GuardBlock> {
    let count = state.action_counts.get(key).copied().unwrap_or(0);
    (count >= action.max_executions).then(|| {
        GuardBlock::new(
            BlockCode::ActionLimitReached,
            format!(
                "{} executed {count} of {} allowed times",
                action.action_type, action.max_executions
            ),
        )
        .with_remediation("select a different action or reset the policy counters")
    })
}

fn check_total_limit(state: &GuardState, policy: &Policy, key: &PolicyKey) -> Option<GuardBlock> {
    let count = state.total_counts.get(key).copied().unwrap_or(0);
    (count >= policy.max_total_actions).then(|| {
        GuardBlock::new(
            BlockCode::TotalLimitReached,
            format!(
                "policy {} executed {count} of {} allowed times on this account",
                policy.id, policy.max_total_actions
            ),
        )
        .with_remediation("select a different policy")
    })
}

fn check_ceiling(
    value: Option<f64>,
    field: &str,
    ceiling: f64,
    code: BlockCode,
    warnings: &mut Vec<String>,
) -> Option<GuardBlock> {
    let Some(value) = value else {
        warnings.push(format!("{field} missing; treated as 0.0"));
        return None;
    };
    (value > ceiling).then(|| {
        let what = field.trim_start_matches("current_").replace('_', " ");
        GuardBlock::new(code, format!("{field} {value:.2} exceeds ceiling {ceiling:.2}"))
            .with_remediation(format!("reduce {what} below {ceiling:.2}"))
    })
}

fn check_account_state(
    policy: &Policy,
    ctx: &DecisionContext,
    warnings: &mut Vec<String>,
) -> Option<GuardBlock> {
    if !ctx.contains(keys::ACCOUNT_STATE) {
        warnings.push(format!("{} missing; state check skipped", keys::ACCOUNT_STATE));
        return None;
    }
    let raw = ctx.account_state();
    let state = raw.and_then(AccountState::parse);
    match state {
        Some(s) if policy.applicable_states.contains(&s) => None,
        _ => Some(
            GuardBlock::new(
                BlockCode::AccountStateMismatch,
                format!(
                    "account state {} is not one of the policy's applicable states",
                    raw.unwrap_or("<non-text>")
                ),
            )
            .with_remediation("wait for the account to enter an applicable state"),
        ),
    }
}

fn check_supervisor(ctx: &DecisionContext) -> Option<GuardBlock> {
    let mut flags = Vec::new();
    if ctx.flag(keys::SUPERVISOR_BLOCK_ALL) {
        flags.push(keys::SUPERVISOR_BLOCK_ALL);
    }
    if ctx.flag(keys::EMERGENCY_FLAG) {
        flags.push(keys::EMERGENCY_FLAG);
    }
    if flags.is_empty() {
        None
    } else {
        Some(
            GuardBlock::new(
                BlockCode::SupervisorBlock,
                format!("supervisor block active: {}", flags.join(", ")),
            )
            .with_remediation("contact the supervisor to lift the block"),
        )
    }
}
