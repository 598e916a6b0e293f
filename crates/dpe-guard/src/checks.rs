//! Guard check identifiers, block codes and the validation result.

use chrono::{DateTime, Utc};
use dpe_policy::ActionType;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// GuardCheck
// ---------------------------------------------------------------------------

/// The ten pre-execution checks, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardCheck {
    /// Policy status is live and the policy has not expired.
    PolicyStatus,
    /// Cooldown since the last execution has elapsed.
    Cooldown,
    /// Per-(policy, action, account) execution cap.
    ActionLimit,
    /// Per-(policy, account) execution cap.
    TotalLimit,
    /// Aggressiveness within the policy ceiling.
    Aggressiveness,
    /// Risk within the policy ceiling.
    Risk,
    /// No automation-detectable repetition or cadence.
    PatternRepetition,
    /// Account state is one the policy applies to.
    AccountState,
    /// No supervisor-level block.
    SupervisorOverride,
    /// No declared abort condition holds.
    AbortConditions,
}

impl GuardCheck {
    /// All checks in evaluation order.
    pub fn all() -> &'static [GuardCheck] {
        &[
            Self::PolicyStatus,
            Self::Cooldown,
            Self::ActionLimit,
            Self::TotalLimit,
            Self::Aggressiveness,
            Self::Risk,
            Self::PatternRepetition,
            Self::AccountState,
            Self::SupervisorOverride,
            Self::AbortConditions,
        ]
    }

    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyStatus => "policy_status",
            Self::Cooldown => "cooldown",
            Self::ActionLimit => "action_limit",
            Self::TotalLimit => "total_limit",
            Self::Aggressiveness => "aggressiveness",
            Self::Risk => "risk",
            Self::PatternRepetition => "pattern_repetition",
            Self::AccountState => "account_state",
            Self::SupervisorOverride => "supervisor_override",
            Self::AbortConditions => "abort_conditions",
        }
    }

    /// Block code emitted when this check fails.
    pub fn block_code(&self) -> BlockCode {
        match self {
            Self::PolicyStatus => BlockCode::PolicyInactive,
            Self::Cooldown => BlockCode::CooldownActive,
            Self::ActionLimit => BlockCode::ActionLimitReached,
            Self::TotalLimit => BlockCode::TotalLimitReached,
            Self::Aggressiveness => BlockCode::AggressivenessCeilingExceeded,
            Self::Risk => BlockCode::RiskCeilingExceeded,
            Self::PatternRepetition => BlockCode::PatternRepetition,
            Self::AccountState => BlockCode::AccountStateMismatch,
            Self::SupervisorOverride => BlockCode::SupervisorBlock,
            Self::AbortConditions => BlockCode::AbortConditionTriggered,
        }
    }
}

impl std::fmt::Display for GuardCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// BlockCode
// ---------------------------------------------------------------------------

/// Structured reason code of a guard block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockCode {
    /// Policy is not active/testing or has expired.
    PolicyInactive,
    /// Cooldown has not elapsed.
    CooldownActive,
    /// Action execution cap reached.
    ActionLimitReached,
    /// Policy execution cap reached for the account.
    TotalLimitReached,
    /// Aggressiveness above the policy ceiling.
    AggressivenessCeilingExceeded,
    /// Risk above the policy ceiling.
    RiskCeilingExceeded,
    /// Repetitive actions or mechanical cadence.
    PatternRepetition,
    /// Account state not covered by the policy.
    AccountStateMismatch,
    /// Supervisor block-all or emergency flag.
    SupervisorBlock,
    /// A declared abort condition holds.
    AbortConditionTriggered,
}

impl BlockCode {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PolicyInactive => "POLICY_INACTIVE",
            Self::CooldownActive => "COOLDOWN_ACTIVE",
            Self::ActionLimitReached => "ACTION_LIMIT_REACHED",
            Self::TotalLimitReached => "TOTAL_LIMIT_REACHED",
            Self::AggressivenessCeilingExceeded => "AGGRESSIVENESS_CEILING_EXCEEDED",
            Self::RiskCeilingExceeded => "RISK_CEILING_EXCEEDED",
            Self::PatternRepetition => "PATTERN_REPETITION",
            Self::AccountStateMismatch => "ACCOUNT_STATE_MISMATCH",
            Self::SupervisorBlock => "SUPERVISOR_BLOCK",
            Self::AbortConditionTriggered => "ABORT_CONDITION_TRIGGERED",
        }
    }

    /// Whether the block concerns one action rather than the whole policy.
    pub fn is_action_specific(&self) -> bool {
        matches!(self, Self::CooldownActive | Self::ActionLimitReached)
    }
}

impl std::fmt::Display for BlockCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Pass/fail of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Which check.
    pub check: GuardCheck,
    /// Whether it passed.
    pub passed: bool,
}

/// A failed check, with a human-readable message and remediation hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardBlock {
    /// Structured reason code.
    pub code: BlockCode,
    /// What went wrong.
    pub message: String,
    /// What the operator can do about it.
    pub remediation: Option<String>,
    /// Minutes until a cooldown clears, rounded up.
    #[serde(default)]
    pub remaining_minutes: Option<i64>,
}

impl GuardBlock {
    pub(crate) fn new(code: BlockCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            remediation: None,
            remaining_minutes: None,
        }
    }

    pub(crate) fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}

impl std::fmt::Display for GuardBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Complete diagnostic of one `validate_execution` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardResult {
    /// Validated policy.
    pub policy_id: String,
    /// Validated action.
    pub action_type: ActionType,
    /// Account the action targets (`unknown` when absent from the context).
    pub account_id: String,
    /// Whether every check passed.
    pub allowed: bool,
    /// All ten checks in evaluation order.
    pub checks: Vec<CheckResult>,
    /// Every failure.
    pub blocks: Vec<GuardBlock>,
    /// Non-blocking observations (missing inputs, near-ceiling values).
    pub warnings: Vec<String>,
    /// Evaluation time.
    pub checked_at: DateTime<Utc>,
}

impl GuardResult {
    /// Whether a block with this code was emitted.
    pub fn is_blocked_by(&self, code: BlockCode) -> bool {
        self.blocks.iter().any(|b| b.code == code)
    }

    /// Codes of every block, in check order.
    pub fn block_codes(&self) -> Vec<BlockCode> {
        self.blocks.iter().map(|b| b.code).collect()
    }

    /// Whether a specific check passed.
    pub fn passed(&self, check: GuardCheck) -> bool {
        self.checks
            .iter()
            .any(|c| c.check == check && c.passed)
    }
}
