//! # Policy Model
//!
//! Versioned rule bundles that authorize bounded actions on a social-media
//! account under stated conditions.
//!
//! A [`Policy`] carries:
//! - **Conditions** over the decision context, each with a weight.
//! - **Actions** it authorizes, each with an execution cap and cooldown range.
//! - **Success signals** and **abort conditions** for outcome tracking and
//!   pre-execution aborts.
//! - **Ceilings** on risk and aggressiveness, and hard limits on total actions.
//!
//! ## Invariants
//!
//! - A policy whose status is not `active`/`testing`, or whose expiry has
//!   passed, is never applicable.
//! - Condition evaluation is fail-closed: an absent or non-coercible field
//!   makes the condition false.
//! - Operators, action types, signals and abort conditions are closed enums
//!   dispatched through exhaustive `match`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use dpe_core::{keys, sha256_json, ContentDigest, ContextValue, DecisionContext, ValidationError};
use serde::{Deserialize, Serialize};

/// Risk level at which a `risk_spike` abort condition fires by default.
pub const DEFAULT_ABORT_RISK: f64 = 0.75;
/// Aggressiveness level at which an `aggressiveness_spike` abort condition
/// fires by default.
pub const DEFAULT_ABORT_AGGRESSIVENESS: f64 = 0.85;

/// Score blend: share of the static confidence weight.
const CONFIDENCE_SHARE: f64 = 0.7;
/// Score blend: share of the weighted condition match.
const CONDITION_SHARE: f64 = 0.3;
/// Fraction of a ceiling above which the score is penalized.
const CEILING_PROXIMITY: f64 = 0.8;
const RISK_PROXIMITY_PENALTY: f64 = 0.8;
const AGGRESSIVENESS_PROXIMITY_PENALTY: f64 = 0.7;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Platform / target-granularity pair a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    /// Whole TikTok account.
    TiktokAccount,
    /// A single TikTok video.
    TiktokVideo,
    /// Whole Instagram account.
    InstagramAccount,
    /// A single Instagram post or reel.
    InstagramPost,
    /// Whole YouTube channel.
    YoutubeChannel,
    /// A single YouTube video.
    YoutubeVideo,
    /// Applies regardless of platform.
    CrossPlatform,
}

impl PolicyScope {
    /// All scopes in declaration order.
    pub fn all() -> &'static [PolicyScope] {
        &[
            Self::TiktokAccount,
            Self::TiktokVideo,
            Self::InstagramAccount,
            Self::InstagramPost,
            Self::YoutubeChannel,
            Self::YoutubeVideo,
            Self::CrossPlatform,
        ]
    }

    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TiktokAccount => "tiktok_account",
            Self::TiktokVideo => "tiktok_video",
            Self::InstagramAccount => "instagram_account",
            Self::InstagramPost => "instagram_post",
            Self::YoutubeChannel => "youtube_channel",
            Self::YoutubeVideo => "youtube_video",
            Self::CrossPlatform => "cross_platform",
        }
    }

    /// Platform name, or `None` for cross-platform scope.
    pub fn platform(&self) -> Option<&'static str> {
        match self {
            Self::TiktokAccount | Self::TiktokVideo => Some("tiktok"),
            Self::InstagramAccount | Self::InstagramPost => Some("instagram"),
            Self::YoutubeChannel | Self::YoutubeVideo => Some("youtube"),
            Self::CrossPlatform => None,
        }
    }
}

impl std::fmt::Display for PolicyScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account lifecycle state as reported by the external classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    /// New account with no distribution history.
    ColdStart,
    /// Building initial trust signals.
    Warming,
    /// Consistent baseline performance.
    Stable,
    /// Sustained upward trend.
    Growing,
    /// A content item is about to break out.
    Breakout,
    /// A content item is in viral distribution.
    Viral,
    /// Sustained downward trend.
    Declining,
    /// Recovering from a penalty or slump.
    Recovering,
    /// Platform-restricted; most actions are unsafe.
    Restricted,
}

impl AccountState {
    /// All states in declaration order.
    pub fn all() -> &'static [AccountState] {
        &[
            Self::ColdStart,
            Self::Warming,
            Self::Stable,
            Self::Growing,
            Self::Breakout,
            Self::Viral,
            Self::Declining,
            Self::Recovering,
            Self::Restricted,
        ]
    }

    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ColdStart => "cold_start",
            Self::Warming => "warming",
            Self::Stable => "stable",
            Self::Growing => "growing",
            Self::Breakout => "breakout",
            Self::Viral => "viral",
            Self::Declining => "declining",
            Self::Recovering => "recovering",
            Self::Restricted => "restricted",
        }
    }

    /// Parse a context string. Case-insensitive; unknown names yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::all()
            .iter()
            .copied()
            .find(|s| s.as_str() == normalized)
    }
}

impl std::fmt::Display for AccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    /// Authored but not yet eligible.
    Draft,
    /// Eligible for selection.
    Active,
    /// Eligible for selection as part of an A/B test.
    Testing,
    /// Superseded; retained for history.
    Deprecated,
    /// Temporarily switched off; may be re-enabled.
    Disabled,
    /// Permanently retired.
    Archived,
}

impl PolicyStatus {
    /// All statuses in declaration order.
    pub fn all() -> &'static [PolicyStatus] {
        &[
            Self::Draft,
            Self::Active,
            Self::Testing,
            Self::Deprecated,
            Self::Disabled,
            Self::Archived,
        ]
    }

    /// Whether policies in this status may be selected.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::Testing)
    }

    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Testing => "testing",
            Self::Deprecated => "deprecated",
            Self::Disabled => "disabled",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for PolicyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A/B test arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbGroup {
    /// Arm A.
    A,
    /// Arm B.
    B,
}

impl std::fmt::Display for AbGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::A => "A",
            Self::B => "B",
        })
    }
}

/// Comparison operator of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// `field <= value`
    #[serde(rename = "<=")]
    Lte,
    /// `field >= value`
    #[serde(rename = ">=")]
    Gte,
    /// `field < value`
    #[serde(rename = "<")]
    Lt,
    /// `field > value`
    #[serde(rename = ">")]
    Gt,
    /// `field == value`
    #[serde(rename = "==")]
    Eq,
    /// `field != value`
    #[serde(rename = "!=")]
    Ne,
    /// `field` is a member of the list `value`.
    #[serde(rename = "in")]
    In,
    /// `field` is not a member of the list `value`.
    #[serde(rename = "not_in")]
    NotIn,
}

impl Operator {
    /// Return the operator symbol.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lte => "<=",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::In => "in",
            Self::NotIn => "not_in",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action a policy may authorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Publish new content.
    Post,
    /// Paid or native promotion of existing content.
    Boost,
    /// Follow another account.
    Follow,
    /// Unfollow another account.
    Unfollow,
    /// Like a content item.
    Like,
    /// Comment on a content item.
    Comment,
    /// Reply to a comment.
    Reply,
    /// Share a content item.
    Share,
    /// Repost or stitch a content item.
    Repost,
    /// Pin a content item or comment.
    Pin,
    /// Schedule a future post.
    Schedule,
    /// Pause automated activity.
    Pause,
}

impl ActionType {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::Boost => "boost",
            Self::Follow => "follow",
            Self::Unfollow => "unfollow",
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Reply => "reply",
            Self::Share => "share",
            Self::Repost => "repost",
            Self::Pin => "pin",
            Self::Schedule => "schedule",
            Self::Pause => "pause",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable signal that an executed policy achieved its goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessSignal {
    /// View velocity increased.
    VelocityIncrease,
    /// Engagement rate increased.
    EngagementLift,
    /// Comment count grew.
    CommentGrowth,
    /// Follower count grew.
    FollowerGrowth,
    /// Watch-time retention improved.
    RetentionImprovement,
    /// Distribution reached new audiences.
    ReachExpansion,
    /// Content crossed the breakout threshold.
    BreakoutAchieved,
}

impl SuccessSignal {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VelocityIncrease => "velocity_increase",
            Self::EngagementLift => "engagement_lift",
            Self::CommentGrowth => "comment_growth",
            Self::FollowerGrowth => "follower_growth",
            Self::RetentionImprovement => "retention_improvement",
            Self::ReachExpansion => "reach_expansion",
            Self::BreakoutAchieved => "breakout_achieved",
        }
    }
}

/// Condition under which a policy must not execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortCondition {
    /// Risk score above the abort threshold.
    RiskSpike,
    /// Aggressiveness above the abort threshold.
    AggressivenessSpike,
    /// Shadowban detector fired.
    ShadowbanDetected,
    /// Engagement-drop detector fired.
    EngagementDrop,
    /// Reach-collapse detector fired.
    ReachCollapse,
    /// Platform flagged the account.
    AccountFlagged,
    /// Supervisor override is set.
    SupervisorOverride,
    /// Operator requested a manual abort.
    ManualAbort,
}

impl AbortCondition {
    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RiskSpike => "risk_spike",
            Self::AggressivenessSpike => "aggressiveness_spike",
            Self::ShadowbanDetected => "shadowban_detected",
            Self::EngagementDrop => "engagement_drop",
            Self::ReachCollapse => "reach_collapse",
            Self::AccountFlagged => "account_flagged",
            Self::SupervisorOverride => "supervisor_override",
            Self::ManualAbort => "manual_abort",
        }
    }

    /// Whether this abort condition holds for the context.
    ///
    /// Missing risk/aggressiveness never triggers a spike; missing detector
    /// flags are unset.
    pub fn is_triggered(
        &self,
        ctx: &DecisionContext,
        risk_threshold: f64,
        aggressiveness_threshold: f64,
    ) -> bool {
        match self {
            Self::RiskSpike => ctx.risk_score().is_some_and(|r| r > risk_threshold),
            Self::AggressivenessSpike => ctx
                .aggressiveness()
                .is_some_and(|a| a > aggressiveness_threshold),
            Self::ShadowbanDetected => ctx.flag(keys::SHADOWBAN_DETECTED),
            Self::EngagementDrop => ctx.flag(keys::ENGAGEMENT_DROP_DETECTED),
            Self::ReachCollapse => ctx.flag(keys::REACH_COLLAPSE_DETECTED),
            Self::AccountFlagged => ctx.flag(keys::ACCOUNT_FLAGGED),
            Self::SupervisorOverride => ctx.flag(keys::SUPERVISOR_OVERRIDE),
            Self::ManualAbort => ctx.flag(keys::MANUAL_ABORT),
        }
    }
}

impl std::fmt::Display for AbortCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

fn default_weight() -> f64 {
    1.0
}

/// A weighted predicate over one context field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Context key to read.
    pub field: String,
    /// Comparison operator.
    pub operator: Operator,
    /// Right-hand side of the comparison.
    pub value: ContextValue,
    /// Relative weight in the applicability score.
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl Condition {
    /// Create a condition with weight 1.0.
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<ContextValue>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
            weight: default_weight(),
        }
    }

    /// Builder: set the weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Evaluate against a context. Fail-closed on absence or type mismatch.
    pub fn evaluate(&self, ctx: &DecisionContext) -> bool {
        let Some(actual) = ctx.get(&self.field) else {
            return false;
        };
        match self.operator {
            Operator::Lte => numeric(actual, &self.value, |a, b| a <= b),
            Operator::Gte => numeric(actual, &self.value, |a, b| a >= b),
            Operator::Lt => numeric(actual, &self.value, |a, b| a < b),
            Operator::Gt => numeric(actual, &self.value, |a, b| a > b),
            Operator::Eq => actual.loosely_equals(&self.value),
            Operator::Ne => !actual.loosely_equals(&self.value),
            Operator::In => self
                .value
                .as_list()
                .is_some_and(|items| items.iter().any(|v| actual.loosely_equals(v))),
            Operator::NotIn => self
                .value
                .as_list()
                .is_some_and(|items| !items.iter().any(|v| actual.loosely_equals(v))),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

fn numeric(actual: &ContextValue, expected: &ContextValue, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.as_number(), expected.as_number()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// Inclusive cooldown window in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownRange {
    /// Minimum minutes between executions.
    pub min_minutes: u32,
    /// Upper bound the orchestrator may wait for jitter.
    pub max_minutes: u32,
}

impl CooldownRange {
    /// Create a cooldown window.
    pub fn new(min_minutes: u32, max_minutes: u32) -> Self {
        Self {
            min_minutes,
            max_minutes,
        }
    }

    /// Minimum wait as a chrono duration.
    pub fn min_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.min_minutes))
    }
}

/// An action a policy authorizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// What to do.
    pub action_type: ActionType,
    /// Cap per (policy, action, account).
    pub max_executions: u32,
    /// Minimum/maximum wait between executions.
    pub cooldown: CooldownRange,
    /// Free-form parameters forwarded to the orchestrator.
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl Action {
    /// Create an action with no parameters.
    pub fn new(action_type: ActionType, max_executions: u32, cooldown: CooldownRange) -> Self {
        Self {
            action_type,
            max_executions,
            cooldown,
            parameters: BTreeMap::new(),
        }
    }

    /// Builder: add a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Authorship, versioning and experiment metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    /// When the policy document was authored.
    pub created_at: DateTime<Utc>,
    /// Author (person or system).
    pub created_by: String,
    /// Version string, dotted numeric (`1.2.0`).
    pub version: String,
    /// Version this one supersedes.
    #[serde(default)]
    pub previous_version: Option<String>,
    /// Free-form labels.
    #[serde(default)]
    pub tags: Vec<String>,
    /// A/B arm while under test.
    #[serde(default)]
    pub ab_test_group: Option<AbGroup>,
}

impl PolicyMetadata {
    /// Metadata for a fresh `1.0.0` policy.
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            created_at: Utc::now(),
            created_by: created_by.into(),
            version: "1.0.0".to_string(),
            previous_version: None,
            tags: Vec::new(),
            ab_test_group: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Result of matching a policy's conditions against a context.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionMatch {
    /// Conditions satisfied.
    pub met: usize,
    /// Conditions declared.
    pub total: usize,
    /// Weight of satisfied conditions over total weight (1.0 when none).
    pub weighted_fraction: f64,
    /// Display strings of unsatisfied conditions.
    pub unmet: Vec<String>,
}

impl ConditionMatch {
    /// Whether every condition held.
    pub fn all_met(&self) -> bool {
        self.met == self.total
    }
}

/// A versioned, auditable rule bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique identifier. Versioned ids end in `_v<N>`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Longer description for reviewers.
    #[serde(default)]
    pub description: String,
    /// Platform / granularity.
    pub scope: PolicyScope,
    /// Account states in which the policy may apply.
    pub applicable_states: BTreeSet<AccountState>,
    /// Ordered conditions; all must hold.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Authorized actions.
    pub actions: Vec<Action>,
    /// Signals that count as success.
    #[serde(default)]
    pub success_signals: Vec<SuccessSignal>,
    /// Conditions that abort execution.
    #[serde(default)]
    pub abort_conditions: Vec<AbortCondition>,
    /// Static confidence in [0, 1].
    pub confidence_weight: f64,
    /// Lifecycle status.
    pub status: PolicyStatus,
    /// Authorship and versioning.
    pub metadata: PolicyMetadata,
    /// Cap on executions per (policy, account).
    pub max_total_actions: u32,
    /// Minimum minutes between any two executions of this policy on an account.
    #[serde(default)]
    pub global_cooldown_minutes: u32,
    /// Hard expiry.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Maximum tolerated `current_risk_score`.
    pub risk_ceiling: f64,
    /// Maximum tolerated `current_aggressiveness`.
    pub aggressiveness_ceiling: f64,
    /// Approved actions need human sign-off.
    #[serde(default)]
    pub requires_supervisor_approval: bool,
    /// The orchestrator should simulate before executing.
    #[serde(default)]
    pub requires_simulation: bool,
}

impl Policy {
    /// Create a draft policy with permissive defaults; callers fill in
    /// conditions, actions and states through the builders.
    pub fn new(id: impl Into<String>, name: impl Into<String>, scope: PolicyScope) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            scope,
            applicable_states: BTreeSet::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
            success_signals: Vec::new(),
            abort_conditions: Vec::new(),
            confidence_weight: 0.5,
            status: PolicyStatus::Draft,
            metadata: PolicyMetadata::new("system"),
            max_total_actions: 10,
            global_cooldown_minutes: 0,
            expires_at: None,
            risk_ceiling: 1.0,
            aggressiveness_ceiling: 1.0,
            requires_supervisor_approval: false,
            requires_simulation: false,
        }
    }

    /// Builder: description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder: applicable account states.
    pub fn with_states(mut self, states: impl IntoIterator<Item = AccountState>) -> Self {
        self.applicable_states = states.into_iter().collect();
        self
    }

    /// Builder: append a condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Builder: append an action.
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Builder: success signals.
    pub fn with_success_signals(mut self, signals: impl IntoIterator<Item = SuccessSignal>) -> Self {
        self.success_signals = signals.into_iter().collect();
        self
    }

    /// Builder: abort conditions.
    pub fn with_abort_conditions(
        mut self,
        conditions: impl IntoIterator<Item = AbortCondition>,
    ) -> Self {
        self.abort_conditions = conditions.into_iter().collect();
        self
    }

    /// Builder: confidence weight.
    pub fn with_confidence(mut self, confidence_weight: f64) -> Self {
        self.confidence_weight = confidence_weight;
        self
    }

    /// Builder: status.
    pub fn with_status(mut self, status: PolicyStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder: version string.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.metadata.version = version.into();
        self
    }

    /// Builder: risk and aggressiveness ceilings.
    pub fn with_ceilings(mut self, risk: f64, aggressiveness: f64) -> Self {
        self.risk_ceiling = risk;
        self.aggressiveness_ceiling = aggressiveness;
        self
    }

    /// Builder: execution limits.
    pub fn with_limits(mut self, max_total_actions: u32, global_cooldown_minutes: u32) -> Self {
        self.max_total_actions = max_total_actions;
        self.global_cooldown_minutes = global_cooldown_minutes;
        self
    }

    /// Builder: expiry.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Builder: supervisor approval requirement.
    pub fn with_supervisor_approval(mut self, required: bool) -> Self {
        self.requires_supervisor_approval = required;
        self
    }

    /// Builder: simulation requirement.
    pub fn with_simulation(mut self, required: bool) -> Self {
        self.requires_simulation = required;
        self
    }

    /// Builder: tags.
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.metadata.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Family identifier: `id` without a trailing `_v<N>` suffix.
    pub fn base_id(&self) -> &str {
        base_id_of(&self.id)
    }

    /// Look up the declared action of a given type.
    pub fn action(&self, action_type: ActionType) -> Option<&Action> {
        self.actions.iter().find(|a| a.action_type == action_type)
    }

    /// Whether the policy has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Status is live and the policy has not expired.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_live() && !self.is_expired_at(now)
    }

    /// Account state check. Absent state passes; unknown or excluded fails.
    pub fn state_matches(&self, ctx: &DecisionContext) -> bool {
        match ctx.account_state() {
            None => !ctx.contains(keys::ACCOUNT_STATE),
            Some(raw) => AccountState::parse(raw).is_some_and(|s| self.applicable_states.contains(&s)),
        }
    }

    /// Evaluate every condition and report the weighted match.
    pub fn match_conditions(&self, ctx: &DecisionContext) -> ConditionMatch {
        let total = self.conditions.len();
        if total == 0 {
            return ConditionMatch {
                met: 0,
                total: 0,
                weighted_fraction: 1.0,
                unmet: Vec::new(),
            };
        }
        let mut met = 0usize;
        let mut met_weight = 0.0;
        let mut total_weight = 0.0;
        let mut unmet = Vec::new();
        for condition in &self.conditions {
            total_weight += condition.weight;
            if condition.evaluate(ctx) {
                met += 1;
                met_weight += condition.weight;
            } else {
                unmet.push(condition.to_string());
            }
        }
        let weighted_fraction = if total_weight > 0.0 {
            met_weight / total_weight
        } else {
            met as f64 / total as f64
        };
        ConditionMatch {
            met,
            total,
            weighted_fraction,
            unmet,
        }
    }

    /// Whether the policy applies to the context right now.
    pub fn is_applicable(&self, ctx: &DecisionContext) -> bool {
        self.is_applicable_at(ctx, Utc::now())
    }

    /// Whether the policy applies to the context at `now`.
    pub fn is_applicable_at(&self, ctx: &DecisionContext, now: DateTime<Utc>) -> bool {
        self.is_live_at(now)
            && self.state_matches(ctx)
            && self.conditions.iter().all(|c| c.evaluate(ctx))
    }

    /// Applicability score in [0, 1] right now.
    pub fn calculate_applicability_score(&self, ctx: &DecisionContext) -> f64 {
        self.calculate_applicability_score_at(ctx, Utc::now())
    }

    /// Applicability score in [0, 1] at `now`.
    ///
    /// `0.7 * confidence + 0.3 * weighted condition match`, then penalized
    /// by 0.8 when risk exceeds 80% of the risk ceiling and by 0.7 when
    /// aggressiveness exceeds 80% of the aggressiveness ceiling.
    pub fn calculate_applicability_score_at(&self, ctx: &DecisionContext, now: DateTime<Utc>) -> f64 {
        if !self.is_applicable_at(ctx, now) {
            return 0.0;
        }
        let matched = self.match_conditions(ctx);
        let mut score =
            CONFIDENCE_SHARE * self.confidence_weight + CONDITION_SHARE * matched.weighted_fraction;
        if ctx
            .risk_score()
            .is_some_and(|r| r > CEILING_PROXIMITY * self.risk_ceiling)
        {
            score *= RISK_PROXIMITY_PENALTY;
        }
        if ctx
            .aggressiveness()
            .is_some_and(|a| a > CEILING_PROXIMITY * self.aggressiveness_ceiling)
        {
            score *= AGGRESSIVENESS_PROXIMITY_PENALTY;
        }
        score.clamp(0.0, 1.0)
    }

    /// Check structural constraints. Called by the registry before storage.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyField("id"));
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("name"));
        }
        if self.metadata.version.trim().is_empty() {
            return Err(ValidationError::EmptyField("metadata.version"));
        }
        if self.applicable_states.is_empty() {
            return Err(ValidationError::EmptyField("applicable_states"));
        }
        unit_range("confidence_weight", self.confidence_weight)?;
        unit_range("risk_ceiling", self.risk_ceiling)?;
        unit_range("aggressiveness_ceiling", self.aggressiveness_ceiling)?;
        if self.max_total_actions == 0 {
            return Err(ValidationError::NonPositive {
                field: "max_total_actions".to_string(),
            });
        }
        for (i, condition) in self.conditions.iter().enumerate() {
            if condition.field.trim().is_empty() {
                return Err(ValidationError::EmptyField("conditions.field"));
            }
            if !condition.weight.is_finite() || condition.weight < 0.0 {
                return Err(ValidationError::OutOfRange {
                    field: format!("conditions[{i}].weight"),
                    value: condition.weight,
                    min: 0.0,
                    max: f64::MAX,
                });
            }
        }
        if self.actions.is_empty() {
            return Err(ValidationError::NoActions);
        }
        for (i, action) in self.actions.iter().enumerate() {
            if action.max_executions == 0 {
                return Err(ValidationError::NonPositive {
                    field: format!("actions[{i}].max_executions"),
                });
            }
            if action.cooldown.min_minutes > action.cooldown.max_minutes {
                return Err(ValidationError::InvalidCooldown {
                    min: action.cooldown.min_minutes,
                    max: action.cooldown.max_minutes,
                });
            }
        }
        Ok(())
    }

    /// Digest of the policy content.
    ///
    /// Status and A/B group are operational state, not content, and are
    /// excluded so lifecycle transitions do not change the digest.
    pub fn content_digest(&self) -> Result<ContentDigest, serde_json::Error> {
        let mut content = self.clone();
        content.status = PolicyStatus::Draft;
        content.metadata.ab_test_group = None;
        sha256_json(&content)
    }
}

fn unit_range(field: &str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field: field.to_string(),
            value,
            min: 0.0,
            max: 1.0,
        })
    }
}

/// Strip a trailing `_v<digits>` suffix.
pub fn base_id_of(id: &str) -> &str {
    if let Some(pos) = id.rfind("_v") {
        let suffix = &id[pos + 2..];
        if pos > 0 && !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
            return &id[..pos];
        }
    }
    id
}

/// Order two version strings by dotted numeric components.
///
/// A leading `v` is ignored. Missing components count as zero, so `1.2`
/// equals `1.2.0`. If either side has a non-numeric component the strings
/// are compared lexicographically.
pub fn compare_version_strings(a: &str, b: &str) -> Ordering {
    fn parts(v: &str) -> Option<Vec<u64>> {
        v.trim()
            .trim_start_matches(['v', 'V'])
            .split('.')
            .map(|p| p.parse::<u64>().ok())
            .collect()
    }
    match (parts(a), parts(b)) {
        (Some(pa), Some(pb)) => {
            let len = pa.len().max(pb.len());
            for i in 0..len {
                let x = pa.get(i).copied().unwrap_or(0);
                let y = pb.get(i).copied().unwrap_or(0);
                match x.cmp(&y) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            Ordering::Equal
        }
        _ => a.cmp(b),
    }
}
