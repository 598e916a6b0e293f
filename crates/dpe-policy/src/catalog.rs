//! # Standard Policy Catalog
//!
//! Five ready-made policies covering the common growth situations. They are
//! registered `active` at version `1.0.0` and serve as the default policy
//! set for a fresh engine.

use std::collections::BTreeMap;

use serde_json::json;

use crate::model::{
    AbortCondition, AccountState, Action, ActionType, Condition, CooldownRange, Operator, Policy,
    PolicyScope, PolicyStatus, SuccessSignal,
};

/// Return the standard policies keyed by policy id.
pub fn standard_policies() -> BTreeMap<String, Policy> {
    [
        breakout_comment_push(),
        cold_start_warmup(),
        viral_momentum_boost(),
        engagement_recovery(),
        steady_follower_growth(),
    ]
    .into_iter()
    .map(|p| (p.id.clone(), p))
    .collect()
}

/// Seed comments on a video that is a handful of comments away from
/// breaking out and already retains viewers above baseline.
fn breakout_comment_push() -> Policy {
    Policy::new(
        "breakout_comment_push_v1",
        "Breakout comment push",
        PolicyScope::TiktokVideo,
    )
    .with_description("Push a near-breakout video over the comment threshold")
    .with_states([AccountState::Growing, AccountState::Breakout, AccountState::Stable])
    .with_condition(Condition::new("comments_to_breakout", Operator::Lte, 5).with_weight(1.5))
    .with_condition(Condition::new("retention_ratio", Operator::Gt, 1.1).with_weight(1.2))
    .with_action(
        Action::new(ActionType::Comment, 3, CooldownRange::new(15, 45))
            .with_parameter("style", json!("question")),
    )
    .with_action(Action::new(ActionType::Reply, 5, CooldownRange::new(10, 30)))
    .with_success_signals([SuccessSignal::CommentGrowth, SuccessSignal::BreakoutAchieved])
    .with_abort_conditions([
        AbortCondition::RiskSpike,
        AbortCondition::ShadowbanDetected,
        AbortCondition::SupervisorOverride,
    ])
    .with_confidence(0.82)
    .with_ceilings(0.6, 0.7)
    .with_limits(8, 10)
    .with_status(PolicyStatus::Active)
    .with_tags(["breakout", "comments"])
}

/// Low-volume organic activity for new accounts.
fn cold_start_warmup() -> Policy {
    Policy::new("cold_start_warmup_v1", "Cold-start warmup", PolicyScope::CrossPlatform)
        .with_description("Build trust signals on a new account with slow, varied activity")
        .with_states([AccountState::ColdStart, AccountState::Warming])
        .with_condition(Condition::new("account_age_days", Operator::Lt, 14))
        .with_condition(Condition::new("posts_published", Operator::Lte, 10).with_weight(0.5))
        .with_action(Action::new(ActionType::Like, 20, CooldownRange::new(5, 20)))
        .with_action(Action::new(ActionType::Follow, 10, CooldownRange::new(30, 90)))
        .with_action(Action::new(ActionType::Post, 1, CooldownRange::new(720, 1440)))
        .with_success_signals([SuccessSignal::FollowerGrowth, SuccessSignal::ReachExpansion])
        .with_abort_conditions([
            AbortCondition::AccountFlagged,
            AbortCondition::ShadowbanDetected,
            AbortCondition::AggressivenessSpike,
        ])
        .with_confidence(0.7)
        .with_ceilings(0.4, 0.4)
        .with_limits(25, 5)
        .with_status(PolicyStatus::Active)
        .with_tags(["warmup"])
}

/// Amplify a video that is already in viral distribution.
fn viral_momentum_boost() -> Policy {
    Policy::new(
        "viral_momentum_boost_v1",
        "Viral momentum boost",
        PolicyScope::TiktokVideo,
    )
    .with_description("Add paid boost and a pinned comment while velocity is high")
    .with_states([AccountState::Viral, AccountState::Breakout])
    .with_condition(Condition::new("velocity_percentile", Operator::Gte, 0.9).with_weight(2.0))
    .with_condition(Condition::new("content_flagged", Operator::Eq, false))
    .with_action(
        Action::new(ActionType::Boost, 1, CooldownRange::new(240, 480))
            .with_parameter("budget_tier", json!("medium")),
    )
    .with_action(Action::new(ActionType::Pin, 1, CooldownRange::new(60, 120)))
    .with_success_signals([SuccessSignal::VelocityIncrease, SuccessSignal::ReachExpansion])
    .with_abort_conditions([
        AbortCondition::RiskSpike,
        AbortCondition::ReachCollapse,
        AbortCondition::ManualAbort,
    ])
    .with_confidence(0.75)
    .with_ceilings(0.5, 0.6)
    .with_limits(2, 60)
    .with_supervisor_approval(true)
    .with_simulation(true)
    .with_status(PolicyStatus::Active)
    .with_tags(["viral", "paid"])
}

/// Conservative reply-driven recovery after an engagement slump.
fn engagement_recovery() -> Policy {
    Policy::new(
        "engagement_recovery_v1",
        "Engagement recovery",
        PolicyScope::CrossPlatform,
    )
    .with_description("Re-engage the existing audience after a sustained drop")
    .with_states([AccountState::Declining, AccountState::Recovering])
    .with_condition(Condition::new("engagement_rate_change", Operator::Lt, -0.15))
    .with_condition(Condition::new("days_since_last_post", Operator::Lte, 7).with_weight(0.5))
    .with_action(Action::new(ActionType::Reply, 10, CooldownRange::new(20, 60)))
    .with_action(Action::new(ActionType::Post, 1, CooldownRange::new(1440, 2880)))
    .with_success_signals([SuccessSignal::EngagementLift, SuccessSignal::RetentionImprovement])
    .with_abort_conditions([
        AbortCondition::EngagementDrop,
        AbortCondition::ShadowbanDetected,
        AbortCondition::AccountFlagged,
    ])
    .with_confidence(0.6)
    .with_ceilings(0.5, 0.5)
    .with_limits(12, 15)
    .with_status(PolicyStatus::Active)
    .with_tags(["recovery"])
}

/// Follow-back and share cadence for stable, growing channels.
fn steady_follower_growth() -> Policy {
    Policy::new(
        "steady_follower_growth_v1",
        "Steady follower growth",
        PolicyScope::InstagramAccount,
    )
    .with_description("Grow followers through reciprocal engagement in the account's niche")
    .with_states([AccountState::Stable, AccountState::Growing])
    .with_condition(Condition::new("follower_growth_7d", Operator::Gte, 0.0))
    .with_condition(
        Condition::new("niche", Operator::NotIn, vec!["politics", "gambling"]).with_weight(0.5),
    )
    .with_action(Action::new(ActionType::Follow, 15, CooldownRange::new(20, 60)))
    .with_action(Action::new(ActionType::Share, 3, CooldownRange::new(120, 240)))
    .with_success_signals([SuccessSignal::FollowerGrowth, SuccessSignal::EngagementLift])
    .with_abort_conditions([
        AbortCondition::AggressivenessSpike,
        AbortCondition::AccountFlagged,
        AbortCondition::SupervisorOverride,
    ])
    .with_confidence(0.65)
    .with_ceilings(0.5, 0.6)
    .with_limits(20, 10)
    .with_status(PolicyStatus::Active)
    .with_tags(["growth", "followers"])
}
