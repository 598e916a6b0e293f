//! # dpe-policy — Policies, Registry and Evaluator
//!
//! The policy side of the decision policy engine.
//!
//! ## Capabilities
//!
//! - **Policy model** with weighted conditions, bounded actions, success
//!   signals and abort conditions, plus a fail-closed applicability score.
//!
//! - **5 standard policies** covering breakout pushes, cold-start warmup,
//!   viral momentum, engagement recovery and steady follower growth.
//!
//! - **Versioned registry** persisted through a [`dpe_core::KeyValueStore`],
//!   with lifecycle transitions, a lifecycle log, content digests and A/B
//!   tests.
//!
//! - **Evaluator** that applies the system-wide abstention circuit breaker,
//!   scores live policies against a context and keeps a bounded evaluation
//!   log for introspection.

pub mod catalog;
pub mod evaluation_log;
pub mod evaluator;
pub mod model;
pub mod registry;

// Re-export primary types.
pub use catalog::standard_policies;
pub use evaluation_log::{EvaluationLog, EvaluationRecord};
pub use evaluator::{AbstainReason, AbstentionDecision, PolicyEvaluation, PolicyEvaluator};
pub use model::{
    AbGroup, AbortCondition, AccountState, Action, ActionType, Condition, CooldownRange, Operator,
    Policy, PolicyMetadata, PolicyScope, PolicyStatus, SuccessSignal,
};
pub use registry::{AbTest, FieldChange, LifecycleRecord, PolicyRegistry, VersionDiff};
