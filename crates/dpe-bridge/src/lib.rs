//! # dpe-bridge — Orchestrator Bridge
//!
//! One request/response protocol over the decision policy engine.
//!
//! The orchestrator sends an [`ActionRequest`] carrying a flat decision
//! context and receives an [`ActionResponse`] with a terminal
//! [`ActionDecision`]. After executing an approved action it must report
//! back through [`OrchestratorBridge::log_outcome`] (or
//! [`OrchestratorBridge::abort_execution`]) so that cooldowns, execution
//! limits and learned confidence stay current.
//!
//! ## Contract With the Caller
//!
//! - Never execute an action that is not in `approved_actions`.
//! - Gate `REQUIRES_REVIEW` behind a human.
//! - Report every execution.
//!
//! ## Concurrency
//!
//! Decisions never mutate guard counters or the outcome log. Both are
//! behind a single writer lock each, so concurrent reports for the same
//! (policy, account) never double-count.

pub mod bridge;
pub mod request;
pub mod status;

pub use bridge::OrchestratorBridge;
pub use request::{ActionDecision, ActionRequest, ActionResponse};
pub use status::{AbTestReport, SystemStatus};
