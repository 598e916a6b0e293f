//! # dpe-guard — Execution Guard
//!
//! Pre-execution safety checks that run independently of policy scoring.
//!
//! Every validation runs all ten checks and reports every failure, so a
//! caller always receives the complete diagnostic. Validation is read-only;
//! guard state advances only through [`ExecutionGuard::record_execution`],
//! which the caller invokes after an approved action has actually run.

pub mod checks;
pub mod guard;

pub use checks::{BlockCode, CheckResult, GuardBlock, GuardCheck, GuardResult};
pub use guard::{ExecutionGuard, ExecutionStats, GuardStatus};
