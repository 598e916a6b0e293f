//! # dpe-learning — Learning Feedback
//!
//! Adapts policy confidence from historical outcomes.
//!
//! Outcomes are append-only facts and the only source of truth.
//! [`PolicyPerformance`] is a pure fold over a policy's outcomes: it can be
//! discarded at any time and rebuilt by replaying the outcome log
//! ([`LearningFeedback::rebuild_from_store`]). Ratings are rule-based, so
//! every ranking change is explainable from the log alone.

pub mod feedback;
pub mod outcome;
pub mod performance;

pub use feedback::LearningFeedback;
pub use outcome::{OutcomeMetrics, PolicyOutcome};
pub use performance::{PerformanceRating, PolicyPerformance, PolicyTrend};
