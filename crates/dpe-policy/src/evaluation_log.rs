//! # Evaluation Log
//!
//! Bounded, append-only record of every context evaluation and abstention.
//! Used for introspection (`recent_evaluations`, `abstention_rate`), not as
//! durable storage. When the log exceeds its capacity the oldest 10% of
//! records are trimmed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::evaluator::AbstainReason;

/// One evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    /// When the evaluation ran.
    pub timestamp: DateTime<Utc>,
    /// Contract keys of the evaluated context.
    pub context: serde_json::Value,
    /// Number of policies at or above the score threshold.
    pub result_count: usize,
    /// Best score, if any policy qualified.
    pub top_score: Option<f64>,
    /// Id of the best-scoring policy.
    pub top_policy: Option<String>,
    /// Whether this pass ended in abstention.
    pub abstained: bool,
    /// Why, when it did.
    #[serde(default)]
    pub reasons: Vec<AbstainReason>,
}

/// Capacity-bounded evaluation history.
pub struct EvaluationLog {
    records: Vec<EvaluationRecord>,
    max_records: usize,
}

impl EvaluationLog {
    /// Create a log holding at most `max_records` records.
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Vec::new(),
            max_records: max_records.max(1),
        }
    }

    /// Append a record, trimming the oldest 10% when over capacity.
    pub fn append(&mut self, record: EvaluationRecord) {
        self.records.push(record);
        if self.records.len() > self.max_records {
            let trim_count = (self.max_records / 10).max(1);
            self.records.drain(..trim_count);
        }
    }

    /// All retained records, oldest first.
    pub fn records(&self) -> &[EvaluationRecord] {
        &self.records
    }

    /// The last `n` records (or all, if fewer).
    pub fn last_n(&self, n: usize) -> &[EvaluationRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record has been retained.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Fraction of retained records that abstained; 0.0 when empty.
    pub fn abstention_rate(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        let abstained = self.records.iter().filter(|r| r.abstained).count();
        abstained as f64 / self.records.len() as f64
    }
}

impl Default for EvaluationLog {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl std::fmt::Debug for EvaluationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationLog")
            .field("records", &self.records.len())
            .field("max_records", &self.max_records)
            .finish()
    }
}
