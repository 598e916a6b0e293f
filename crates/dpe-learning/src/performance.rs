//! # Policy Performance
//!
//! A pure fold over a policy's outcomes.
//!
//! ## Rating (first match wins)
//!
//! | Rating | Rule |
//! |---|---|
//! | TOXIC | success_rate < 0.2, or avg_risk_delta > 0.3, or avg_engagement_change < -0.3 |
//! | EXCELLENT | success_rate > 0.8 and avg_velocity_lift > 0.1 and avg_risk_delta < 0 |
//! | GOOD | success_rate > 0.6 and avg_velocity_lift > 0 |
//! | ACCEPTABLE | success_rate > 0.4 |
//! | POOR | otherwise |
//!
//! Velocity lift and engagement change are averaged over successful outcomes
//! only; risk delta over all outcomes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dpe_core::LearningConfig;
use dpe_policy::SuccessSignal;
use serde::{Deserialize, Serialize};

use crate::outcome::PolicyOutcome;

/// Rule-based performance class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PerformanceRating {
    /// Harmful; near-excluded from selection.
    Toxic,
    /// Below expectations.
    Poor,
    /// Neutral.
    Acceptable,
    /// Above expectations.
    Good,
    /// Consistently strong with falling risk.
    Excellent,
}

impl PerformanceRating {
    /// Classify aggregate statistics.
    pub fn classify(
        success_rate: f64,
        avg_velocity_lift: f64,
        avg_risk_delta: f64,
        avg_engagement_change: f64,
    ) -> Self {
        if success_rate < 0.2 || avg_risk_delta > 0.3 || avg_engagement_change < -0.3 {
            Self::Toxic
        } else if success_rate > 0.8 && avg_velocity_lift > 0.1 && avg_risk_delta < 0.0 {
            Self::Excellent
        } else if success_rate > 0.6 && avg_velocity_lift > 0.0 {
            Self::Good
        } else if success_rate > 0.4 {
            Self::Acceptable
        } else {
            Self::Poor
        }
    }

    /// Confidence multiplier for this rating.
    pub fn multiplier(&self, success_rate: f64, avg_velocity_lift: f64) -> f64 {
        match self {
            Self::Excellent => 1.3 + avg_velocity_lift.min(0.2),
            Self::Good => 1.1 + (success_rate - 0.6) * 0.5,
            Self::Acceptable => 1.0,
            Self::Poor => 0.8 - (0.4 - success_rate) * 0.5,
            Self::Toxic => 0.5,
        }
    }

    /// Return the string value for serialization.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Toxic => "TOXIC",
            Self::Poor => "POOR",
            Self::Acceptable => "ACCEPTABLE",
            Self::Good => "GOOD",
            Self::Excellent => "EXCELLENT",
        }
    }
}

impl std::fmt::Display for PerformanceRating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of recent success rate against the window before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTrend {
    /// Recent window beats the prior one by more than the threshold.
    Improving,
    /// Recent window trails the prior one by more than the threshold.
    Declining,
    /// Within the threshold.
    Stable,
    /// Not enough outcomes for two windows.
    InsufficientData,
}

impl PolicyTrend {
    /// Label the trend of a chronologically ordered outcome list.
    ///
    /// The most recent `window` outcomes are compared with up to `window`
    /// outcomes before them.
    pub fn from_outcomes(outcomes: &[PolicyOutcome], window: usize, delta: f64) -> Self {
        if window == 0 || outcomes.len() < window {
            return Self::InsufficientData;
        }
        let split = outcomes.len() - window;
        let recent = &outcomes[split..];
        let prior = &outcomes[split.saturating_sub(window)..split];
        if prior.is_empty() {
            return Self::InsufficientData;
        }
        let change = success_rate(recent) - success_rate(prior);
        if change > delta {
            Self::Improving
        } else if change < -delta {
            Self::Declining
        } else {
            Self::Stable
        }
    }
}

fn success_rate(outcomes: &[PolicyOutcome]) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    outcomes.iter().filter(|o| o.success).count() as f64 / outcomes.len() as f64
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Derived aggregate over one policy's outcomes. Cache only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyPerformance {
    /// Policy summarized.
    pub policy_id: String,
    /// Outcomes folded.
    pub total_outcomes: usize,
    /// Successful outcomes.
    pub successes: usize,
    /// `successes / total_outcomes`.
    pub success_rate: f64,
    /// Mean velocity lift over successful outcomes.
    pub avg_velocity_lift: f64,
    /// Mean risk delta over all outcomes.
    pub avg_risk_delta: f64,
    /// Mean engagement change over successful outcomes.
    pub avg_engagement_change: f64,
    /// Rule-based class.
    pub rating: PerformanceRating,
    /// Multiplier applied to the static confidence weight.
    pub confidence_multiplier: f64,
    /// How often each success signal was observed.
    pub signal_counts: BTreeMap<SuccessSignal, usize>,
    /// Aborted executions among the outcomes.
    pub aborted: usize,
    /// Most recent outcome time.
    pub last_outcome_at: Option<DateTime<Utc>>,
    /// Recent-vs-prior success direction.
    pub trend: PolicyTrend,
}

impl PolicyPerformance {
    /// Fold a chronologically ordered, non-empty outcome list.
    ///
    /// Returns `None` for an empty list: a policy without outcomes has no
    /// performance and keeps a multiplier of 1.0.
    pub fn from_outcomes(
        policy_id: &str,
        outcomes: &[PolicyOutcome],
        config: &LearningConfig,
    ) -> Option<Self> {
        if outcomes.is_empty() {
            return None;
        }
        let total = outcomes.len();
        let successes = outcomes.iter().filter(|o| o.success).count();
        let success_rate = successes as f64 / total as f64;
        let successful = || outcomes.iter().filter(|o| o.success);
        let avg_velocity_lift = mean(successful().map(|o| o.metrics.velocity_lift));
        let avg_engagement_change = mean(successful().map(|o| o.metrics.engagement_change));
        let avg_risk_delta = mean(outcomes.iter().map(|o| o.metrics.risk_delta));

        let rating = PerformanceRating::classify(
            success_rate,
            avg_velocity_lift,
            avg_risk_delta,
            avg_engagement_change,
        );
        let mut signal_counts = BTreeMap::new();
        for signal in outcomes.iter().flat_map(|o| o.signals_achieved.iter()) {
            *signal_counts.entry(*signal).or_insert(0) += 1;
        }

        Some(Self {
            policy_id: policy_id.to_string(),
            total_outcomes: total,
            successes,
            success_rate,
            avg_velocity_lift,
            avg_risk_delta,
            avg_engagement_change,
            rating,
            confidence_multiplier: rating.multiplier(success_rate, avg_velocity_lift),
            signal_counts,
            aborted: outcomes.iter().filter(|o| o.abort_reason.is_some()).count(),
            last_outcome_at: outcomes.iter().map(|o| o.timestamp).max(),
            trend: PolicyTrend::from_outcomes(outcomes, config.trend_window, config.trend_delta),
        })
    }

    /// Whether the policy is rated toxic.
    pub fn is_toxic(&self) -> bool {
        self.rating == PerformanceRating::Toxic
    }

    /// Most frequently observed success signal (ties resolve to the first
    /// in declaration order).
    pub fn dominant_signal(&self) -> Option<SuccessSignal> {
        self.signal_counts
            .iter()
            .fold(None, |best: Option<(SuccessSignal, usize)>, (signal, count)| match best {
                Some((_, best_count)) if best_count >= *count => best,
                _ => Some((*signal, *count)),
            })
            .map(|(signal, _)| signal)
    }
}
