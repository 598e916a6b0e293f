//! # Error Hierarchy
//!
//! Structured error types for the decision policy engine, built with
//! `thiserror`.
//!
//! Only two families of failure propagate to callers: malformed policies
//! rejected at registration ([`ValidationError`]) and unreachable or corrupt
//! storage ([`StorageError`]). Condition misses and guard blocks are folded
//! into decision data by the components that produce them.

use thiserror::Error;

/// Top-level error type for the engine.
#[derive(Error, Debug)]
pub enum DpeError {
    /// A policy failed validation and was not stored.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The registry or outcome store could not complete a read or write.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A lifecycle transition is not permitted from the current status.
    #[error("state transition error: {0}")]
    StateTransition(#[from] StateTransitionError),

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What kind of record was looked up (policy, ab test, ...).
        kind: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// An A/B test operation was malformed (same policy twice, unknown group).
    #[error("A/B test error: {0}")]
    AbTest(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DpeError {
    /// Shorthand for a missing policy.
    pub fn policy_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "policy",
            id: id.into(),
        }
    }
}

/// Reasons a policy is rejected at registration.
///
/// Each variant carries the offending value and the accepted range so that
/// policy authors can fix the document without reading engine code.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A required string field is empty.
    #[error("field `{0}` must be non-empty")]
    EmptyField(&'static str),

    /// The (id, version) pair is already registered.
    #[error("policy {id} version {version} is already registered; new behavior requires a new version")]
    DuplicatePolicy {
        /// Policy identifier.
        id: String,
        /// Policy version.
        version: String,
    },

    /// A numeric field lies outside its permitted range.
    #[error("field `{field}` = {value} is outside [{min}, {max}]")]
    OutOfRange {
        /// Field name (dotted path for nested fields).
        field: String,
        /// The rejected value.
        value: f64,
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
    },

    /// A limit that must be strictly positive is zero.
    #[error("field `{field}` must be greater than zero")]
    NonPositive {
        /// Field name (dotted path for nested fields).
        field: String,
    },

    /// A cooldown range has its bounds inverted.
    #[error("cooldown range [{min}, {max}] minutes is inverted")]
    InvalidCooldown {
        /// Lower bound in minutes.
        min: u32,
        /// Upper bound in minutes.
        max: u32,
    },

    /// A policy authorizes no actions.
    #[error("policy declares no actions")]
    NoActions,

    /// A published version does not supersede the latest registered one.
    #[error("version {version} of {base_id} does not supersede latest version {latest}")]
    StaleVersion {
        /// Family identifier.
        base_id: String,
        /// The rejected version.
        version: String,
        /// The latest registered version.
        latest: String,
    },
}

/// Failures of the storage port.
///
/// Reads fall back to the last-known-good in-memory cache; writes surface
/// these errors to the caller and are never silently dropped.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The backing store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Filesystem failure in a directory-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored document could not be decoded.
    #[error("corrupt record at {key}: {reason}")]
    Corrupt {
        /// Storage key of the record.
        key: String,
        /// Why decoding failed.
        reason: String,
    },

    /// A value could not be encoded for storage.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The key contains characters outside the permitted alphabet.
    #[error("invalid storage key \"{0}\"")]
    InvalidKey(String),
}

/// Errors during policy lifecycle transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    /// The attempted transition is not valid from the current status.
    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        /// The current status name.
        from: String,
        /// The attempted target status name.
        to: String,
        /// Human-readable reason for the rejection.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_duplicate_display() {
        let err = ValidationError::DuplicatePolicy {
            id: "breakout_push".to_string(),
            version: "1.0.0".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("breakout_push"));
        assert!(msg.contains("1.0.0"));
        assert!(msg.contains("new version"));
    }

    #[test]
    fn validation_error_out_of_range_display() {
        let err = ValidationError::OutOfRange {
            field: "confidence_weight".to_string(),
            value: 1.5,
            min: 0.0,
            max: 1.0,
        };
        let msg = format!("{err}");
        assert!(msg.contains("confidence_weight"));
        assert!(msg.contains("1.5"));
    }

    #[test]
    fn dpe_error_wraps_validation() {
        let err: DpeError = ValidationError::EmptyField("id").into();
        assert!(format!("{err}").contains("validation error"));
        assert!(format!("{err}").contains("`id`"));
    }

    #[test]
    fn dpe_error_wraps_storage() {
        let err: DpeError = StorageError::Unavailable("disk detached".to_string()).into();
        let msg = format!("{err}");
        assert!(msg.contains("storage error"));
        assert!(msg.contains("disk detached"));
    }

    #[test]
    fn not_found_names_kind_and_id() {
        let err = DpeError::policy_not_found("ghost");
        assert_eq!(format!("{err}"), "policy not found: ghost");
    }

    #[test]
    fn state_transition_display() {
        let err = StateTransitionError::InvalidTransition {
            from: "active".to_string(),
            to: "active".to_string(),
            reason: "enable is only valid from disabled".to_string(),
        };
        assert!(format!("{err}").contains("only valid from disabled"));
    }

    #[test]
    fn storage_corrupt_display() {
        let err = StorageError::Corrupt {
            key: "policies/x".to_string(),
            reason: "truncated".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("policies/x"));
        assert!(msg.contains("truncated"));
    }
}
