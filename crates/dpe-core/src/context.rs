//! # Decision Context
//!
//! The flat key/value map a caller supplies with every decision request.
//!
//! Keys in [`keys`] are part of the external contract; any other key is a
//! policy-specific condition field. Values are a closed sum type
//! ([`ContextValue`]) so that comparison code is an exhaustive `match`
//! rather than runtime type inspection.
//!
//! ## Fail-Closed Semantics
//!
//! Every accessor returns `Option`. A key that is absent, `null` in the
//! source JSON, or of the wrong type yields `None`, and callers treat `None`
//! as "condition not satisfied". No accessor panics or errors on malformed
//! input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Context keys with engine-defined meaning.
pub mod keys {
    /// Account lifecycle state (string enum).
    pub const ACCOUNT_STATE: &str = "account_state";
    /// Current risk score in [0, 1].
    pub const CURRENT_RISK_SCORE: &str = "current_risk_score";
    /// Current aggressiveness in [0, 1].
    pub const CURRENT_AGGRESSIVENESS: &str = "current_aggressiveness";
    /// Systemic emergency flag.
    pub const EMERGENCY_FLAG: &str = "emergency_flag";
    /// Shadowban detector output.
    pub const SHADOWBAN_DETECTED: &str = "shadowban_detected";
    /// Engagement-drop detector output.
    pub const ENGAGEMENT_DROP_DETECTED: &str = "engagement_drop_detected";
    /// Reach-collapse detector output.
    pub const REACH_COLLAPSE_DETECTED: &str = "reach_collapse_detected";
    /// Platform flagged the account.
    pub const ACCOUNT_FLAGGED: &str = "account_flagged";
    /// Supervisor instructs the engine to block every action.
    pub const SUPERVISOR_BLOCK_ALL: &str = "supervisor_flags.block_all_actions";
    /// Supervisor override of automated behavior.
    pub const SUPERVISOR_OVERRIDE: &str = "supervisor_flags.override";
    /// Operator-initiated abort.
    pub const MANUAL_ABORT: &str = "manual_abort";
    /// Account the action would run on.
    pub const ACCOUNT_ID: &str = "account_id";
    /// Platform name.
    pub const PLATFORM: &str = "platform";
    /// Content item the action concerns.
    pub const CONTENT_ID: &str = "content_id";
}

// ---------------------------------------------------------------------------
// ContextValue
// ---------------------------------------------------------------------------

/// A single context value.
///
/// Serialized untagged, so `{"x": 1.5, "y": "a", "z": true, "w": [1, 2]}`
/// deserializes without wrappers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    /// Boolean flag.
    Bool(bool),
    /// Numeric value. Integers are widened to `f64`.
    Number(f64),
    /// Free-form string.
    Text(String),
    /// Homogeneous or mixed list (used by `in` / `not_in`).
    List(Vec<ContextValue>),
}

impl ContextValue {
    /// Coerce to a finite float.
    ///
    /// Numbers pass through; strings are parsed after trimming. Booleans and
    /// lists do not coerce. Non-finite results are rejected.
    pub fn as_number(&self) -> Option<f64> {
        let n = match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.trim().parse::<f64>().ok()?,
            Self::Bool(_) | Self::List(_) => return None,
        };
        n.is_finite().then_some(n)
    }

    /// Interpret as a boolean flag.
    ///
    /// `true`, non-zero numbers and the strings `true`/`yes`/`1` are set;
    /// everything else is unset.
    pub fn as_flag(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && n.is_finite(),
            Self::Text(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
            Self::List(_) => false,
        }
    }

    /// Borrow as a string, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as a list, if this is a list value.
    pub fn as_list(&self) -> Option<&[ContextValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Equality used by `==`, `!=`, `in` and `not_in`.
    ///
    /// Two values that both coerce to numbers compare numerically, so
    /// `"3"` equals `3.0`. Otherwise the variants must agree, with the one
    /// exception that a string compares case-insensitively against a bool.
    pub fn loosely_equals(&self, other: &ContextValue) -> bool {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return (a - b).abs() <= 1e-9;
        }
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Text(s), Self::Bool(b)) | (Self::Bool(b), Self::Text(s)) => {
                s.trim().eq_ignore_ascii_case(if *b { "true" } else { "false" })
            }
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loosely_equals(y))
            }
            _ => false,
        }
    }

    /// Convert a JSON value. `null` and objects have no representation.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null | Value::Object(_) => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Array(items) => Some(Self::List(
                items.iter().filter_map(Self::from_json).collect(),
            )),
        }
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<i32> for ContextValue {
    fn from(v: i32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<u32> for ContextValue {
    fn from(v: u32) -> Self {
        Self::Number(f64::from(v))
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<ContextValue>> From<Vec<T>> for ContextValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Display for ContextValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "\"{s}\""),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DecisionContext
// ---------------------------------------------------------------------------

/// Caller-supplied decision context.
///
/// Backed by a `BTreeMap` so iteration order, serialization and log output
/// are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionContext {
    fields: BTreeMap<String, ContextValue>,
}

impl DecisionContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from a JSON object.
    ///
    /// Nested objects are flattened into dotted keys, so
    /// `{"supervisor_flags": {"override": true}}` is readable as
    /// `supervisor_flags.override`. `null` leaves are dropped (absent).
    /// A non-object input yields an empty context.
    pub fn from_json(value: &Value) -> Self {
        let mut ctx = Self::new();
        if let Value::Object(map) = value {
            flatten_into(&mut ctx.fields, "", map);
        }
        ctx
    }

    /// Builder: set a field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set a field, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Remove a field.
    pub fn remove(&mut self, key: &str) -> Option<ContextValue> {
        self.fields.remove(key)
    }

    /// Look up a raw value.
    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.fields.get(key)
    }

    /// Whether the key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Numeric lookup with string coercion.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(ContextValue::as_number)
    }

    /// Flag lookup. Absent keys are unset.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(ContextValue::as_flag)
    }

    /// String lookup.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ContextValue::as_text)
    }

    /// `current_risk_score`, if present and numeric.
    pub fn risk_score(&self) -> Option<f64> {
        self.number(keys::CURRENT_RISK_SCORE)
    }

    /// `current_aggressiveness`, if present and numeric.
    pub fn aggressiveness(&self) -> Option<f64> {
        self.number(keys::CURRENT_AGGRESSIVENESS)
    }

    /// `account_id`, if present.
    pub fn account_id(&self) -> Option<&str> {
        self.text(keys::ACCOUNT_ID)
    }

    /// `account_state`, if present.
    pub fn account_state(&self) -> Option<&str> {
        self.text(keys::ACCOUNT_STATE)
    }

    /// `platform`, if present.
    pub fn platform(&self) -> Option<&str> {
        self.text(keys::PLATFORM)
    }

    /// `content_id`, if present.
    pub fn content_id(&self) -> Option<&str> {
        self.text(keys::CONTENT_ID)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the context has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContextValue)> {
        self.fields.iter()
    }

    /// Compact JSON summary for evaluation records and logs.
    ///
    /// Carries only the contract keys plus the field count; condition fields
    /// may be arbitrarily large and are not copied.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "account_id": self.account_id(),
            "platform": self.platform(),
            "account_state": self.account_state(),
            "content_id": self.content_id(),
            "current_risk_score": self.risk_score(),
            "current_aggressiveness": self.aggressiveness(),
            "field_count": self.len(),
        })
    }
}

impl FromIterator<(String, ContextValue)> for DecisionContext {
    fn from_iter<I: IntoIterator<Item = (String, ContextValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

fn flatten_into(
    out: &mut BTreeMap<String, ContextValue>,
    prefix: &str,
    map: &serde_json::Map<String, Value>,
) {
    for (k, v) in map {
        let key = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}.{k}")
        };
        match v {
            Value::Object(inner) => flatten_into(out, &key, inner),
            other => {
                if let Some(cv) = ContextValue::from_json(other) {
                    out.insert(key, cv);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn number_coerces_numeric_strings() {
        let ctx = DecisionContext::new()
            .with("a", 3.5)
            .with("b", "4.25")
            .with("c", "not a number")
            .with("d", true);
        assert_eq!(ctx.number("a"), Some(3.5));
        assert_eq!(ctx.number("b"), Some(4.25));
        assert_eq!(ctx.number("c"), None);
        assert_eq!(ctx.number("d"), None);
        assert_eq!(ctx.number("missing"), None);
    }

    #[test]
    fn nan_strings_do_not_coerce() {
        let ctx = DecisionContext::new().with("x", "NaN").with("y", "inf");
        assert_eq!(ctx.number("x"), None);
        assert_eq!(ctx.number("y"), None);
    }

    #[test]
    fn flags_accept_common_encodings() {
        let ctx = DecisionContext::new()
            .with("a", true)
            .with("b", 1)
            .with("c", "yes")
            .with("d", "false")
            .with("e", 0);
        assert!(ctx.flag("a"));
        assert!(ctx.flag("b"));
        assert!(ctx.flag("c"));
        assert!(!ctx.flag("d"));
        assert!(!ctx.flag("e"));
        assert!(!ctx.flag("missing"));
    }

    #[test]
    fn from_json_flattens_nested_objects() {
        let ctx = DecisionContext::from_json(&json!({
            "account_id": "acct-1",
            "supervisor_flags": {"block_all_actions": true, "override": false},
            "ignored": null,
            "tags": ["a", "b"],
        }));
        assert!(ctx.flag(keys::SUPERVISOR_BLOCK_ALL));
        assert!(!ctx.flag(keys::SUPERVISOR_OVERRIDE));
        assert!(!ctx.contains("ignored"));
        assert_eq!(ctx.account_id(), Some("acct-1"));
        assert_eq!(
            ctx.get("tags").and_then(ContextValue::as_list).map(<[_]>::len),
            Some(2)
        );
    }

    #[test]
    fn from_json_non_object_is_empty() {
        assert!(DecisionContext::from_json(&json!([1, 2, 3])).is_empty());
        assert!(DecisionContext::from_json(&Value::Null).is_empty());
    }

    #[test]
    fn loose_equality_crosses_number_and_string() {
        assert!(ContextValue::from("3").loosely_equals(&ContextValue::from(3)));
        assert!(ContextValue::from("TRUE").loosely_equals(&ContextValue::from(true)));
        assert!(!ContextValue::from("tiktok").loosely_equals(&ContextValue::from(1)));
        assert!(!ContextValue::from(true).loosely_equals(&ContextValue::from(1)));
    }

    #[test]
    fn serde_is_untagged_and_transparent() {
        let ctx = DecisionContext::new()
            .with("n", 1.5)
            .with("s", "x")
            .with("b", false)
            .with("l", vec![1, 2]);
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json, json!({"n": 1.5, "s": "x", "b": false, "l": [1.0, 2.0]}));
        let back: DecisionContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn summary_carries_contract_keys_only() {
        let ctx = DecisionContext::new()
            .with(keys::ACCOUNT_ID, "acct-9")
            .with(keys::CURRENT_RISK_SCORE, 0.4)
            .with("retention_ratio", 1.2);
        let s = ctx.summary();
        assert_eq!(s["account_id"], "acct-9");
        assert_eq!(s["current_risk_score"], 0.4);
        assert_eq!(s["field_count"], 3);
        assert!(s.get("retention_ratio").is_none());
    }
}
