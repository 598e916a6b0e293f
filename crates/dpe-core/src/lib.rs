#![deny(missing_docs)]

//! # dpe-core — Foundational Types for the Decision Policy Engine
//!
//! This crate defines the types every other crate in the workspace depends
//! on. It has no internal crate dependencies.
//!
//! ## Design Principles
//!
//! 1. **Typed context, fail-closed lookups.** The caller-supplied context is a
//!    [`DecisionContext`] of [`ContextValue`]s. Every accessor returns an
//!    `Option`; absence and type mismatch look identical to callers, so a
//!    missing field can never accidentally satisfy a condition.
//!
//! 2. **Storage is a port.** Registry documents and the outcome log are
//!    written through [`KeyValueStore`]. The engine only needs get, put and
//!    list-by-prefix; [`MemoryStore`] and [`DirectoryStore`] are provided.
//!
//! 3. **[`DpeError`] hierarchy.** Structured errors with `thiserror`. Guard
//!    blocks and condition misses are decision data, not errors.
//!
//! 4. **One configuration object.** [`EngineConfig`] carries every tunable
//!    threshold, including the pattern-repetition heuristics and the toxic
//!    selection penalty.

pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod storage;
pub mod telemetry;

pub use config::{BridgeConfig, ConfigError, EngineConfig, EvaluatorConfig, GuardConfig, LearningConfig};
pub use context::{keys, ContextValue, DecisionContext};
pub use digest::{sha256_json, ContentDigest};
pub use error::{DpeError, StateTransitionError, StorageError, ValidationError};
pub use storage::{DirectoryStore, KeyValueStore, MemoryStore};
