//! berth-autoscale — closed-loop instance scaling for Berth.
//!
//! Evaluates scaling rules against the latest monitor output (plus
//! externally supplied activity signals) and calls back into the
//! orchestrator to change instance counts.
//!
//! # Evaluation
//!
//! ```text
//! each tick, per deployment:
//!   skip when metrics are stale or within the cooldown window
//!   value  = rule metric resolved from the latest sample / signal map
//!   fire   = value <operator> threshold
//!   target = scale-up → min(max, current+1)
//!            scale-down → max(min, current−1)
//! ```
//!
//! At most one scaling step per tick; the first configured rule that
//! yields a non-no-op change wins.

pub mod engine;

pub use engine::{Engine, EngineError, RuleScope, ScaleDecision, ScaleEvent, ScaleFn};
