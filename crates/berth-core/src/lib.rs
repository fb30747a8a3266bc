//! berth-core — shared domain types for the Berth deployment platform.
//!
//! These types represent projects, deployments, scaling rules, and
//! metric history. All persisted types serialize to/from JSON for
//! storage in redb tables.

pub mod parse;
pub mod ring;
pub mod types;

pub use parse::{epoch_secs, parse_memory};
pub use ring::{MetricRing, DEFAULT_RING_CAPACITY};
pub use types::*;
