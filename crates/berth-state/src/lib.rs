//! berth-state — embedded persistence for the Berth platform.
//!
//! Stores projects, deployment records, and scaling rules in redb
//! tables with JSON-serialized values. Supports an on-disk backend and
//! an in-memory backend for tests.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
