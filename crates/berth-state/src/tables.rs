//! redb table definitions for the Berth state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized
//! domain types).

use redb::TableDefinition;

/// Projects keyed by `{project_id}`.
pub const PROJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("projects");

/// Deployment records keyed by `{deployment_id}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Scaling rule sets keyed by `deployment:{id}` or `project:{id}`.
pub const SCALING_RULES: TableDefinition<&str, &[u8]> = TableDefinition::new("scaling_rules");
