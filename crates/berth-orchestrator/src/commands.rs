//! The command channel.
//!
//! Collaborators deliver `{create, cancel, rollback}` events and
//! receive a `{deployment_id, status, error}` report on completion or
//! failure. The reply sender is optional, so both fire-and-forget and
//! request/response callers are served.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use berth_core::DeploymentStatus;

/// A lifecycle command delivered over the command channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Create {
        /// Pre-allocated deployment id, when the collaborator has
        /// already populated the workspace for it.
        deployment_id: Option<String>,
        project_id: String,
        /// Revision to deploy.
        #[serde(alias = "revision")]
        commit_hash: String,
        branch: String,
        #[serde(default)]
        env_vars: HashMap<String, String>,
        /// Memory limit as a human string ("256M", "1G"). Platform
        /// default when absent.
        #[serde(default, alias = "maxMemory")]
        memory: Option<String>,
    },
    Cancel {
        deployment_id: String,
    },
    Rollback {
        deployment_id: String,
    },
}

/// Outcome reported back to the command's sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReport {
    pub deployment_id: Option<String>,
    pub status: Option<DeploymentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A command plus its optional reply channel.
pub struct CommandEnvelope {
    pub command: Command,
    pub reply: Option<oneshot::Sender<CommandReport>>,
}
