//! StateStore — redb-backed persistence for Berth.
//!
//! Provides typed CRUD over projects, deployments, and scaling rules.
//! All values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter
//! for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use berth_core::{Deployment, Project, ScalingRule};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PROJECTS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(SCALING_RULES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Projects ───────────────────────────────────────────────────

    /// Insert or update a project.
    pub fn put_project(&self, project: &Project) -> StateResult<()> {
        let value = serde_json::to_vec(project).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PROJECTS).map_err(map_err!(Table))?;
            table
                .insert(project.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(project_id = %project.id, "project stored");
        Ok(())
    }

    /// Get a project by id.
    pub fn get_project(&self, project_id: &str) -> StateResult<Option<Project>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROJECTS).map_err(map_err!(Table))?;
        match table.get(project_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let project: Project =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(project))
            }
            None => Ok(None),
        }
    }

    /// List all projects.
    pub fn list_projects(&self) -> StateResult<Vec<Project>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROJECTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let project: Project =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(project);
        }
        Ok(results)
    }

    /// Delete a project by id. Returns true if it existed.
    pub fn delete_project(&self, project_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(PROJECTS).map_err(map_err!(Table))?;
            existed = table.remove(project_id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment record.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<()> {
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(deployment.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a deployment by id.
    pub fn get_deployment(&self, deployment_id: &str) -> StateResult<Option<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(deployment_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let deployment: Deployment =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(deployment))
            }
            None => Ok(None),
        }
    }

    /// Get a deployment by id, failing with `NotFound` when absent.
    pub fn require_deployment(&self, deployment_id: &str) -> StateResult<Deployment> {
        self.get_deployment(deployment_id)?
            .ok_or_else(|| StateError::NotFound(format!("deployment {deployment_id}")))
    }

    /// List all deployment records.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let deployment: Deployment =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(deployment);
        }
        Ok(results)
    }

    /// List all deployments of a project, newest first.
    pub fn list_deployments_for_project(&self, project_id: &str) -> StateResult<Vec<Deployment>> {
        let mut results: Vec<Deployment> = self
            .list_deployments()?
            .into_iter()
            .filter(|d| d.project_id == project_id)
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(results)
    }

    /// The most recent deployment of the project that ever reached
    /// `completed`, created no later than `before_created_at` and
    /// distinct from `exclude_id`. This is the rollback source for the
    /// excluded deployment.
    pub fn previous_completed(
        &self,
        project_id: &str,
        exclude_id: &str,
        before_created_at: u64,
    ) -> StateResult<Option<Deployment>> {
        let candidates = self
            .list_deployments_for_project(project_id)?
            .into_iter()
            .filter(|d| d.id != exclude_id)
            .filter(|d| d.created_at <= before_created_at)
            .filter(|d| d.ever_completed());
        Ok(candidates.max_by_key(|d| (d.created_at, d.completed_at)))
    }

    /// Delete a deployment by id. Returns true if it existed.
    pub fn delete_deployment(&self, deployment_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            existed = table
                .remove(deployment_id)
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Scaling rules ──────────────────────────────────────────────

    /// Insert or replace the scaling rule set for a target key
    /// (`deployment:{id}` or `project:{id}`).
    pub fn put_rules(&self, target_key: &str, rules: &[ScalingRule]) -> StateResult<()> {
        let value = serde_json::to_vec(rules).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SCALING_RULES).map_err(map_err!(Table))?;
            table
                .insert(target_key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%target_key, count = rules.len(), "scaling rules stored");
        Ok(())
    }

    /// Get the scaling rule set for a target key.
    pub fn get_rules(&self, target_key: &str) -> StateResult<Option<Vec<ScalingRule>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCALING_RULES).map_err(map_err!(Table))?;
        match table.get(target_key).map_err(map_err!(Read))? {
            Some(guard) => {
                let rules: Vec<ScalingRule> =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(rules))
            }
            None => Ok(None),
        }
    }

    /// List all stored rule sets as (target_key, rules) pairs.
    pub fn list_rules(&self) -> StateResult<Vec<(String, Vec<ScalingRule>)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCALING_RULES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let rules: Vec<ScalingRule> =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push((key.value().to_string(), rules));
        }
        Ok(results)
    }

    /// Delete the rule set for a target key. Returns true if it existed.
    pub fn delete_rules(&self, target_key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SCALING_RULES).map_err(map_err!(Table))?;
            existed = table.remove(target_key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}
