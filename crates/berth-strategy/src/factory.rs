//! Strategy selection from a deployment's artifact layout.
//!
//! A Dockerfile selects the container strategy; otherwise a
//! package.json selects the supervised-process strategy; neither is a
//! configuration error. Rollback deployments whose own workspace has
//! not been populated yet are selected from the rollback source's
//! artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use berth_core::{Deployment, Project};

use crate::docker::DockerStrategy;
use crate::error::{StrategyError, StrategyResult};
use crate::host::HostCapacity;
use crate::process::ProcessStrategy;
use crate::strategy::DeploymentStrategy;
use crate::supervisor::Supervisor;
use crate::workspace::WorkspaceLayout;

/// Selects a strategy for a deployment.
#[async_trait]
pub trait StrategyFactory: Send + Sync {
    async fn create(
        &self,
        deployment: &Deployment,
        project: &Project,
    ) -> StrategyResult<Arc<dyn DeploymentStrategy>>;
}

/// Factory selecting by inspecting the deployment's artifacts on disk.
pub struct ArtifactFactory {
    workspace: WorkspaceLayout,
    capacity: HostCapacity,
    supervisor: Arc<dyn Supervisor>,
}

impl ArtifactFactory {
    pub fn new(
        workspace: WorkspaceLayout,
        capacity: HostCapacity,
        supervisor: Arc<dyn Supervisor>,
    ) -> Self {
        Self {
            workspace,
            capacity,
            supervisor,
        }
    }

    /// Directory whose artifacts determine the strategy: the
    /// deployment's own workdir, or its rollback source's when the
    /// workdir has not been populated.
    fn artifact_dir(&self, deployment: &Deployment) -> PathBuf {
        let own = self
            .workspace
            .deployment_dir(&deployment.project_id, &deployment.id);
        if has_artifacts(&own) {
            return own;
        }
        if let Some(source) = &deployment.rollback_from {
            let source_dir = self
                .workspace
                .deployment_dir(&deployment.project_id, source);
            if has_artifacts(&source_dir) {
                return source_dir;
            }
        }
        own
    }
}

fn has_artifacts(dir: &Path) -> bool {
    dir.join("Dockerfile").is_file() || dir.join("package.json").is_file()
}

#[async_trait]
impl StrategyFactory for ArtifactFactory {
    async fn create(
        &self,
        deployment: &Deployment,
        project: &Project,
    ) -> StrategyResult<Arc<dyn DeploymentStrategy>> {
        let work_dir = self
            .workspace
            .deployment_dir(&deployment.project_id, &deployment.id);
        let artifact_dir = self.artifact_dir(deployment);

        if artifact_dir.join("Dockerfile").is_file() {
            debug!(deployment_id = %deployment.id, "selected container strategy");
            let strategy = DockerStrategy::connect(
                deployment.clone(),
                project.clone(),
                work_dir,
                self.capacity,
            )?;
            return Ok(Arc::new(strategy));
        }

        if artifact_dir.join("package.json").is_file() {
            debug!(deployment_id = %deployment.id, "selected process strategy");
            let strategy = ProcessStrategy::new(
                self.supervisor.clone(),
                deployment.clone(),
                project.clone(),
                work_dir,
                self.capacity,
            );
            return Ok(Arc::new(strategy));
        }

        Err(StrategyError::Configuration(
            "neither Dockerfile nor package.json found in deployment artifacts".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessDescriptor;
    use crate::supervisor::ProcessState;

    struct NullSupervisor;

    #[async_trait]
    impl Supervisor for NullSupervisor {
        async fn start(&self, _d: &ProcessDescriptor) -> StrategyResult<()> {
            Ok(())
        }
        async fn delete(&self, _name: &str) -> StrategyResult<()> {
            Ok(())
        }
        async fn describe(&self, _name: &str) -> StrategyResult<Option<ProcessState>> {
            Ok(None)
        }
        async fn scale(&self, _name: &str, _instances: u32) -> StrategyResult<()> {
            Ok(())
        }
    }

    fn factory(root: &Path) -> ArtifactFactory {
        ArtifactFactory::new(
            WorkspaceLayout::new(root),
            HostCapacity {
                memory_bytes: 8 * 1024 * 1024 * 1024,
                cpu_cores: 4,
            },
            Arc::new(NullSupervisor),
        )
    }

    fn project() -> Project {
        Project {
            id: "p1".to_string(),
            name: "api".to_string(),
            env: Default::default(),
            port: None,
            health_probe: None,
            process: None,
            created_at: 1000,
        }
    }

    fn deployment() -> Deployment {
        let mut d = Deployment::new("p1", "abc123", "main");
        d.id = "d1".to_string();
        d
    }

    #[tokio::test]
    async fn dockerfile_selects_container_strategy() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("p1/d1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Dockerfile"), "FROM scratch\n").unwrap();
        // A Dockerfile wins even when a package manifest is present.
        std::fs::write(dir.join("package.json"), "{}").unwrap();

        let strategy = factory(root.path())
            .create(&deployment(), &project())
            .await
            .unwrap();
        // The container strategy validates against the Dockerfile.
        strategy.validate().await.unwrap();
    }

    #[tokio::test]
    async fn package_manifest_selects_process_strategy() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("p1/d1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("package.json"), "{}").unwrap();

        let strategy = factory(root.path())
            .create(&deployment(), &project())
            .await
            .unwrap();
        strategy.validate().await.unwrap();
    }

    #[tokio::test]
    async fn no_artifacts_is_a_configuration_error() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("p1/d1")).unwrap();

        let err = match factory(root.path()).create(&deployment(), &project()).await {
            Ok(_) => panic!("expected a configuration error"),
            Err(e) => e,
        };
        assert!(matches!(err, StrategyError::Configuration(_)));
    }

    #[tokio::test]
    async fn rollback_selects_from_source_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let source_dir = root.path().join("p1/d0");
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::write(source_dir.join("package.json"), "{}").unwrap();

        let mut d = deployment();
        d.rollback_from = Some("d0".to_string());

        // The new deployment's own workdir is empty; selection falls
        // back to the rollback source.
        let strategy = factory(root.path()).create(&d, &project()).await;
        assert!(strategy.is_ok());
    }
}
