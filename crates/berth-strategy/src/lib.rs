//! berth-strategy — pluggable deployment strategies for Berth.
//!
//! A strategy knows how to realize one deployment on one runtime kind.
//! Two variants exist, differing only in deploy/health mechanics:
//!
//! - [`DockerStrategy`] builds an image from the deployment's
//!   artifacts and runs it as a container on a project-scoped network
//!   with a project-scoped volume.
//! - [`ProcessStrategy`] writes a supervised-process descriptor and
//!   starts the application under an external process supervisor.
//!
//! The [`ArtifactFactory`] inspects a deployment's artifact layout
//! (Dockerfile vs. package.json) and selects the variant.

pub mod docker;
pub mod error;
pub mod factory;
pub mod host;
pub mod process;
pub mod strategy;
pub mod supervisor;
pub mod workspace;

pub use docker::DockerStrategy;
pub use error::{StrategyError, StrategyResult};
pub use factory::{ArtifactFactory, StrategyFactory};
pub use host::HostCapacity;
pub use process::{ProcessDescriptor, ProcessStrategy};
pub use strategy::{DeploymentStrategy, HealthReport, LogOptions};
pub use supervisor::{Pm2Supervisor, ProcessState, Supervisor, SupervisorStatus};
pub use workspace::WorkspaceLayout;
