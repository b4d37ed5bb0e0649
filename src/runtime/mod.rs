use std::path::Path;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::types::{Capabilities, ContainerInfo, RunRequest};

#[cfg(test)]
pub mod fake;
pub mod podman;
pub use podman::PodmanRuntime;

/// Operations the deployment pipeline needs from a container runtime.
///
/// `stop` and `remove` must succeed when the target is already absent.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build `image` from `containerfile` using `context` as the build context.
    async fn build(&self, image: &str, containerfile: &Path, context: &Path)
        -> Result<(), RuntimeError>;

    /// Create and start a container, returning its id.
    async fn run(&self, request: &RunRequest) -> Result<String, RuntimeError>;

    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;

    /// List containers (running or not) whose name matches `name_filter`.
    async fn ps(&self, name_filter: &str) -> Result<Vec<ContainerInfo>, RuntimeError>;

    /// Last `tail` lines of combined stdout/stderr.
    async fn logs(&self, name: &str, tail: usize) -> Result<String, RuntimeError>;

    async fn exec(&self, name: &str, command: &[&str]) -> Result<String, RuntimeError>;

    /// Network backends this runtime can use for rootless containers.
    async fn network_backends(&self) -> Result<Capabilities, RuntimeError>;
}
