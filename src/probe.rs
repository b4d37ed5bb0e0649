//! Observes container state by name. Nothing is cached between calls.

use std::time::Duration;

use log::debug;
use tokio::time::sleep;

use crate::error::RuntimeError;
use crate::runtime::ContainerRuntime;
use crate::types::{ContainerPresence, RuntimeState};

pub struct RuntimeProbe<'a> {
    runtime: &'a dyn ContainerRuntime,
}

impl<'a> RuntimeProbe<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime) -> Self {
        Self { runtime }
    }

    /// Snapshot for the container named exactly `name`.
    ///
    /// The runtime's name filter is a substring match, so other containers
    /// sharing a prefix are ignored here.
    pub async fn state(&self, name: &str) -> Result<RuntimeState, RuntimeError> {
        let matches: Vec<_> = self
            .runtime
            .ps(name)
            .await?
            .into_iter()
            .filter(|c| c.name == name)
            .collect();

        let found = matches
            .iter()
            .find(|c| c.running)
            .or_else(|| matches.first());
        Ok(match found {
            Some(c) => {
                debug!("{} ({}) from {}, running: {}", c.name, c.id, c.image, c.running);
                RuntimeState {
                    container_exists: true,
                    container_running: c.running,
                    container_id: Some(c.id.clone()),
                }
            }
            None => RuntimeState::absent(),
        })
    }

    pub async fn exists(&self, name: &str) -> Result<ContainerPresence, RuntimeError> {
        Ok(self.state(name).await?.presence())
    }

    /// Waits `settle`, then reports whether the container is still running.
    pub async fn confirm_running(&self, name: &str, settle: Duration) -> Result<bool, RuntimeError> {
        sleep(settle).await;
        let presence = self.exists(name).await?;
        debug!("{} is {} {:?} after start", name, presence, settle);
        Ok(presence == ContainerPresence::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;

    #[tokio::test]
    async fn test_absent_container() {
        let runtime = FakeRuntime::new();
        let probe = RuntimeProbe::new(&runtime);
        assert_eq!(probe.exists("rag-system").await.unwrap(), ContainerPresence::Absent);
    }

    #[tokio::test]
    async fn test_exact_name_match_only() {
        let runtime = FakeRuntime::new().with_container("rag-system-old", true);
        let probe = RuntimeProbe::new(&runtime);
        assert_eq!(probe.exists("rag-system").await.unwrap(), ContainerPresence::Absent);
    }

    #[tokio::test]
    async fn test_stopped_and_running() {
        let runtime = FakeRuntime::new()
            .with_container("stopped", false)
            .with_container("running", true);
        let probe = RuntimeProbe::new(&runtime);

        let state = probe.state("stopped").await.unwrap();
        assert!(state.container_exists);
        assert!(!state.container_running);
        assert_eq!(state.container_id.as_deref(), Some("stale-stopped"));
        assert_eq!(probe.exists("running").await.unwrap(), ContainerPresence::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_running_waits_settle_delay() {
        let runtime = FakeRuntime::new().with_container("rag-system", true);
        let probe = RuntimeProbe::new(&runtime);

        let start = tokio::time::Instant::now();
        assert!(probe
            .confirm_running("rag-system", Duration::from_secs(2))
            .await
            .unwrap());
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
