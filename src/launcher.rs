//! Starts the service container with at most one fallback attempt.

use std::time::Duration;

use log::{info, warn};

use crate::error::{LaunchError, RuntimeError};
use crate::probe::RuntimeProbe;
use crate::runtime::ContainerRuntime;
use crate::types::{ContainerPresence, RunRequest};

/// A container that is running under `request`'s settings.
#[derive(Debug, Clone)]
pub struct LaunchOutcome {
    pub container_id: String,
    pub request: RunRequest,
}

pub struct ContainerLauncher<'a> {
    runtime: &'a dyn ContainerRuntime,
    settle: Duration,
    log_tail: usize,
}

impl<'a> ContainerLauncher<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, settle: Duration, log_tail: usize) -> Self {
        Self {
            runtime,
            settle,
            log_tail,
        }
    }

    /// Clears whatever occupies `name`: stop if running, then remove.
    ///
    /// Returns what was found. Runtimes differ in how they handle a name
    /// conflict on create, so the name is always freed explicitly.
    pub async fn teardown(&self, name: &str) -> Result<ContainerPresence, RuntimeError> {
        let presence = RuntimeProbe::new(self.runtime).exists(name).await?;
        if presence == ContainerPresence::Running {
            info!("Stopping existing container {}", name);
            self.runtime.stop(name).await?;
        }
        if presence != ContainerPresence::Absent {
            info!("Removing existing container {}", name);
            self.runtime.remove(name).await?;
        }
        Ok(presence)
    }

    /// Primary attempt, then exactly one reduced attempt. Never a third.
    pub async fn launch(&self, primary: RunRequest) -> Result<LaunchOutcome, LaunchError> {
        let name = primary.name.clone();
        let reduced = primary.reduced();
        let mut attempts = 0;
        let mut last_error = String::new();

        for request in [primary, reduced] {
            attempts += 1;
            info!(
                "Starting {} ({} configuration, network {})",
                name, request.strategy, request.network
            );
            match self.attempt(&request).await {
                Ok(container_id) => {
                    info!("Container {} running ({})", name, short_id(&container_id));
                    return Ok(LaunchOutcome {
                        container_id,
                        request,
                    });
                }
                Err(e) => {
                    warn!("{} launch of {} failed: {}", request.strategy, name, e);
                    last_error = e.to_string();
                }
            }
        }

        let logs = self.runtime.logs(&name, self.log_tail).await.ok();
        Err(LaunchError {
            attempts,
            last_error,
            logs,
        })
    }

    /// One teardown-run-confirm cycle.
    pub async fn attempt(&self, request: &RunRequest) -> Result<String, RuntimeError> {
        self.teardown(&request.name).await?;
        let container_id = self.runtime.run(request).await?;

        let probe = RuntimeProbe::new(self.runtime);
        if !probe.confirm_running(&request.name, self.settle).await? {
            if let Ok(logs) = self.runtime.logs(&request.name, self.log_tail).await {
                warn!("Container {} exited after start. Recent logs:\n{}", request.name, logs);
            }
            return Err(RuntimeError::Rejected(format!(
                "{} was not running {:?} after start",
                request.name, self.settle
            )));
        }
        Ok(container_id)
    }
}

pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
