//! Deployment sequencing.
//!
//! prerequisites -> host directories -> image build -> stale container
//! check -> network backend -> launch -> health gate -> report.
//! The first fatal error stops the run; absorbed problems end up in the
//! final [`DeploymentReport`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{DeployError, LaunchError};
use crate::health::{FatalSignature, HealthCheck, HealthGate, HealthReport, Remediation};
use crate::launcher::{short_id, ContainerLauncher};
use crate::network;
use crate::prepare::{PrepareMode, PrepareReport, ResourcePreparer, SecurityLabeler};
use crate::probe::RuntimeProbe;
use crate::runtime::ContainerRuntime;
use crate::types::{
    DeploymentSpec, HealthState, LaunchStrategy, NetworkBackend, RunRequest, RuntimeState,
};
use crate::watchdog;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
/// Container running but the service was never confirmed healthy (strict mode only).
pub const EXIT_UNHEALTHY: i32 = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct DeployOptions {
    /// Prepare directories destructively before the first launch.
    pub fix: bool,
    pub skip_build: bool,
}

pub struct Orchestrator<'a> {
    config: &'a Config,
    runtime: &'a dyn ContainerRuntime,
    labeler: &'a dyn SecurityLabeler,
    health: &'a dyn HealthCheck,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a Config,
        runtime: &'a dyn ContainerRuntime,
        labeler: &'a dyn SecurityLabeler,
        health: &'a dyn HealthCheck,
    ) -> Self {
        Self {
            config,
            runtime,
            labeler,
            health,
        }
    }

    /// Runs a full deployment. On a fatal error the container's recent log
    /// tail is logged before the error is returned.
    pub async fn deploy(&self, options: DeployOptions) -> Result<DeploymentReport, DeployError> {
        match self.execute(options).await {
            Ok(report) => Ok(report),
            Err(err) => {
                error!("Deployment failed: {}", err);
                self.surface_logs(&err).await;
                Err(err)
            }
        }
    }

    async fn execute(&self, options: DeployOptions) -> Result<DeploymentReport, DeployError> {
        info!("[1/7] Checking prerequisites");
        self.check_prerequisites().await?;
        let spec = self.config.deployment_spec()?;

        info!("[2/7] Preparing host directories");
        let mode = if options.fix {
            PrepareMode::Fix
        } else {
            PrepareMode::Normal
        };
        let preparer = ResourcePreparer::new(self.labeler);
        let prepared = preparer.prepare(&spec.mounts, &spec.host_dirs, mode).await?;

        if options.skip_build {
            info!("[3/7] Skipping image build");
        } else {
            info!("[3/7] Building image {}", spec.image);
            self.build_image(&spec).await?;
        }

        info!("[4/7] Checking for an existing {} container", spec.name);
        let existing = RuntimeProbe::new(self.runtime).state(&spec.name).await?;
        if existing.container_exists {
            info!(
                "Found {} container {}; it will be replaced",
                existing.presence(),
                existing.container_id.as_deref().map(short_id).unwrap_or("?")
            );
        }

        info!("[5/7] Selecting network backend");
        let backend = network::resolve(self.runtime, self.config.network_backend).await;

        info!("[6/7] Launching {}", spec.name);
        let primary = primary_request(&spec, backend, &prepared);
        let log_tail = self.config.health.log_tail;
        let launcher = ContainerLauncher::new(
            self.runtime,
            Duration::from_secs(self.config.settle_secs),
            log_tail,
        );
        let launched = launcher.launch(primary).await?;
        debug!("{} launched as {}", spec.name, launched.container_id);

        info!("[7/7] Waiting for the service to become healthy");
        let signatures = self.config.signatures();
        let remediation = StorageRemediation {
            runtime: self.runtime,
            launcher: &launcher,
            preparer: &preparer,
            spec: &spec,
            request: launched.request.clone(),
        };
        let gate = HealthGate::new(
            self.runtime,
            self.health,
            &signatures,
            self.config.health_policy(),
        );
        let health = gate.await_healthy(&spec.name, &remediation).await;

        let current = RuntimeProbe::new(self.runtime)
            .state(&spec.name)
            .await
            .unwrap_or_else(|e| {
                warn!("Could not read final state of {}: {}", spec.name, e);
                RuntimeState::absent()
            });

        // A remediation that fails after teardown leaves nothing running.
        if let Some(reason) = &health.remediation_error {
            if !current.container_running {
                return Err(LaunchError {
                    attempts: 1,
                    last_error: format!("storage remediation failed: {}", reason),
                    logs: health.recent_logs.clone(),
                }
                .into());
            }
        }
        let strategy = if health.remediated {
            LaunchStrategy::Permissive
        } else {
            launched.request.strategy
        };

        Ok(DeploymentReport {
            container_name: spec.name.clone(),
            container_id: current.container_id,
            network: backend,
            strategy,
            health,
            preparation_warnings: prepared.warnings,
            directories: prepared.prepared,
            urls: self.access_urls(),
            hints: self.management_hints(),
        })
    }

    /// Every missing item is reported, not just the first.
    async fn check_prerequisites(&self) -> Result<(), DeployError> {
        let mut missing = Vec::new();
        if !self.config.project_dir.is_dir() {
            missing.push(format!(
                "project directory {}",
                self.config.project_dir.display()
            ));
        }
        let containerfile = self.config.containerfile_path();
        if !containerfile.is_file() {
            missing.push(containerfile.display().to_string());
        }
        let env_file = self.config.env_file_path();
        if !env_file.is_file() {
            missing.push(env_file.display().to_string());
        }
        if let Err(e) = self.runtime.ps(&self.config.container_name).await {
            missing.push(format!("container runtime ({})", e));
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(DeployError::PrerequisiteMissing(missing))
        }
    }

    async fn build_image(&self, spec: &DeploymentSpec) -> Result<(), DeployError> {
        let containerfile = self.config.containerfile_path();
        let build = self
            .runtime
            .build(&spec.image, &containerfile, &self.config.project_dir);
        let interval = Duration::from_secs(self.config.connectivity_interval_secs);

        match watchdog::supervise(build, self.config.connectivity_probe.as_deref(), interval).await
        {
            Ok(Ok(())) => {
                info!("Built {}", spec.image);
                Ok(())
            }
            Ok(Err(e)) => Err(DeployError::Build(e.to_string())),
            Err(lost) => Err(DeployError::Build(lost.to_string())),
        }
    }

    async fn surface_logs(&self, err: &DeployError) {
        let logs = match err.captured_logs() {
            Some(logs) => Some(logs.to_string()),
            None => self
                .runtime
                .logs(&self.config.container_name, self.config.health.log_tail)
                .await
                .ok(),
        };
        match logs {
            Some(logs) if !logs.trim().is_empty() => {
                error!("Recent logs from {}:\n{}", self.config.container_name, logs)
            }
            _ => debug!("No container logs available"),
        }
    }

    /// Prepares host directories only.
    pub async fn prepare(&self, fix: bool) -> Result<PrepareReport, DeployError> {
        let mode = if fix {
            PrepareMode::Fix
        } else {
            PrepareMode::Normal
        };
        ResourcePreparer::new(self.labeler)
            .prepare(&self.config.mounts(), &self.config.host_dirs(), mode)
            .await
    }

    /// Read-only snapshot: container state, one health probe, log tail.
    pub async fn status(&self) -> Result<StatusReport, DeployError> {
        let name = &self.config.container_name;
        let state = RuntimeProbe::new(self.runtime).state(name).await?;
        let healthy = state.container_running && self.health.check().await;
        let logs = if state.container_exists {
            self.runtime.logs(name, self.config.health.log_tail).await.ok()
        } else {
            None
        };
        Ok(StatusReport {
            container_name: name.clone(),
            state,
            endpoint: self.health.endpoint().to_string(),
            healthy,
            recent_logs: logs,
        })
    }

    fn access_urls(&self) -> Vec<(String, String)> {
        let base = format!("http://localhost:{}", self.config.host_port);
        vec![
            ("Web UI".into(), format!("{}/", base)),
            ("API docs".into(), format!("{}/docs", base)),
            ("Health".into(), format!("{}{}", base, self.config.health.path)),
        ]
    }

    fn management_hints(&self) -> Vec<String> {
        let name = &self.config.container_name;
        vec![
            format!("podman logs -f {}", name),
            format!("podman restart {}", name),
            format!("podman stop {}", name),
            "rag-deploy status".to_string(),
            "rag-deploy fix".to_string(),
        ]
    }
}

/// Primary request adjusted for what preparation could not provide.
fn primary_request(
    spec: &DeploymentSpec,
    backend: NetworkBackend,
    prepared: &PrepareReport,
) -> RunRequest {
    let mut request = RunRequest::primary(spec, backend);
    if prepared.labels_failed {
        request.labels_disabled = true;
    }
    request
        .mounts
        .retain(|m| !prepared.unavailable.contains(&m.host_path));
    request
}

/// Storage recovery: clear the container, reset storage in fix mode, and
/// relaunch with labels disabled and every mount writable.
struct StorageRemediation<'a> {
    runtime: &'a dyn ContainerRuntime,
    launcher: &'a ContainerLauncher<'a>,
    preparer: &'a ResourcePreparer<'a>,
    spec: &'a DeploymentSpec,
    request: RunRequest,
}

#[async_trait]
impl<'a> Remediation for StorageRemediation<'a> {
    async fn remediate(&self, signature: &FatalSignature) -> Result<(), DeployError> {
        let name = &self.spec.name;
        if let Some(storage) = self.spec.mounts.iter().find(|m| m.resettable) {
            match self
                .runtime
                .exec(name, &["ls", "-la", storage.container_path.as_str()])
                .await
            {
                Ok(listing) => info!("{} as seen by the container:\n{}", storage.container_path, listing),
                Err(e) => debug!("Could not inspect {}: {}", storage.container_path, e),
            }
        }

        info!("Remediating '{}': resetting storage and relaunching", signature.name);
        self.launcher.teardown(name).await?;
        self.preparer
            .prepare(&self.spec.mounts, &self.spec.host_dirs, PrepareMode::Fix)
            .await?;
        let container_id = self.launcher.attempt(&self.request.permissive()).await?;
        info!("Relaunched {} ({}) with permissive settings", name, short_id(&container_id));
        Ok(())
    }
}

/// Outcome of a deployment that got as far as a running container.
#[derive(Debug)]
pub struct DeploymentReport {
    pub container_name: String,
    pub container_id: Option<String>,
    pub network: NetworkBackend,
    pub strategy: LaunchStrategy,
    pub health: HealthReport,
    pub preparation_warnings: Vec<String>,
    pub directories: Vec<PathBuf>,
    pub urls: Vec<(String, String)>,
    pub hints: Vec<String>,
}

impl DeploymentReport {
    /// `strict` turns "not confirmed healthy" into a distinct failure code.
    pub fn exit_code(&self, strict: bool) -> i32 {
        if self.health.is_healthy() || !strict {
            EXIT_OK
        } else {
            EXIT_UNHEALTHY
        }
    }
}

impl fmt::Display for DeploymentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match self.health.state {
            HealthState::Healthy => "Deployment complete",
            _ => "Deployment finished with warnings",
        };
        writeln!(f, "=== {} ===", outcome)?;
        writeln!(
            f,
            "Container:  {} ({})",
            self.container_name,
            self.container_id.as_deref().map(short_id).unwrap_or("unknown")
        )?;
        writeln!(f, "Launch:     {} configuration, network {}", self.strategy, self.network)?;
        write!(
            f,
            "Health:     {} after {} check(s)",
            self.health.state, self.health.attempts
        )?;
        if let Some(signature) = &self.health.signature {
            write!(f, " [{}]", signature)?;
        }
        if self.health.remediated {
            write!(f, " after one remediation")?;
        }
        writeln!(f)?;
        if let Some(reason) = &self.health.remediation_error {
            writeln!(f, "Remediation failed: {}", reason)?;
        }

        if !self.preparation_warnings.is_empty() {
            writeln!(f, "\nWarnings:")?;
            for warning in &self.preparation_warnings {
                writeln!(f, "  {}", warning)?;
            }
        }
        if !self.health.is_healthy() {
            if let Some(logs) = &self.health.recent_logs {
                writeln!(f, "\nRecent logs:\n{}", logs.trim_end())?;
            }
        }

        writeln!(f, "\nDirectories:")?;
        for dir in &self.directories {
            writeln!(f, "  {}", dir.display())?;
        }
        writeln!(f, "\nAccess:")?;
        for (label, url) in &self.urls {
            writeln!(f, "  {:<10}  {}", label, url)?;
        }
        writeln!(f, "\nManage:")?;
        for hint in &self.hints {
            writeln!(f, "  {}", hint)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct StatusReport {
    pub container_name: String,
    pub state: RuntimeState,
    pub endpoint: String,
    pub healthy: bool,
    pub recent_logs: Option<String>,
}

impl StatusReport {
    pub fn exit_code(&self) -> i32 {
        if self.healthy {
            EXIT_OK
        } else {
            EXIT_UNHEALTHY
        }
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Container:  {} ({})",
            self.container_name,
            self.state.presence()
        )?;
        if let Some(id) = &self.state.container_id {
            writeln!(f, "ID:         {}", short_id(id))?;
        }
        writeln!(
            f,
            "Health:     {} {}",
            self.endpoint,
            if self.healthy { "OK" } else { "unreachable" }
        )?;
        if let Some(logs) = &self.recent_logs {
            writeln!(f, "\nRecent logs:\n{}", logs.trim_end())?;
        }
        Ok(())
    }
}
