//! Value objects shared by every deployment step.
//!
//! A [`DeploymentSpec`] is built once per invocation from configuration
//! and never mutated.  Each attempt to start the container derives a
//! [`RunRequest`] from it; the reduced and permissive variants used by
//! the launch fallback and the storage remediation are pure functions of
//! the primary request, so the strategies can be tested without a runtime.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Whether the container may write to a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    ReadWrite,
    ReadOnly,
}

/// A host directory bind-mounted into the container.
///
/// `host_path` must exist and be accessible to the container user before
/// launch; [`crate::prepare::ResourcePreparer`] establishes that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub mode: MountMode,
    /// Request a private security label (`:Z`) on the bind.
    pub relabel: bool,
    /// Dropped by the reduced launch attempt.
    pub optional: bool,
    /// Contents are wiped when preparing in fix mode.
    pub resettable: bool,
}

impl VolumeMount {
    pub fn new(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            mode: MountMode::ReadWrite,
            relabel: true,
            optional: false,
            resettable: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.mode = MountMode::ReadOnly;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn resettable(mut self) -> Self {
        self.resettable = true;
        self
    }

    /// Renders the mount in `host:container[:options]` bind syntax.
    pub fn bind(&self, labels_disabled: bool) -> String {
        let mut options = Vec::new();
        if self.mode == MountMode::ReadOnly {
            options.push("ro");
        }
        if self.relabel && !labels_disabled {
            options.push("Z");
        }
        let base = format!("{}:{}", self.host_path.display(), self.container_path);
        if options.is_empty() {
            base
        } else {
            format!("{}:{}", base, options.join(","))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpus: f64,
}

impl ResourceLimits {
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure,
    UnlessStopped,
}

/// Immutable description of one deployment attempt.
#[derive(Debug, Clone)]
pub struct DeploymentSpec {
    pub name: String,
    pub image: String,
    pub bind_address: String,
    pub port: PortMapping,
    pub mounts: Vec<VolumeMount>,
    /// Host directories that are prepared but not mounted (backups).
    pub host_dirs: Vec<PathBuf>,
    /// Entries from the environment file, passed through untouched.
    pub env: Vec<String>,
    pub limits: ResourceLimits,
    pub restart: RestartPolicy,
    pub userns: Option<String>,
}

/// Which strategy produced a [`RunRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStrategy {
    Primary,
    Reduced,
    Permissive,
}

impl fmt::Display for LaunchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchStrategy::Primary => write!(f, "primary"),
            LaunchStrategy::Reduced => write!(f, "reduced"),
            LaunchStrategy::Permissive => write!(f, "permissive"),
        }
    }
}

/// Fully resolved arguments for a single `run` call.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub strategy: LaunchStrategy,
    pub name: String,
    pub image: String,
    pub bind_address: String,
    pub port: PortMapping,
    pub mounts: Vec<VolumeMount>,
    pub env: Vec<String>,
    pub limits: ResourceLimits,
    pub restart: RestartPolicy,
    pub userns: Option<String>,
    pub network: NetworkBackend,
    /// Run with `label=disable` and no `:Z` relabel on binds.
    pub labels_disabled: bool,
}

impl RunRequest {
    pub fn primary(spec: &DeploymentSpec, network: NetworkBackend) -> Self {
        Self {
            strategy: LaunchStrategy::Primary,
            name: spec.name.clone(),
            image: spec.image.clone(),
            bind_address: spec.bind_address.clone(),
            port: spec.port,
            mounts: spec.mounts.clone(),
            env: spec.env.clone(),
            limits: spec.limits,
            restart: spec.restart,
            userns: spec.userns.clone(),
            network,
            labels_disabled: false,
        }
    }

    /// Lower-risk variant: optional mounts dropped, label requirement relaxed.
    pub fn reduced(&self) -> Self {
        let mut request = self.clone();
        request.strategy = LaunchStrategy::Reduced;
        request.mounts.retain(|m| !m.optional);
        request.labels_disabled = true;
        request
    }

    /// Variant used after a known storage failure: every mount is kept but
    /// forced read-write, and labeling is disabled.
    pub fn permissive(&self) -> Self {
        let mut request = self.clone();
        request.strategy = LaunchStrategy::Permissive;
        for mount in &mut request.mounts {
            mount.mode = MountMode::ReadWrite;
        }
        request.labels_disabled = true;
        request
    }

    pub fn binds(&self) -> Vec<String> {
        self.mounts
            .iter()
            .map(|m| m.bind(self.labels_disabled))
            .collect()
    }

    pub fn port_key(&self) -> String {
        format!("{}/tcp", self.port.container_port)
    }
}

/// Rootless network backends, declared in preference order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum NetworkBackend {
    Pasta,
    Slirp4netns,
    Default,
}

impl NetworkBackend {
    /// Value for the container's network mode; `None` leaves the runtime default.
    pub fn network_mode(&self) -> Option<&'static str> {
        match self {
            NetworkBackend::Pasta => Some("pasta"),
            NetworkBackend::Slirp4netns => Some("slirp4netns"),
            NetworkBackend::Default => None,
        }
    }
}

impl fmt::Display for NetworkBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkBackend::Pasta => write!(f, "pasta"),
            NetworkBackend::Slirp4netns => write!(f, "slirp4netns"),
            NetworkBackend::Default => write!(f, "default"),
        }
    }
}

pub type Capabilities = BTreeSet<NetworkBackend>;

/// One row of `ps` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerPresence {
    Running,
    Stopped,
    Absent,
}

impl fmt::Display for ContainerPresence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerPresence::Running => write!(f, "running"),
            ContainerPresence::Stopped => write!(f, "stopped"),
            ContainerPresence::Absent => write!(f, "absent"),
        }
    }
}

/// Observed runtime snapshot for one container name.  Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeState {
    pub container_exists: bool,
    pub container_running: bool,
    pub container_id: Option<String>,
}

impl RuntimeState {
    pub fn absent() -> Self {
        Self {
            container_exists: false,
            container_running: false,
            container_id: None,
        }
    }

    pub fn presence(&self) -> ContainerPresence {
        match (self.container_exists, self.container_running) {
            (true, true) => ContainerPresence::Running,
            (true, false) => ContainerPresence::Stopped,
            _ => ContainerPresence::Absent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Unknown,
    Starting,
    Healthy,
    DegradedKnownCause,
    Failed,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Unknown => write!(f, "unknown"),
            HealthState::Starting => write!(f, "starting"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::DegradedKnownCause => write!(f, "degraded (known cause)"),
            HealthState::Failed => write!(f, "not confirmed healthy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::sample_spec;

    #[test]
    fn test_bind_syntax() {
        let ro = VolumeMount::new("/a", "/b").read_only();
        assert_eq!(ro.bind(false), "/a:/b:ro,Z");
        assert_eq!(ro.bind(true), "/a:/b:ro");

        let mut plain = VolumeMount::new("/a", "/b");
        plain.relabel = false;
        assert_eq!(plain.bind(false), "/a:/b");
    }

    #[test]
    fn test_reduced_drops_optional_mounts_and_labels() {
        let primary = RunRequest::primary(&sample_spec(), NetworkBackend::Pasta);
        let reduced = primary.reduced();

        assert_eq!(reduced.strategy, LaunchStrategy::Reduced);
        assert_eq!(reduced.mounts.len(), 2);
        assert!(reduced.mounts.iter().all(|m| !m.optional));
        assert!(reduced.labels_disabled);
        assert_eq!(reduced.network, NetworkBackend::Pasta);
        assert!(reduced.binds().iter().all(|b| !b.ends_with('Z')));
    }

    #[test]
    fn test_permissive_forces_read_write() {
        let primary = RunRequest::primary(&sample_spec(), NetworkBackend::Default);
        let permissive = primary.permissive();

        assert_eq!(permissive.mounts.len(), 3);
        assert!(permissive
            .mounts
            .iter()
            .all(|m| m.mode == MountMode::ReadWrite));
        assert_eq!(permissive.binds()[0], "/srv/rag/documents:/app/documents");
    }

    #[test]
    fn test_backend_preference_order() {
        assert!(NetworkBackend::Pasta < NetworkBackend::Slirp4netns);
        assert!(NetworkBackend::Slirp4netns < NetworkBackend::Default);
        assert_eq!(NetworkBackend::Default.network_mode(), None);
    }

    #[test]
    fn test_runtime_state_presence() {
        assert_eq!(RuntimeState::absent().presence(), ContainerPresence::Absent);
        let stopped = RuntimeState {
            container_exists: true,
            container_running: false,
            container_id: Some("abc".into()),
        };
        assert_eq!(stopped.presence(), ContainerPresence::Stopped);
    }
}
