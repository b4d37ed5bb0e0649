//! In-memory runtime for tests. Records every call.

use super::ContainerRuntime;
use crate::error::RuntimeError;
use crate::types::{
    Capabilities, ContainerInfo, DeploymentSpec, LaunchStrategy, NetworkBackend, PortMapping,
    ResourceLimits, RestartPolicy, RunRequest, VolumeMount,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Build,
    Run(LaunchStrategy),
    Stop(String),
    Remove(String),
    Ps,
    Logs,
    Exec,
    NetworkBackends,
}

#[derive(Default)]
struct State {
    containers: Vec<ContainerInfo>,
    calls: Vec<Call>,
    run_failures: VecDeque<String>,
    rejected: Option<(LaunchStrategy, String)>,
    exits_on_start: u32,
    logs: String,
    capabilities: Option<Capabilities>,
    build_error: Option<String>,
    unreachable: bool,
    next_id: u32,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_container(self, name: &str, running: bool) -> Self {
        self.state.lock().unwrap().containers.push(ContainerInfo {
            id: format!("stale-{}", name),
            name: name.to_string(),
            image: "localhost/old:latest".to_string(),
            running,
        });
        self
    }

    /// The next `count` run calls fail with `message`.
    pub fn fail_runs(self, count: usize, message: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for _ in 0..count {
                state.run_failures.push_back(message.to_string());
            }
        }
        self
    }

    /// Every run with `strategy` fails with `message`.
    pub fn reject_strategy(self, strategy: LaunchStrategy, message: &str) -> Self {
        self.state.lock().unwrap().rejected = Some((strategy, message.to_string()));
        self
    }

    /// The next `count` containers exit right after starting.
    pub fn exit_on_start(self, count: u32) -> Self {
        self.state.lock().unwrap().exits_on_start = count;
        self
    }

    pub fn with_logs(self, logs: &str) -> Self {
        self.set_logs(logs);
        self
    }

    pub fn with_capabilities(self, capabilities: &[NetworkBackend]) -> Self {
        self.state.lock().unwrap().capabilities = Some(capabilities.iter().copied().collect());
        self
    }

    pub fn fail_build(self, message: &str) -> Self {
        self.state.lock().unwrap().build_error = Some(message.to_string());
        self
    }

    pub fn unreachable(self) -> Self {
        self.state.lock().unwrap().unreachable = true;
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub fn set_logs(&self, logs: &str) {
        self.state.lock().unwrap().logs = logs.to_string();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn runs(&self) -> Vec<LaunchStrategy> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Run(strategy) => Some(strategy),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn containers_named(&self, name: &str) -> Vec<ContainerInfo> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn build(&self, _image: &str, _file: &Path, _context: &Path) -> Result<(), RuntimeError> {
        self.record(Call::Build);
        match self.state.lock().unwrap().build_error.clone() {
            Some(message) => Err(RuntimeError::Rejected(message)),
            None => Ok(()),
        }
    }

    async fn run(&self, request: &RunRequest) -> Result<String, RuntimeError> {
        self.record(Call::Run(request.strategy));
        let mut state = self.state.lock().unwrap();
        if state.containers.iter().any(|c| c.name == request.name) {
            return Err(RuntimeError::Rejected(format!(
                "the container name \"{}\" is already in use",
                request.name
            )));
        }
        if let Some((_, message)) = state
            .rejected
            .as_ref()
            .filter(|(strategy, _)| *strategy == request.strategy)
        {
            return Err(RuntimeError::Rejected(message.clone()));
        }
        if let Some(message) = state.run_failures.pop_front() {
            return Err(RuntimeError::Rejected(message));
        }
        let running = if state.exits_on_start > 0 {
            state.exits_on_start -= 1;
            false
        } else {
            true
        };
        state.next_id += 1;
        let id = format!("ctr{:04}", state.next_id);
        state.containers.push(ContainerInfo {
            id: id.clone(),
            name: request.name.clone(),
            image: request.image.clone(),
            running,
        });
        Ok(id)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(Call::Stop(name.to_string()));
        let mut state = self.state.lock().unwrap();
        for c in state.containers.iter_mut().filter(|c| c.name == name) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.record(Call::Remove(name.to_string()));
        self.state.lock().unwrap().containers.retain(|c| c.name != name);
        Ok(())
    }

    async fn ps(&self, name_filter: &str) -> Result<Vec<ContainerInfo>, RuntimeError> {
        self.record(Call::Ps);
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(RuntimeError::Rejected("cannot connect to Podman".into()));
        }
        Ok(state
            .containers
            .iter()
            .filter(|c| c.name.contains(name_filter))
            .cloned()
            .collect())
    }

    async fn logs(&self, name: &str, _tail: usize) -> Result<String, RuntimeError> {
        self.record(Call::Logs);
        let state = self.state.lock().unwrap();
        if !state.containers.iter().any(|c| c.name == name) {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        Ok(state.logs.clone())
    }

    async fn exec(&self, name: &str, command: &[&str]) -> Result<String, RuntimeError> {
        self.record(Call::Exec);
        let state = self.state.lock().unwrap();
        match state.containers.iter().find(|c| c.name == name) {
            Some(c) if c.running => Ok(format!("exec: {}", command.join(" "))),
            _ => Err(RuntimeError::NotFound(name.to_string())),
        }
    }

    async fn network_backends(&self) -> Result<Capabilities, RuntimeError> {
        self.record(Call::NetworkBackends);
        Ok(self
            .state
            .lock()
            .unwrap()
            .capabilities
            .clone()
            .unwrap_or_else(|| [NetworkBackend::Default].into_iter().collect()))
    }
}

pub fn sample_spec() -> DeploymentSpec {
    DeploymentSpec {
        name: "rag-system".into(),
        image: "localhost/rag-system:latest".into(),
        bind_address: "0.0.0.0".into(),
        port: PortMapping {
            host_port: 8080,
            container_port: 8080,
        },
        mounts: vec![
            VolumeMount::new("/srv/rag/documents", "/app/documents").read_only(),
            VolumeMount::new("/srv/rag/data/chromadb", "/app/data/chromadb").resettable(),
            VolumeMount::new("/srv/rag/data/logs", "/app/logs").optional(),
        ],
        host_dirs: vec![],
        env: vec!["LOG_LEVEL=INFO".into()],
        limits: ResourceLimits {
            memory_bytes: 4 << 30,
            cpus: 2.0,
        },
        restart: RestartPolicy::UnlessStopped,
        userns: None,
    }
}
