//! Health gating after launch.
//!
//! The gate polls the service endpoint a bounded number of times.  Between
//! polls it scans the container log tail for known fatal signatures; a
//! match means waiting longer will not help, so it runs one remediation
//! cycle, waits a grace period, and polls once more.  A plain timeout is
//! reported separately from a recognised failure.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::sleep;

use crate::error::DeployError;
use crate::runtime::ContainerRuntime;
use crate::types::HealthState;

/// A log substring that identifies a specific, known failure mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalSignature {
    pub name: String,
    pub pattern: String,
}

impl FatalSignature {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignatureSet {
    signatures: Vec<FatalSignature>,
}

impl SignatureSet {
    pub fn empty() -> Self {
        Self {
            signatures: Vec::new(),
        }
    }

    /// Failures of the vector store's on-disk database.
    pub fn storage_defaults() -> Self {
        Self::empty()
            .with(
                "readonly-database",
                "attempt to write a readonly database",
            )
            .with("database-open", "unable to open database file")
            .with("vector-store-init", "Failed to initialize vector store")
            .with("permission-denied", "PermissionError: [Errno 13]")
    }

    pub fn with(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.signatures.push(FatalSignature::new(name, pattern));
        self
    }

    /// Adds configured patterns, named after the pattern itself.
    pub fn extend_patterns<I: IntoIterator<Item = String>>(mut self, patterns: I) -> Self {
        for pattern in patterns {
            self.signatures.push(FatalSignature::new(pattern.clone(), pattern));
        }
        self
    }

    pub fn find(&self, logs: &str) -> Option<&FatalSignature> {
        self.signatures
            .iter()
            .find(|s| !s.pattern.is_empty() && logs.contains(&s.pattern))
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }
}

impl Default for SignatureSet {
    fn default() -> Self {
        Self::storage_defaults()
    }
}

/// One readiness probe of the managed service.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn check(&self) -> bool;
}

pub struct HttpHealthCheck {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthCheck {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(resp) => {
                debug!("GET {} -> {}", self.url, resp.status());
                resp.status().is_success()
            }
            Err(e) => {
                debug!("GET {} failed: {}", self.url, e);
                false
            }
        }
    }
}

/// The single corrective action taken after a recognised failure.
#[async_trait]
pub trait Remediation: Send + Sync {
    async fn remediate(&self, signature: &FatalSignature) -> Result<(), DeployError>;
}

#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub attempts: u32,
    pub interval: Duration,
    /// Wait between the remediation relaunch and the final poll.
    pub grace: Duration,
    pub log_tail: usize,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(2),
            grace: Duration::from_secs(15),
            log_tail: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub state: HealthState,
    /// Polls made before remediation or the final verdict.
    pub attempts: u32,
    pub remediated: bool,
    pub signature: Option<String>,
    /// Why remediation could not complete, if it failed.
    pub remediation_error: Option<String>,
    pub recent_logs: Option<String>,
}

impl HealthReport {
    fn new(state: HealthState, attempts: u32) -> Self {
        Self {
            state,
            attempts,
            remediated: false,
            signature: None,
            remediation_error: None,
            recent_logs: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

pub struct HealthGate<'a> {
    runtime: &'a dyn ContainerRuntime,
    check: &'a dyn HealthCheck,
    signatures: &'a SignatureSet,
    policy: HealthPolicy,
}

impl<'a> HealthGate<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        check: &'a dyn HealthCheck,
        signatures: &'a SignatureSet,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            runtime,
            check,
            signatures,
            policy,
        }
    }

    pub async fn await_healthy(&self, name: &str, remediation: &dyn Remediation) -> HealthReport {
        let mut state = HealthState::Unknown;
        transition(&mut state, HealthState::Starting);
        info!(
            "Waiting for {} (up to {} attempts, every {:?})",
            self.check.endpoint(),
            self.policy.attempts,
            self.policy.interval
        );
        debug!("Watching {} logs for {} fatal signatures", name, self.signatures.len());

        let mut attempt = 0;
        while attempt < self.policy.attempts {
            attempt += 1;
            if self.check.check().await {
                transition(&mut state, HealthState::Healthy);
                info!("Service healthy after {} attempt(s)", attempt);
                return HealthReport::new(state, attempt);
            }

            if let Some(logs) = self.recent_logs(name).await {
                if let Some(signature) = self.signatures.find(&logs) {
                    transition(&mut state, HealthState::DegradedKnownCause);
                    let signature = signature.clone();
                    return self
                        .remediate(name, signature, attempt, logs, remediation)
                        .await;
                }
            }

            debug!("Attempt {}/{}: not ready", attempt, self.policy.attempts);
            if attempt < self.policy.attempts {
                sleep(self.policy.interval).await;
            }
        }

        transition(&mut state, HealthState::Failed);
        warn!(
            "{} did not become healthy after {} attempts; the service may still be starting",
            self.check.endpoint(),
            attempt
        );
        let mut report = HealthReport::new(state, attempt);
        report.recent_logs = self.recent_logs(name).await;
        report
    }

    async fn remediate(
        &self,
        name: &str,
        signature: FatalSignature,
        attempts: u32,
        detected_in: String,
        remediation: &dyn Remediation,
    ) -> HealthReport {
        warn!(
            "Detected known failure '{}' in {} logs; running remediation",
            signature.name, name
        );
        let mut report = HealthReport::new(HealthState::DegradedKnownCause, attempts);
        report.signature = Some(signature.name.clone());

        match remediation.remediate(&signature).await {
            Ok(()) => {
                report.remediated = true;
                sleep(self.policy.grace).await;
                if self.check.check().await {
                    info!("Service healthy after remediation");
                    report.state = HealthState::Healthy;
                    return report;
                }
                warn!("Service still not healthy after remediation");
            }
            Err(e) => {
                warn!("Remediation failed: {}", e);
                report.remediation_error = Some(e.to_string());
                // The container may be gone; keep the logs that triggered remediation.
                report.recent_logs = self.recent_logs(name).await.or(Some(detected_in));
                return report;
            }
        }
        report.recent_logs = self.recent_logs(name).await;
        report
    }

    async fn recent_logs(&self, name: &str) -> Option<String> {
        match self.runtime.logs(name, self.policy.log_tail).await {
            Ok(logs) => Some(logs),
            Err(e) => {
                debug!("Could not read logs for {}: {}", name, e);
                None
            }
        }
    }
}

fn transition(state: &mut HealthState, next: HealthState) {
    debug!("health: {} -> {}", state, next);
    *state = next;
}
