use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::DeployError;
use crate::health::{HealthPolicy, SignatureSet};
use crate::types::{
    DeploymentSpec, NetworkBackend, PortMapping, ResourceLimits, RestartPolicy, VolumeMount,
};

const DEFAULT_CONFIG_FILE: &str = "rag-deploy.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Root of the directory layout and the image build context.
    pub project_dir: PathBuf,
    pub container_name: String,
    pub image: String,
    pub containerfile: String,
    pub bind_address: String,
    pub host_port: u16,
    pub container_port: u16,
    pub env_file: String,
    pub memory: String,
    pub cpus: f64,
    pub restart_policy: RestartPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_backend: Option<NetworkBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    pub settle_secs: u64,
    pub build_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connectivity_probe: Option<String>,
    pub connectivity_interval_secs: u64,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    pub path: String,
    pub attempts: u32,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub grace_secs: u64,
    pub log_tail: usize,
    /// Treat "never became healthy" as a failed deployment.
    pub strict: bool,
    pub extra_signatures: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/health".into(),
            attempts: 30,
            interval_secs: 2,
            timeout_secs: 5,
            grace_secs: 15,
            log_tail: 50,
            strict: false,
            extra_signatures: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            container_name: "rag-system".into(),
            image: "localhost/rag-system:latest".into(),
            containerfile: "Containerfile".into(),
            bind_address: "0.0.0.0".into(),
            host_port: 8080,
            container_port: 8080,
            env_file: ".env".into(),
            memory: "4g".into(),
            cpus: 2.0,
            restart_policy: RestartPolicy::UnlessStopped,
            userns: None,
            network_backend: None,
            socket: None,
            settle_secs: 2,
            build_timeout_secs: 1800,
            connectivity_probe: None,
            connectivity_interval_secs: 10,
            health: HealthConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(file))
            .merge(Json::file("rag-deploy.json"))
            .merge(Env::prefixed("RAG_DEPLOY_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Bind sources must be absolute or the API reads them as volume names.
        config.project_dir = std::path::absolute(&config.project_dir).map_err(|e| {
            anyhow::anyhow!("Invalid project_dir {}: {}", config.project_dir.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.health.attempts == 0 {
            anyhow::bail!("health.attempts must be at least 1");
        }
        if self.host_port == 0 || self.container_port == 0 {
            anyhow::bail!("ports must be non-zero");
        }
        if self.cpus.is_nan() || self.cpus <= 0.0 {
            anyhow::bail!("cpus must be positive, got {}", self.cpus);
        }
        parse_memory(&self.memory).map_err(|e| anyhow::anyhow!("Invalid memory limit: {}", e))?;
        Ok(())
    }

    pub fn containerfile_path(&self) -> PathBuf {
        self.project_dir.join(&self.containerfile)
    }

    pub fn env_file_path(&self) -> PathBuf {
        self.project_dir.join(&self.env_file)
    }

    /// Bind mounts in the fixed project layout.
    pub fn mounts(&self) -> Vec<VolumeMount> {
        let root = &self.project_dir;
        vec![
            VolumeMount::new(root.join("documents"), "/app/documents"),
            VolumeMount::new(root.join("data/chromadb"), "/app/data/chromadb").resettable(),
            VolumeMount::new(root.join("data/logs"), "/app/logs").optional(),
            VolumeMount::new(root.join("static"), "/app/static")
                .read_only()
                .optional(),
        ]
    }

    pub fn host_dirs(&self) -> Vec<PathBuf> {
        vec![self.project_dir.join("data/backups")]
    }

    /// Builds the immutable spec for this run. Reads the environment file.
    pub fn deployment_spec(&self) -> Result<DeploymentSpec, DeployError> {
        let env_path = self.env_file_path();
        let env = std::fs::read_to_string(&env_path)
            .map(|text| parse_env_file(&text))
            .map_err(|e| {
                DeployError::PrerequisiteMissing(vec![format!("{} ({})", env_path.display(), e)])
            })?;
        let memory_bytes = parse_memory(&self.memory)
            .map_err(|e| DeployError::PrerequisiteMissing(vec![format!("memory limit: {}", e)]))?;

        Ok(DeploymentSpec {
            name: self.container_name.clone(),
            image: self.image.clone(),
            bind_address: self.bind_address.clone(),
            port: PortMapping {
                host_port: self.host_port,
                container_port: self.container_port,
            },
            mounts: self.mounts(),
            host_dirs: self.host_dirs(),
            env,
            limits: ResourceLimits {
                memory_bytes,
                cpus: self.cpus,
            },
            restart: self.restart_policy,
            userns: self.userns.clone(),
        })
    }

    pub fn health_url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.host_port, self.health.path)
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            attempts: self.health.attempts,
            interval: Duration::from_secs(self.health.interval_secs),
            grace: Duration::from_secs(self.health.grace_secs),
            log_tail: self.health.log_tail,
        }
    }

    pub fn signatures(&self) -> SignatureSet {
        SignatureSet::storage_defaults().extend_patterns(self.health.extra_signatures.clone())
    }
}

/// `KEY=VALUE` lines; blank lines and `#` comments are skipped, values are
/// kept exactly as written.
pub fn parse_env_file(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim_start())
        .filter(|line| !line.is_empty() && !line.starts_with('#') && line.contains('='))
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect()
}

/// Parses sizes like `512m` or `4g` into bytes.
pub fn parse_memory(value: &str) -> Result<i64, String> {
    let value = value.trim().to_ascii_lowercase();
    let value = value.strip_suffix('b').unwrap_or(&value);
    let (digits, multiplier) = match value.chars().last() {
        Some('k') => (&value[..value.len() - 1], 1i64 << 10),
        Some('m') => (&value[..value.len() - 1], 1i64 << 20),
        Some('g') => (&value[..value.len() - 1], 1i64 << 30),
        Some(c) if c.is_ascii_digit() => (value, 1),
        _ => return Err(format!("unrecognised size '{}'", value)),
    };
    let amount: i64 = digits
        .parse()
        .map_err(|_| format!("unrecognised size '{}'", value))?;
    if amount <= 0 {
        return Err(format!("size must be positive, got '{}'", value));
    }
    amount
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("4g"), Ok(4 << 30));
        assert_eq!(parse_memory("512M"), Ok(512 << 20));
        assert_eq!(parse_memory("2gb"), Ok(2 << 30));
        assert_eq!(parse_memory("1048576"), Ok(1 << 20));
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("0g").is_err());
        assert!(parse_memory("").is_err());
    }

    #[test]
    fn test_parse_env_file_passthrough() {
        let text = "# RAG settings\nEMBEDDING_MODEL=all-MiniLM-L6-v2\n\nMIN_CONFIDENCE=0.3\r\n  CHUNK_SIZE=500\nnot a pair\nQUOTED=\"a b\"\n";
        assert_eq!(
            parse_env_file(text),
            vec![
                "EMBEDDING_MODEL=all-MiniLM-L6-v2",
                "MIN_CONFIDENCE=0.3",
                "CHUNK_SIZE=500",
                "QUOTED=\"a b\"",
            ]
        );
    }

    #[test]
    fn test_defaults() {
        Jail::expect_with(|_jail| {
            let config = Config::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.container_name, "rag-system");
            assert_eq!(config.host_port, 8080);
            assert_eq!(config.health.attempts, 30);
            assert_eq!(config.restart_policy, RestartPolicy::UnlessStopped);
            assert!(config.network_backend.is_none());
            assert_eq!(config.health_url(), "http://127.0.0.1:8080/health");
            assert!(config.project_dir.is_absolute());
            Ok(())
        });
    }

    #[test]
    fn test_bind_sources_are_absolute() {
        Jail::expect_with(|jail| {
            jail.set_env("RAG_DEPLOY_PROJECT_DIR", "site");

            let config = Config::load(None).map_err(|e| e.to_string())?;
            assert!(config.project_dir.is_absolute());
            assert!(config.project_dir.ends_with("site"));
            for bind in config.mounts().iter().map(|m| m.bind(false)) {
                assert!(bind.starts_with('/'), "relative bind source: {}", bind);
            }
            assert!(config.containerfile_path().is_absolute());
            Ok(())
        });
    }

    #[test]
    fn test_rejects_nan_cpus() {
        Jail::expect_with(|jail| {
            jail.set_env("RAG_DEPLOY_CPUS", "NaN");
            assert!(Config::load(None).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "rag-deploy.toml",
                r#"
                container_name = "docs-rag"
                host_port = 9090
                network_backend = "slirp4netns"
                restart_policy = "always"

                [health]
                attempts = 10
                "#,
            )?;
            jail.set_env("RAG_DEPLOY_HOST_PORT", "9191");
            jail.set_env("RAG_DEPLOY_HEALTH__STRICT", "true");

            let config = Config::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.container_name, "docs-rag");
            assert_eq!(config.host_port, 9191);
            assert_eq!(config.network_backend, Some(NetworkBackend::Slirp4netns));
            assert_eq!(config.restart_policy, RestartPolicy::Always);
            assert_eq!(config.health.attempts, 10);
            assert!(config.health.strict);
            assert_eq!(config.health.interval_secs, 2);
            Ok(())
        });
    }

    #[test]
    fn test_rejects_zero_attempts() {
        Jail::expect_with(|jail| {
            jail.set_env("RAG_DEPLOY_HEALTH__ATTEMPTS", "0");
            assert!(Config::load(None).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_deployment_spec_reads_env_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".env"), "LOG_LEVEL=INFO\n").unwrap();
        let config = Config {
            project_dir: tmp.path().to_path_buf(),
            ..Config::default()
        };

        let spec = config.deployment_spec().unwrap();
        assert_eq!(spec.env, vec!["LOG_LEVEL=INFO"]);
        assert_eq!(spec.limits.memory_bytes, 4 << 30);
        assert_eq!(spec.mounts.len(), 4);
        assert_eq!(spec.mounts[1].host_path, tmp.path().join("data/chromadb"));
        assert!(spec.mounts[1].resettable);
        assert_eq!(spec.host_dirs, vec![tmp.path().join("data/backups")]);
    }

    #[test]
    fn test_missing_env_file_is_prerequisite() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            project_dir: tmp.path().to_path_buf(),
            ..Config::default()
        };
        assert!(matches!(
            config.deployment_spec(),
            Err(DeployError::PrerequisiteMissing(_))
        ));
    }
}
