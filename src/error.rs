//! Error taxonomy for the deployment pipeline.
//!
//! Only failures that abort the run are errors.  Problems the pipeline can
//! absorb (label fallbacks, a health timeout, a degraded remediation) are
//! carried as values in the step reports instead.

use std::path::PathBuf;

use thiserror::Error;

/// Failure of a single container runtime operation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container API error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("runtime command failed: {0}")]
    Command(#[from] CommandError),

    #[error("no such container: {0}")]
    NotFound(String),

    #[error("unexpected runtime output: {0}")]
    Parse(String),

    #[error("{0}")]
    Rejected(String),
}

/// Failure running a host-side helper program.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out")]
    Timeout { program: String },

    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Both launch strategies failed.
#[derive(Debug, Error)]
#[error("launch failed after {attempts} attempt(s): {last_error}")]
pub struct LaunchError {
    pub attempts: u32,
    pub last_error: String,
    /// Container log tail captured after the last attempt, if any.
    pub logs: Option<String>,
}

/// Fatal outcome of a deployment.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("missing prerequisites: {}", .0.join(", "))]
    PrerequisiteMissing(Vec<String>),

    #[error("could not prepare {path}: {reason}")]
    ResourcePreparation { path: PathBuf, reason: String },

    #[error("image build failed: {0}")]
    Build(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl DeployError {
    /// Log text already captured while the error was produced.
    pub fn captured_logs(&self) -> Option<&str> {
        match self {
            DeployError::Launch(e) => e.logs.as_deref(),
            _ => None,
        }
    }
}
