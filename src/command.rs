//! Bounded-time execution of host helper programs (podman CLI, SELinux tools).

use std::process::{Output, Stdio};
use std::time::Duration;

use log::debug;
use tokio::process::Command;

use crate::error::CommandError;

/// Runs `program` to completion and returns its output regardless of exit status.
///
/// The child is killed if `timeout` elapses first.
pub async fn run_raw(program: &str, args: &[&str], timeout: Duration) -> Result<Output, CommandError> {
    debug!("exec: {} {}", program, args.join(" "));
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    tokio::select! {
        result = child => result.map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        }),
        _ = tokio::time::sleep(timeout) => Err(CommandError::Timeout {
            program: program.to_string(),
        }),
    }
}

/// Like [`run_raw`], but a non-zero exit is an error. Returns trimmed stdout.
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<String, CommandError> {
    let output = run_raw(program, args, timeout).await?;
    if !output.status.success() {
        return Err(CommandError::Failed {
            program: program.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
