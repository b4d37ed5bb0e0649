//! Host-side preparation of bind-mounted directories.
//!
//! Every step is conditional on the current on-disk state, so running the
//! preparer again without intervening changes does nothing.  Wiping a
//! mount's contents only happens in [`PrepareMode::Fix`].

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::fs;

use crate::command;
use crate::error::{CommandError, DeployError};
use crate::types::{MountMode, VolumeMount};

const READ_ONLY_MODE: u32 = 0o755;
const READ_WRITE_MODE: u32 = 0o775;
/// Fix mode opens writable mounts to any container uid mapping.
const FIX_MODE: u32 = 0o777;
const CONTAINER_FILE_TYPE: &str = "container_file_t";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareMode {
    Normal,
    /// Destructive: resettable mounts are emptied and permissions widened.
    Fix,
}

/// Applies the mandatory-access-control label containers need on a path.
#[async_trait]
pub trait SecurityLabeler: Send + Sync {
    /// Whether labels are enforced on this host at all.
    async fn enforcing(&self) -> bool;

    async fn label(&self, path: &Path) -> Result<(), CommandError>;
}

pub struct SelinuxLabeler {
    timeout: Duration,
}

impl SelinuxLabeler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SecurityLabeler for SelinuxLabeler {
    async fn enforcing(&self) -> bool {
        match command::run("getenforce", &[], self.timeout).await {
            Ok(mode) => mode == "Enforcing",
            Err(e) => {
                debug!("getenforce unavailable ({}); assuming no SELinux", e);
                false
            }
        }
    }

    async fn label(&self, path: &Path) -> Result<(), CommandError> {
        let path = path.to_string_lossy();
        command::run("chcon", &["-R", "-t", CONTAINER_FILE_TYPE, &path], self.timeout).await?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct PrepareReport {
    pub prepared: Vec<PathBuf>,
    /// Resettable mounts that were emptied (fix mode only).
    pub reset: Vec<PathBuf>,
    /// Optional mounts that could not be prepared; launch without them.
    pub unavailable: Vec<PathBuf>,
    /// Labeling failed somewhere; launch with labels disabled.
    pub labels_failed: bool,
    pub warnings: Vec<String>,
}

impl PrepareReport {
    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

pub struct ResourcePreparer<'a> {
    labeler: &'a dyn SecurityLabeler,
}

impl<'a> ResourcePreparer<'a> {
    pub fn new(labeler: &'a dyn SecurityLabeler) -> Self {
        Self { labeler }
    }

    pub async fn prepare(
        &self,
        mounts: &[VolumeMount],
        host_dirs: &[PathBuf],
        mode: PrepareMode,
    ) -> Result<PrepareReport, DeployError> {
        let mut report = PrepareReport::default();
        let enforcing = self.labeler.enforcing().await;
        if mode == PrepareMode::Fix {
            warn!("Fix mode: resettable directories will be emptied");
        }

        for mount in mounts {
            let path = &mount.host_path;
            if let Err(e) = self.prepare_mount(mount, mode, &mut report).await {
                if mount.optional {
                    report.warn(format!(
                        "Optional mount {} unavailable ({}); it will be skipped",
                        path.display(),
                        e
                    ));
                    report.unavailable.push(path.clone());
                    continue;
                }
                return Err(DeployError::ResourcePreparation {
                    path: path.clone(),
                    reason: e.to_string(),
                });
            }

            if enforcing && mount.relabel {
                if let Err(e) = self.labeler.label(path).await {
                    report.warn(format!(
                        "Could not label {} ({}); labels will be disabled for the container",
                        path.display(),
                        e
                    ));
                    report.labels_failed = true;
                }
            }
            report.prepared.push(path.clone());
        }

        for dir in host_dirs {
            prepare_host_dir(dir).await.map_err(|e| DeployError::ResourcePreparation {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
            report.prepared.push(dir.clone());
        }

        info!(
            "Prepared {} director{}",
            report.prepared.len(),
            if report.prepared.len() == 1 { "y" } else { "ies" }
        );
        Ok(report)
    }

    async fn prepare_mount(
        &self,
        mount: &VolumeMount,
        mode: PrepareMode,
        report: &mut PrepareReport,
    ) -> io::Result<()> {
        let path = &mount.host_path;
        let created = ensure_dir(path).await?;
        if mode == PrepareMode::Fix && mount.resettable {
            clear_dir(path).await?;
            info!("Reset contents of {}", path.display());
            report.reset.push(path.clone());
        }
        ensure_mode(path, target_mode(mount.mode, mode), created).await
    }
}

fn target_mode(mount: MountMode, mode: PrepareMode) -> u32 {
    match (mount, mode) {
        (MountMode::ReadOnly, _) => READ_ONLY_MODE,
        (MountMode::ReadWrite, PrepareMode::Normal) => READ_WRITE_MODE,
        (MountMode::ReadWrite, PrepareMode::Fix) => FIX_MODE,
    }
}

/// Returns whether the directory had to be created.
async fn ensure_dir(path: &Path) -> io::Result<bool> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(false),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a directory",
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Creating {}", path.display());
            fs::create_dir_all(path).await?;
            Ok(true)
        }
        Err(e) => Err(e),
    }
}

async fn prepare_host_dir(path: &Path) -> io::Result<()> {
    let created = ensure_dir(path).await?;
    ensure_mode(path, READ_ONLY_MODE, created).await
}

/// New directories get exactly `mode`. Existing ones only gain the missing
/// bits, so a wider mode left by fix mode survives later deploys.
async fn ensure_mode(path: &Path, mode: u32, created: bool) -> io::Result<()> {
    let current = fs::metadata(path).await?.permissions().mode() & 0o777;
    let target = if created { mode } else { current | mode };
    if current != target {
        debug!("chmod {:o} -> {:o} {}", current, target, path.display());
        fs::set_permissions(path, std::fs::Permissions::from_mode(target)).await?;
    }
    Ok(())
}

async fn clear_dir(path: &Path) -> io::Result<()> {
    let mut entries = fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let entry_path = entry.path();
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&entry_path).await?;
        } else {
            fs::remove_file(&entry_path).await?;
        }
    }
    Ok(())
}

/// Scriptable labeler for tests.
#[cfg(test)]
pub struct StubLabeler {
    pub enforcing: bool,
    pub fail: bool,
    pub labeled: std::sync::Mutex<Vec<PathBuf>>,
}

#[cfg(test)]
impl StubLabeler {
    pub fn disabled() -> Self {
        Self {
            enforcing: false,
            fail: false,
            labeled: Default::default(),
        }
    }

    pub fn active(fail: bool) -> Self {
        Self {
            enforcing: true,
            fail,
            labeled: Default::default(),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl SecurityLabeler for StubLabeler {
    async fn enforcing(&self) -> bool {
        self.enforcing
    }

    async fn label(&self, path: &Path) -> Result<(), CommandError> {
        self.labeled.lock().unwrap().push(path.to_path_buf());
        if self.fail {
            return Err(CommandError::Failed {
                program: "chcon".into(),
                code: Some(1),
                stderr: "Operation not permitted".into(),
            });
        }
        Ok(())
    }
}
