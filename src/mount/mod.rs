//! Mount Watcher
//!
//! Makes sure the removable media is attached and populated before any
//! asset-dependent component starts. A mount point that is mounted but
//! still empty counts as not ready: the mount call can return before the
//! filesystem is readable.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::ConditionConfig;
use crate::logging::OutcomeLog;
use crate::readiness::{Probe, ReadinessCondition, ReadinessError, ReadinessGate};

#[derive(Debug, Error)]
pub enum MountError {
    #[error("mount of {device:?} on {mount_point:?} failed: {reason}")]
    CommandFailed {
        device: PathBuf,
        mount_point: PathBuf,
        reason: String,
    },
    #[error("mount point {0:?} could not be prepared: {1}")]
    MountPoint(PathBuf, std::io::Error),
    #[error(transparent)]
    NotReady(#[from] ReadinessError),
}

/// Performs the actual mount
#[async_trait]
pub trait Mounter: Send + Sync {
    async fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), MountError>;
}

/// Mounts through the system `mount` binary
#[derive(Debug, Clone, Default)]
pub struct SystemMounter;

#[async_trait]
impl Mounter for SystemMounter {
    async fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), MountError> {
        let output = Command::new("mount")
            .arg(device)
            .arg(mount_point)
            .output()
            .await
            .map_err(|e| MountError::CommandFailed {
                device: device.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(MountError::CommandFailed {
                device: device.to_path_buf(),
                mount_point: mount_point.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Probe satisfied once the mount point is mounted, a directory and non-empty
#[derive(Debug, Clone)]
pub struct MountProbe {
    mounts_table: PathBuf,
    mount_point: PathBuf,
}

impl MountProbe {
    pub fn new(mounts_table: impl Into<PathBuf>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mounts_table: mounts_table.into(),
            mount_point: mount_point.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        is_mounted(&self.mounts_table, &self.mount_point) && has_entries(&self.mount_point)
    }
}

#[async_trait]
impl Probe for MountProbe {
    async fn check(&self) -> bool {
        self.is_ready()
    }
}

pub struct MountWatcher {
    mounts_table: PathBuf,
    mounter: Arc<dyn Mounter>,
    condition: ConditionConfig,
    log: OutcomeLog,
}

impl MountWatcher {
    pub fn new(
        mounts_table: impl Into<PathBuf>,
        mounter: Arc<dyn Mounter>,
        condition: ConditionConfig,
        log: OutcomeLog,
    ) -> Self {
        Self {
            mounts_table: mounts_table.into(),
            mounter,
            condition,
            log,
        }
    }

    pub fn is_mounted(&self, mount_point: &Path) -> bool {
        is_mounted(&self.mounts_table, mount_point)
    }

    pub fn probe(&self, mount_point: &Path) -> MountProbe {
        MountProbe::new(self.mounts_table.clone(), mount_point)
    }

    /// Mount `device` on `mount_point` unless something is already mounted
    /// there, then wait until the mount is populated. Without a device the
    /// mount is left to the system automounter and only waited for.
    pub async fn ensure_mounted(
        &self,
        device: Option<&Path>,
        mount_point: &Path,
    ) -> Result<(), MountError> {
        if self.is_mounted(mount_point) {
            debug!("{:?} already mounted", mount_point);
        } else if let Some(device) = device {
            fs::create_dir_all(mount_point)
                .map_err(|e| MountError::MountPoint(mount_point.to_path_buf(), e))?;
            self.log.started(format!("mounting {:?} on {:?}", device, mount_point));
            if let Err(e) = self.mounter.mount(device, mount_point).await {
                self.log.failed(&e);
                return Err(e);
            }
        }

        let mut gate = ReadinessGate::new(self.log).with(ReadinessCondition::required(
            format!("mount:{}", mount_point.display()),
            Arc::new(self.probe(mount_point)),
            self.condition.timeout(),
            self.condition.poll_interval(),
        ));
        gate.wait_all().await?;
        self.log.succeeded(format!("{:?} mounted and populated", mount_point));
        Ok(())
    }
}

fn is_mounted(mounts_table: &Path, mount_point: &Path) -> bool {
    let Ok(table) = fs::read_to_string(mounts_table) else {
        return false;
    };
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|target| Path::new(&decode_mount_field(target)) == mount_point)
}

fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Undo the octal escaping (`\040` for space) used by the kernel mount table
fn decode_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
