//! Mounter implementations: host bind paths, docker named volumes and tmpfs.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::debug;
use uuid::Uuid;

use crate::error::FlowError;
use crate::task::{Mount, MountType};

use super::docker::run_docker;
use super::Mounter;

/// Bind mounts expose host directories; only sources under an allowed
/// prefix are accepted. An empty allowlist disables bind mounts entirely.
pub struct BindMounter {
    allowed: Vec<String>,
    // Per-source lock held across directory creation; the flag flips only
    // once the directory actually exists.
    sources: DashMap<String, Arc<Mutex<bool>>>,
}

impl BindMounter {
    pub fn new(allowed: Vec<String>) -> Self {
        Self {
            allowed,
            sources: DashMap::new(),
        }
    }
}

#[async_trait]
impl Mounter for BindMounter {
    async fn mount(&self, mount: &mut Mount) -> Result<(), FlowError> {
        if mount.target.is_empty() {
            return Err(FlowError::MountTargetRequired {
                mount_type: MountType::Bind,
            });
        }
        if mount.source.is_empty() {
            return Err(FlowError::MountSourceRequired {
                mount_type: MountType::Bind,
            });
        }
        if self.allowed.is_empty() {
            return Err(FlowError::BindMountsDisabled);
        }
        if !self.allowed.iter().any(|p| mount.source.starts_with(p)) {
            return Err(FlowError::MountSourceForbidden {
                mount_type: MountType::Bind,
            });
        }
        let slot = self
            .sources
            .entry(mount.source.clone())
            .or_insert_with(|| Arc::new(Mutex::new(false)))
            .clone();
        let mut prepared = slot
            .lock()
            .map_err(|_| FlowError::Execution("bind source lock poisoned".to_string()))?;
        if !*prepared {
            std::fs::create_dir_all(&mount.source)?;
            *prepared = true;
            debug!(source = %mount.source, "prepared bind source");
        }
        Ok(())
    }

    async fn unmount(&self, _mount: &Mount) -> Result<(), FlowError> {
        // Host directories outlive the task.
        Ok(())
    }
}

/// Named docker volumes, created fresh per mount and removed on unmount.
#[derive(Default)]
pub struct VolumeMounter {
    created: DashSet<String>,
}

impl VolumeMounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Mounter for VolumeMounter {
    async fn mount(&self, mount: &mut Mount) -> Result<(), FlowError> {
        if !mount.source.is_empty() {
            return Err(FlowError::MountSourceForbidden {
                mount_type: MountType::Volume,
            });
        }
        if mount.target.is_empty() {
            return Err(FlowError::MountTargetRequired {
                mount_type: MountType::Volume,
            });
        }
        let name = Uuid::new_v4().to_string();
        run_docker(&["volume", "create", &name]).await?;
        self.created.insert(name.clone());
        mount.source = name;
        debug!(volume = %mount.source, target = %mount.target, "created volume");
        Ok(())
    }

    async fn unmount(&self, mount: &Mount) -> Result<(), FlowError> {
        if mount.source.is_empty() {
            return Ok(());
        }
        if self.created.remove(&mount.source).is_none() {
            return Err(FlowError::UnknownVolume {
                name: mount.source.clone(),
            });
        }
        run_docker(&["volume", "rm", "-f", &mount.source]).await?;
        debug!(volume = %mount.source, "removed volume");
        Ok(())
    }
}

/// Tmpfs mounts are declared entirely by the container runtime; there is
/// nothing to prepare, only shape to validate.
#[derive(Default)]
pub struct TmpfsMounter;

impl TmpfsMounter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Mounter for TmpfsMounter {
    async fn mount(&self, mount: &mut Mount) -> Result<(), FlowError> {
        if !mount.source.is_empty() {
            return Err(FlowError::MountSourceForbidden {
                mount_type: MountType::Tmpfs,
            });
        }
        if mount.target.is_empty() {
            return Err(FlowError::MountTargetRequired {
                mount_type: MountType::Tmpfs,
            });
        }
        Ok(())
    }

    async fn unmount(&self, _mount: &Mount) -> Result<(), FlowError> {
        Ok(())
    }
}
