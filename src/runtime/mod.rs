//! Execution runtime backends and the mount abstraction.
//!
//! A `Runtime` executes one `Task` in isolation, in a container or as a
//! restricted local process, and a `Mounter` prepares the filesystem
//! resources a task asks for. Both are trait objects so the engine stays
//! backend-agnostic.

pub mod docker;
pub mod mounts;
pub mod shell;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::FlowError;
use crate::task::{Mount, MountType, Task};

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Execute `task` to completion, updating its state, result and
    /// timestamps in place. Cancellation via `token` stops the task.
    async fn run(&self, token: CancellationToken, task: &mut Task) -> Result<(), FlowError>;

    /// Stop a running task.
    async fn stop(&self, task: &Task) -> Result<(), FlowError>;

    /// Verify the backend is usable.
    async fn health_check(&self) -> Result<(), FlowError>;
}

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Prepare the mount, filling in `source` where the backend generates it.
    async fn mount(&self, mount: &mut Mount) -> Result<(), FlowError>;
    async fn unmount(&self, mount: &Mount) -> Result<(), FlowError>;
}

/// Dispatches mount/unmount calls by mount type.
#[derive(Default)]
pub struct MounterRegistry {
    mounters: DashMap<MountType, Arc<dyn Mounter>>,
}

impl MounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, mount_type: MountType, mounter: Arc<dyn Mounter>) {
        self.mounters.insert(mount_type, mounter);
    }

    pub async fn mount(&self, mount: &mut Mount) -> Result<(), FlowError> {
        self.resolve(mount.mount_type)?.mount(mount).await
    }

    pub async fn unmount(&self, mount: &Mount) -> Result<(), FlowError> {
        self.resolve(mount.mount_type)?.unmount(mount).await
    }

    fn resolve(&self, mount_type: MountType) -> Result<Arc<dyn Mounter>, FlowError> {
        self.mounters
            .get(&mount_type)
            .map(|m| m.clone())
            .ok_or_else(|| FlowError::Execution(format!("no mounter for type {mount_type}")))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Shell,
}

/// Build the configured runtime with its mounters wired in.
pub fn build_runtime(cfg: &EngineConfig) -> Result<Arc<dyn Runtime>, FlowError> {
    match cfg.runtime {
        RuntimeKind::Docker => {
            let registry = Arc::new(MounterRegistry::new());
            registry.register(
                MountType::Bind,
                Arc::new(mounts::BindMounter::new(cfg.mounts.bind.allowed.clone())),
            );
            registry.register(MountType::Volume, Arc::new(mounts::VolumeMounter::new()));
            registry.register(MountType::Tmpfs, Arc::new(mounts::TmpfsMounter::new()));
            Ok(Arc::new(docker::DockerRuntime::new(
                registry,
                cfg.docker.credentials.clone(),
            )))
        }
        RuntimeKind::Shell => Ok(Arc::new(shell::ShellRuntime::new(
            cfg.shell.cmd.clone(),
            cfg.shell.uid,
            cfg.shell.gid,
        ))),
    }
}

/// Parse a cpu limit like `"0.5"` into docker NanoCPUs.
pub fn parse_cpus(value: &str) -> Result<u64, FlowError> {
    let cpus: f64 = value.trim().parse().map_err(|_| FlowError::InvalidCpus {
        value: value.to_string(),
    })?;
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(FlowError::InvalidCpus {
            value: value.to_string(),
        });
    }
    Ok((cpus * 1_000_000_000.0) as u64)
}

/// Parse a memory limit like `"512m"` or `"2g"` into bytes. A bare number
/// is bytes.
pub fn parse_memory(value: &str) -> Result<i64, FlowError> {
    let value = value.trim().to_ascii_lowercase();
    if value.is_empty() {
        return Err(FlowError::InvalidMemory { value });
    }
    let (number, multiplier) = if let Some(n) = value.strip_suffix("kb").or(value.strip_suffix('k'))
    {
        (n, 1024_i64)
    } else if let Some(n) = value.strip_suffix("mb").or(value.strip_suffix('m')) {
        (n, 1024 * 1024)
    } else if let Some(n) = value.strip_suffix("gb").or(value.strip_suffix('g')) {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = value.strip_suffix('b') {
        (n, 1)
    } else {
        (value.as_str(), 1)
    };
    let number: i64 = number.trim().parse().map_err(|_| FlowError::InvalidMemory {
        value: value.clone(),
    })?;
    if number <= 0 {
        return Err(FlowError::InvalidMemory { value });
    }
    Ok(number * multiplier)
}
