//! YAML application configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::manager::ManagerIntervals;
use crate::runtime::RuntimeKind;
use crate::scheduler::SchedulerIntervals;
use crate::task::TaskLimits;
use crate::types::parse_duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub queue: QueueConfig,
    pub poll: PollConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, FlowError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub runtime: RuntimeKind,
    /// Default limits applied to tasks that don't set their own.
    pub limits: TaskLimits,
    pub docker: DockerConfig,
    pub shell: ShellConfig,
    pub mounts: MountsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Path to a YAML file mapping registry domains to credentials.
    pub credentials: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Interpreter prefix the task script is passed to.
    pub cmd: Vec<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            cmd: vec!["bash".to_string(), "-c".to_string()],
            uid: None,
            gid: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MountsConfig {
    pub bind: BindConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BindConfig {
    /// Host path prefixes bind mounts may use. Empty disables bind mounts.
    pub allowed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub concurrency: usize,
    /// Queue name -> weight. Empty means the standard four-queue layout.
    pub priorities: HashMap<String, u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            priorities: HashMap::new(),
        }
    }
}

/// Polling intervals as duration strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub push_step: String,
    pub depend_step: String,
    pub push_job: String,
    pub check_job: String,
    pub trigger_sync: String,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            push_step: "1s".to_string(),
            depend_step: "1s".to_string(),
            push_job: "1s".to_string(),
            check_job: "10s".to_string(),
            trigger_sync: "60s".to_string(),
        }
    }
}

impl PollConfig {
    pub fn scheduler_intervals(&self) -> Result<SchedulerIntervals, FlowError> {
        Ok(SchedulerIntervals {
            push: parse_duration(&self.push_step)?,
            depend: parse_duration(&self.depend_step)?,
        })
    }

    pub fn manager_intervals(&self) -> Result<ManagerIntervals, FlowError> {
        Ok(ManagerIntervals {
            push: parse_duration(&self.push_job)?,
            check: parse_duration(&self.check_job)?,
        })
    }

    pub fn trigger_sync_interval(&self) -> Result<Duration, FlowError> {
        parse_duration(&self.trigger_sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.engine.runtime, RuntimeKind::Docker);
        assert_eq!(cfg.queue.concurrency, 10);
        assert_eq!(cfg.engine.shell.cmd, vec!["bash", "-c"]);
        assert_eq!(
            cfg.poll.manager_intervals().unwrap().check,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn partial_document_overrides_selectively() {
        let cfg: AppConfig = serde_yaml::from_str(
            r#"
engine:
  runtime: shell
  shell:
    uid: 1000
    gid: 1000
  limits:
    cpus: "0.5"
queue:
  concurrency: 4
poll:
  check_job: 2s
"#,
        )
        .unwrap();
        assert_eq!(cfg.engine.runtime, RuntimeKind::Shell);
        assert_eq!(cfg.engine.shell.uid, Some(1000));
        assert_eq!(cfg.engine.limits.cpus.as_deref(), Some("0.5"));
        assert_eq!(cfg.queue.concurrency, 4);
        assert_eq!(
            cfg.poll.manager_intervals().unwrap().check,
            Duration::from_secs(2)
        );
        assert_eq!(
            cfg.poll.scheduler_intervals().unwrap().push,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn bad_interval_surfaces_on_parse() {
        let cfg: AppConfig = serde_yaml::from_str("poll: {check_job: soon}").unwrap();
        assert!(cfg.poll.manager_intervals().is_err());
    }
}
