//! Job, Workflow and Trigger models.
//!
//! A Job is one runtime instantiation of a Dag, owning a batch of Steps
//! created atomically at its `run` transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Created,
    Ready,
    Start,
    Finished,
    Canceled,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Canceled | JobState::Failed
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub workflow_id: String,
    pub dag_id: String,
    #[serde(default)]
    pub trigger_id: String,
    #[serde(default)]
    pub script_version: i32,
    #[serde(default)]
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh Job in `ready` state, eligible for dispatch by the manager.
    pub fn ready(workflow_id: &str, dag_id: &str, trigger_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            dag_id: dag_id.to_string(),
            trigger_id: trigger_id.to_string(),
            state: JobState::Ready,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    #[default]
    Enabled,
    Disabled,
}

/// Aggregate run counters maintained on each terminal Job transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCounters {
    pub successful: i64,
    pub failed: i64,
    pub running: i64,
    pub canceled: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub dag_id: String,
    #[serde(default)]
    pub state: WorkflowState,
    #[serde(default)]
    pub counters: WorkflowCounters,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerState {
    #[default]
    Enabled,
    Disabled,
}

/// A scheduled trigger: fires every `schedule` interval (duration string) and
/// creates a ready Job for its workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub workflow_id: String,
    /// Interval duration string, e.g. "30s" or "5m". Empty disables firing.
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub state: TriggerState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(JobState::Finished.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Canceled.is_terminal());
        assert!(!JobState::Ready.is_terminal());
        assert!(!JobState::Start.is_terminal());
    }

    #[test]
    fn ready_job_has_fresh_id() {
        let a = Job::ready("wf", "dag", "trig");
        let b = Job::ready("wf", "dag", "trig");
        assert_ne!(a.id, b.id);
        assert_eq!(a.state, JobState::Ready);
    }
}
