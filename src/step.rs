//! Step model: one Node's execution unit within a Job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::KV;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    #[default]
    Created,
    Ready,
    Running,
    Finished,
    Failed,
    Canceled,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Finished | StepState::Failed | StepState::Canceled | StepState::Skipped
        )
    }
}

/// The action a step performs: a `{bot, rule_id}` handler lookup key plus the
/// node's static parameters, merged over the step input before invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepAction {
    pub bot: String,
    pub rule_id: String,
    #[serde(default)]
    pub parameters: KV,
}

/// `node_id` and `depend_node_ids` are immutable after decomposition; the
/// scheduler mutates `state`/`input`, the step FSM mutates
/// `state`/`output`/`finished_at`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub job_id: String,
    pub node_id: String,
    #[serde(default)]
    pub depend_node_ids: Vec<String>,
    pub action: StepAction,
    #[serde(default)]
    pub state: StepState,
    #[serde(default)]
    pub input: KV,
    #[serde(default)]
    pub output: KV,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(job_id: &str, node_id: &str, action: StepAction, state: StepState) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            node_id: node_id.to_string(),
            action,
            state,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(StepState::Finished.is_terminal());
        assert!(StepState::Failed.is_terminal());
        assert!(StepState::Canceled.is_terminal());
        assert!(StepState::Skipped.is_terminal());
        assert!(!StepState::Created.is_terminal());
        assert!(!StepState::Ready.is_terminal());
        assert!(!StepState::Running.is_terminal());
    }
}
