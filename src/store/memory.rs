//! In-memory `Store` backed by `DashMap`s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;

use crate::dag::Dag;
use crate::error::FlowError;
use crate::job::{Job, JobState, Trigger, Workflow};
use crate::step::{Step, StepState};
use crate::types::KV;

use super::Store;

#[derive(Default)]
pub struct MemoryStore {
    dags: DashMap<String, Dag>,
    jobs: DashMap<String, Job>,
    steps: DashMap<String, Step>,
    workflows: DashMap<String, Workflow>,
    triggers: DashMap<String, Trigger>,
    // Serializes step batch creation so a batch lands all-or-nothing.
    step_batch: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn missing(kind: &str, id: &str) -> FlowError {
        FlowError::Store(format!("{kind} not found: {id}"))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_dag(&self, dag: Dag) -> Result<(), FlowError> {
        self.dags.insert(dag.id.clone(), dag);
        Ok(())
    }

    async fn get_dag(&self, id: &str) -> Result<Dag, FlowError> {
        self.dags
            .get(id)
            .map(|d| d.clone())
            .ok_or_else(|| Self::missing("dag", id))
    }

    async fn create_job(&self, job: Job) -> Result<(), FlowError> {
        self.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Job, FlowError> {
        self.jobs
            .get(id)
            .map(|j| j.clone())
            .ok_or_else(|| Self::missing("job", id))
    }

    async fn get_jobs_by_state(&self, state: JobState) -> Result<Vec<Job>, FlowError> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.state == state)
            .map(|j| j.clone())
            .collect())
    }

    async fn update_job_state(&self, id: &str, state: JobState) -> Result<(), FlowError> {
        let mut job = self.jobs.get_mut(id).ok_or_else(|| Self::missing("job", id))?;
        job.state = state;
        Ok(())
    }

    async fn update_job_started_at(&self, id: &str, at: DateTime<Utc>) -> Result<(), FlowError> {
        let mut job = self.jobs.get_mut(id).ok_or_else(|| Self::missing("job", id))?;
        job.started_at = Some(at);
        Ok(())
    }

    async fn update_job_finished_at(&self, id: &str, at: DateTime<Utc>) -> Result<(), FlowError> {
        let mut job = self.jobs.get_mut(id).ok_or_else(|| Self::missing("job", id))?;
        job.finished_at = Some(at);
        Ok(())
    }

    async fn create_steps(&self, steps: &[Step]) -> Result<(), FlowError> {
        let _guard = self
            .step_batch
            .lock()
            .map_err(|_| FlowError::Store("step batch lock poisoned".to_string()))?;
        for step in steps {
            if self.steps.contains_key(&step.id) {
                return Err(FlowError::Store(format!(
                    "step already exists: {}",
                    step.id
                )));
            }
        }
        for step in steps {
            self.steps.insert(step.id.clone(), step.clone());
        }
        Ok(())
    }

    async fn get_step(&self, id: &str) -> Result<Step, FlowError> {
        self.steps
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| Self::missing("step", id))
    }

    async fn get_steps_by_job(&self, job_id: &str) -> Result<Vec<Step>, FlowError> {
        Ok(self
            .steps
            .iter()
            .filter(|s| s.job_id == job_id)
            .map(|s| s.clone())
            .collect())
    }

    async fn get_steps_by_state(&self, state: StepState) -> Result<Vec<Step>, FlowError> {
        Ok(self
            .steps
            .iter()
            .filter(|s| s.state == state)
            .map(|s| s.clone())
            .collect())
    }

    async fn get_steps_by_depend(
        &self,
        job_id: &str,
        node_ids: &[String],
    ) -> Result<Vec<Step>, FlowError> {
        Ok(self
            .steps
            .iter()
            .filter(|s| s.job_id == job_id && node_ids.contains(&s.node_id))
            .map(|s| s.clone())
            .collect())
    }

    async fn update_step_state(&self, id: &str, state: StepState) -> Result<(), FlowError> {
        let mut step = self
            .steps
            .get_mut(id)
            .ok_or_else(|| Self::missing("step", id))?;
        step.state = state;
        Ok(())
    }

    async fn update_step_input(&self, id: &str, input: KV) -> Result<(), FlowError> {
        let mut step = self
            .steps
            .get_mut(id)
            .ok_or_else(|| Self::missing("step", id))?;
        step.input = input;
        Ok(())
    }

    async fn update_step_output(&self, id: &str, output: KV) -> Result<(), FlowError> {
        let mut step = self
            .steps
            .get_mut(id)
            .ok_or_else(|| Self::missing("step", id))?;
        step.output = output;
        Ok(())
    }

    async fn update_step_error(&self, id: &str, error: &str) -> Result<(), FlowError> {
        let mut step = self
            .steps
            .get_mut(id)
            .ok_or_else(|| Self::missing("step", id))?;
        step.error = Some(error.to_string());
        Ok(())
    }

    async fn update_step_started_at(&self, id: &str, at: DateTime<Utc>) -> Result<(), FlowError> {
        let mut step = self
            .steps
            .get_mut(id)
            .ok_or_else(|| Self::missing("step", id))?;
        step.started_at = Some(at);
        Ok(())
    }

    async fn update_step_finished_at(&self, id: &str, at: DateTime<Utc>) -> Result<(), FlowError> {
        let mut step = self
            .steps
            .get_mut(id)
            .ok_or_else(|| Self::missing("step", id))?;
        step.finished_at = Some(at);
        Ok(())
    }

    async fn create_workflow(&self, workflow: Workflow) -> Result<(), FlowError> {
        self.workflows.insert(workflow.id.clone(), workflow);
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Workflow, FlowError> {
        self.workflows
            .get(id)
            .map(|w| w.clone())
            .ok_or_else(|| Self::missing("workflow", id))
    }

    async fn increase_workflow_count(
        &self,
        id: &str,
        successful: i64,
        failed: i64,
        running: i64,
        canceled: i64,
    ) -> Result<(), FlowError> {
        let mut wf = self
            .workflows
            .get_mut(id)
            .ok_or_else(|| Self::missing("workflow", id))?;
        wf.counters.successful += successful;
        wf.counters.failed += failed;
        wf.counters.running += running;
        wf.counters.canceled += canceled;
        Ok(())
    }

    async fn create_trigger(&self, trigger: Trigger) -> Result<(), FlowError> {
        self.triggers.insert(trigger.id.clone(), trigger);
        Ok(())
    }

    async fn list_triggers(&self) -> Result<Vec<Trigger>, FlowError> {
        Ok(self.triggers.iter().map(|t| t.clone()).collect())
    }
}
