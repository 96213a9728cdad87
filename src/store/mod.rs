//! Persistence seam for jobs, steps, dags, workflows and triggers.
//!
//! The scheduler, manager and FSMs all talk through `Store`, so backends are
//! swappable. `MemoryStore` is the in-process implementation used by the CLI
//! and the test suite.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::dag::Dag;
use crate::error::FlowError;
use crate::job::{Job, JobState, Trigger, Workflow};
use crate::step::{Step, StepState};
use crate::types::KV;

#[async_trait]
pub trait Store: Send + Sync {
    // ── dags ────────────────────────────────────────────────────────────

    async fn create_dag(&self, dag: Dag) -> Result<(), FlowError>;
    async fn get_dag(&self, id: &str) -> Result<Dag, FlowError>;

    // ── jobs ────────────────────────────────────────────────────────────

    async fn create_job(&self, job: Job) -> Result<(), FlowError>;
    async fn get_job(&self, id: &str) -> Result<Job, FlowError>;
    async fn get_jobs_by_state(&self, state: JobState) -> Result<Vec<Job>, FlowError>;
    async fn update_job_state(&self, id: &str, state: JobState) -> Result<(), FlowError>;
    async fn update_job_started_at(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), FlowError>;
    async fn update_job_finished_at(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), FlowError>;

    // ── steps ───────────────────────────────────────────────────────────

    /// Create a batch of steps atomically: either all land or none do.
    async fn create_steps(&self, steps: &[Step]) -> Result<(), FlowError>;
    async fn get_step(&self, id: &str) -> Result<Step, FlowError>;
    async fn get_steps_by_job(&self, job_id: &str) -> Result<Vec<Step>, FlowError>;
    async fn get_steps_by_state(&self, state: StepState) -> Result<Vec<Step>, FlowError>;
    /// Steps of `job_id` whose node id is in `node_ids`, i.e. the direct
    /// parents of a pending step.
    async fn get_steps_by_depend(
        &self,
        job_id: &str,
        node_ids: &[String],
    ) -> Result<Vec<Step>, FlowError>;
    async fn update_step_state(&self, id: &str, state: StepState) -> Result<(), FlowError>;
    async fn update_step_input(&self, id: &str, input: KV) -> Result<(), FlowError>;
    async fn update_step_output(&self, id: &str, output: KV) -> Result<(), FlowError>;
    async fn update_step_error(&self, id: &str, error: &str) -> Result<(), FlowError>;
    async fn update_step_started_at(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), FlowError>;
    async fn update_step_finished_at(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), FlowError>;

    // ── workflows & triggers ────────────────────────────────────────────

    async fn create_workflow(&self, workflow: Workflow) -> Result<(), FlowError>;
    async fn get_workflow(&self, id: &str) -> Result<Workflow, FlowError>;
    /// Apply signed deltas to the workflow's run counters.
    async fn increase_workflow_count(
        &self,
        id: &str,
        successful: i64,
        failed: i64,
        running: i64,
        canceled: i64,
    ) -> Result<(), FlowError>;

    async fn create_trigger(&self, trigger: Trigger) -> Result<(), FlowError>;
    async fn list_triggers(&self) -> Result<Vec<Trigger>, FlowError>;
}
