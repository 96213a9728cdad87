//! Job and Step state machines.
//!
//! Transitions are table-driven: an event either maps the current state to
//! exactly one next state or the call fails with `InvalidTransition`. Side
//! effects (step creation, store updates, workflow counters) happen inside
//! the transition methods so callers can't advance state without them.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::dag::decompose;
use crate::error::FlowError;
use crate::handler::{HandlerRegistry, StepContext};
use crate::job::{Job, JobState};
use crate::step::{Step, StepState};
use crate::store::Store;
use crate::types::KV;

pub struct TransitionTable<S, E> {
    machine: &'static str,
    rules: Vec<(E, S, S)>,
}

impl<S, E> TransitionTable<S, E>
where
    S: Copy + PartialEq + std::fmt::Debug,
    E: Copy + PartialEq + std::fmt::Debug,
{
    pub fn new(machine: &'static str, rules: Vec<(E, S, S)>) -> Self {
        Self { machine, rules }
    }

    pub fn next(&self, state: S, event: E) -> Result<S, FlowError> {
        self.rules
            .iter()
            .find(|(e, src, _)| *e == event && *src == state)
            .map(|(_, _, dst)| *dst)
            .ok_or_else(|| FlowError::InvalidTransition {
                machine: self.machine,
                state: format!("{state:?}").to_lowercase(),
                event: format!("{event:?}").to_lowercase(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    Run,
    Success,
    Error,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Bind,
    Run,
    Success,
    Error,
    Cancel,
    Skip,
}

fn job_table() -> TransitionTable<JobState, JobEvent> {
    use JobEvent::*;
    use JobState::*;
    TransitionTable::new(
        "job",
        vec![
            (Run, Ready, Start),
            (Success, Start, Finished),
            (Error, Start, Failed),
            (Cancel, Ready, Canceled),
            (Cancel, Start, Canceled),
        ],
    )
}

fn step_table() -> TransitionTable<StepState, StepEvent> {
    use StepEvent::*;
    use StepState::*;
    TransitionTable::new(
        "step",
        vec![
            (Bind, Created, Ready),
            (Run, Ready, Running),
            (Success, Running, Finished),
            (Error, Running, Failed),
            (Error, Created, Failed),
            (Cancel, Created, Canceled),
            (Cancel, Ready, Canceled),
            (Cancel, Running, Canceled),
            (Skip, Created, Skipped),
        ],
    )
}

// ───────────────────────── job fsm ─────────────────────────

pub struct JobFsm {
    table: TransitionTable<JobState, JobEvent>,
    store: Arc<dyn Store>,
}

impl JobFsm {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            table: job_table(),
            store,
        }
    }

    /// `ready -> start`: decompose the job's dag and create its step batch.
    ///
    /// Re-delivery safe: if the job already has steps, creation is skipped
    /// and only the state advance is re-applied.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn run(&self, job: &mut Job) -> Result<(), FlowError> {
        let next = self.table.next(job.state, JobEvent::Run)?;

        let existing = self.store.get_steps_by_job(&job.id).await?;
        if existing.is_empty() {
            let dag = self.store.get_dag(&job.dag_id).await?;
            let mut steps = decompose(&dag, &job.id)?;
            let now = Utc::now();
            for step in &mut steps {
                if step.state == StepState::Ready {
                    step.started_at = Some(now);
                }
            }
            self.store.create_steps(&steps).await?;
            debug!(count = steps.len(), "created step batch");
        } else {
            debug!(count = existing.len(), "steps already exist, skipping creation");
        }

        let now = Utc::now();
        self.store.update_job_state(&job.id, next).await?;
        self.store.update_job_started_at(&job.id, now).await?;
        self.store
            .increase_workflow_count(&job.workflow_id, 0, 0, 1, 0)
            .await?;
        job.state = next;
        job.started_at = Some(now);
        Ok(())
    }

    /// `start -> finished`. `finished_at` defaults to now; the manager passes
    /// the latest step finish time instead.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn success(
        &self,
        job: &mut Job,
        finished_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), FlowError> {
        let next = self.table.next(job.state, JobEvent::Success)?;
        let at = finished_at.unwrap_or_else(Utc::now);
        self.store.update_job_state(&job.id, next).await?;
        self.store.update_job_finished_at(&job.id, at).await?;
        self.store
            .increase_workflow_count(&job.workflow_id, 1, 0, -1, 0)
            .await?;
        job.state = next;
        job.finished_at = Some(at);
        Ok(())
    }

    /// `start -> failed`.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn error(&self, job: &mut Job) -> Result<(), FlowError> {
        let next = self.table.next(job.state, JobEvent::Error)?;
        let now = Utc::now();
        self.store.update_job_state(&job.id, next).await?;
        self.store.update_job_finished_at(&job.id, now).await?;
        self.store
            .increase_workflow_count(&job.workflow_id, 0, 1, -1, 0)
            .await?;
        job.state = next;
        job.finished_at = Some(now);
        Ok(())
    }

    /// `ready|start -> canceled`. The running counter is only decremented if
    /// the job had actually started.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn cancel(&self, job: &mut Job) -> Result<(), FlowError> {
        let was_started = job.state == JobState::Start;
        let next = self.table.next(job.state, JobEvent::Cancel)?;
        let now = Utc::now();
        self.store.update_job_state(&job.id, next).await?;
        self.store.update_job_finished_at(&job.id, now).await?;
        let running = if was_started { -1 } else { 0 };
        self.store
            .increase_workflow_count(&job.workflow_id, 0, 0, running, 1)
            .await?;
        job.state = next;
        job.finished_at = Some(now);
        Ok(())
    }
}

// ───────────────────────── step fsm ─────────────────────────

pub struct StepFsm {
    table: TransitionTable<StepState, StepEvent>,
    store: Arc<dyn Store>,
    handlers: Arc<HandlerRegistry>,
}

impl StepFsm {
    pub fn new(store: Arc<dyn Store>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            table: step_table(),
            store,
            handlers,
        }
    }

    /// `created -> ready`: attach the merged parent outputs as input.
    #[instrument(skip(self, step, input), fields(step_id = %step.id, node_id = %step.node_id))]
    pub async fn bind(&self, step: &mut Step, input: KV) -> Result<(), FlowError> {
        let next = self.table.next(step.state, StepEvent::Bind)?;
        let now = Utc::now();
        self.store.update_step_input(&step.id, input.clone()).await?;
        self.store.update_step_state(&step.id, next).await?;
        self.store.update_step_started_at(&step.id, now).await?;
        step.input = input;
        step.state = next;
        step.started_at = Some(now);
        Ok(())
    }

    /// `ready -> running`: invoke the step's handler with
    /// `input merged-with parameters` (parameters win) and record the output.
    #[instrument(skip(self, step), fields(step_id = %step.id, node_id = %step.node_id, bot = %step.action.bot, rule_id = %step.action.rule_id))]
    pub async fn run(&self, step: &mut Step) -> Result<(), FlowError> {
        let next = self.table.next(step.state, StepEvent::Run)?;
        self.store.update_step_state(&step.id, next).await?;
        step.state = next;

        let handler = self
            .handlers
            .resolve(&step.action.bot, &step.action.rule_id)?;
        let ctx = StepContext {
            job_id: step.job_id.clone(),
            node_id: step.node_id.clone(),
            bot: step.action.bot.clone(),
            rule_id: step.action.rule_id.clone(),
        };
        let merged = step.input.clone().merge(step.action.parameters.clone());
        let output = handler.call(ctx, merged).await?;
        self.store.update_step_output(&step.id, output.clone()).await?;
        step.output = output;
        Ok(())
    }

    /// `running -> finished`.
    #[instrument(skip(self, step), fields(step_id = %step.id))]
    pub async fn success(&self, step: &mut Step) -> Result<(), FlowError> {
        let next = self.table.next(step.state, StepEvent::Success)?;
        let now = Utc::now();
        self.store.update_step_state(&step.id, next).await?;
        self.store.update_step_finished_at(&step.id, now).await?;
        step.state = next;
        step.finished_at = Some(now);
        Ok(())
    }

    /// `running|created -> failed`, recording the error text. The created
    /// path is dependency propagation: a failed parent fails the child.
    #[instrument(skip(self, step), fields(step_id = %step.id))]
    pub async fn error(&self, step: &mut Step, error: &str) -> Result<(), FlowError> {
        let next = self.table.next(step.state, StepEvent::Error)?;
        let now = Utc::now();
        self.store.update_step_state(&step.id, next).await?;
        self.store.update_step_error(&step.id, error).await?;
        self.store.update_step_finished_at(&step.id, now).await?;
        step.state = next;
        step.error = Some(error.to_string());
        step.finished_at = Some(now);
        Ok(())
    }

    /// `created|ready|running -> canceled`, used when an upstream step was
    /// canceled.
    #[instrument(skip(self, step), fields(step_id = %step.id))]
    pub async fn cancel(&self, step: &mut Step) -> Result<(), FlowError> {
        let next = self.table.next(step.state, StepEvent::Cancel)?;
        let now = Utc::now();
        self.store.update_step_state(&step.id, next).await?;
        self.store.update_step_finished_at(&step.id, now).await?;
        step.state = next;
        step.finished_at = Some(now);
        Ok(())
    }

    /// `created -> skipped`, used when an upstream step was skipped.
    #[instrument(skip(self, step), fields(step_id = %step.id))]
    pub async fn skip(&self, step: &mut Step) -> Result<(), FlowError> {
        let next = self.table.next(step.state, StepEvent::Skip)?;
        let now = Utc::now();
        self.store.update_step_state(&step.id, next).await?;
        self.store.update_step_finished_at(&step.id, now).await?;
        step.state = next;
        step.finished_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Dag, Edge, Node};
    use crate::job::Workflow;
    use crate::step::StepAction;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn two_node_dag() -> Dag {
        Dag {
            id: "dag-1".to_string(),
            nodes: vec![
                Node {
                    id: "a".to_string(),
                    bot: "test".to_string(),
                    rule_id: "echo".to_string(),
                    parameters: KV::new(),
                },
                Node {
                    id: "b".to_string(),
                    bot: "test".to_string(),
                    rule_id: "echo".to_string(),
                    parameters: KV::new(),
                },
            ],
            edges: vec![Edge {
                source: "a".to_string(),
                target: "b".to_string(),
            }],
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.create_dag(two_node_dag()).await.unwrap();
        store
            .create_workflow(Workflow {
                id: "wf".to_string(),
                dag_id: "dag-1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn job_run_creates_steps_and_starts() {
        let store = seeded_store().await;
        let fsm = JobFsm::new(store.clone());
        let mut job = Job::ready("wf", "dag-1", "");
        store.create_job(job.clone()).await.unwrap();

        fsm.run(&mut job).await.unwrap();
        assert_eq!(job.state, JobState::Start);
        assert!(job.started_at.is_some());

        let steps = store.get_steps_by_job(&job.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        let wf = store.get_workflow("wf").await.unwrap();
        assert_eq!(wf.counters.running, 1);
    }

    #[tokio::test]
    async fn job_run_redelivery_does_not_duplicate_steps() {
        let store = seeded_store().await;
        let fsm = JobFsm::new(store.clone());
        let mut job = Job::ready("wf", "dag-1", "");
        store.create_job(job.clone()).await.unwrap();
        fsm.run(&mut job).await.unwrap();

        // A duplicate delivery sees the job still in ready state in its
        // payload; the steps must not be created twice.
        let mut stale = job.clone();
        stale.state = JobState::Ready;
        fsm.run(&mut stale).await.unwrap();
        assert_eq!(store.get_steps_by_job(&job.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn job_run_from_start_is_invalid() {
        let store = seeded_store().await;
        let fsm = JobFsm::new(store.clone());
        let mut job = Job::ready("wf", "dag-1", "");
        job.state = JobState::Start;
        assert!(matches!(
            fsm.run(&mut job).await,
            Err(FlowError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn job_terminal_transitions_update_counters() {
        let store = seeded_store().await;
        let fsm = JobFsm::new(store.clone());
        let mut job = Job::ready("wf", "dag-1", "");
        store.create_job(job.clone()).await.unwrap();
        fsm.run(&mut job).await.unwrap();
        fsm.success(&mut job, None).await.unwrap();

        assert_eq!(job.state, JobState::Finished);
        let wf = store.get_workflow("wf").await.unwrap();
        assert_eq!(wf.counters.successful, 1);
        assert_eq!(wf.counters.running, 0);
    }

    #[tokio::test]
    async fn job_cancel_before_start_keeps_running_counter() {
        let store = seeded_store().await;
        let fsm = JobFsm::new(store.clone());
        let mut job = Job::ready("wf", "dag-1", "");
        store.create_job(job.clone()).await.unwrap();
        fsm.cancel(&mut job).await.unwrap();

        let wf = store.get_workflow("wf").await.unwrap();
        assert_eq!(wf.counters.running, 0);
        assert_eq!(wf.counters.canceled, 1);
    }

    #[tokio::test]
    async fn step_run_merges_parameters_over_input() {
        let store = Arc::new(MemoryStore::new());
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register_fn("test", "echo", |_ctx, input| async move { Ok(input) });
        let fsm = StepFsm::new(store.clone(), handlers);

        let mut action = StepAction {
            bot: "test".to_string(),
            rule_id: "echo".to_string(),
            parameters: KV::new(),
        };
        action.parameters.insert("k", json!("param"));
        let mut step = Step::new("job", "a", action, StepState::Created);
        store.create_steps(&[step.clone()]).await.unwrap();

        let mut input = KV::new();
        input.insert("k", json!("input"));
        input.insert("other", json!(1));
        fsm.bind(&mut step, input).await.unwrap();
        assert_eq!(step.state, StepState::Ready);

        fsm.run(&mut step).await.unwrap();
        assert_eq!(step.state, StepState::Running);
        assert_eq!(step.output.get("k"), Some(&json!("param")));
        assert_eq!(step.output.get("other"), Some(&json!(1)));

        fsm.success(&mut step).await.unwrap();
        assert_eq!(step.state, StepState::Finished);
        assert_eq!(
            store.get_step(&step.id).await.unwrap().state,
            StepState::Finished
        );
    }

    #[tokio::test]
    async fn step_error_records_message() {
        let store = Arc::new(MemoryStore::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let fsm = StepFsm::new(store.clone(), handlers);

        let mut step = Step::new("job", "a", StepAction::default(), StepState::Running);
        store.create_steps(&[step.clone()]).await.unwrap();
        fsm.error(&mut step, "boom").await.unwrap();

        let stored = store.get_step(&step.id).await.unwrap();
        assert_eq!(stored.state, StepState::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn step_invalid_transition_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let fsm = StepFsm::new(store.clone(), handlers);
        let mut step = Step::new("job", "a", StepAction::default(), StepState::Finished);
        assert!(matches!(
            fsm.run(&mut step).await,
            Err(FlowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            fsm.skip(&mut step).await,
            Err(FlowError::InvalidTransition { .. })
        ));
    }
}
