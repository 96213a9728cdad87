//! Step scheduler: two polling loops advancing steps by dependency
//! resolution.
//!
//! `push_ready_step` dispatches ready steps onto the worker queue and marks
//! them running; `depend_step` watches created steps and binds them once
//! every direct parent finished, merging the parents' outputs into the
//! child's input.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::FlowError;
use crate::fsm::StepFsm;
use crate::poll::poll_until;
use crate::queue::{QueueTask, TaskQueue, KIND_WORKER, QUEUE_WORKER};
use crate::step::{Step, StepState};
use crate::store::Store;
use crate::types::KV;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerIntervals {
    pub push: Duration,
    pub depend: Duration,
}

impl Default for SchedulerIntervals {
    fn default() -> Self {
        Self {
            push: Duration::from_secs(1),
            depend: Duration::from_secs(1),
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    queue: Arc<TaskQueue>,
    step_fsm: Arc<StepFsm>,
    token: CancellationToken,
    intervals: SchedulerIntervals,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<TaskQueue>,
        step_fsm: Arc<StepFsm>,
        token: CancellationToken,
        intervals: SchedulerIntervals,
    ) -> Self {
        Self {
            store,
            queue,
            step_fsm,
            token,
            intervals,
        }
    }

    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let push = {
            let scheduler = Arc::clone(&self);
            let token = self.token.clone();
            tokio::spawn(async move {
                poll_until(scheduler.intervals.push, 0.0, token, || {
                    let scheduler = Arc::clone(&scheduler);
                    async move {
                        if let Err(err) = scheduler.push_ready_step().await {
                            warn!(%err, "push_ready_step pass failed");
                        }
                    }
                })
                .await;
            })
        };
        let depend = {
            let scheduler = Arc::clone(&self);
            let token = self.token.clone();
            tokio::spawn(async move {
                poll_until(scheduler.intervals.depend, 0.0, token, || {
                    let scheduler = Arc::clone(&scheduler);
                    async move {
                        if let Err(err) = scheduler.depend_step().await {
                            warn!(%err, "depend_step pass failed");
                        }
                    }
                })
                .await;
            })
        };
        vec![push, depend]
    }

    /// Enqueue every ready step onto the worker queue and mark it running.
    /// A duplicate enqueue (step already dispatched) is skipped quietly.
    #[instrument(skip(self))]
    pub async fn push_ready_step(&self) -> Result<(), FlowError> {
        let steps = self.store.get_steps_by_state(StepState::Ready).await?;
        for step in steps {
            // The payload carries the ready state; the consumer re-applies
            // the run transition from it. The state only advances after a
            // successful enqueue, so an enqueue failure leaves the step
            // ready for the next pass. Duplicate dispatch is tolerated and
            // deduplicated by step id.
            let payload = serde_json::to_value(&step)?;
            let task = QueueTask::new(step.id.clone(), QUEUE_WORKER, KIND_WORKER, payload);
            match self.queue.enqueue(task) {
                Ok(()) => {
                    self.store
                        .update_step_state(&step.id, StepState::Running)
                        .await?;
                    debug!(step_id = %step.id, node_id = %step.node_id, "dispatched step");
                }
                Err(FlowError::DuplicateTask { .. }) => {
                    debug!(step_id = %step.id, "step already dispatched, skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Advance created steps whose parents have all reached a terminal state.
    #[instrument(skip(self))]
    pub async fn depend_step(&self) -> Result<(), FlowError> {
        let steps = self.store.get_steps_by_state(StepState::Created).await?;
        for mut step in steps {
            if let Err(err) = self.resolve_step(&mut step).await {
                warn!(step_id = %step.id, %err, "failed to resolve step dependencies");
            }
        }
        Ok(())
    }

    async fn resolve_step(&self, step: &mut Step) -> Result<(), FlowError> {
        let parents = self
            .store
            .get_steps_by_depend(&step.job_id, &step.depend_node_ids)
            .await?;
        if parents.len() < step.depend_node_ids.len() {
            return Err(FlowError::Store(format!(
                "step {} expects {} parents, found {}",
                step.id,
                step.depend_node_ids.len(),
                parents.len()
            )));
        }

        // A terminal-bad parent short-circuits: the child adopts the parent's
        // own state without waiting on the remaining dependencies.
        if let Some(parent) = parents.iter().find(|p| p.state == StepState::Failed) {
            let reason = format!("dependency '{}' failed", parent.node_id);
            return self.step_fsm.error(step, &reason).await;
        }
        if parents.iter().any(|p| p.state == StepState::Canceled) {
            return self.step_fsm.cancel(step).await;
        }
        if parents.iter().any(|p| p.state == StepState::Skipped) {
            return self.step_fsm.skip(step).await;
        }
        if !parents.iter().all(|p| p.state == StepState::Finished) {
            return Ok(());
        }

        // Merge parent outputs in finish order, the last finisher winning on
        // key collisions.
        let mut finished = parents;
        finished.sort_by_key(|p| p.finished_at);
        let input = finished
            .into_iter()
            .fold(KV::new(), |acc, p| acc.merge(p.output));
        self.step_fsm.bind(step, input).await
    }
}
