//! Job manager: dispatches ready jobs and watches started jobs to a verdict.
//!
//! `push_ready_job` enqueues ready jobs for decomposition; `check_job`
//! classifies a started job from its steps once none are still in flight:
//! any failed step fails the job, otherwise any canceled step cancels it,
//! otherwise it finished.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::FlowError;
use crate::fsm::JobFsm;
use crate::job::{Job, JobState};
use crate::poll::poll_until;
use crate::queue::{QueueTask, TaskQueue, KIND_JOB, QUEUE_JOB};
use crate::step::StepState;
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
pub struct ManagerIntervals {
    pub push: Duration,
    pub check: Duration,
}

impl Default for ManagerIntervals {
    fn default() -> Self {
        Self {
            push: Duration::from_secs(1),
            check: Duration::from_secs(10),
        }
    }
}

pub struct Manager {
    store: Arc<dyn Store>,
    queue: Arc<TaskQueue>,
    job_fsm: Arc<JobFsm>,
    token: CancellationToken,
    intervals: ManagerIntervals,
}

impl Manager {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<TaskQueue>,
        job_fsm: Arc<JobFsm>,
        token: CancellationToken,
        intervals: ManagerIntervals,
    ) -> Self {
        Self {
            store,
            queue,
            job_fsm,
            token,
            intervals,
        }
    }

    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let push = {
            let manager = Arc::clone(&self);
            let token = self.token.clone();
            tokio::spawn(async move {
                poll_until(manager.intervals.push, 0.0, token, || {
                    let manager = Arc::clone(&manager);
                    async move {
                        if let Err(err) = manager.push_ready_job().await {
                            warn!(%err, "push_ready_job pass failed");
                        }
                    }
                })
                .await;
            })
        };
        let check = {
            let manager = Arc::clone(&self);
            let token = self.token.clone();
            tokio::spawn(async move {
                poll_until(manager.intervals.check, 0.0, token, || {
                    let manager = Arc::clone(&manager);
                    async move {
                        if let Err(err) = manager.check_job().await {
                            warn!(%err, "check_job pass failed");
                        }
                    }
                })
                .await;
            })
        };
        vec![push, check]
    }

    /// Enqueue every ready job, keyed by job id so re-dispatch is deduped.
    #[instrument(skip(self))]
    pub async fn push_ready_job(&self) -> Result<(), FlowError> {
        let jobs = self.store.get_jobs_by_state(JobState::Ready).await?;
        for job in jobs {
            let payload = serde_json::to_value(&job)?;
            let task = QueueTask::new(job.id.clone(), QUEUE_JOB, KIND_JOB, payload);
            match self.queue.enqueue(task) {
                Ok(()) => {
                    debug!(job_id = %job.id, "dispatched job");
                }
                Err(FlowError::DuplicateTask { .. }) => {
                    warn!(job_id = %job.id, "job already dispatched, skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Settle started jobs whose steps have all reached a terminal state.
    #[instrument(skip(self))]
    pub async fn check_job(&self) -> Result<(), FlowError> {
        let jobs = self.store.get_jobs_by_state(JobState::Start).await?;
        for mut job in jobs {
            if let Err(err) = self.settle(&mut job).await {
                warn!(job_id = %job.id, %err, "failed to settle job");
            }
        }
        Ok(())
    }

    async fn settle(&self, job: &mut Job) -> Result<(), FlowError> {
        let steps = self.store.get_steps_by_job(&job.id).await?;
        if steps.iter().any(|s| !s.state.is_terminal()) {
            return Ok(());
        }

        if steps.iter().any(|s| s.state == StepState::Failed) {
            return self.job_fsm.error(job).await;
        }
        if steps.iter().any(|s| s.state == StepState::Canceled) {
            return self.job_fsm.cancel(job).await;
        }
        let finished_at = steps.iter().filter_map(|s| s.finished_at).max();
        self.job_fsm.success(job, finished_at).await
    }
}
