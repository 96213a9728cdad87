//! Queue consumers: wire the task kinds to the job/step FSMs.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::FlowError;
use crate::fsm::{JobFsm, StepFsm};
use crate::job::{Job, Trigger, WorkflowState};
use crate::queue::{TaskQueue, KIND_CRON, KIND_JOB, KIND_STEP, KIND_WORKER};
use crate::step::Step;
use crate::store::Store;

/// Register the standard consumers on `queue`.
pub fn register_handlers(
    queue: &TaskQueue,
    store: Arc<dyn Store>,
    job_fsm: Arc<JobFsm>,
    step_fsm: Arc<StepFsm>,
) {
    {
        let job_fsm = Arc::clone(&job_fsm);
        queue.register_handler(KIND_JOB, move |payload| {
            let job_fsm = Arc::clone(&job_fsm);
            async move {
                let mut job: Job = serde_json::from_value(payload)?;
                run_job(&job_fsm, &mut job).await
            }
        });
    }
    {
        let step_fsm = Arc::clone(&step_fsm);
        queue.register_handler(KIND_WORKER, move |payload| {
            let step_fsm = Arc::clone(&step_fsm);
            async move {
                let mut step: Step = serde_json::from_value(payload)?;
                run_step(&step_fsm, &mut step).await
            }
        });
    }
    {
        let store = Arc::clone(&store);
        queue.register_handler(KIND_CRON, move |payload| {
            let store = Arc::clone(&store);
            async move {
                let trigger: Trigger = serde_json::from_value(payload)?;
                fire_trigger(store.as_ref(), &trigger).await
            }
        });
    }
    // Reserved for externally produced step events; currently trace-only.
    queue.register_handler(KIND_STEP, |payload| async move {
        debug!(?payload, "step event received");
        Ok(())
    });
}

#[instrument(skip(job_fsm, job), fields(job_id = %job.id))]
async fn run_job(job_fsm: &JobFsm, job: &mut Job) -> Result<(), FlowError> {
    job_fsm.run(job).await?;
    info!(job_id = %job.id, "job started");
    Ok(())
}

/// Execute a dispatched step. A handler failure settles the step as failed
/// and is not propagated, so the queue does not retry business failures.
#[instrument(skip(step_fsm, step), fields(step_id = %step.id, node_id = %step.node_id))]
async fn run_step(step_fsm: &StepFsm, step: &mut Step) -> Result<(), FlowError> {
    match step_fsm.run(step).await {
        Ok(()) => step_fsm.success(step).await,
        Err(FlowError::InvalidTransition { .. }) => {
            // Duplicate delivery of an already-settled step.
            debug!(step_id = %step.id, "step not runnable, dropping");
            Ok(())
        }
        Err(err) => {
            warn!(step_id = %step.id, %err, "step execution failed");
            step_fsm.error(step, &err.to_string()).await
        }
    }
}

/// Turn a fired trigger into a ready job, unless its workflow is disabled.
#[instrument(skip(store, trigger), fields(trigger_id = %trigger.id, workflow_id = %trigger.workflow_id))]
async fn fire_trigger(store: &dyn Store, trigger: &Trigger) -> Result<(), FlowError> {
    let workflow = store.get_workflow(&trigger.workflow_id).await?;
    if workflow.state == WorkflowState::Disabled {
        debug!(workflow_id = %workflow.id, "workflow disabled, dropping trigger fire");
        return Ok(());
    }
    let job = Job::ready(&workflow.id, &workflow.dag_id, &trigger.id);
    store.create_job(job.clone()).await?;
    info!(job_id = %job.id, "job created from trigger");
    Ok(())
}
