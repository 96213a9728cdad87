//! Single-shot execution engine.
//!
//! An `Engine` runs exactly one task against its runtime backend and then
//! latches to `Completed`. Execution failures (non-zero exit, timeout,
//! cancellation) settle the task and return `Ok`; an `Err` from `run` means
//! the engine itself could not do its job (bad limits, backend unreachable).

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::config::EngineConfig;
use crate::error::FlowError;
use crate::runtime::{build_runtime, parse_cpus, parse_memory, Runtime};
use crate::task::{Task, TaskLimits, TaskState};
use crate::types::parse_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Completed,
}

pub struct Engine {
    state: Mutex<EngineState>,
    runtime: Arc<dyn Runtime>,
    limits: TaskLimits,
}

impl Engine {
    pub fn new(runtime: Arc<dyn Runtime>, limits: TaskLimits) -> Self {
        Self {
            state: Mutex::new(EngineState::Idle),
            runtime,
            limits,
        }
    }

    pub fn from_config(cfg: &EngineConfig) -> Result<Self, FlowError> {
        Ok(Self::new(build_runtime(cfg)?, cfg.limits.clone()))
    }

    pub fn state(&self) -> EngineState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(EngineState::Completed)
    }

    pub async fn health_check(&self) -> Result<(), FlowError> {
        self.runtime.health_check().await
    }

    fn take_idle(&self) -> Result<(), FlowError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| FlowError::Execution("engine state lock poisoned".to_string()))?;
        if *state != EngineState::Idle {
            return Err(FlowError::EngineBusy {
                state: format!("{:?}", *state).to_lowercase(),
            });
        }
        *state = EngineState::Running;
        Ok(())
    }

    fn latch_completed(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = EngineState::Completed;
        }
    }

    /// Execute `task` to a terminal state.
    #[instrument(skip(self, token, task), fields(task_id = %task.id))]
    pub async fn run(&self, token: CancellationToken, task: &mut Task) -> Result<(), FlowError> {
        self.take_idle()?;
        let result = self.run_inner(token, task).await;
        self.latch_completed();
        result
    }

    async fn run_inner(
        &self,
        token: CancellationToken,
        task: &mut Task,
    ) -> Result<(), FlowError> {
        self.apply_default_limits(task);
        self.validate(task)?;
        let deadline = match &task.timeout {
            Some(timeout) => Some(parse_duration(timeout)?),
            None => None,
        };

        let mut executed = task.clone();
        // The deadline cancels a child token rather than dropping the run
        // future: the backend sees the cancellation, terminates the process
        // or container and releases its mounts before returning.
        let run_token = token.child_token();
        let timer = deadline.map(|limit| {
            let deadline_token = run_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                deadline_token.cancel();
            })
        });
        let mut outcome = self.runtime.run(run_token, &mut executed).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        if matches!(outcome, Err(FlowError::Canceled)) && !token.is_cancelled() {
            if let Some(limit) = deadline {
                outcome = Err(FlowError::Execution(format!(
                    "task timed out after {limit:?}"
                )));
            }
        }

        task.started_at = executed.started_at;
        task.pre = executed.pre.clone();
        task.post = executed.post.clone();
        match outcome {
            Ok(()) => {
                task.mark_completed(&executed);
            }
            Err(FlowError::Canceled) => {
                task.state = TaskState::Canceled;
            }
            Err(err) => {
                if let Err(stop_err) = self.runtime.stop(&executed).await {
                    warn!(task_id = %task.id, %stop_err, "failed to stop task");
                }
                task.mark_failed(err.to_string());
            }
        }
        Ok(())
    }

    fn apply_default_limits(&self, task: &mut Task) {
        if self.limits.is_empty() {
            return;
        }
        let limits = task.limits.get_or_insert_with(TaskLimits::default);
        if limits.cpus.is_none() {
            limits.cpus = self.limits.cpus.clone();
        }
        if limits.memory.is_none() {
            limits.memory = self.limits.memory.clone();
        }
    }

    fn validate(&self, task: &Task) -> Result<(), FlowError> {
        if let Some(limits) = &task.limits {
            if let Some(cpus) = &limits.cpus {
                parse_cpus(cpus)?;
            }
            if let Some(memory) = &limits.memory {
                parse_memory(memory)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::shell::ShellRuntime;
    use std::time::Duration;

    fn shell_engine() -> Engine {
        Engine::new(
            Arc::new(ShellRuntime::new(vec![], None, None)),
            TaskLimits::default(),
        )
    }

    fn task(run: &str) -> Task {
        let mut t = Task::new();
        t.run = run.to_string();
        t
    }

    #[tokio::test]
    async fn successful_run_completes_the_task_and_latches() {
        let engine = shell_engine();
        assert_eq!(engine.state(), EngineState::Idle);

        let mut t = task("echo -n done > \"$OUTPUT\"");
        engine.run(CancellationToken::new(), &mut t).await.unwrap();
        assert_eq!(t.state, TaskState::Completed);
        assert_eq!(t.result.as_deref(), Some("done"));
        assert_eq!(engine.state(), EngineState::Completed);
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let engine = shell_engine();
        let mut t = task("true");
        engine.run(CancellationToken::new(), &mut t).await.unwrap();

        let mut again = task("true");
        assert!(matches!(
            engine.run(CancellationToken::new(), &mut again).await,
            Err(FlowError::EngineBusy { .. })
        ));
    }

    #[tokio::test]
    async fn execution_failure_settles_the_task_without_an_error() {
        let engine = shell_engine();
        let mut t = task("exit 5");
        engine.run(CancellationToken::new(), &mut t).await.unwrap();
        assert_eq!(t.state, TaskState::Failed);
        assert!(t.error.is_some());
        assert!(t.failed_at.is_some());
    }

    #[tokio::test]
    async fn timeout_fails_the_task() {
        let engine = shell_engine();
        let mut t = task("sleep 30");
        t.timeout = Some("100ms".to_string());
        engine.run(CancellationToken::new(), &mut t).await.unwrap();
        assert_eq!(t.state, TaskState::Failed);
        assert!(t.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn invalid_limits_are_a_hard_error() {
        let engine = shell_engine();
        let mut t = task("true");
        t.limits = Some(TaskLimits {
            cpus: Some("plenty".to_string()),
            memory: None,
        });
        assert!(matches!(
            engine.run(CancellationToken::new(), &mut t).await,
            Err(FlowError::InvalidCpus { .. })
        ));
        assert_eq!(engine.state(), EngineState::Completed);
    }

    #[tokio::test]
    async fn invalid_timeout_is_a_hard_error() {
        let engine = shell_engine();
        let mut t = task("true");
        t.timeout = Some("eventually".to_string());
        assert!(matches!(
            engine.run(CancellationToken::new(), &mut t).await,
            Err(FlowError::InvalidDuration { .. })
        ));
    }

    #[tokio::test]
    async fn default_limits_fill_unset_fields_only() {
        let engine = Engine::new(
            Arc::new(ShellRuntime::new(vec![], None, None)),
            TaskLimits {
                cpus: Some("1".to_string()),
                memory: Some("512m".to_string()),
            },
        );
        let mut t = task("true");
        t.limits = Some(TaskLimits {
            cpus: Some("2".to_string()),
            memory: None,
        });
        engine.apply_default_limits(&mut t);
        let limits = t.limits.as_ref().unwrap();
        assert_eq!(limits.cpus.as_deref(), Some("2"));
        assert_eq!(limits.memory.as_deref(), Some("512m"));
    }

    #[tokio::test]
    async fn cancellation_with_a_deadline_still_reports_canceled() {
        let engine = shell_engine();
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let mut t = task("sleep 30");
        t.timeout = Some("10s".to_string());
        engine.run(token, &mut t).await.unwrap();
        assert_eq!(t.state, TaskState::Canceled);
    }

    #[tokio::test]
    async fn cancellation_marks_the_task_canceled() {
        let engine = shell_engine();
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let mut t = task("sleep 30");
        engine.run(token, &mut t).await.unwrap();
        assert_eq!(t.state, TaskState::Canceled);
    }
}
