//! In-process prioritized task queue.
//!
//! Work items flow between the manager, scheduler and dispatch handlers as
//! `QueueTask`s on named queues with integer weights: a worker always drains
//! the heaviest non-empty queue first. Task ids are deduplicated for a
//! retention window so periodic producers can re-enqueue blindly, and failed
//! handler invocations are retried up to `max_retry` times.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::FlowError;

pub const QUEUE_JOB: &str = "workflow_job";
pub const QUEUE_STEP: &str = "workflow_step";
pub const QUEUE_CRON: &str = "workflow_cron";
pub const QUEUE_WORKER: &str = "workflow_worker";

pub const KIND_JOB: &str = "job";
pub const KIND_STEP: &str = "step";
pub const KIND_CRON: &str = "cron";
pub const KIND_WORKER: &str = "worker";

pub const DEFAULT_MAX_RETRY: u32 = 3;
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3 * 24 * 3600);

#[derive(Debug, Clone)]
pub struct QueueTask {
    pub id: String,
    pub queue: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub max_retry: u32,
    pub retention: Duration,
    attempt: u32,
}

impl QueueTask {
    pub fn new(
        id: impl Into<String>,
        queue: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            kind: kind.into(),
            payload,
            max_retry: DEFAULT_MAX_RETRY,
            retention: DEFAULT_RETENTION,
            attempt: 0,
        }
    }
}

type HandlerFuture = BoxFuture<'static, Result<(), FlowError>>;
type Handler = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

struct NamedQueue {
    weight: u32,
    tasks: VecDeque<QueueTask>,
}

pub struct TaskQueue {
    queues: Mutex<HashMap<String, NamedQueue>>,
    notify: Notify,
    seen: DashMap<String, Instant>,
    handlers: DashMap<String, Handler>,
    token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Build a queue with the given `(name, weight)` priorities. Enqueueing
    /// to a name not listed here is an error.
    pub fn new(priorities: &[(&str, u32)]) -> Self {
        let queues = priorities
            .iter()
            .map(|(name, weight)| {
                (
                    name.to_string(),
                    NamedQueue {
                        weight: *weight,
                        tasks: VecDeque::new(),
                    },
                )
            })
            .collect();
        Self {
            queues: Mutex::new(queues),
            notify: Notify::new(),
            seen: DashMap::new(),
            handlers: DashMap::new(),
            token: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// The standard four-queue layout, worker > job > step > cron.
    pub fn with_default_queues() -> Self {
        Self::new(&[
            (QUEUE_WORKER, 6),
            (QUEUE_JOB, 4),
            (QUEUE_STEP, 3),
            (QUEUE_CRON, 1),
        ])
    }

    pub fn register_handler<F, Fut>(&self, kind: &str, f: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), FlowError>> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(move |payload| Box::pin(f(payload)));
        self.handlers.insert(kind.to_string(), wrapped);
    }

    /// Enqueue a task. A task id already seen within its retention window is
    /// rejected with `DuplicateTask`.
    pub fn enqueue(&self, task: QueueTask) -> Result<(), FlowError> {
        if self.token.is_cancelled() {
            return Err(FlowError::QueueClosed);
        }
        match self.seen.entry(task.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().elapsed() < task.retention {
                    return Err(FlowError::DuplicateTask {
                        id: task.id.clone(),
                    });
                }
                entry.insert(Instant::now());
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Instant::now());
            }
        }
        self.push(task)?;
        Ok(())
    }

    fn push(&self, task: QueueTask) -> Result<(), FlowError> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| FlowError::QueueClosed)?;
        let named = queues
            .get_mut(&task.queue)
            .ok_or_else(|| FlowError::UnknownQueue {
                queue: task.queue.clone(),
            })?;
        named.tasks.push_back(task);
        drop(queues);
        self.notify.notify_waiters();
        self.notify.notify_one();
        Ok(())
    }

    fn pop(&self) -> Option<QueueTask> {
        let mut queues = self.queues.lock().ok()?;
        let mut names: Vec<(u32, String)> = queues
            .iter()
            .filter(|(_, q)| !q.tasks.is_empty())
            .map(|(name, q)| (q.weight, name.clone()))
            .collect();
        names.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        let (_, name) = names.into_iter().next()?;
        queues.get_mut(&name).and_then(|q| q.tasks.pop_front())
    }

    /// Spawn `concurrency` workers draining the queues until shutdown.
    pub fn run(self: Arc<Self>, concurrency: usize) {
        let mut workers = match self.workers.lock() {
            Ok(w) => w,
            Err(_) => return,
        };
        for _ in 0..concurrency.max(1) {
            let queue = Arc::clone(&self);
            workers.push(tokio::spawn(async move {
                queue.worker_loop().await;
            }));
        }
    }

    async fn worker_loop(&self) {
        loop {
            let task = match self.pop() {
                Some(task) => task,
                None => {
                    tokio::select! {
                        _ = self.token.cancelled() => return,
                        _ = self.notify.notified() => continue,
                    }
                }
            };
            self.process(task).await;
        }
    }

    async fn process(&self, mut task: QueueTask) {
        let handler = match self.handlers.get(&task.kind) {
            Some(handler) => handler.clone(),
            None => {
                error!(id = %task.id, kind = %task.kind, "no handler for task kind");
                return;
            }
        };
        match handler(task.payload.clone()).await {
            Ok(()) => {
                debug!(id = %task.id, kind = %task.kind, "task processed");
            }
            Err(err) => {
                if task.attempt < task.max_retry {
                    task.attempt += 1;
                    warn!(id = %task.id, attempt = task.attempt, %err, "task failed, retrying");
                    if let Err(err) = self.push(task) {
                        error!(%err, "failed to re-enqueue task");
                    }
                } else {
                    error!(id = %task.id, kind = %task.kind, %err, "task failed, retries exhausted");
                }
            }
        }
    }

    /// Stop accepting tasks, wake all workers and wait for them to exit.
    /// Already-queued tasks are dropped.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.notify.notify_waiters();
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    #[cfg(test)]
    fn depth(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .map(|q| q.get(queue).map(|n| n.tasks.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn heavier_queue_drains_first() {
        let queue = Arc::new(TaskQueue::new(&[("low", 1), ("high", 5)]));
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            queue.register_handler("probe", move |payload| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(payload.as_str().unwrap().to_string());
                    Ok(())
                }
            });
        }

        queue
            .enqueue(QueueTask::new("t1", "low", "probe", json!("low")))
            .unwrap();
        queue
            .enqueue(QueueTask::new("t2", "high", "probe", json!("high")))
            .unwrap();

        queue.clone().run(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.shutdown().await;

        let order = order.lock().unwrap();
        assert_eq!(*order, vec!["high".to_string(), "low".to_string()]);
    }

    #[tokio::test]
    async fn default_layout_drains_jobs_before_steps() {
        let queue = Arc::new(TaskQueue::with_default_queues());
        let order = Arc::new(Mutex::new(Vec::new()));
        for kind in [KIND_JOB, KIND_STEP] {
            let order = order.clone();
            queue.register_handler(kind, move |payload| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(payload.as_str().unwrap().to_string());
                    Ok(())
                }
            });
        }

        queue
            .enqueue(QueueTask::new("s", QUEUE_STEP, KIND_STEP, json!("step")))
            .unwrap();
        queue
            .enqueue(QueueTask::new("j", QUEUE_JOB, KIND_JOB, json!("job")))
            .unwrap();

        queue.clone().run(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.shutdown().await;

        let order = order.lock().unwrap();
        assert_eq!(*order, vec!["job".to_string(), "step".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_within_retention() {
        let queue = TaskQueue::with_default_queues();
        queue
            .enqueue(QueueTask::new("dup", QUEUE_JOB, KIND_JOB, json!({})))
            .unwrap();
        assert!(matches!(
            queue.enqueue(QueueTask::new("dup", QUEUE_JOB, KIND_JOB, json!({}))),
            Err(FlowError::DuplicateTask { .. })
        ));
        assert_eq!(queue.depth(QUEUE_JOB), 1);
    }

    #[tokio::test]
    async fn failing_handler_is_retried_to_exhaustion() {
        let queue = Arc::new(TaskQueue::with_default_queues());
        let calls = Arc::new(AtomicU32::new(0));
        {
            let calls = calls.clone();
            queue.register_handler(KIND_WORKER, move |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(FlowError::Execution("always fails".to_string()))
                }
            });
        }

        queue
            .enqueue(QueueTask::new("t", QUEUE_WORKER, KIND_WORKER, json!({})))
            .unwrap();
        queue.clone().run(1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        queue.shutdown().await;

        // Initial attempt plus DEFAULT_MAX_RETRY retries.
        assert_eq!(calls.load(Ordering::SeqCst), 1 + DEFAULT_MAX_RETRY);
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected() {
        let queue = TaskQueue::with_default_queues();
        assert!(matches!(
            queue.enqueue(QueueTask::new("t", "ghost", KIND_JOB, json!({}))),
            Err(FlowError::UnknownQueue { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_tasks_and_joins_workers() {
        let queue = Arc::new(TaskQueue::with_default_queues());
        queue.register_handler(KIND_JOB, |_| async { Ok(()) });
        queue.clone().run(2);
        queue.shutdown().await;

        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(QueueTask::new("t", QUEUE_JOB, KIND_JOB, json!({}))),
            Err(FlowError::QueueClosed)
        ));
    }
}
