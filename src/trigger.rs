//! Interval trigger scheduler.
//!
//! Periodically re-reads the trigger table so operators can add, disable or
//! re-schedule triggers at runtime, and fires due triggers onto the cron
//! queue. The dispatch side turns a fired trigger into a ready Job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::FlowError;
use crate::job::{Trigger, TriggerState};
use crate::poll::poll_until;
use crate::queue::{QueueTask, TaskQueue, KIND_CRON, QUEUE_CRON};
use crate::store::Store;
use crate::types::parse_duration;

struct Entry {
    trigger: Trigger,
    period: Duration,
    next_fire: Instant,
}

pub struct TriggerScheduler {
    store: Arc<dyn Store>,
    queue: Arc<TaskQueue>,
    token: CancellationToken,
    sync_interval: Duration,
    tick_interval: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl TriggerScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<TaskQueue>,
        token: CancellationToken,
        sync_interval: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            token,
            sync_interval,
            tick_interval: Duration::from_millis(500),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let sync = {
            let scheduler = Arc::clone(&self);
            let token = self.token.clone();
            tokio::spawn(async move {
                poll_until(scheduler.sync_interval, 0.0, token, || {
                    let scheduler = Arc::clone(&scheduler);
                    async move {
                        if let Err(err) = scheduler.sync().await {
                            warn!(%err, "trigger sync failed");
                        }
                    }
                })
                .await;
            })
        };
        let tick = {
            let scheduler = Arc::clone(&self);
            let token = self.token.clone();
            tokio::spawn(async move {
                poll_until(scheduler.tick_interval, 0.0, token, || {
                    let scheduler = Arc::clone(&scheduler);
                    async move {
                        scheduler.tick();
                    }
                })
                .await;
            })
        };
        vec![sync, tick]
    }

    /// Reconcile the in-memory fire table with the stored triggers. New
    /// triggers first fire one full period from now; removed, disabled or
    /// unparsable triggers are dropped.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> Result<(), FlowError> {
        let triggers = self.store.list_triggers().await?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| FlowError::Store("trigger table lock poisoned".to_string()))?;

        let mut keep: HashMap<String, Entry> = HashMap::with_capacity(triggers.len());
        for trigger in triggers {
            if trigger.state == TriggerState::Disabled || trigger.schedule.is_empty() {
                continue;
            }
            let period = match parse_duration(&trigger.schedule) {
                Ok(period) if !period.is_zero() => period,
                Ok(_) | Err(_) => {
                    warn!(trigger_id = %trigger.id, schedule = %trigger.schedule, "invalid trigger schedule, ignoring");
                    continue;
                }
            };
            let entry = match entries.remove(&trigger.id) {
                Some(mut existing) if existing.period == period => {
                    existing.trigger = trigger;
                    existing
                }
                _ => Entry {
                    trigger,
                    period,
                    next_fire: Instant::now() + period,
                },
            };
            keep.insert(entry.trigger.id.clone(), entry);
        }
        *entries = keep;
        debug!(count = entries.len(), "trigger table synced");
        Ok(())
    }

    /// Fire every due trigger onto the cron queue.
    pub fn tick(&self) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let now = Instant::now();
        for entry in entries.values_mut() {
            if entry.next_fire > now {
                continue;
            }
            entry.next_fire = now + entry.period;
            let payload = match serde_json::to_value(&entry.trigger) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(trigger_id = %entry.trigger.id, %err, "failed to encode trigger");
                    continue;
                }
            };
            let id = format!("cron-{}-{}", entry.trigger.id, Utc::now().timestamp());
            let task = QueueTask::new(id, QUEUE_CRON, KIND_CRON, payload);
            match self.queue.enqueue(task) {
                Ok(()) => debug!(trigger_id = %entry.trigger.id, "trigger fired"),
                Err(FlowError::DuplicateTask { .. }) => {}
                Err(err) => warn!(trigger_id = %entry.trigger.id, %err, "failed to enqueue trigger"),
            }
        }
    }

    #[cfg(test)]
    fn force_due(&self, trigger_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(trigger_id) {
            entry.next_fire = Instant::now() - Duration::from_millis(1);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}
