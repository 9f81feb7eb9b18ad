//! Remote Task Table
//!
//! Routes inbound task status notifications to the Task step waiting for
//! them. A waiter registers its remote task id right after dispatch and
//! receives the outcome through a one-shot channel. Entries are removed
//! when consumed, when the waiter gives up, or when they expire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{EngineError, Result};

/// Final status reported by an agent for one of its tasks.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemoteTaskStatus {
    Completed,
    Failed,
}

/// Body of a task status notification.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub status: RemoteTaskStatus,
    #[serde(default)]
    pub output: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn completed(output: HashMap<String, Value>) -> Self {
        Self {
            status: RemoteTaskStatus::Completed,
            output,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: RemoteTaskStatus::Failed,
            output: HashMap::new(),
            error: Some(message.into()),
        }
    }

    /// The task output, or the remote failure as an error.
    pub fn into_result(self, task_id: &str) -> Result<HashMap<String, Value>> {
        match self.status {
            RemoteTaskStatus::Completed => Ok(self.output),
            RemoteTaskStatus::Failed => Err(EngineError::RemoteTaskFailed {
                task_id: task_id.to_string(),
                message: self
                    .error
                    .unwrap_or_else(|| "agent reported failure without a message".to_string()),
            }),
        }
    }
}

enum Slot {
    Waiting {
        sender: oneshot::Sender<TaskOutcome>,
        step_instance_id: String,
    },
    /// Outcome that arrived before its waiter registered
    Parked { outcome: TaskOutcome, parked_at: Instant },
}

/// Owned table of pending remote tasks.
pub struct RemoteTaskTable {
    slots: Mutex<HashMap<String, Slot>>,
    dispatching: AtomicUsize,
    parked_ttl: Duration,
}

impl RemoteTaskTable {
    /// `parked_ttl` bounds how long an early notification is kept.
    pub fn new(parked_ttl: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            dispatching: AtomicUsize::new(0),
            parked_ttl,
        }
    }

    /// Marks a dispatch as in progress until the guard is dropped.
    /// Notifications for unknown ids are only parked while a dispatch is
    /// in progress; otherwise they are dropped.
    pub fn begin_dispatch(self: &Arc<Self>) -> DispatchGuard {
        self.dispatching.fetch_add(1, Ordering::SeqCst);
        DispatchGuard {
            table: Arc::clone(self),
        }
    }

    /// Registers interest in `task_id`. If the outcome is already parked
    /// the returned waiter resolves immediately.
    pub fn register(self: &Arc<Self>, task_id: &str, step_instance_id: &str) -> PendingTask {
        let (sender, receiver) = oneshot::channel();
        let mut slots = self.slots.lock();
        self.sweep(&mut slots);

        match slots.remove(task_id) {
            Some(Slot::Parked { outcome, .. }) => {
                debug!("Remote task {} had already reported; handing over", task_id);
                let _ = sender.send(outcome);
            }
            Some(Slot::Waiting { step_instance_id: other, .. }) => {
                warn!(
                    "Remote task {} was awaited by step instance {}; replacing waiter",
                    task_id, other
                );
                slots.insert(
                    task_id.to_string(),
                    Slot::Waiting {
                        sender,
                        step_instance_id: step_instance_id.to_string(),
                    },
                );
            }
            None => {
                slots.insert(
                    task_id.to_string(),
                    Slot::Waiting {
                        sender,
                        step_instance_id: step_instance_id.to_string(),
                    },
                );
            }
        }

        PendingTask {
            task_id: task_id.to_string(),
            receiver,
            table: Arc::clone(self),
        }
    }

    /// Delivers a status notification. Returns true when a waiter took it
    /// or it was parked for a waiter about to register.
    pub fn complete(&self, task_id: &str, outcome: TaskOutcome) -> bool {
        let mut slots = self.slots.lock();
        self.sweep(&mut slots);

        match slots.remove(task_id) {
            Some(Slot::Waiting { sender, step_instance_id }) => {
                debug!(
                    "Routing {:?} for remote task {} to step instance {}",
                    outcome.status, task_id, step_instance_id
                );
                if sender.send(outcome).is_err() {
                    warn!("Waiter for remote task {} is gone; dropping notification", task_id);
                    return false;
                }
                true
            }
            Some(parked @ Slot::Parked { .. }) => {
                warn!("Duplicate notification for remote task {}; keeping the first", task_id);
                slots.insert(task_id.to_string(), parked);
                false
            }
            None if self.dispatching.load(Ordering::SeqCst) > 0 => {
                debug!("Parking early notification for remote task {}", task_id);
                slots.insert(
                    task_id.to_string(),
                    Slot::Parked {
                        outcome,
                        parked_at: Instant::now(),
                    },
                );
                true
            }
            None => {
                warn!("Notification for unknown remote task {}; dropping", task_id);
                false
            }
        }
    }

    /// The step instance waiting on `task_id`, if any.
    pub fn step_instance_for(&self, task_id: &str) -> Option<String> {
        match self.slots.lock().get(task_id) {
            Some(Slot::Waiting { step_instance_id, .. }) => Some(step_instance_id.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_waiter(&self, task_id: &str) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(task_id), Some(Slot::Waiting { .. })) {
            slots.remove(task_id);
            debug!("Stopped waiting for remote task {}", task_id);
        }
    }

    fn sweep(&self, slots: &mut HashMap<String, Slot>) {
        let ttl = self.parked_ttl;
        slots.retain(|task_id, slot| match slot {
            Slot::Parked { parked_at, .. } if parked_at.elapsed() > ttl => {
                warn!("Discarding expired notification for remote task {}", task_id);
                false
            }
            _ => true,
        });
    }
}

/// Keeps early notifications parkable while a dispatch call is in flight.
pub struct DispatchGuard {
    table: Arc<RemoteTaskTable>,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.table.dispatching.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A registered wait for one remote task. Dropping it without receiving
/// removes the table entry.
pub struct PendingTask {
    task_id: String,
    receiver: oneshot::Receiver<TaskOutcome>,
    table: Arc<RemoteTaskTable>,
}

impl PendingTask {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Waits for the outcome, bounded by `timeout` when given.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<TaskOutcome> {
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, &mut self.receiver)
                .await
                .map_err(|_| {
                    EngineError::Timeout(format!(
                        "remote task {} did not report within {:?}",
                        self.task_id, limit
                    ))
                })?,
            None => (&mut self.receiver).await,
        };

        received.map_err(|_| {
            EngineError::Cancelled(format!("waiter for remote task {} was discarded", self.task_id))
        })
    }
}

impl Drop for PendingTask {
    fn drop(&mut self) {
        self.table.remove_waiter(&self.task_id);
    }
}
