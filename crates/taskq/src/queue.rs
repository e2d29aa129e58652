use super::{next_task_id, BoxedRaw, TaskId, TaskType};
use anyhow::Context;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Queue schedules type-erased task payloads for delayed execution.
/// It is cheaply cloneable and shared between schedulers of new tasks
/// and the Server which dequeues and polls them.
#[derive(Clone)]
pub struct Queue(Arc<Inner>);

struct Inner {
    // Tasks ordered by wake-at deadline, then by id for FIFO ties.
    tasks: Mutex<BTreeMap<(Instant, TaskId), ScheduledTask>>,
    notify: tokio::sync::Notify,
}

pub(crate) struct ScheduledTask {
    pub id: TaskId,
    pub type_: TaskType,
    pub payload: BoxedRaw,
    // Completed (failed) attempts of this task so far.
    pub attempts: u32,
}

impl Queue {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            tasks: Mutex::new(BTreeMap::new()),
            notify: tokio::sync::Notify::new(),
        }))
    }

    /// Schedule `msg` for execution by the Executor registered for `type_`,
    /// no earlier than `delay` from now. The returned TaskId identifies this
    /// invocation and is not reused.
    pub fn enqueue<M: serde::Serialize>(
        &self,
        type_: TaskType,
        msg: &M,
        delay: std::time::Duration,
    ) -> anyhow::Result<TaskId> {
        let payload =
            serde_json::value::to_raw_value(msg).context("failed to encode task message")?;
        let id = next_task_id();

        self.push(
            ScheduledTask {
                id,
                type_,
                payload,
                attempts: 0,
            },
            delay,
        );
        Ok(id)
    }

    /// Number of tasks which are scheduled but not yet dequeued.
    pub fn pending(&self) -> usize {
        self.0.tasks.lock().unwrap().len()
    }

    pub(crate) fn push(&self, task: ScheduledTask, delay: std::time::Duration) {
        let wake_at = Instant::now() + delay;
        self.0
            .tasks
            .lock()
            .unwrap()
            .insert((wake_at, task.id), task);
        self.0.notify.notify_one();
    }

    /// Remove and return up to `limit` tasks whose deadlines have elapsed.
    pub(crate) fn pop_due(&self, now: Instant, limit: usize) -> Vec<ScheduledTask> {
        let mut tasks = self.0.tasks.lock().unwrap();
        let mut due = Vec::new();

        while due.len() < limit {
            match tasks.first_key_value() {
                Some((&(wake_at, _), _)) if wake_at <= now => {
                    let (_, task) = tasks.pop_first().unwrap();
                    due.push(task);
                }
                _ => break,
            }
        }
        due
    }

    /// Deadline of the soonest scheduled task, if any.
    pub(crate) fn next_wake(&self) -> Option<Instant> {
        self.0
            .tasks
            .lock()
            .unwrap()
            .first_key_value()
            .map(|(&(wake_at, _), _)| wake_at)
    }

    /// Resolves when a task has been pushed since the last notification.
    pub(crate) async fn notified(&self) {
        self.0.notify.notified().await
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}
