use super::{queue::ScheduledTask, Executor, Queue, RetryPolicy, TaskId, TaskType};
use anyhow::Context;
use futures::future::{BoxFuture, FutureExt};
use tracing::Instrument;

/// ObjSafe is an object-safe and type-erased trait which is implemented for all Executors.
pub(crate) trait ObjSafe: Send + Sync + 'static {
    fn task_type(&self) -> TaskType;

    fn poll<'s>(
        &'s self,
        queue: &'s Queue,
        task_id: TaskId,
        payload: &'s serde_json::value::RawValue,
    ) -> BoxFuture<'s, anyhow::Result<()>>;
}

impl<E: Executor> ObjSafe for E {
    fn task_type(&self) -> TaskType {
        E::TASK_TYPE
    }

    fn poll<'s>(
        &'s self,
        queue: &'s Queue,
        task_id: TaskId,
        payload: &'s serde_json::value::RawValue,
    ) -> BoxFuture<'s, anyhow::Result<()>> {
        let span = tracing::debug_span!("poll", task_id = %task_id);

        async move {
            let msg: E::Msg =
                serde_json::from_str(payload.get()).context("failed to decode task message")?;

            E::poll(self, queue, task_id, msg).await
        }
        .instrument(span)
        .boxed()
    }
}

/// Poll one dequeued task, re-enqueueing it with backoff on failure until
/// the retry policy's attempt budget is exhausted.
pub(crate) async fn poll_task(
    executor: std::sync::Arc<dyn ObjSafe>,
    queue: Queue,
    task: ScheduledTask,
    retry: RetryPolicy,
) {
    let ScheduledTask {
        id,
        type_,
        payload,
        attempts,
    } = task;

    match executor.poll(&queue, id, &payload).await {
        Ok(()) => {
            tracing::debug!(?id, ?type_, "task poll completed");
        }
        Err(err) => {
            let attempts = attempts + 1;

            if attempts >= retry.max_attempts {
                tracing::error!(
                    ?id,
                    ?type_,
                    attempts,
                    ?err,
                    "task failed and exhausted its retry budget (abandoning)"
                );
            } else {
                let backoff = retry.backoff(attempts);
                tracing::warn!(
                    ?id,
                    ?type_,
                    attempts,
                    ?backoff,
                    ?err,
                    "task failed and will be retried"
                );
                queue.push(
                    ScheduledTask {
                        id,
                        type_,
                        payload,
                        attempts,
                    },
                    backoff,
                );
            }
        }
    }
}
