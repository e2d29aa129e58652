use super::{executors, Executor, Queue, RetryPolicy, Server};
use std::sync::Arc;
use tokio::time::Instant;

impl Server {
    pub fn new() -> Self {
        Self {
            executors: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the default retry policy applied to failing task polls.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register an Executor to be served by this Server.
    pub fn register<E: Executor>(mut self, executor: E) -> Self {
        match self
            .executors
            .binary_search_by_key(&E::TASK_TYPE, |entry| entry.task_type())
        {
            Ok(_index) => panic!("an Executor for {:?} is already registered", E::TASK_TYPE),
            Err(index) => self.executors.insert(index, Arc::new(executor)),
        }
        self
    }

    /// Serve tasks of `queue` until signaled to stop by `shutdown`.
    /// At most `permits` task polls run concurrently. Returns only after
    /// `shutdown` resolves and all in-flight polls have finished.
    pub async fn serve(self, queue: Queue, permits: u32, shutdown: impl std::future::Future<Output = ()>) {
        serve(self, queue, permits, shutdown).await
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn serve(
    server: Server,
    queue: Queue,
    permits: u32,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let Server { executors, retry } = server;
    let semaphore = Arc::new(tokio::sync::Semaphore::new(permits as usize));
    tokio::pin!(shutdown);

    loop {
        // Block until at least one permit is available.
        if semaphore.available_permits() == 0 {
            tokio::select! {
                permit = semaphore.clone().acquire_owned() => drop(permit.unwrap()),
                () = &mut shutdown => break,
            }
            continue;
        }

        let limit = semaphore.available_permits();
        let due = queue.pop_due(Instant::now(), limit);

        if due.is_empty() {
            // Sleep until the soonest task becomes due, a new task is
            // enqueued, or shutdown is signaled.
            tokio::select! {
                () = idle(&queue) => (),
                () = &mut shutdown => break,
            }
            continue;
        }

        for task in due {
            let Ok(index) = executors.binary_search_by_key(&task.type_, |entry| entry.task_type())
            else {
                panic!("dequeued {:?} with unregistered {:?}", task.id, task.type_);
            };

            let permit = semaphore.clone().acquire_owned().await.unwrap();
            let executor = executors[index].clone();
            let queue = queue.clone();

            tokio::spawn(async move {
                let _guard = permit;
                () = executors::poll_task(executor, queue, task, retry).await;
            });
        }
    }
    tracing::info!("task serving loop signaled to stop and is awaiting running polls");

    // Acquiring all permits only succeeds after in-flight polls have finished.
    let _ = semaphore.acquire_many_owned(permits).await.unwrap();
}

async fn idle(queue: &Queue) {
    match queue.next_wake() {
        Some(wake_at) => tokio::select! {
            () = tokio::time::sleep_until(wake_at) => (),
            () = queue.notified() => (),
        },
        None => queue.notified().await,
    }
}
