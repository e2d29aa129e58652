use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskq::{Executor, Queue, RetryPolicy, Server, TaskId, TaskType};

// Number of concurrent polls that may run.
const CONCURRENCY: u32 = 4;
// Bound on how long any single test scenario may take.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Flaky fails its first `failures` polls and then succeeds.
struct Flaky {
    failures: u32,
    polls: Arc<AtomicU32>,
}

#[derive(Debug, serde::Deserialize, serde::Serialize)]
struct Ping;

impl Executor for Flaky {
    const TASK_TYPE: TaskType = TaskType(32767);

    type Msg = Ping;

    async fn poll<'s>(
        &'s self,
        _queue: &'s Queue,
        _task_id: TaskId,
        Ping: Ping,
    ) -> anyhow::Result<()> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            anyhow::bail!("injected failure of poll {n}");
        }
        Ok(())
    }
}

fn init_tracing() {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(10),
    }
}

async fn serve_until(server: Server, queue: Queue, polls: Arc<AtomicU32>, expect_polls: u32) {
    let monitor = async {
        let mut ticker = tokio::time::interval(Duration::from_millis(5));
        loop {
            let _instant = ticker.tick().await;
            if polls.load(Ordering::SeqCst) >= expect_polls {
                // Grace period, so that assertions of "no further polls"
                // made after serving are meaningful.
                tokio::time::sleep(Duration::from_millis(50)).await;
                break;
            }
        }
    };
    tokio::time::timeout(TEST_TIMEOUT, server.serve(queue, CONCURRENCY, monitor))
        .await
        .expect("test timed out");
}

#[tokio::test]
async fn enqueue_delay_is_honored() {
    init_tracing();
    let queue = Queue::new();
    let polls = Arc::new(AtomicU32::new(0));

    let started = tokio::time::Instant::now();
    queue
        .enqueue(Flaky::TASK_TYPE, &Ping, Duration::from_millis(100))
        .unwrap();

    let server = Server::new().register(Flaky {
        failures: 0,
        polls: polls.clone(),
    });
    serve_until(server, queue.clone(), polls.clone(), 1).await;

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(polls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn failed_polls_are_retried_until_success() {
    init_tracing();
    let queue = Queue::new();
    let polls = Arc::new(AtomicU32::new(0));

    queue.enqueue(Flaky::TASK_TYPE, &Ping, Duration::ZERO).unwrap();

    let server = Server::new()
        .with_retry_policy(fast_retries(10))
        .register(Flaky {
            failures: 2,
            polls: polls.clone(),
        });
    serve_until(server, queue.clone(), polls.clone(), 3).await;

    // Two failures, then one success, and nothing further.
    assert_eq!(polls.load(Ordering::SeqCst), 3);
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn task_is_abandoned_after_attempt_budget() {
    init_tracing();
    let queue = Queue::new();
    let polls = Arc::new(AtomicU32::new(0));

    queue.enqueue(Flaky::TASK_TYPE, &Ping, Duration::ZERO).unwrap();

    let server = Server::new()
        .with_retry_policy(fast_retries(4))
        .register(Flaky {
            failures: u32::MAX,
            polls: polls.clone(),
        });
    serve_until(server, queue.clone(), polls.clone(), 4).await;

    // Exactly `max_attempts` polls ran, and the task was dropped rather
    // than re-enqueued.
    assert_eq!(polls.load(Ordering::SeqCst), 4);
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn undecodable_payloads_exhaust_retries() {
    init_tracing();
    let queue = Queue::new();
    let polls = Arc::new(AtomicU32::new(0));

    // Flaky's Msg is a unit struct, so a JSON array fails to decode.
    queue
        .enqueue(Flaky::TASK_TYPE, &vec![1, 2, 3], Duration::ZERO)
        .unwrap();

    let server = Server::new()
        .with_retry_policy(fast_retries(3))
        .register(Flaky {
            failures: 0,
            polls: polls.clone(),
        });

    let monitor = async {
        while queue.pending() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    tokio::time::timeout(TEST_TIMEOUT, server.serve(queue.clone(), CONCURRENCY, monitor))
        .await
        .expect("test timed out");

    // The executor itself never ran.
    assert_eq!(polls.load(Ordering::SeqCst), 0);
    assert_eq!(queue.pending(), 0);
}
