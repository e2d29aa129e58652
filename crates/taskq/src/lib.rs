use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

mod executors;
mod queue;
pub mod server;

pub use queue::Queue;

/// BoxedRaw is a type-erased raw JSON message.
type BoxedRaw = Box<serde_json::value::RawValue>;

/// TaskType is the type of a task, and maps it to an Executor.
#[derive(
    Debug,
    serde::Deserialize,
    serde::Serialize,
    PartialOrd,
    PartialEq,
    Ord,
    Eq,
    Clone,
    Copy,
    Hash,
)]
pub struct TaskType(pub i16);

/// Task types must be globally unique: very bad things will happen if two
/// different executors are run for the same task type. Constants for all
/// in-use task types are defined here so it's easier to avoid collisions.
pub mod task_types {
    use super::TaskType;

    pub const CONTACT_POINT_SYNC: TaskType = TaskType(1);
}

/// TaskId identifies a single scheduled invocation of a task.
/// Ids are unique within a process and are rendered and serialized
/// as fixed-width hex strings.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl std::fmt::Debug for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl serde::Serialize for TaskId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for TaskId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        u64::from_str_radix(&s, 16)
            .map(TaskId)
            .map_err(serde::de::Error::custom)
    }
}

/// Generate a process-unique TaskId, composed of a random per-process shard
/// in the upper bits and a monotonic sequence in the lower bits.
pub fn next_task_id() -> TaskId {
    static SHARD: LazyLock<u64> = LazyLock::new(|| rand::random::<u16>() as u64);
    static SEQUENCE: AtomicU64 = AtomicU64::new(1);

    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    TaskId((*SHARD << 48) | (seq & ((1 << 48) - 1)))
}

/// RetryPolicy governs re-invocation of a task whose poll returned an error.
/// Failed attempts are re-enqueued with exponential backoff, doubling from
/// `backoff_base` up to `backoff_cap`, until `max_attempts` total attempts
/// have been made. After that the task is abandoned and surfaced via an
/// error-level log.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: std::time::Duration,
    pub backoff_cap: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_base: std::time::Duration::from_secs(1),
            backoff_cap: std::time::Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Backoff before re-attempting a task which has already failed
    /// `attempts` times. Jittered by up to 10% to spread retries.
    pub fn backoff(&self, attempts: u32) -> std::time::Duration {
        use rand::Rng;

        let exp = attempts.saturating_sub(1).min(20);
        let base = self.backoff_base.saturating_mul(1 << exp);
        let jitter = rand::thread_rng().gen_range(0.0..0.1);

        std::cmp::min(base.mul_f64(1.0 + jitter), self.backoff_cap)
    }
}

/// Executor is the core trait implemented by executors of various task types.
pub trait Executor: Send + Sync + 'static {
    const TASK_TYPE: TaskType;

    type Msg: serde::de::DeserializeOwned + serde::Serialize + Send;

    fn poll<'s>(
        &'s self,
        queue: &'s Queue,
        task_id: TaskId,
        msg: Self::Msg,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send + 's;
}

/// Server holds registered implementations of Executors and serves them.
pub struct Server {
    executors: Vec<Arc<dyn executors::ObjSafe>>,
    retry: RetryPolicy,
}
