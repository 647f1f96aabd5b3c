use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Unique identifier for a task.
///
/// Wrapper around a UUID string. A retried task keeps its id; only the
/// scheduling metadata of the derived item changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordinal urgency class. Lower code dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Wire representation (0-3).
    pub fn code(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Parses the wire representation. Anything outside 0-3 is rejected.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Priority::Critical),
            1 => Some(Priority::High),
            2 => Some(Priority::Normal),
            3 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// Free-form key/value metadata handed to the handler alongside the payload.
pub type TaskContext = serde_json::Map<String, serde_json::Value>;

/// Boxed future returned by task handlers and closures.
pub type TaskFuture =
    Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send>>;

/// A no-argument async closure submitted directly to a local pool.
pub type TaskFn = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// The two shapes a unit of work can take.
///
/// Only `Named` is fully described by serializable data and can therefore
/// cross the network; a raw `Closure` is local-only by construction. The
/// wire protocol (`cluster::protocol`) only ever carries the `Named` fields,
/// so the restriction is enforced by the type system rather than convention.
#[derive(Clone)]
pub enum WorkSpec {
    /// Opaque local-only callable.
    Closure(TaskFn),
    /// Registry-backed, remote-routable description.
    Named {
        name: String,
        payload: serde_json::Value,
        context: TaskContext,
    },
}

impl std::fmt::Debug for WorkSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkSpec::Closure(_) => f.write_str("WorkSpec::Closure"),
            WorkSpec::Named { name, .. } => write!(f, "WorkSpec::Named({})", name),
        }
    }
}

/// The task envelope as it sits in the queue.
///
/// Immutable once enqueued: a failed attempt derives a fresh item via
/// [`WorkItem::with_retry`] instead of mutating in place. Dispatch order is
/// the total order `(priority asc, ready_at asc, sequence asc)`.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: TaskId,
    pub display_name: String,
    pub priority: Priority,
    /// Earliest dispatch time, epoch milliseconds.
    pub ready_at: u64,
    /// Process-wide monotonic tiebreak.
    pub sequence: u64,
    pub spec: WorkSpec,
    pub retry_count: u32,
    pub max_retries: u32,
    pub backoff_base: f64,
    pub backoff_cap: f64,
    pub jitter_fraction: f64,
    /// Abandon-before-dispatch cutoff, epoch milliseconds.
    pub deadline: Option<u64>,
    pub labels: BTreeSet<String>,
}

impl WorkItem {
    /// The dispatch ordering key.
    pub fn sort_key(&self) -> (Priority, u64, u64) {
        (self.priority, self.ready_at, self.sequence)
    }

    /// Exponential backoff for the *next* attempt after this one failed:
    /// `min(cap, base^retry_count)` seconds, jittered by
    /// `± uniform(0, delay * jitter_fraction)`, floored at 50 ms.
    pub fn backoff_delay(&self) -> Duration {
        let raw = self
            .backoff_cap
            .min(self.backoff_base.powi(self.retry_count as i32));
        let jittered = if self.jitter_fraction > 0.0 {
            let spread = raw * self.jitter_fraction;
            raw + rand::Rng::gen_range(&mut rand::thread_rng(), -spread..=spread)
        } else {
            raw
        };
        Duration::from_secs_f64(jittered.max(0.050))
    }

    /// Whether a further attempt is allowed after a failure.
    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Derives the retry copy of a failed item: same id and spec, bumped
    /// `retry_count`, `ready_at` pushed out by the backoff delay, and a
    /// fresh sequence number from the pool's monotonic counter.
    pub fn with_retry(&self, sequence: u64) -> WorkItem {
        let delay = self.backoff_delay();
        WorkItem {
            retry_count: self.retry_count + 1,
            ready_at: now_ms() + delay.as_millis() as u64,
            sequence,
            ..self.clone()
        }
    }

    /// Whether the deadline (if any) has already passed.
    pub fn deadline_passed(&self, now: u64) -> bool {
        self.deadline.is_some_and(|d| d < now)
    }
}

/// Current system time in epoch milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
