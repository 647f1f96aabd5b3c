//! Worker Pool
//!
//! The local scheduling engine: a fixed set of worker loops sharing one
//! priority queue. Dispatch order is the total order
//! `(priority asc, ready_at asc, sequence asc)`.
//!
//! ## Dispatch lifecycle
//! 1. A worker pops the lowest-ordered ready item (bounded wait, so it
//!    stays responsive to stop signals).
//! 2. Admission gate: pool not paused, host not hot (CPU / named-process
//!    probe), every label's token bucket grants a token, every label's
//!    in-flight count is under its cap. Any refusal re-queues the item with
//!    a short fixed delay and no retry penalty.
//! 3. Deadline check: an item whose deadline already passed is abandoned
//!    without ever invoking its handler.
//! 4. Execution: in-flight slots held by a drop guard, `on_task_start` /
//!    `on_task_end` fired once per attempt.
//! 5. Failure: while retries remain, a fresh item is derived with
//!    exponential backoff and re-enqueued; otherwise the failure is
//!    terminal and reported through the end hook only.
//!
//! Among ready, admissible items dispatch strictly follows the queue
//! order. A ready lower-priority item can run ahead of a higher-priority
//! item that is currently rate-limited or capped; that tradeoff is part of
//! the contract (see the ordering tests).

use super::bucket::TokenBucket;
use super::monitor::ResourceMonitor;
use super::registry::TaskRegistry;
use super::types::{now_ms, Priority, TaskId, WorkItem, WorkSpec};
use crate::error::SchedulerError;

use dashmap::DashMap;
use serde::Deserialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Per-label token bucket parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimit {
    pub fill_rate: f64,
    pub capacity: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub worker_count: usize,
    /// CPU utilization above which admission refuses to dispatch.
    /// `None` disables the CPU gate.
    pub cpu_threshold_percent: Option<f64>,
    /// Process name watched by the admission probe, paired with
    /// `max_process_count`.
    pub max_named_process: Option<String>,
    pub max_process_count: usize,
    /// label -> bucket parameters. Labels without an entry are not
    /// rate-limited.
    pub rate_limits: HashMap<String, RateLimit>,
    /// Upper bound on how long a worker waits before re-checking the
    /// queue. Bounds dispatch latency for delayed items.
    pub poll_interval_ms: u64,
    /// Re-queue delay applied when the admission gate refuses an item.
    pub admission_retry_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            cpu_threshold_percent: None,
            max_named_process: None,
            max_process_count: 1,
            rate_limits: HashMap::new(),
            poll_interval_ms: 250,
            admission_retry_ms: 200,
        }
    }
}

/// Per-submission knobs. `Default` gives a plain `Normal`-priority task
/// with three retries and mildly jittered exponential backoff.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub priority: Priority,
    /// Seconds before the task becomes dispatchable. Negative values are
    /// clamped to zero.
    pub delay: f64,
    /// Display name; defaults to the task name for named specs.
    pub name: Option<String>,
    pub labels: BTreeSet<String>,
    /// Abandon-before-dispatch cutoff, epoch milliseconds.
    pub deadline: Option<u64>,
    pub max_retries: u32,
    pub backoff_base: f64,
    pub backoff_cap: f64,
    pub jitter_fraction: f64,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            delay: 0.0,
            name: None,
            labels: BTreeSet::new(),
            deadline: None,
            max_retries: 3,
            backoff_base: 2.0,
            backoff_cap: 60.0,
            jitter_fraction: 0.1,
        }
    }
}

pub type StartHook = Arc<dyn Fn(&WorkItem) + Send + Sync>;
pub type EndHook = Arc<
    dyn Fn(&WorkItem, Option<&serde_json::Value>, Option<&SchedulerError>) + Send + Sync,
>;

/// Observer callbacks, fired once per *attempt* (a task retried twice
/// produces three start/end pairs).
#[derive(Clone, Default)]
pub struct TaskHooks {
    pub on_task_start: Option<StartHook>,
    pub on_task_end: Option<EndHook>,
}

/// What actually sits in the heap: a task, or a shutdown sentinel that
/// unblocks one worker loop.
enum Slot {
    Task(WorkItem),
    Shutdown,
}

struct QueuedEntry {
    priority: Priority,
    ready_at: u64,
    sequence: u64,
    slot: Slot,
}

impl QueuedEntry {
    fn task(item: WorkItem) -> Self {
        Self {
            priority: item.priority,
            ready_at: item.ready_at,
            sequence: item.sequence,
            slot: Slot::Task(item),
        }
    }

    fn shutdown(sequence: u64) -> Self {
        Self {
            priority: Priority::Critical,
            ready_at: now_ms(),
            sequence,
            slot: Slot::Shutdown,
        }
    }

    fn key(&self) -> (Priority, u64, u64) {
        (self.priority, self.ready_at, self.sequence)
    }
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Label in-flight bookkeeping. Cap check and increment happen under one
/// lock so two workers cannot both squeeze past a `cap = 1`.
#[derive(Default)]
struct InflightTable {
    counts: HashMap<String, usize>,
    limits: HashMap<String, usize>,
}

impl InflightTable {
    fn try_acquire(&mut self, labels: &BTreeSet<String>) -> bool {
        for label in labels {
            let current = self.counts.get(label).copied().unwrap_or(0);
            if let Some(&cap) = self.limits.get(label) {
                if current >= cap {
                    return false;
                }
            }
        }
        for label in labels {
            *self.counts.entry(label.clone()).or_insert(0) += 1;
        }
        true
    }

    fn release(&mut self, labels: &BTreeSet<String>) {
        for label in labels {
            if let Some(count) = self.counts.get_mut(label) {
                *count = count.saturating_sub(1);
            }
        }
    }

    fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

/// Releases the in-flight slots when dropped, including on handler panic.
struct InflightGuard {
    table: Arc<Mutex<InflightTable>>,
    labels: BTreeSet<String>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.table.lock().unwrap().release(&self.labels);
    }
}

pub struct WorkerPool {
    config: PoolConfig,
    registry: Arc<TaskRegistry>,
    monitor: Arc<dyn ResourceMonitor>,
    hooks: TaskHooks,
    queue: Mutex<BinaryHeap<Reverse<QueuedEntry>>>,
    notify: Notify,
    sequence: AtomicU64,
    paused: AtomicBool,
    stopped: AtomicBool,
    /// Attempts claimed by a worker but not yet finished (covers the
    /// window from queue pop through admission, execution, and any
    /// re-enqueue). Lets a draining stop see work the queue no longer
    /// holds.
    active: AtomicUsize,
    buckets: DashMap<String, TokenBucket>,
    inflight: Arc<Mutex<InflightTable>>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        registry: Arc<TaskRegistry>,
        monitor: Arc<dyn ResourceMonitor>,
        hooks: TaskHooks,
    ) -> Arc<Self> {
        let buckets = DashMap::new();
        for (label, limit) in &config.rate_limits {
            buckets.insert(
                label.clone(),
                TokenBucket::new(limit.fill_rate, limit.capacity),
            );
        }

        Arc::new(Self {
            config,
            registry,
            monitor,
            hooks,
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            sequence: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            buckets,
            inflight: Arc::new(Mutex::new(InflightTable::default())),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the worker loops and returns immediately. Items submitted
    /// before `start` are dispatched once the workers come up.
    pub fn start(self: Arc<Self>) {
        tracing::info!("Starting {} pool workers", self.config.worker_count);

        let mut workers = self.workers.lock().unwrap();
        for worker_id in 0..self.config.worker_count {
            let pool = self.clone();
            workers.push(tokio::spawn(async move {
                pool.worker_loop(worker_id).await;
            }));
        }
    }

    /// Shuts the pool down.
    ///
    /// With `drain = false`, queued work is abandoned: one Critical
    /// zero-delay sentinel per worker unblocks the loops. With
    /// `drain = true`, submissions close first and shutdown waits until
    /// the queue is empty and nothing is in flight (a paused pool is
    /// resumed, otherwise the drain could never finish). A never-started
    /// pool has nothing to drain with, so its queue is abandoned. `wait`
    /// awaits the worker join handles.
    pub async fn stop(&self, wait: bool, drain: bool) {
        self.stopped.store(true, Ordering::SeqCst);

        if drain {
            // A pool that was never started has no workers to do the
            // draining; waiting would spin forever.
            if self.workers.lock().unwrap().is_empty() {
                tracing::warn!(
                    "Draining stop on a never-started pool; abandoning {} queued task(s)",
                    self.queue_len()
                );
            } else {
                self.paused.store(false, Ordering::SeqCst);
                loop {
                    let queue_empty = self.queue.lock().unwrap().is_empty();
                    if queue_empty && self.active.load(Ordering::SeqCst) == 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        {
            let mut queue = self.queue.lock().unwrap();
            for _ in 0..self.config.worker_count {
                let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
                queue.push(Reverse(QueuedEntry::shutdown(sequence)));
            }
        }
        self.notify.notify_waiters();

        if wait {
            let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
            for handle in handles {
                let _ = handle.await;
            }
        }

        tracing::info!("Worker pool stopped (drain: {})", drain);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::info!("Worker pool paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        tracing::info!("Worker pool resumed");
    }

    /// Enqueues a unit of work and returns its id.
    ///
    /// No validation beyond what the types enforce; a negative delay is
    /// clamped to zero. Fails only once the pool has been stopped.
    pub fn submit(
        &self,
        spec: WorkSpec,
        opts: SubmitOptions,
    ) -> Result<TaskId, SchedulerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::PoolStopped);
        }

        let delay = opts.delay.max(0.0);
        let display_name = opts.name.unwrap_or_else(|| match &spec {
            WorkSpec::Named { name, .. } => name.clone(),
            WorkSpec::Closure(_) => "closure".to_string(),
        });

        let item = WorkItem {
            id: TaskId::new(),
            display_name,
            priority: opts.priority,
            ready_at: now_ms() + (delay * 1000.0) as u64,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            spec,
            retry_count: 0,
            max_retries: opts.max_retries,
            backoff_base: opts.backoff_base,
            backoff_cap: opts.backoff_cap,
            jitter_fraction: opts.jitter_fraction,
            deadline: opts.deadline,
            labels: opts.labels,
        };

        let id = item.id.clone();
        tracing::debug!(
            "Submitted task {} ('{}', priority {:?}, delay {:.3}s)",
            id.0,
            item.display_name,
            item.priority,
            delay
        );

        self.enqueue(item);
        Ok(id)
    }

    /// Caps how many tasks carrying `label` may run at once. Labels
    /// without a cap are effectively unbounded.
    pub fn set_concurrency_limit(&self, label: &str, max_inflight: usize) {
        self.inflight
            .lock()
            .unwrap()
            .limits
            .insert(label.to_string(), max_inflight);
        tracing::info!("Concurrency limit for '{}' set to {}", label, max_inflight);
    }

    /// Number of tasks currently queued (excluding shutdown sentinels).
    pub fn queue_len(&self) -> usize {
        self.queue
            .lock()
            .unwrap()
            .iter()
            .filter(|Reverse(e)| matches!(e.slot, Slot::Task(_)))
            .count()
    }

    fn enqueue(&self, item: WorkItem) {
        self.queue.lock().unwrap().push(Reverse(QueuedEntry::task(item)));
        self.notify.notify_one();
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::debug!("Worker {} started", worker_id);

        loop {
            match self.next_slot().await {
                Some(Slot::Shutdown) => break,
                Some(Slot::Task(item)) => {
                    // `active` was claimed in `next_slot` under the queue
                    // lock; released here once the attempt (and any
                    // re-queue it triggered) is done.
                    self.process(item).await;
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                None => continue,
            }
        }

        tracing::debug!("Worker {} stopped", worker_id);
    }

    /// Pops the head entry if it is ready; otherwise waits until either a
    /// submission nudges the queue or the head becomes ready, bounded by
    /// the poll interval so stop signals are picked up promptly.
    async fn next_slot(&self) -> Option<Slot> {
        let wait = {
            let mut queue = self.queue.lock().unwrap();
            match queue.peek() {
                None => Duration::from_millis(self.config.poll_interval_ms),
                Some(Reverse(head)) => {
                    let now = now_ms();
                    if head.ready_at <= now {
                        let Reverse(entry) = queue.pop()?;
                        // Claimed while the queue lock is still held: a
                        // draining stop must never observe an empty queue
                        // with `active == 0` while a popped task is on its
                        // way to the admission gate.
                        if matches!(entry.slot, Slot::Task(_)) {
                            self.active.fetch_add(1, Ordering::SeqCst);
                        }
                        return Some(entry.slot);
                    }
                    Duration::from_millis(
                        (head.ready_at - now).min(self.config.poll_interval_ms),
                    )
                }
            }
        };

        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        None
    }

    async fn process(&self, item: WorkItem) {
        // Admission gate. Order matters only for cheapness: flag checks
        // before the resource probe, buckets before the in-flight lock.
        if self.paused.load(Ordering::SeqCst) {
            self.requeue_blocked(item, "pool paused");
            return;
        }
        if self.resources_hot() {
            self.requeue_blocked(item, "resource pressure");
            return;
        }
        if !self.buckets_allow(&item.labels) {
            self.requeue_blocked(item, "rate limited");
            return;
        }
        let guard = match self.try_acquire_inflight(&item.labels) {
            Some(guard) => guard,
            None => {
                self.requeue_blocked(item, "concurrency cap");
                return;
            }
        };

        self.run_admitted(item, guard).await;
    }

    async fn run_admitted(&self, item: WorkItem, guard: InflightGuard) {
        if item.deadline_passed(now_ms()) {
            drop(guard);
            tracing::warn!(
                "Task {} ('{}') abandoned: deadline passed before dispatch",
                item.id.0,
                item.display_name
            );
            self.finish(&item, None, Some(&SchedulerError::DeadlineExceeded));
            return;
        }

        if let Some(hook) = &self.hooks.on_task_start {
            hook(&item);
        }

        let result = self.run_spec(&item).await;
        drop(guard);

        match result {
            Ok(value) => {
                tracing::debug!(
                    "Task {} ('{}') completed (attempt {})",
                    item.id.0,
                    item.display_name,
                    item.retry_count + 1
                );
                self.finish(&item, Some(&value), None);
            }
            Err(err) => {
                self.finish(&item, None, Some(&err));

                if err.is_retryable() && item.retries_remaining() {
                    let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
                    let retry = item.with_retry(sequence);
                    tracing::info!(
                        "Task {} ('{}') failed (attempt {}): {}; retry {} of {} in {}ms",
                        item.id.0,
                        item.display_name,
                        item.retry_count + 1,
                        err,
                        retry.retry_count,
                        retry.max_retries,
                        retry.ready_at.saturating_sub(now_ms())
                    );
                    self.enqueue(retry);
                } else {
                    tracing::error!(
                        "Task {} ('{}') failed terminally after {} attempt(s): {}",
                        item.id.0,
                        item.display_name,
                        item.retry_count + 1,
                        err
                    );
                }
            }
        }
    }

    async fn run_spec(&self, item: &WorkItem) -> Result<serde_json::Value, SchedulerError> {
        match &item.spec {
            WorkSpec::Closure(task_fn) => task_fn().await.map_err(SchedulerError::Handler),
            WorkSpec::Named {
                name,
                payload,
                context,
            } => {
                self.registry
                    .run(name, payload.clone(), context.clone())
                    .await
            }
        }
    }

    /// Re-enqueues an admission-blocked item with a short fixed delay.
    /// Not a failure: `retry_count` is untouched and no hooks fire.
    fn requeue_blocked(&self, item: WorkItem, reason: &str) {
        tracing::trace!(
            "Task {} ('{}') admission-blocked ({}), re-queueing",
            item.id.0,
            item.display_name,
            reason
        );
        let mut blocked = item;
        blocked.ready_at = now_ms() + self.config.admission_retry_ms;
        self.enqueue(blocked);
    }

    fn resources_hot(&self) -> bool {
        if let Some(threshold) = self.config.cpu_threshold_percent {
            let cpu = self.monitor.cpu_percent();
            if cpu > threshold {
                tracing::debug!("Admission: CPU {:.1}% over threshold {:.1}%", cpu, threshold);
                return true;
            }
        }
        if let Some(name) = &self.config.max_named_process {
            let count = self.monitor.process_count(name);
            if count >= self.config.max_process_count {
                tracing::debug!(
                    "Admission: {} '{}' processes at cap {}",
                    count,
                    name,
                    self.config.max_process_count
                );
                return true;
            }
        }
        false
    }

    /// Every rate-limited label must yield a token. A grant from an
    /// earlier bucket stays spent even if a later bucket refuses; the
    /// buckets refill continuously, so the cost is transient.
    fn buckets_allow(&self, labels: &BTreeSet<String>) -> bool {
        for label in labels {
            if let Some(bucket) = self.buckets.get(label) {
                if !bucket.allow(1.0) {
                    return false;
                }
            }
        }
        true
    }

    fn try_acquire_inflight(&self, labels: &BTreeSet<String>) -> Option<InflightGuard> {
        if self.inflight.lock().unwrap().try_acquire(labels) {
            Some(InflightGuard {
                table: self.inflight.clone(),
                labels: labels.clone(),
            })
        } else {
            None
        }
    }

    fn finish(
        &self,
        item: &WorkItem,
        result: Option<&serde_json::Value>,
        error: Option<&SchedulerError>,
    ) {
        if let Some(hook) = &self.hooks.on_task_end {
            hook(item, result, error);
        }
    }
}
