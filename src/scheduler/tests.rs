//! Scheduler Tests
//!
//! Exercises the observable contract of the worker pool and its leaf
//! components: dispatch ordering, delay and deadline handling, retry
//! backoff, rate limiting, and concurrency capping.
//!
//! ## Test Scopes
//! - **Ordering**: priority order and FIFO tiebreak among ready items.
//! - **Timing**: submission delays, deterministic backoff, token refill.
//! - **Admission**: pause/resume, per-label concurrency caps.
//! - **Lifecycle**: stop semantics, per-attempt hook behavior.

#[cfg(test)]
mod tests {
    use crate::error::SchedulerError;
    use crate::scheduler::bucket::TokenBucket;
    use crate::scheduler::monitor::{ResourceMonitor, StaticMonitor};
    use crate::scheduler::pool::{
        PoolConfig, RateLimit, SubmitOptions, TaskHooks, WorkerPool,
    };
    use crate::scheduler::registry::TaskRegistry;
    use crate::scheduler::types::{
        now_ms, Priority, TaskFuture, WorkItem, WorkSpec,
    };

    use std::collections::{BTreeSet, HashMap};
    use std::future::Future;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    // ------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------

    /// Captures hook invocations for assertions.
    #[derive(Clone, Default)]
    struct Recorder {
        starts: Arc<Mutex<Vec<(String, u32, Instant)>>>,
        ends: Arc<Mutex<Vec<(String, u32, bool, Option<String>, Instant)>>>,
    }

    impl Recorder {
        fn hooks(&self) -> TaskHooks {
            let starts = self.starts.clone();
            let ends = self.ends.clone();
            TaskHooks {
                on_task_start: Some(Arc::new(move |item: &WorkItem| {
                    starts.lock().unwrap().push((
                        item.display_name.clone(),
                        item.retry_count,
                        Instant::now(),
                    ));
                })),
                on_task_end: Some(Arc::new(
                    move |item: &WorkItem,
                          result: Option<&serde_json::Value>,
                          error: Option<&SchedulerError>| {
                        ends.lock().unwrap().push((
                            item.display_name.clone(),
                            item.retry_count,
                            result.is_some(),
                            error.map(|e| e.to_string()),
                            Instant::now(),
                        ));
                    },
                )),
            }
        }

        fn start_names(&self) -> Vec<String> {
            self.starts
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _, _)| name.clone())
                .collect()
        }

        fn start_count(&self) -> usize {
            self.starts.lock().unwrap().len()
        }

        fn end_count(&self) -> usize {
            self.ends.lock().unwrap().len()
        }
    }

    /// A probe whose readings can be flipped mid-test.
    struct AdjustableMonitor {
        cpu: Arc<AtomicUsize>,
        processes: Arc<AtomicUsize>,
    }

    impl ResourceMonitor for AdjustableMonitor {
        fn cpu_percent(&self) -> f64 {
            self.cpu.load(Ordering::SeqCst) as f64
        }

        fn process_count(&self, _name: &str) -> usize {
            self.processes.load(Ordering::SeqCst)
        }
    }

    fn test_pool(config: PoolConfig, hooks: TaskHooks) -> Arc<WorkerPool> {
        WorkerPool::new(
            config,
            TaskRegistry::new(),
            Arc::new(StaticMonitor::idle()),
            hooks,
        )
    }

    fn closure<F, Fut>(f: F) -> WorkSpec
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        WorkSpec::Closure(Arc::new(move || Box::pin(f()) as TaskFuture))
    }

    fn noop() -> WorkSpec {
        closure(|| async { Ok(serde_json::Value::Null) })
    }

    fn labels(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    // ============================================================
    // TEST 1: Priority ordering
    // ============================================================

    #[tokio::test]
    async fn test_priority_ordering() {
        // ARRANGE: one worker, three priorities submitted low-first
        // before the workers come up, so all are ready simultaneously.
        let recorder = Recorder::default();
        let pool = test_pool(
            PoolConfig {
                worker_count: 1,
                ..PoolConfig::default()
            },
            recorder.hooks(),
        );

        for (name, priority) in [
            ("low", Priority::Low),
            ("crit", Priority::Critical),
            ("norm", Priority::Normal),
        ] {
            pool.submit(
                noop(),
                SubmitOptions {
                    priority,
                    name: Some(name.to_string()),
                    ..SubmitOptions::default()
                },
            )
            .unwrap();
        }

        // ACT
        pool.clone().start();
        assert!(wait_for(|| recorder.start_count() == 3, Duration::from_secs(2)).await);

        // ASSERT: dispatch follows priority, not submission order
        assert_eq!(recorder.start_names(), vec!["crit", "norm", "low"]);

        pool.stop(true, false).await;
    }

    // ============================================================
    // TEST 2: FIFO tiebreak within a priority
    // ============================================================

    #[tokio::test]
    async fn test_fifo_tiebreak() {
        // ARRANGE
        let recorder = Recorder::default();
        let pool = test_pool(
            PoolConfig {
                worker_count: 1,
                ..PoolConfig::default()
            },
            recorder.hooks(),
        );

        for name in ["a", "b"] {
            pool.submit(
                noop(),
                SubmitOptions {
                    name: Some(name.to_string()),
                    ..SubmitOptions::default()
                },
            )
            .unwrap();
        }

        // ACT
        pool.clone().start();
        assert!(wait_for(|| recorder.start_count() == 2, Duration::from_secs(2)).await);

        // ASSERT
        assert_eq!(recorder.start_names(), vec!["a", "b"]);

        pool.stop(true, false).await;
    }

    // ============================================================
    // TEST 3: Submission delay is honored
    // ============================================================

    #[tokio::test]
    async fn test_delay_honored() {
        // ARRANGE
        let recorder = Recorder::default();
        let pool = test_pool(
            PoolConfig {
                worker_count: 1,
                ..PoolConfig::default()
            },
            recorder.hooks(),
        );
        pool.clone().start();

        // ACT
        let submitted = Instant::now();
        pool.submit(
            noop(),
            SubmitOptions {
                delay: 1.0,
                name: Some("delayed".to_string()),
                ..SubmitOptions::default()
            },
        )
        .unwrap();

        assert!(wait_for(|| recorder.start_count() == 1, Duration::from_secs(3)).await);

        // ASSERT: not before the delay, dispatched within delay + poll slop
        let started = recorder.starts.lock().unwrap()[0].2;
        let elapsed = started.duration_since(submitted);
        assert!(
            elapsed >= Duration::from_millis(950),
            "dispatched too early: {:?}",
            elapsed
        );
        assert!(
            elapsed <= Duration::from_millis(1600),
            "dispatched too late: {:?}",
            elapsed
        );

        pool.stop(true, false).await;
    }

    // ============================================================
    // TEST 4: Deterministic exponential backoff
    // ============================================================

    #[tokio::test]
    async fn test_deterministic_backoff() {
        // ARRANGE: handler fails twice, then succeeds. With base 2.0 and
        // zero jitter the inter-attempt delays are 2^0 = 1s and 2^1 = 2s.
        let recorder = Recorder::default();
        let pool = test_pool(
            PoolConfig {
                worker_count: 1,
                ..PoolConfig::default()
            },
            recorder.hooks(),
        );
        pool.clone().start();

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        pool.submit(
            closure(move || {
                let attempts = attempts_clone.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        anyhow::bail!("transient failure");
                    }
                    Ok(serde_json::Value::Null)
                }
            }),
            SubmitOptions {
                name: Some("flaky".to_string()),
                max_retries: 2,
                backoff_base: 2.0,
                backoff_cap: 60.0,
                jitter_fraction: 0.0,
                ..SubmitOptions::default()
            },
        )
        .unwrap();

        // ACT: three attempts total
        assert!(wait_for(|| recorder.start_count() == 3, Duration::from_secs(6)).await);
        assert!(wait_for(|| recorder.end_count() == 3, Duration::from_secs(1)).await);

        // ASSERT: inter-attempt gaps track the backoff schedule
        let starts = recorder.starts.lock().unwrap().clone();
        let gap1 = starts[1].2.duration_since(starts[0].2);
        let gap2 = starts[2].2.duration_since(starts[1].2);
        assert!(
            gap1 >= Duration::from_millis(900) && gap1 <= Duration::from_millis(1600),
            "first retry gap {:?}",
            gap1
        );
        assert!(
            gap2 >= Duration::from_millis(1900) && gap2 <= Duration::from_millis(2600),
            "second retry gap {:?}",
            gap2
        );

        // Final attempt succeeds with retry_count = 2; earlier attempts
        // each reported their failure through the end hook.
        let ends = recorder.ends.lock().unwrap();
        let (_, retry_count, ok, error, _) = ends.last().unwrap().clone();
        assert_eq!(retry_count, 2);
        assert!(ok);
        assert!(error.is_none());
        assert!(ends[0].3.is_some());
        assert!(ends[1].3.is_some());

        pool.stop(true, false).await;
    }

    // ============================================================
    // TEST 5: Token bucket refill
    // ============================================================

    #[test]
    fn test_token_bucket_refill() {
        // ARRANGE: 1 token/sec, capacity 1, starts full
        let bucket = TokenBucket::new(1.0, 1.0);

        // ACT + ASSERT
        assert!(bucket.allow(1.0), "fresh bucket should grant");
        assert!(!bucket.allow(1.0), "empty bucket should refuse");

        std::thread::sleep(Duration::from_millis(1050));
        assert!(bucket.allow(1.0), "bucket should refill after 1s");
    }

    #[test]
    fn test_token_bucket_caps_at_capacity() {
        let bucket = TokenBucket::new(1.0, 2.0);
        std::thread::sleep(Duration::from_millis(100));

        // Refill is clamped to capacity regardless of elapsed time.
        assert!(bucket.allow(2.0));
        assert!(!bucket.allow(1.0));
    }

    // ============================================================
    // TEST 6: Per-label concurrency cap
    // ============================================================

    #[tokio::test]
    async fn test_concurrency_cap_no_overlap() {
        // ARRANGE: four workers but "llm" capped at one in flight.
        let recorder = Recorder::default();
        let pool = test_pool(
            PoolConfig {
                worker_count: 4,
                ..PoolConfig::default()
            },
            recorder.hooks(),
        );
        pool.set_concurrency_limit("llm", 1);
        pool.clone().start();

        let intervals: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        for name in ["llm-1", "llm-2"] {
            let intervals = intervals.clone();
            pool.submit(
                closure(move || {
                    let intervals = intervals.clone();
                    async move {
                        let begin = Instant::now();
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        intervals.lock().unwrap().push((begin, Instant::now()));
                        Ok(serde_json::Value::Null)
                    }
                }),
                SubmitOptions {
                    name: Some(name.to_string()),
                    labels: labels(&["llm"]),
                    ..SubmitOptions::default()
                },
            )
            .unwrap();
        }

        // ACT
        assert!(wait_for(|| intervals.lock().unwrap().len() == 2, Duration::from_secs(4)).await);

        // ASSERT: execution windows never overlap
        let mut windows = intervals.lock().unwrap().clone();
        windows.sort_by_key(|(begin, _)| *begin);
        assert!(
            windows[0].1 <= windows[1].0,
            "capped executions overlapped: {:?}",
            windows
        );

        pool.stop(true, false).await;
    }

    // ============================================================
    // TEST 7: Deadline abandonment
    // ============================================================

    #[tokio::test]
    async fn test_deadline_abandonment() {
        // ARRANGE: deadline already in the past at submission time.
        let recorder = Recorder::default();
        let pool = test_pool(PoolConfig::default(), recorder.hooks());
        pool.clone().start();

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        pool.submit(
            closure(move || {
                let ran = ran_clone.clone();
                async move {
                    ran.store(true, Ordering::SeqCst);
                    Ok(serde_json::Value::Null)
                }
            }),
            SubmitOptions {
                name: Some("stale".to_string()),
                deadline: Some(now_ms() - 1_000),
                ..SubmitOptions::default()
            },
        )
        .unwrap();

        // ACT
        assert!(wait_for(|| recorder.end_count() == 1, Duration::from_secs(2)).await);

        // ASSERT: handler never ran, end hook reported the abandonment
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(recorder.start_count(), 0);
        let ends = recorder.ends.lock().unwrap();
        let error = ends[0].3.as_deref().unwrap();
        assert!(error.contains("deadline"), "unexpected error: {}", error);

        pool.stop(true, false).await;
    }

    // ============================================================
    // TEST 8: Pause and resume
    // ============================================================

    #[tokio::test]
    async fn test_pause_blocks_dispatch() {
        // ARRANGE
        let recorder = Recorder::default();
        let pool = test_pool(
            PoolConfig {
                worker_count: 2,
                ..PoolConfig::default()
            },
            recorder.hooks(),
        );
        pool.clone().start();
        pool.pause();

        pool.submit(noop(), SubmitOptions::default()).unwrap();

        // ACT: paused pool re-queues through the admission gate
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(recorder.start_count(), 0, "paused pool must not dispatch");

        pool.resume();

        // ASSERT
        assert!(wait_for(|| recorder.start_count() == 1, Duration::from_secs(2)).await);

        pool.stop(true, false).await;
    }

    // ============================================================
    // TEST 9: Unknown handler name is terminal
    // ============================================================

    #[tokio::test]
    async fn test_unknown_handler_not_retried() {
        // ARRANGE: a named spec with no matching registry entry and
        // retries configured. NotFound cannot succeed later, so only a
        // single attempt is made.
        let recorder = Recorder::default();
        let pool = test_pool(PoolConfig::default(), recorder.hooks());
        pool.clone().start();

        pool.submit(
            WorkSpec::Named {
                name: "missing".to_string(),
                payload: serde_json::json!({}),
                context: Default::default(),
            },
            SubmitOptions {
                max_retries: 3,
                ..SubmitOptions::default()
            },
        )
        .unwrap();

        // ACT
        assert!(wait_for(|| recorder.end_count() == 1, Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(400)).await;

        // ASSERT: exactly one attempt, reported as NotFound
        assert_eq!(recorder.end_count(), 1);
        let ends = recorder.ends.lock().unwrap();
        let error = ends[0].3.as_deref().unwrap();
        assert!(error.contains("missing"), "unexpected error: {}", error);

        pool.stop(true, false).await;
    }

    // ============================================================
    // TEST 10: Registry lookup and execution
    // ============================================================

    #[tokio::test]
    async fn test_registry_run_and_not_found() {
        // ARRANGE
        let registry = TaskRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        registry.register("double", move |payload, _context| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let n = payload["n"].as_i64().unwrap_or(0);
                Ok(serde_json::json!({ "result": n * 2 }))
            }
        });

        assert!(registry.has_handler("double"));
        assert_eq!(registry.handler_count(), 1);

        // ACT
        let result = registry
            .run("double", serde_json::json!({"n": 21}), Default::default())
            .await
            .unwrap();

        // ASSERT
        assert_eq!(result["result"], 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let missing = registry
            .run("nope", serde_json::json!({}), Default::default())
            .await;
        assert!(matches!(missing, Err(SchedulerError::NotFound(_))));
    }

    // ============================================================
    // TEST 11: Backoff math
    // ============================================================

    #[test]
    fn test_backoff_math() {
        let mut item = WorkItem {
            id: crate::scheduler::types::TaskId::new(),
            display_name: "t".to_string(),
            priority: Priority::Normal,
            ready_at: now_ms(),
            sequence: 0,
            spec: noop(),
            retry_count: 0,
            max_retries: 5,
            backoff_base: 2.0,
            backoff_cap: 60.0,
            jitter_fraction: 0.0,
            deadline: None,
            labels: BTreeSet::new(),
        };

        // base^retry_count, capped
        assert_eq!(item.backoff_delay(), Duration::from_secs(1));
        item.retry_count = 1;
        assert_eq!(item.backoff_delay(), Duration::from_secs(2));
        item.retry_count = 10;
        assert_eq!(item.backoff_delay(), Duration::from_secs(60));

        // floored at 50ms
        item.retry_count = 1;
        item.backoff_base = 0.01;
        assert_eq!(item.backoff_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_with_retry_derivation() {
        let item = WorkItem {
            id: crate::scheduler::types::TaskId::new(),
            display_name: "t".to_string(),
            priority: Priority::High,
            ready_at: now_ms(),
            sequence: 7,
            spec: noop(),
            retry_count: 0,
            max_retries: 3,
            backoff_base: 2.0,
            backoff_cap: 60.0,
            jitter_fraction: 0.0,
            deadline: None,
            labels: labels(&["gpu"]),
        };

        let retry = item.with_retry(42);

        // Same identity, bumped bookkeeping, pushed-out ready time.
        assert_eq!(retry.id, item.id);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.sequence, 42);
        assert!(retry.ready_at >= item.ready_at + 1_000);
        assert_eq!(retry.priority, item.priority);
        assert_eq!(retry.labels, item.labels);
    }

    // ============================================================
    // TEST 12: Priority codes
    // ============================================================

    #[test]
    fn test_priority_codes() {
        assert_eq!(Priority::Critical.code(), 0);
        assert_eq!(Priority::Low.code(), 3);
        assert_eq!(Priority::from_code(1), Some(Priority::High));
        assert_eq!(Priority::from_code(4), None);

        // Dispatch order: lower code is more urgent.
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::Normal < Priority::Low);
    }

    // ============================================================
    // TEST 13: Stop semantics
    // ============================================================

    #[tokio::test]
    async fn test_stop_rejects_new_submissions() {
        let recorder = Recorder::default();
        let pool = test_pool(PoolConfig::default(), recorder.hooks());
        pool.clone().start();

        pool.stop(true, false).await;

        let result = pool.submit(noop(), SubmitOptions::default());
        assert!(matches!(result, Err(SchedulerError::PoolStopped)));
    }

    #[tokio::test]
    async fn test_draining_stop_finishes_queued_work() {
        // ARRANGE: queued work present when stop(drain) is called.
        let recorder = Recorder::default();
        let pool = test_pool(
            PoolConfig {
                worker_count: 2,
                ..PoolConfig::default()
            },
            recorder.hooks(),
        );

        for i in 0..5 {
            pool.submit(
                noop(),
                SubmitOptions {
                    name: Some(format!("task-{}", i)),
                    ..SubmitOptions::default()
                },
            )
            .unwrap();
        }
        pool.clone().start();

        // ACT
        pool.stop(true, true).await;

        // ASSERT: every queued task ran to completion before shutdown
        assert_eq!(recorder.end_count(), 5);
    }

    // ============================================================
    // TEST 14: Resource-pressure admission gate
    // ============================================================

    #[tokio::test]
    async fn test_cpu_pressure_blocks_dispatch() {
        // ARRANGE: threshold 50%, probe reading 100%.
        let cpu = Arc::new(AtomicUsize::new(100));
        let recorder = Recorder::default();
        let pool = WorkerPool::new(
            PoolConfig {
                worker_count: 1,
                cpu_threshold_percent: Some(50.0),
                ..PoolConfig::default()
            },
            TaskRegistry::new(),
            Arc::new(AdjustableMonitor {
                cpu: cpu.clone(),
                processes: Arc::new(AtomicUsize::new(0)),
            }),
            recorder.hooks(),
        );
        pool.clone().start();

        pool.submit(noop(), SubmitOptions::default()).unwrap();

        // ACT: several admission-retry cycles pass while the host is hot
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(recorder.start_count(), 0, "hot host must not dispatch");

        // Pressure clears, the re-queued item dispatches.
        cpu.store(10, Ordering::SeqCst);

        // ASSERT
        assert!(wait_for(|| recorder.start_count() == 1, Duration::from_secs(2)).await);

        pool.stop(true, false).await;
    }

    #[tokio::test]
    async fn test_process_cap_blocks_dispatch() {
        // ARRANGE: at most one "ollama" process tolerated; probe sees one.
        let processes = Arc::new(AtomicUsize::new(1));
        let recorder = Recorder::default();
        let pool = WorkerPool::new(
            PoolConfig {
                worker_count: 1,
                max_named_process: Some("ollama".to_string()),
                max_process_count: 1,
                ..PoolConfig::default()
            },
            TaskRegistry::new(),
            Arc::new(AdjustableMonitor {
                cpu: Arc::new(AtomicUsize::new(0)),
                processes: processes.clone(),
            }),
            recorder.hooks(),
        );
        pool.clone().start();

        pool.submit(noop(), SubmitOptions::default()).unwrap();

        // ACT
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(recorder.start_count(), 0, "process cap must not dispatch");

        processes.store(0, Ordering::SeqCst);

        // ASSERT
        assert!(wait_for(|| recorder.start_count() == 1, Duration::from_secs(2)).await);

        pool.stop(true, false).await;
    }

    // ============================================================
    // TEST 15: Drain covers admission-requeued work
    // ============================================================

    #[tokio::test]
    async fn test_draining_stop_waits_for_rate_limited_work() {
        // ARRANGE: four "slow" tasks behind a capacity-1 bucket, so most
        // attempts bounce through the admission re-queue path while the
        // drain is in progress.
        let recorder = Recorder::default();
        let pool = test_pool(
            PoolConfig {
                worker_count: 2,
                rate_limits: HashMap::from([(
                    "slow".to_string(),
                    RateLimit {
                        fill_rate: 5.0,
                        capacity: 1.0,
                    },
                )]),
                ..PoolConfig::default()
            },
            recorder.hooks(),
        );
        pool.clone().start();

        for i in 0..4 {
            pool.submit(
                noop(),
                SubmitOptions {
                    name: Some(format!("slow-{}", i)),
                    labels: labels(&["slow"]),
                    ..SubmitOptions::default()
                },
            )
            .unwrap();
        }

        // ACT
        pool.stop(true, true).await;

        // ASSERT: the drain outlasted every re-queue cycle
        assert_eq!(recorder.end_count(), 4);
        let ends = recorder.ends.lock().unwrap();
        assert!(ends.iter().all(|(_, _, ok, _, _)| *ok));
    }

    // ============================================================
    // TEST 16: Draining stop on a never-started pool
    // ============================================================

    #[tokio::test]
    async fn test_draining_stop_without_start_returns() {
        // ARRANGE: queued items but no workers to drain them.
        let pool = test_pool(PoolConfig::default(), TaskHooks::default());
        pool.submit(noop(), SubmitOptions::default()).unwrap();
        pool.submit(noop(), SubmitOptions::default()).unwrap();

        // ACT: must return instead of waiting on the queue forever
        pool.stop(true, true).await;

        // ASSERT
        let result = pool.submit(noop(), SubmitOptions::default());
        assert!(matches!(result, Err(SchedulerError::PoolStopped)));
    }
}
