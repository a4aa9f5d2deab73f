//! Background refresh queue.
//!
//! Accepts "this key may be stale, refresh it eventually" signals without
//! making the caller wait. Each key moves through a small state machine:
//!
//! ```text
//! (none) --enqueue--> Debouncing --delay--> Queued --worker--> InFlight --done--> (none)
//! Debouncing --enqueue--> Debouncing   (timer restarted)
//! Queued/InFlight --enqueue--> unchanged
//! ```
//!
//! # Admission
//!
//! A debounce timer per key coalesces bursts of identical submissions into
//! one refresh. Timers are spawned tasks; resetting one aborts it and bumps
//! a generation counter, so a timer that already woke up cannot promote a
//! key it no longer owns.
//!
//! # Workers
//!
//! Admitted tasks run FIFO. A worker loop is started when a task is
//! admitted and fewer than [`QueueConfig::concurrency`] loops are running;
//! each loop exits once the queue is empty. Failed refreshes are retried
//! per [`QueueConfig::retry`], then logged and dropped. A panicking handler
//! is caught and logged; the loop carries on with the next key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::task::AbortHandle;
use tracing::{debug, error, trace, warn};

use crate::config::QueueConfig;
use crate::key::CacheKey;
use crate::retry::with_retry;
use crate::telemetry;
use crate::{CacheError, Result};

/// A pending refresh. Identity is `(url, credential)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefreshTask {
    pub url: String,
    pub credential: Option<String>,
}

impl RefreshTask {
    pub fn new(url: impl Into<String>, credential: Option<String>) -> Self {
        Self {
            url: url.into(),
            credential,
        }
    }

    /// Identity key of this task.
    pub fn key(&self) -> CacheKey {
        CacheKey::new(&self.url, self.credential.as_deref())
    }
}

/// Where a key sits in the admission state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting out the admission delay; another enqueue restarts it.
    Debouncing,
    /// Admitted, waiting for a worker.
    Queued,
    /// Being fetched.
    InFlight,
}

/// Work the queue performs for each admitted task.
#[async_trait]
pub trait RefreshHandler: Send + Sync + 'static {
    type Output: Send;

    /// Fetch fresh data. Retried on transient errors.
    async fn fetch(&self, task: &RefreshTask) -> Result<Self::Output>;

    /// Called once per successful fetch, off any caller's path.
    async fn on_complete(&self, task: &RefreshTask, output: Self::Output);
}

struct Timer {
    generation: u64,
    handle: AbortHandle,
    task: RefreshTask,
}

#[derive(Default)]
struct QueueState {
    debouncing: HashMap<CacheKey, Timer>,
    queued: VecDeque<RefreshTask>,
    queued_keys: HashSet<CacheKey>,
    in_flight: HashSet<CacheKey>,
    workers: usize,
    next_generation: u64,
    closed: bool,
}

struct Shared<H> {
    handler: H,
    config: QueueConfig,
    state: Mutex<QueueState>,
}

/// Debounced, deduplicating background refresh queue.
///
/// Must be used from within a tokio runtime.
pub struct RefreshQueue<H: RefreshHandler> {
    shared: Arc<Shared<H>>,
}

impl<H: RefreshHandler> RefreshQueue<H> {
    pub fn new(handler: H, config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                handler,
                config,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Ask for `url` to be refreshed eventually. Never blocks.
    pub fn enqueue(&self, url: &str, credential: Option<&str>) {
        let task = RefreshTask::new(url, credential.map(str::to_string));
        let key = task.key();
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        if state.queued_keys.contains(&key) || state.in_flight.contains(&key) {
            trace!(key = %key, "refresh already committed");
            return;
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        if let Some(previous) = state.debouncing.remove(&key) {
            previous.handle.abort();
            trace!(key = %key, "refresh debounce restarted");
        } else {
            debug!(key = %key, "refresh scheduled");
        }

        let shared = Arc::clone(&self.shared);
        let delay = self.shared.config.admission_delay;
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Shared::admit(&shared, &timer_key, generation);
        });
        state.debouncing.insert(
            key,
            Timer {
                generation,
                handle: handle.abort_handle(),
                task,
            },
        );
    }

    /// Current state of `(url, credential)`, or `None` if no task exists.
    pub fn state(&self, url: &str, credential: Option<&str>) -> Option<TaskState> {
        let key = CacheKey::new(url, credential);
        let state = self.shared.lock();
        if state.in_flight.contains(&key) {
            Some(TaskState::InFlight)
        } else if state.queued_keys.contains(&key) {
            Some(TaskState::Queued)
        } else if state.debouncing.contains_key(&key) {
            Some(TaskState::Debouncing)
        } else {
            None
        }
    }

    /// Number of tasks in any state.
    pub fn pending(&self) -> usize {
        let state = self.shared.lock();
        state.debouncing.len() + state.queued.len() + state.in_flight.len()
    }

    /// Whether no task exists in any state.
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Cancel all admission timers and drop queued tasks.
    ///
    /// In-flight refreshes run to completion. Later `enqueue` calls are
    /// ignored.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        for (_, timer) in state.debouncing.drain() {
            timer.handle.abort();
        }
        state.queued.clear();
        state.queued_keys.clear();
    }
}

impl<H: RefreshHandler> Drop for RefreshQueue<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<H: RefreshHandler> Shared<H> {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Timer callback: move `key` from Debouncing to Queued.
    fn admit(this: &Arc<Self>, key: &CacheKey, generation: u64) {
        let mut state = this.lock();
        let current = state.debouncing.get(key).map(|t| t.generation);
        if current != Some(generation) {
            return;
        }
        let Some(timer) = state.debouncing.remove(key) else {
            return;
        };
        state.queued_keys.insert(key.clone());
        state.queued.push_back(timer.task);
        debug!(key = %key, queued = state.queued.len(), "refresh admitted");

        if state.workers < this.config.concurrency.max(1) {
            state.workers += 1;
            tokio::spawn(Self::worker_loop(Arc::clone(this)));
        }
    }

    async fn worker_loop(this: Arc<Self>) {
        loop {
            let task = {
                let mut state = this.lock();
                let Some(task) = state.queued.pop_front() else {
                    state.workers -= 1;
                    return;
                };
                let key = task.key();
                state.queued_keys.remove(&key);
                if !state.in_flight.insert(key) {
                    let e = CacheError::Admission(format!(
                        "{} dequeued while already in flight",
                        task.url
                    ));
                    error!(error = %e, "refresh queue invariant violated");
                    continue;
                }
                task
            };

            if AssertUnwindSafe(this.run(&task))
                .catch_unwind()
                .await
                .is_err()
            {
                error!(url = %task.url, "refresh handler panicked");
            }

            this.lock().in_flight.remove(&task.key());
        }
    }

    async fn run(&self, task: &RefreshTask) {
        let result = with_retry(&self.config.retry, &task.url, || self.handler.fetch(task)).await;
        match result {
            Ok(output) => {
                metrics::counter!(telemetry::REFRESHES_TOTAL, "status" => "ok").increment(1);
                self.handler.on_complete(task, output).await;
            }
            Err(e) => {
                metrics::counter!(telemetry::REFRESHES_TOTAL, "status" => "error").increment(1);
                warn!(url = %task.url, error = %e, "background refresh failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::Instant;

    const DELAY: Duration = Duration::from_secs(5);

    /// Records every fetch; fails URLs listed in `failing`.
    #[derive(Default)]
    struct Recorder {
        fetches: Mutex<Vec<(String, Instant)>>,
        completed: AtomicU32,
        failing: Vec<&'static str>,
        panicking: Vec<&'static str>,
        gate: Option<Arc<Semaphore>>,
        running: AtomicU32,
        max_running: AtomicU32,
    }

    impl Recorder {
        fn fetch_count(&self) -> usize {
            self.fetches.lock().unwrap().len()
        }

        fn fetched_urls(&self) -> Vec<String> {
            self.fetches
                .lock()
                .unwrap()
                .iter()
                .map(|(u, _)| u.clone())
                .collect()
        }
    }

    #[async_trait]
    impl RefreshHandler for Arc<Recorder> {
        type Output = String;

        async fn fetch(&self, task: &RefreshTask) -> Result<String> {
            self.fetches
                .lock()
                .unwrap()
                .push((task.url.clone(), Instant::now()));
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await.unwrap();
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.panicking.contains(&task.url.as_str()) {
                panic!("boom");
            }
            if self.failing.contains(&task.url.as_str()) {
                return Err(CacheError::Http("connection refused".into()));
            }
            Ok(format!("body of {}", task.url))
        }

        async fn on_complete(&self, _task: &RefreshTask, _output: String) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> QueueConfig {
        QueueConfig::new()
            .admission_delay(DELAY)
            .retry(RetryConfig::disabled())
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_enqueues_fetches_once_after_last_call() {
        let recorder = Arc::new(Recorder::default());
        let queue = RefreshQueue::new(recorder.clone(), config());

        queue.enqueue("http://a", None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.enqueue("http://a", None);
        let second_call = Instant::now();
        assert_eq!(queue.state("http://a", None), Some(TaskState::Debouncing));

        tokio::time::sleep(Duration::from_secs(30)).await;

        let fetches = recorder.fetches.lock().unwrap().clone();
        assert_eq!(fetches.len(), 1);
        assert!(fetches[0].1 - second_call >= DELAY);
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
        assert!(queue.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_runs_before_admission_delay() {
        let recorder = Arc::new(Recorder::default());
        let queue = RefreshQueue::new(recorder.clone(), config());

        queue.enqueue("http://a", None);
        tokio::time::sleep(DELAY - Duration::from_millis(1)).await;
        assert_eq!(recorder.fetch_count(), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(recorder.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_while_in_flight_is_a_no_op() {
        let gate = Arc::new(Semaphore::new(0));
        let recorder = Arc::new(Recorder {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let queue = RefreshQueue::new(recorder.clone(), config());

        queue.enqueue("http://a", None);
        tokio::time::sleep(DELAY + Duration::from_millis(1)).await;
        assert_eq!(queue.state("http://a", None), Some(TaskState::InFlight));

        queue.enqueue("http://a", None);
        assert_eq!(queue.state("http://a", None), Some(TaskState::InFlight));
        assert_eq!(queue.pending(), 1);

        gate.add_permits(1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.fetch_count(), 1);
        assert_eq!(queue.state("http://a", None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn credentials_are_separate_tasks() {
        let recorder = Arc::new(Recorder::default());
        let queue = RefreshQueue::new(recorder.clone(), config());

        queue.enqueue("http://a", None);
        queue.enqueue("http://a", Some("tok"));
        assert_eq!(queue.pending(), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn admitted_tasks_run_in_insertion_order() {
        let recorder = Arc::new(Recorder::default());
        let queue = RefreshQueue::new(recorder.clone(), config());

        for url in ["http://a", "http://b", "http://c"] {
            queue.enqueue(url, None);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(
            recorder.fetched_urls(),
            vec!["http://a", "http://b", "http://c"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_key_does_not_block_others() {
        let recorder = Arc::new(Recorder {
            failing: vec!["http://bad"],
            ..Default::default()
        });
        let queue = RefreshQueue::new(recorder.clone(), config());

        queue.enqueue("http://bad", None);
        queue.enqueue("http://good", None);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(recorder.fetch_count(), 2);
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
        assert!(queue.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let recorder = Arc::new(Recorder {
            failing: vec!["http://flaky"],
            ..Default::default()
        });
        let queue = RefreshQueue::new(
            recorder.clone(),
            config().retry(RetryConfig::new().max_attempts(3)),
        );

        queue.enqueue("http://flaky", None);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(recorder.fetch_count(), 3);
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_does_not_kill_worker() {
        let recorder = Arc::new(Recorder {
            panicking: vec!["http://panic"],
            ..Default::default()
        });
        let queue = RefreshQueue::new(recorder.clone(), config());

        queue.enqueue("http://panic", None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue("http://after", None);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(recorder.fetched_urls(), vec!["http://panic", "http://after"]);
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
        assert!(queue.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn single_worker_processes_one_key_at_a_time() {
        let recorder = Arc::new(Recorder::default());
        let queue = RefreshQueue::new(recorder.clone(), config());

        for i in 0..5 {
            queue.enqueue(&format!("http://k{i}"), None);
        }
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(recorder.fetch_count(), 5);
        assert_eq!(recorder.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_allows_parallel_keys() {
        let gate = Arc::new(Semaphore::new(0));
        let recorder = Arc::new(Recorder {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let queue = RefreshQueue::new(recorder.clone(), config().concurrency(2));

        for i in 0..3 {
            queue.enqueue(&format!("http://k{i}"), None);
        }
        tokio::time::sleep(DELAY + Duration::from_millis(1)).await;
        assert_eq!(recorder.running.load(Ordering::SeqCst), 2);

        gate.add_permits(3);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(recorder.fetch_count(), 3);
        assert_eq!(recorder.max_running.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_debouncing_tasks() {
        let recorder = Arc::new(Recorder::default());
        let queue = RefreshQueue::new(recorder.clone(), config());

        queue.enqueue("http://a", None);
        queue.shutdown();
        queue.enqueue("http://b", None);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(recorder.fetch_count(), 0);
        assert!(queue.is_idle());
    }
}
