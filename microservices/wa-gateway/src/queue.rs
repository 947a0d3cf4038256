//! In-process job queue runtime
//!
//! Named queues with a fixed worker pool, a sliding-window rate limiter
//! independent of per-job delay, per-job priority, retries with
//! exponential backoff and jitter, and predicate removal of pending jobs.
//! Handlers report a typed outcome; jobs that exhaust their attempts are
//! parked for inspection.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Outcome of a failed or deferred job execution.
#[derive(Debug)]
pub enum JobError {
    /// Transient failure; counts an attempt and backs off.
    Retry(String),
    /// Non-retryable; the job is dropped with a log line.
    Discard(String),
    /// Reschedule after the given delay without consuming an attempt.
    Postpone(Duration),
}

pub type JobResult = std::result::Result<(), JobError>;

#[async_trait]
pub trait JobHandler<J>: Send + Sync + 'static {
    async fn handle(&self, job: &J) -> JobResult;
}

/// Sliding-window execution budget: at most `max` runs per `window`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub concurrency: usize,
    pub rate_limit: Option<RateLimit>,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_limit: None,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

struct Job<J> {
    run_at: Instant,
    priority: u8,
    seq: u64,
    attempt: u32,
    data: J,
}

/// Heap ordering for not-yet-due jobs: earliest `run_at` pops first.
struct TimeOrdered<J>(Job<J>);

impl<J> PartialEq for TimeOrdered<J> {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl<J> Eq for TimeOrdered<J> {}

impl<J> PartialOrd for TimeOrdered<J> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<J> Ord for TimeOrdered<J> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .0
            .run_at
            .cmp(&self.0.run_at)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// Heap ordering for due jobs: highest priority pops first, FIFO within
/// a priority.
struct ReadyOrdered<J>(Job<J>);

impl<J> PartialEq for ReadyOrdered<J> {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl<J> Eq for ReadyOrdered<J> {}

impl<J> PartialOrd for ReadyOrdered<J> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<J> Ord for ReadyOrdered<J> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// Pending jobs split by due-ness; workers promote due jobs before
/// picking by priority.
struct PendingSet<J> {
    scheduled: BinaryHeap<TimeOrdered<J>>,
    ready: BinaryHeap<ReadyOrdered<J>>,
}

impl<J> PendingSet<J> {
    fn new() -> Self {
        Self {
            scheduled: BinaryHeap::new(),
            ready: BinaryHeap::new(),
        }
    }

    fn len(&self) -> usize {
        self.scheduled.len() + self.ready.len()
    }

    fn promote_due(&mut self, now: Instant) {
        while self
            .scheduled
            .peek()
            .map(|j| j.0.run_at <= now)
            .unwrap_or(false)
        {
            if let Some(job) = self.scheduled.pop() {
                self.ready.push(ReadyOrdered(job.0));
            }
        }
    }
}

struct RateWindow {
    count: u32,
    window_start: Instant,
}

#[derive(Default)]
struct QueueMetrics {
    enqueued: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    discarded: AtomicU64,
    parked: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub completed: u64,
    pub retried: u64,
    pub discarded: u64,
    pub parked: u64,
    pub pending: usize,
}

struct QueueState<J> {
    name: String,
    opts: QueueOptions,
    pending: Mutex<PendingSet<J>>,
    parked: Mutex<Vec<(J, String)>>,
    rate: Mutex<RateWindow>,
    notify: Notify,
    seq: AtomicU64,
    shutdown: AtomicBool,
    metrics: QueueMetrics,
}

/// A named job queue with its worker pool.
pub struct JobQueue<J> {
    state: Arc<QueueState<J>>,
}

impl<J> Clone for JobQueue<J> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<J: Send + Sync + 'static> JobQueue<J> {
    pub fn new(name: &str, opts: QueueOptions) -> Self {
        Self {
            state: Arc::new(QueueState {
                name: name.to_string(),
                opts,
                pending: Mutex::new(PendingSet::new()),
                parked: Mutex::new(Vec::new()),
                rate: Mutex::new(RateWindow {
                    count: 0,
                    window_start: Instant::now(),
                }),
                notify: Notify::new(),
                seq: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                metrics: QueueMetrics::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Enqueue a job for immediate execution.
    pub fn enqueue(&self, data: J) {
        self.enqueue_with(data, Duration::ZERO, 0);
    }

    /// Enqueue a job to run after `delay`.
    pub fn enqueue_after(&self, data: J, delay: Duration) {
        self.enqueue_with(data, delay, 0);
    }

    /// Enqueue with a scheduled delay and a priority; among due jobs,
    /// higher priority runs first.
    pub fn enqueue_with(&self, data: J, delay: Duration, priority: u8) {
        self.push(data, delay, priority, 0);
        self.state.notify.notify_one();
    }

    /// Enqueue many jobs, each with its own scheduled delay.
    pub fn enqueue_bulk(&self, jobs: Vec<(J, Duration)>) {
        for (data, delay) in jobs {
            self.push(data, delay, 0, 0);
        }
        self.state.notify.notify_waiters();
        self.state.notify.notify_one();
    }

    fn push(&self, data: J, delay: Duration, priority: u8, attempt: u32) {
        let job = Job {
            run_at: Instant::now() + delay,
            priority,
            seq: self.state.seq.fetch_add(1, Ordering::Relaxed),
            attempt,
            data,
        };
        self.state.pending.lock().scheduled.push(TimeOrdered(job));
        self.state.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop all not-yet-started jobs matching the predicate; returns how
    /// many were removed. In-flight jobs are not touched.
    pub fn remove_pending<F: Fn(&J) -> bool>(&self, predicate: F) -> usize {
        let mut pending = self.state.pending.lock();
        let before = pending.len();
        let scheduled: BinaryHeap<TimeOrdered<J>> = pending
            .scheduled
            .drain()
            .filter(|job| !predicate(&job.0.data))
            .collect();
        let ready: BinaryHeap<ReadyOrdered<J>> = pending
            .ready
            .drain()
            .filter(|job| !predicate(&job.0.data))
            .collect();
        pending.scheduled = scheduled;
        pending.ready = ready;
        before - pending.len()
    }

    pub fn pending_len(&self) -> usize {
        self.state.pending.lock().len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.state.metrics.enqueued.load(Ordering::Relaxed),
            completed: self.state.metrics.completed.load(Ordering::Relaxed),
            retried: self.state.metrics.retried.load(Ordering::Relaxed),
            discarded: self.state.metrics.discarded.load(Ordering::Relaxed),
            parked: self.state.metrics.parked.load(Ordering::Relaxed),
            pending: self.pending_len(),
        }
    }

    /// Spawn the worker pool. Call once.
    pub fn start(&self, handler: Arc<dyn JobHandler<J>>) {
        for worker in 0..self.state.opts.concurrency.max(1) {
            let state = self.state.clone();
            let handler = handler.clone();
            let queue = self.clone();
            tokio::spawn(async move {
                debug!(queue = %state.name, worker, "Queue worker started");
                queue.worker_loop(handler).await;
                debug!(queue = %state.name, worker, "Queue worker stopped");
            });
        }
    }

    /// Stop accepting work; workers exit after their current job.
    pub fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    async fn worker_loop(&self, handler: Arc<dyn JobHandler<J>>) {
        enum Next<J> {
            Run(Job<J>),
            Wait(Instant),
            Idle,
        }

        let state = &self.state;
        loop {
            if state.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let next = {
                let mut pending = state.pending.lock();
                pending.promote_due(Instant::now());
                match pending.ready.pop() {
                    Some(job) => Next::Run(job.0),
                    None => match pending.scheduled.peek() {
                        Some(job) => Next::Wait(job.0.run_at),
                        None => Next::Idle,
                    },
                }
            };

            match next {
                Next::Run(job) => {
                    self.acquire_rate_slot().await;
                    self.execute(job, &handler).await;
                }
                Next::Wait(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = state.notify.notified() => {}
                    }
                }
                Next::Idle => {
                    // Poll fallback guards against a wakeup lost between
                    // the peek and the wait.
                    tokio::select! {
                        _ = state.notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {}
                    }
                }
            }
        }
    }

    async fn execute(&self, job: Job<J>, handler: &Arc<dyn JobHandler<J>>) {
        let state = &self.state;
        match handler.handle(&job.data).await {
            Ok(()) => {
                state.metrics.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(JobError::Discard(reason)) => {
                state.metrics.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %state.name, %reason, "Job discarded");
            }
            Err(JobError::Postpone(delay)) => {
                self.push_rescheduled(job, delay, false);
            }
            Err(JobError::Retry(reason)) => {
                let next_attempt = job.attempt + 1;
                if next_attempt >= state.opts.max_attempts {
                    error!(
                        queue = %state.name,
                        attempts = next_attempt,
                        %reason,
                        "Job permanently failed, parking"
                    );
                    state.metrics.parked.fetch_add(1, Ordering::Relaxed);
                    state.parked.lock().push((job.data, reason));
                } else {
                    let backoff = self.backoff_delay(job.attempt);
                    warn!(
                        queue = %state.name,
                        attempt = next_attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        %reason,
                        "Job failed, retrying"
                    );
                    state.metrics.retried.fetch_add(1, Ordering::Relaxed);
                    self.push_rescheduled(job, backoff, true);
                }
            }
        }
    }

    fn push_rescheduled(&self, job: Job<J>, delay: Duration, count_attempt: bool) {
        let rescheduled = Job {
            run_at: Instant::now() + delay,
            priority: job.priority,
            seq: self.state.seq.fetch_add(1, Ordering::Relaxed),
            attempt: if count_attempt { job.attempt + 1 } else { job.attempt },
            data: job.data,
        };
        self.state
            .pending
            .lock()
            .scheduled
            .push(TimeOrdered(rescheduled));
        self.state.notify.notify_one();
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.state.opts.backoff_base;
        let exp = base * (1u32 << attempt.min(5));
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter_ms)
    }

    /// Block until the sliding-window budget admits one more execution.
    async fn acquire_rate_slot(&self) {
        let Some(limit) = self.state.opts.rate_limit else {
            return;
        };
        loop {
            let wait_until = {
                let mut window = self.state.rate.lock();
                let now = Instant::now();
                if now.duration_since(window.window_start) >= limit.window {
                    window.window_start = now;
                    window.count = 0;
                }
                if window.count < limit.max {
                    window.count += 1;
                    None
                } else {
                    Some(window.window_start + limit.window)
                }
            };
            match wait_until {
                None => return,
                Some(at) => tokio::time::sleep_until(at).await,
            }
        }
    }
}

impl<J: Clone + Send + Sync + 'static> JobQueue<J> {
    /// Permanently failed jobs with their last error, for inspection.
    pub fn parked(&self) -> Vec<(J, String)> {
        self.state.parked.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Recorder {
        handled: Mutex<Vec<u32>>,
        fail_first: AtomicU32,
        postpone_first: AtomicU32,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                handled: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(0),
                postpone_first: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler<u32> for Recorder {
        async fn handle(&self, job: &u32) -> JobResult {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(JobError::Retry("simulated failure".into()));
            }
            if self.postpone_first.load(Ordering::SeqCst) > 0 {
                self.postpone_first.fetch_sub(1, Ordering::SeqCst);
                return Err(JobError::Postpone(Duration::from_millis(10)));
            }
            self.handled.lock().push(*job);
            Ok(())
        }
    }

    struct AlwaysFail;

    #[async_trait]
    impl JobHandler<u32> for AlwaysFail {
        async fn handle(&self, _job: &u32) -> JobResult {
            Err(JobError::Retry("down".into()))
        }
    }

    fn fast_opts() -> QueueOptions {
        QueueOptions {
            concurrency: 2,
            rate_limit: None,
            max_attempts: 3,
            backoff_base: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn processes_enqueued_jobs() {
        let queue: JobQueue<u32> = JobQueue::new("test", fast_opts());
        let handler = Recorder::new();
        queue.start(handler.clone());

        queue.enqueue(1);
        queue.enqueue(2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut handled = handler.handled.lock().clone();
        handled.sort_unstable();
        assert_eq!(handled, vec![1, 2]);
        assert_eq!(queue.stats().completed, 2);
    }

    #[tokio::test]
    async fn retries_with_backoff_then_succeeds() {
        let queue: JobQueue<u32> = JobQueue::new("test", fast_opts());
        let handler = Recorder::new();
        handler.fail_first.store(1, Ordering::SeqCst);
        queue.start(handler.clone());

        queue.enqueue(7);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handler.handled.lock().clone(), vec![7]);
        let stats = queue.stats();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.parked, 0);
    }

    #[tokio::test]
    async fn parks_after_attempt_cap() {
        let queue: JobQueue<u32> = JobQueue::new("test", fast_opts());
        queue.start(Arc::new(AlwaysFail));

        queue.enqueue(9);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let stats = queue.stats();
        assert_eq!(stats.parked, 1);
        // attempts = cap, retries = cap - 1
        assert_eq!(stats.retried, 2);
        let parked = queue.parked();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].0, 9);
    }

    #[tokio::test]
    async fn postpone_does_not_consume_attempts() {
        let queue: JobQueue<u32> = JobQueue::new("test", fast_opts());
        let handler = Recorder::new();
        handler.postpone_first.store(5, Ordering::SeqCst);
        queue.start(handler.clone());

        queue.enqueue(3);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handler.handled.lock().clone(), vec![3]);
        assert_eq!(queue.stats().parked, 0);
    }

    #[tokio::test]
    async fn respects_scheduled_delay() {
        let queue: JobQueue<u32> = JobQueue::new("test", fast_opts());
        let handler = Recorder::new();
        queue.start(handler.clone());

        let started = std::time::Instant::now();
        queue.enqueue_after(1, Duration::from_millis(120));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handler.handled.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(handler.handled.lock().clone(), vec![1]);
        assert!(started.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn due_jobs_run_in_priority_order() {
        let queue: JobQueue<u32> = JobQueue::new(
            "test",
            QueueOptions {
                concurrency: 1,
                ..fast_opts()
            },
        );
        // All due immediately, enqueued before any worker runs
        queue.enqueue_with(1, Duration::ZERO, 0);
        queue.enqueue_with(2, Duration::ZERO, 5);
        queue.enqueue_with(3, Duration::ZERO, 1);

        let handler = Recorder::new();
        queue.start(handler.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.handled.lock().clone(), vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn rate_limit_bounds_throughput() {
        let opts = QueueOptions {
            concurrency: 4,
            rate_limit: Some(RateLimit {
                max: 2,
                window: Duration::from_millis(100),
            }),
            ..fast_opts()
        };
        let queue: JobQueue<u32> = JobQueue::new("test", opts);
        let handler = Recorder::new();
        queue.start(handler.clone());

        let started = std::time::Instant::now();
        for i in 0..6 {
            queue.enqueue(i);
        }

        while handler.handled.lock().len() < 6 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(started.elapsed() < Duration::from_secs(2), "queue stalled");
        }
        // 6 jobs at 2 per 100ms need at least two full windows
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn remove_pending_filters_by_predicate() {
        let queue: JobQueue<u32> = JobQueue::new("test", fast_opts());
        // Not started: jobs stay pending
        queue.enqueue_bulk(vec![
            (1, Duration::from_secs(60)),
            (2, Duration::from_secs(60)),
            (3, Duration::from_secs(60)),
        ]);

        let removed = queue.remove_pending(|j| *j != 2);
        assert_eq!(removed, 2);
        assert_eq!(queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn bulk_delays_pace_execution_order() {
        let queue: JobQueue<u32> = JobQueue::new("test", fast_opts());
        let handler = Recorder::new();
        queue.start(handler.clone());

        queue.enqueue_bulk(vec![
            (2, Duration::from_millis(80)),
            (0, Duration::ZERO),
            (1, Duration::from_millis(40)),
        ]);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(handler.handled.lock().clone(), vec![0, 1, 2]);
    }
}
