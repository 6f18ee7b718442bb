//! # Worker Pool Module
//!
//! A small fixed pool of `may` coroutines that runs Async actions off the
//! HTTP I/O path.
//!
//! ## Features
//!
//! - **Shared queue**: all workers receive from one MPSC channel, so the
//!   least busy worker picks up the next job
//! - **Bounded depth**: `queue_bound` is enforced at dispatch; a full queue
//!   either sheds immediately or waits up to a timeout, per [`BackpressureMode`]
//! - **Rejection returns the job**: [`WorkerPool::dispatch`] hands a rejected
//!   job back so the caller can run it inline instead of dropping it
//! - **Panic containment**: a panicking job is logged and the worker keeps going
//! - **Metrics**: queue depth, dispatch, completion and shed counts
//!
//! ## Configuration
//!
//! - `PANEL_ACTION_WORKERS`: number of worker coroutines (default: 4)
//! - `PANEL_ACTION_QUEUE_BOUND`: maximum queued jobs (default: 1024)
//! - `PANEL_BACKPRESSURE_MODE`: `block` or `shed` (default: block)
//! - `PANEL_BACKPRESSURE_TIMEOUT_MS`: wait in block mode before shedding (default: 50)
//! - `PANEL_STACK_SIZE`: coroutine stack size, decimal or `0x` hex (default: 0x10000)

use may::sync::mpsc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A unit of work for the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// What to do when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressureMode {
    /// Wait up to the backpressure timeout for room, then shed
    #[default]
    Block,
    /// Reject immediately
    Shed,
}

impl BackpressureMode {
    /// Parse backpressure mode from string
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "block" => Some(Self::Block),
            "shed" => Some(Self::Shed),
            _ => None,
        }
    }
}

/// Configuration for a worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker coroutines
    pub num_workers: usize,
    /// Maximum queue depth
    pub queue_bound: usize,
    /// Backpressure mode
    pub backpressure_mode: BackpressureMode,
    /// Timeout for block mode in milliseconds
    pub backpressure_timeout_ms: u64,
    /// Stack size for worker coroutines
    pub stack_size: usize,
}

fn parse_size(s: &str) -> Option<usize> {
    match s.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl WorkerPoolConfig {
    /// Load configuration from environment variables
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let num_workers = std::env::var("PANEL_ACTION_WORKERS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.num_workers);

        let queue_bound = std::env::var("PANEL_ACTION_QUEUE_BOUND")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.queue_bound);

        let backpressure_mode = std::env::var("PANEL_BACKPRESSURE_MODE")
            .ok()
            .and_then(|s| BackpressureMode::parse(&s))
            .unwrap_or_default();

        let backpressure_timeout_ms = std::env::var("PANEL_BACKPRESSURE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.backpressure_timeout_ms);

        let stack_size = std::env::var("PANEL_STACK_SIZE")
            .ok()
            .and_then(|s| parse_size(&s))
            .unwrap_or(defaults.stack_size);

        Self {
            num_workers,
            queue_bound,
            backpressure_mode,
            backpressure_timeout_ms,
            stack_size,
        }
    }

    /// Create a custom configuration
    #[must_use]
    pub fn new(
        num_workers: usize,
        queue_bound: usize,
        backpressure_mode: BackpressureMode,
        backpressure_timeout_ms: u64,
        stack_size: usize,
    ) -> Self {
        Self {
            num_workers,
            queue_bound,
            backpressure_mode,
            backpressure_timeout_ms,
            stack_size,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            queue_bound: 1024,
            backpressure_mode: BackpressureMode::Block,
            backpressure_timeout_ms: 50,
            stack_size: 0x10000, // 64KB
        }
    }
}

/// Metrics for a worker pool
#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    /// Jobs rejected because the queue was full or the pool was closed
    pub shed_count: AtomicU64,
    /// Jobs queued or running
    pub queue_depth: AtomicUsize,
    /// Total jobs accepted
    pub dispatched_count: AtomicU64,
    /// Total jobs finished (including panicked ones)
    pub completed_count: AtomicU64,
    /// Jobs that panicked
    pub panic_count: AtomicU64,
}

impl WorkerPoolMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_shed(&self) {
        self.shed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch(&self) {
        self.dispatched_count.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo a dispatch whose send failed.
    fn record_unsent(&self) {
        self.dispatched_count.fetch_sub(1, Ordering::Relaxed);
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.panic_count.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get_shed_count(&self) -> u64 {
        self.shed_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_dispatched_count(&self) -> u64 {
        self.dispatched_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn get_panic_count(&self) -> u64 {
        self.panic_count.load(Ordering::Relaxed)
    }
}

/// A fixed set of worker coroutines draining one job queue
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// `None` once the pool is shut down
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    metrics: Arc<WorkerPoolMetrics>,
    workers: usize,
    name: String,
}

impl WorkerPool {
    /// Spawn the worker coroutines.
    ///
    /// # Safety
    ///
    /// This function is marked unsafe because it spawns coroutines using
    /// `may::coroutine::Builder::spawn()`, which is unsafe in the `may` runtime.
    /// The caller must ensure the May coroutine runtime is properly initialized.
    pub unsafe fn new(name: impl Into<String>, config: WorkerPoolConfig) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>();
        let metrics = Arc::new(WorkerPoolMetrics::new());
        let rx = Arc::new(rx);

        info!(
            pool = %name,
            num_workers = config.num_workers,
            queue_bound = config.queue_bound,
            backpressure_mode = ?config.backpressure_mode,
            stack_size = config.stack_size,
            "Creating worker pool"
        );

        let mut workers = 0;
        for worker_id in 0..config.num_workers {
            let rx = Arc::clone(&rx);
            let metrics = Arc::clone(&metrics);
            let pool_name = name.clone();

            let spawn_result = may::coroutine::Builder::new()
                .stack_size(config.stack_size)
                .spawn(move || {
                    debug!(pool = %pool_name, worker_id, "Worker coroutine started");
                    // All workers share the receiver; the channel closes when
                    // the pool drops its sender.
                    while let Ok(job) = rx.recv() {
                        if let Err(panic) =
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(job))
                        {
                            metrics.record_panic();
                            error!(
                                pool = %pool_name,
                                worker_id,
                                panic_message = ?panic,
                                "Job panicked"
                            );
                        }
                        metrics.record_completion();
                    }
                    debug!(pool = %pool_name, worker_id, "Worker coroutine exiting");
                });

            match spawn_result {
                Ok(_) => workers += 1,
                Err(e) => error!(
                    pool = %name,
                    worker_id,
                    error = %e,
                    "Failed to spawn worker coroutine"
                ),
            }
        }

        Self {
            config,
            sender: Mutex::new(Some(tx)),
            metrics,
            workers,
            name,
        }
    }

    /// Queue a job. A rejected job is handed back untouched.
    ///
    /// Rejection happens when the pool has no live workers, has been shut
    /// down, or its queue stays full past the backpressure policy.
    pub fn dispatch(&self, job: Job) -> Result<(), Job> {
        if self.workers == 0 {
            self.metrics.record_shed();
            return Err(job);
        }
        if !self.wait_for_room() {
            self.metrics.record_shed();
            warn!(
                pool = %self.name,
                queue_depth = self.metrics.get_queue_depth(),
                queue_bound = self.config.queue_bound,
                "Worker pool full; job shed"
            );
            return Err(job);
        }

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            self.metrics.record_shed();
            return Err(job);
        };
        self.metrics.record_dispatch();
        match sender.send(job) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.metrics.record_unsent();
                self.metrics.record_shed();
                error!(pool = %self.name, "Worker pool channel disconnected");
                Err(e.0)
            }
        }
    }

    fn has_room(&self) -> bool {
        self.metrics.get_queue_depth() < self.config.queue_bound
    }

    fn wait_for_room(&self) -> bool {
        if self.has_room() {
            return true;
        }
        match self.config.backpressure_mode {
            BackpressureMode::Shed => false,
            BackpressureMode::Block => {
                let deadline =
                    Instant::now() + Duration::from_millis(self.config.backpressure_timeout_ms);
                while Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(1));
                    if self.has_room() {
                        return true;
                    }
                }
                false
            }
        }
    }

    /// Stop accepting jobs. Workers finish what is queued and exit.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            info!(
                pool = %self.name,
                pending = self.metrics.get_queue_depth(),
                "Worker pool shutting down"
            );
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Number of workers that actually started
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<WorkerPoolMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_mode_parse() {
        assert_eq!(BackpressureMode::parse("block"), Some(BackpressureMode::Block));
        assert_eq!(BackpressureMode::parse("SHED"), Some(BackpressureMode::Shed));
        assert_eq!(BackpressureMode::parse("invalid"), None);
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.queue_bound, 1024);
        assert_eq!(config.backpressure_mode, BackpressureMode::Block);
        assert_eq!(config.backpressure_timeout_ms, 50);
        assert_eq!(config.stack_size, 0x10000);
    }

    #[test]
    fn test_parse_size_hex() {
        assert_eq!(parse_size("0x8000"), Some(0x8000));
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("0xzz"), None);
    }

    #[test]
    fn test_worker_pool_metrics() {
        let metrics = WorkerPoolMetrics::new();
        metrics.record_dispatch();
        assert_eq!(metrics.get_dispatched_count(), 1);
        assert_eq!(metrics.get_queue_depth(), 1);
        metrics.record_completion();
        assert_eq!(metrics.get_completed_count(), 1);
        assert_eq!(metrics.get_queue_depth(), 0);
        metrics.record_shed();
        assert_eq!(metrics.get_shed_count(), 1);
    }

    #[test]
    fn test_zero_bound_sheds_and_returns_job() {
        may::config().set_workers(2);
        let config = WorkerPoolConfig::new(1, 0, BackpressureMode::Shed, 0, 0x10000);
        let pool = unsafe { WorkerPool::new("test", config) };
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let rejected = pool
            .dispatch(Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap_err();
        rejected();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pool.metrics().get_shed_count(), 1);
    }

    #[test]
    fn test_shutdown_rejects() {
        may::config().set_workers(2);
        let pool = unsafe { WorkerPool::new("closed", WorkerPoolConfig::default()) };
        pool.shutdown();
        assert!(!pool.is_open());
        assert!(pool.dispatch(Box::new(|| {})).is_err());
    }

    #[test]
    fn test_jobs_run_on_workers() {
        may::config().set_workers(2);
        let pool = unsafe { WorkerPool::new("run", WorkerPoolConfig::default()) };
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let r = Arc::clone(&ran);
            assert!(pool
                .dispatch(Box::new(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                }))
                .is_ok());
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) < 10 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }
}
