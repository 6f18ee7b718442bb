use super::slots::SlotPool;
use crate::ids::SessionId;
use crate::post::ParamVec;
use crate::session::ValueMatrix;
use crate::worker_pool::{Job, WorkerPool, WorkerPoolConfig};
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Key of the catch-all action used when no exact key is registered.
pub const DEFAULT_ACTION: &str = "*";

/// Where a handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// On the thread that completed the POST body
    #[default]
    Sync,
    /// On the action worker pool
    Async,
}

/// Everything a handler gets to see. Owned, so it can cross to a worker.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub session_id: SessionId,
    /// The field that selected the action
    pub key: Arc<str>,
    pub value: String,
    /// Every pair of the submission, in arrival order
    pub params: ParamVec,
    /// Snapshot of the session's value matrix
    pub values: ValueMatrix,
}

impl ActionContext {
    /// Value of another parameter of the same submission.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.as_str())
    }

    #[cfg(test)]
    pub(crate) fn for_test(key: &str, value: &str) -> Self {
        let mut params = ParamVec::new();
        params.push((Arc::from(key), value.to_string()));
        Self {
            session_id: SessionId::new(),
            key: Arc::from(key),
            value: value.to_string(),
            params,
            values: ValueMatrix::new(),
        }
    }
}

/// Handler signature. Errors are logged at the dispatch boundary.
pub type ActionHandler = Arc<dyn Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync>;

/// A registered binding.
pub struct ActionItem {
    key: Arc<str>,
    handler: ActionHandler,
    mode: ExecMode,
    requests: AtomicU64,
}

impl fmt::Debug for ActionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionItem")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("requests", &self.requests())
            .finish_non_exhaustive()
    }
}

impl ActionItem {
    pub fn new(key: &str, handler: ActionHandler, mode: ExecMode) -> Self {
        Self {
            key: Arc::from(key),
            handler,
            mode,
            requests: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Completed invocations.
    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Run the handler with failures and panics contained. Counts exactly
    /// one invocation.
    pub(crate) fn invoke(&self, ctx: &ActionContext) -> bool {
        let start = Instant::now();
        let result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (self.handler)(ctx)));
        self.requests.fetch_add(1, Ordering::Relaxed);
        let elapsed_us = start.elapsed().as_micros() as u64;
        match result {
            Ok(Ok(())) => {
                debug!(
                    action = %self.key,
                    key = %ctx.key,
                    session_id = %ctx.session_id,
                    elapsed_us,
                    "Action complete"
                );
                true
            }
            Ok(Err(e)) => {
                error!(
                    action = %self.key,
                    key = %ctx.key,
                    session_id = %ctx.session_id,
                    error = %format!("{e:#}"),
                    "Action handler failed"
                );
                false
            }
            Err(panic) => {
                error!(
                    action = %self.key,
                    key = %ctx.key,
                    session_id = %ctx.session_id,
                    panic_message = %panic_message(panic.as_ref()),
                    "Action handler panicked"
                );
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Result of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Ran on the calling thread; `ok` is false if the handler failed.
    Inline { ok: bool },
    /// Handed to the worker pool.
    Queued,
    /// The pool refused the job; it ran inline instead.
    FellBack { ok: bool },
    /// Neither the key nor the default action is registered.
    Unhandled,
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub inline: AtomicU64,
    pub queued: AtomicU64,
    pub fallback: AtomicU64,
    pub failed: AtomicU64,
    pub unhandled: AtomicU64,
}

impl DispatchMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Routes completed submissions to registered actions.
///
/// The action map is read-mostly and sits behind a `RwLock`; handler code
/// never runs while any dispatcher lock is held.
pub struct ActionDispatcher {
    actions: RwLock<HashMap<Arc<str>, Arc<ActionItem>>>,
    slots: Arc<SlotPool>,
    pool: RwLock<Option<Arc<WorkerPool>>>,
    metrics: Arc<DispatchMetrics>,
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionDispatcher {
    /// A dispatcher without workers: Async actions run inline until
    /// [`ActionDispatcher::start_workers`] is called.
    #[must_use]
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
            slots: Arc::new(SlotPool::new()),
            pool: RwLock::new(None),
            metrics: Arc::new(DispatchMetrics::default()),
        }
    }

    /// Spawn the Async worker pool.
    pub fn start_workers(&self, config: WorkerPoolConfig) {
        // SAFETY: may::coroutine::Builder::spawn() is marked unsafe by the may runtime.
        // The workers only run boxed `Send + 'static` jobs and own everything they touch.
        #[allow(unsafe_code)]
        let pool = unsafe { WorkerPool::new("actions", config) };
        if pool.workers() == 0 {
            warn!("No action workers started; Async actions will run inline");
        }
        if let Some(old) = self.pool.write().replace(Arc::new(pool)) {
            old.shutdown();
        }
    }

    /// Close the worker pool. Queued jobs still run; new ones run inline.
    pub fn stop_workers(&self) {
        if let Some(pool) = self.pool.write().take() {
            pool.shutdown();
        }
    }

    /// Bind `handler` to `key`, replacing any previous binding.
    pub fn register<F>(&self, key: &str, handler: F, mode: ExecMode)
    where
        F: Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let item = Arc::new(ActionItem::new(key, Arc::new(handler), mode));
        let replaced = self
            .actions
            .write()
            .insert(Arc::from(key), item)
            .is_some();
        info!(action = key, mode = ?mode, replaced, "Action registered");
    }

    /// Register the catch-all action.
    pub fn register_default<F>(&self, handler: F, mode: ExecMode)
    where
        F: Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(DEFAULT_ACTION, handler, mode);
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.actions.write().remove(key).is_some()
    }

    #[must_use]
    pub fn item(&self, key: &str) -> Option<Arc<ActionItem>> {
        self.actions.read().get(key).cloned()
    }

    /// Exact match, else the default action.
    #[must_use]
    pub fn resolve(&self, key: &str) -> Option<Arc<ActionItem>> {
        let actions = self.actions.read();
        actions
            .get(key)
            .or_else(|| actions.get(DEFAULT_ACTION))
            .cloned()
    }

    /// Dispatch a submission. The primary pair is the first one whose key
    /// has its own action; without one, the first pair goes to the default.
    /// Returns `None` for an empty submission.
    pub fn dispatch(
        &self,
        session_id: &SessionId,
        params: ParamVec,
        values: ValueMatrix,
    ) -> Option<DispatchOutcome> {
        let (key, value) = {
            let actions = self.actions.read();
            params
                .iter()
                .find(|(k, _)| actions.contains_key(k.as_ref()) && k.as_ref() != DEFAULT_ACTION)
                .or_else(|| params.first())
                .map(|(k, v)| (Arc::clone(k), v.clone()))?
        };
        let ctx = ActionContext {
            session_id: session_id.clone(),
            key,
            value,
            params,
            values,
        };
        let mode = self.resolve(&ctx.key).map(|item| item.mode());
        Some(self.execute(ctx, mode))
    }

    /// Run the action for `ctx.key`. `mode` overrides the registered mode.
    pub fn execute(&self, ctx: ActionContext, mode: Option<ExecMode>) -> DispatchOutcome {
        let Some(item) = self.resolve(&ctx.key) else {
            DispatchMetrics::bump(&self.metrics.unhandled);
            warn!(
                key = %ctx.key,
                session_id = %ctx.session_id,
                "No action for key and no default action"
            );
            return DispatchOutcome::Unhandled;
        };
        match mode.unwrap_or(item.mode()) {
            ExecMode::Sync => {
                DispatchMetrics::bump(&self.metrics.inline);
                let ok = item.invoke(&ctx);
                self.note_failure(ok);
                DispatchOutcome::Inline { ok }
            }
            ExecMode::Async => self.submit(item, ctx),
        }
    }

    fn submit(&self, item: Arc<ActionItem>, ctx: ActionContext) -> DispatchOutcome {
        let key = Arc::clone(&ctx.key);
        let slot = self.slots.acquire(item, ctx);
        let succeeded = Arc::new(AtomicBool::new(true));
        let job = {
            let slots = Arc::clone(&self.slots);
            let metrics = Arc::clone(&self.metrics);
            let succeeded = Arc::clone(&succeeded);
            let job: Job = Box::new(move || {
                if let Some(task) = slot.take_task() {
                    if !task.item.invoke(&task.ctx) {
                        succeeded.store(false, Ordering::Relaxed);
                        DispatchMetrics::bump(&metrics.failed);
                    }
                }
                slots.release(&slot);
            });
            job
        };

        let pool = self.pool.read().clone();
        let rejected = match pool {
            Some(pool) => match pool.dispatch(job) {
                Ok(()) => {
                    DispatchMetrics::bump(&self.metrics.queued);
                    debug!(key = %key, "Action queued");
                    return DispatchOutcome::Queued;
                }
                Err(job) => job,
            },
            None => job,
        };

        warn!(key = %key, "Async submission failed; running action inline");
        DispatchMetrics::bump(&self.metrics.fallback);
        rejected();
        DispatchOutcome::FellBack {
            ok: succeeded.load(Ordering::Relaxed),
        }
    }

    fn note_failure(&self, ok: bool) {
        if !ok {
            DispatchMetrics::bump(&self.metrics.failed);
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Jobs queued or running on the worker pool.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.pool
            .read()
            .as_ref()
            .map_or(0, |p| p.metrics().get_queue_depth())
    }

    #[must_use]
    pub fn slots(&self) -> &SlotPool {
        &self.slots
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
