use super::timers::Timers;
use crate::config::ServerConfig;
use crate::dispatcher::{ActionContext, ActionDispatcher, DispatchOutcome, ExecMode};
use crate::error::{PanelError, PanelResult};
use crate::ids::SessionId;
use crate::mode::{ModeCell, ServerMode};
use crate::post::{Chunk, Ingestor, TempDirTarget, UploadListener, UploadTarget};
use crate::request::{ConnectionId, PostMode, Request, RequestGcReport, RequestPool};
use crate::session::{Credentials, GcPolicy, GcReport, Session, SessionStore, ValueMatrix};
use crate::stats::{Gauges, Stats, StatsSnapshot, TokenValue};
use crate::worker_pool::WorkerPoolConfig;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The request object handed to the HTTP layer for one exchange.
pub type RequestHandle = Arc<Request>;

/// Modes from which a shutdown may proceed, tried in order.
const LIVE_MODES: [ServerMode; 6] = [
    ServerMode::Running,
    ServerMode::Paused,
    ServerMode::Scanning,
    ServerMode::Disabled,
    ServerMode::Stopped,
    ServerMode::Created,
];

/// Owns every component of the core. Constructed once by the process entry
/// point and passed (as `Arc`) to the HTTP layer.
pub struct ServerContext {
    config: ServerConfig,
    policy: GcPolicy,
    mode: ModeCell,
    requests: RequestPool,
    sessions: SessionStore,
    ingestor: Ingestor,
    dispatcher: ActionDispatcher,
    stats: Stats,
    timers: Mutex<Option<Timers>>,
}

impl ServerContext {
    /// Build a context in `Created` mode with uploads going to
    /// `config.upload_dir`.
    pub fn new(config: ServerConfig) -> PanelResult<Arc<Self>> {
        let target = Arc::new(TempDirTarget::new(config.upload_dir.clone()));
        Self::with_upload_target(config, target)
    }

    /// Build a context with a custom upload destination.
    pub fn with_upload_target(
        config: ServerConfig,
        target: Arc<dyn UploadTarget>,
    ) -> PanelResult<Arc<Self>> {
        config.validate()?;
        let ctx = Arc::new(Self {
            policy: GcPolicy::from_config(&config),
            requests: RequestPool::new(config.request_grace()),
            mode: ModeCell::new(),
            sessions: SessionStore::new(),
            ingestor: Ingestor::new(target),
            dispatcher: ActionDispatcher::new(),
            stats: Stats::new(),
            timers: Mutex::new(None),
            config,
        });
        debug!(
            max_sessions = ctx.config.max_sessions,
            upload_dir = %ctx.config.upload_dir.display(),
            "Server context created"
        );
        Ok(ctx)
    }

    fn refused(&self, operation: &'static str) -> PanelError {
        let current = self.mode.get();
        warn!(operation, mode = %current, "Operation refused in current mode");
        PanelError::ModeRefused { current, operation }
    }

    // --- lifecycle --------------------------------------------------------

    /// Created → Running: optionally restore sessions, start the action
    /// workers and the timer thread.
    pub fn start(self: &Arc<Self>, load_sessions: bool) -> PanelResult<()> {
        if !self.mode.compare_and_set(ServerMode::Created, ServerMode::Running) {
            return Err(self.refused("start"));
        }
        if load_sessions {
            match self.load_sessions() {
                Ok(n) => debug!(sessions = n, "Session snapshot restored"),
                Err(e) => warn!(error = %e, "Session snapshot not restored"),
            }
        }

        let pool_config = WorkerPoolConfig {
            num_workers: self.config.worker_count,
            stack_size: self.config.worker_stack_size,
            ..WorkerPoolConfig::from_env()
        };
        self.dispatcher.start_workers(pool_config);

        let timers = Timers::spawn(
            Arc::downgrade(self),
            self.config.gc_interval(),
            self.config.stats_interval(),
        )
        .map_err(|e| PanelError::io("spawning timer thread", e))?;
        *self.timers.lock() = Some(timers);

        info!(
            sessions = self.sessions.len(),
            workers = self.config.worker_count,
            "Server core running"
        );
        Ok(())
    }

    /// Running → Paused. Requests are refused; GC keeps running.
    pub fn pause(&self) -> PanelResult<()> {
        if self.mode.compare_and_set(ServerMode::Running, ServerMode::Paused) {
            Ok(())
        } else {
            Err(self.refused("pause"))
        }
    }

    pub fn resume(&self) -> PanelResult<()> {
        if self.mode.compare_and_set(ServerMode::Paused, ServerMode::Running) {
            Ok(())
        } else {
            Err(self.refused("resume"))
        }
    }

    /// Running → Scanning for a content reload, then sweep in cleanup mode.
    /// Only one caller can hold the scan.
    pub fn begin_scan(&self) -> PanelResult<GcReport> {
        if !self.mode.compare_and_set(ServerMode::Running, ServerMode::Scanning) {
            return Err(self.refused("begin_scan"));
        }
        info!("Content scan started; collecting in cleanup mode");
        Ok(self.run_gc(true))
    }

    pub fn end_scan(&self) -> PanelResult<()> {
        if self.mode.compare_and_set(ServerMode::Scanning, ServerMode::Running) {
            info!("Content scan finished");
            Ok(())
        } else {
            Err(self.refused("end_scan"))
        }
    }

    /// Stop serving and collecting without tearing anything down.
    pub fn disable(&self) -> PanelResult<()> {
        if self.mode.set(ServerMode::Disabled) {
            info!("Server core disabled");
            Ok(())
        } else {
            Err(self.refused("disable"))
        }
    }

    /// Move to `Terminated` from any live mode, stop timers and workers,
    /// optionally save sessions, then drop every session. Returns the number
    /// of sessions saved.
    pub fn shutdown(&self, save: bool) -> PanelResult<usize> {
        let from = LIVE_MODES
            .into_iter()
            .find(|&from| self.mode.compare_and_set(from, ServerMode::Terminated));
        let Some(from) = from else {
            return Err(self.refused("shutdown"));
        };
        info!(from = %from, "Server core shutting down");

        if let Some(mut timers) = self.timers.lock().take() {
            timers.stop();
        }
        self.dispatcher.stop_workers();

        let saved = if save {
            match self.save_sessions() {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "Session snapshot not saved at shutdown");
                    0
                }
            }
        } else {
            0
        };
        let dropped = self.sessions.clear();
        info!(saved, dropped, "Server core terminated");
        Ok(saved)
    }

    #[must_use]
    pub fn mode(&self) -> ServerMode {
        self.mode.get()
    }

    // --- HTTP layer callbacks ---------------------------------------------

    /// Accept-time filter. An empty allow-list accepts everything.
    #[must_use]
    pub fn accept_source(&self, addr: IpAddr) -> bool {
        if self.mode.get() == ServerMode::Terminated {
            return false;
        }
        let allowed = &self.config.allowed_sources;
        if allowed.is_empty() {
            return true;
        }
        let addr = addr.to_string();
        let ok = allowed.iter().any(|prefix| addr.starts_with(prefix.as_str()));
        if !ok {
            debug!(source = %addr, "Connection refused by source filter");
        }
        ok
    }

    /// Bind a pooled request and a session to a new exchange. `None` while
    /// the server is not responding.
    pub fn begin_request(
        &self,
        connection: ConnectionId,
        session_token: Option<&str>,
        user_agent: Option<&str>,
    ) -> Option<RequestHandle> {
        if !self.mode.is_responding() {
            debug!(
                connection = connection.0,
                mode = %self.mode.get(),
                "Request refused; server not responding"
            );
            return None;
        }
        self.stats.record_request();
        let id = SessionId::from_client_or_new(session_token);
        let session = self.sessions.checkout(&id, user_agent);
        let req = self.requests.acquire(connection);
        req.bind_session(session);
        Some(req)
    }

    /// The request's session, provided the store still holds that same
    /// session under its id.
    fn bound_session(&self, req: &Request, operation: &'static str) -> PanelResult<Arc<Session>> {
        let Some(session) = req.session() else {
            error!(slot = req.slot(), operation, "Request has no session");
            return Err(PanelError::Misuse("request has no session"));
        };
        match self.sessions.find(session.id()) {
            Some(current) if Arc::ptr_eq(&current, &session) => Ok(session),
            _ => {
                error!(session_id = %session.id(), operation, "Bound session no longer exists");
                Err(PanelError::UnknownSession(session.id().clone()))
            }
        }
    }

    /// Feed one body chunk. `false` tells the HTTP layer to fail the request.
    pub fn on_body_chunk(&self, req: &Request, chunk: &Chunk<'_>) -> bool {
        let Ok(session) = self.bound_session(req, "body_chunk") else {
            self.stats.record_rejected_chunk();
            return false;
        };
        let accepted = self.ingestor.feed(req, &session, chunk);
        if !accepted {
            self.stats.record_rejected_chunk();
        } else if chunk.filename.is_some() {
            self.stats.record_upload_bytes(chunk.size());
        }
        accepted
    }

    /// End of body: flush POST state and dispatch the submission.
    /// `Ok(None)` if there was nothing to dispatch.
    pub fn on_body_complete(&self, req: &Request) -> PanelResult<Option<DispatchOutcome>> {
        let session = self.bound_session(req, "body_complete")?;
        let submission = self.ingestor.finish(req, &session);
        req.set_post_mode(PostMode::None);
        if submission.params.is_empty() {
            return Ok(None);
        }
        Ok(self
            .dispatcher
            .dispatch(session.id(), submission.params, session.values()))
    }

    /// Completion callback: release the session and return the request to
    /// the pool. A body that never completed is discarded. Safe to call more
    /// than once.
    pub fn on_request_complete(&self, req: &Request, bytes_served: u64) {
        if let Some(session) = req.take_session() {
            if req.post_mode() != PostMode::None {
                self.ingestor.abort(&session);
                req.set_post_mode(PostMode::None);
            }
            session.release();
        }
        self.stats.record_bytes_served(bytes_served);
        self.requests.release(req);
    }

    // --- exposed operations -----------------------------------------------

    pub fn register_action<F>(&self, key: &str, handler: F, mode: ExecMode)
    where
        F: Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.register(key, handler, mode);
    }

    pub fn set_upload_listener(&self, listener: Arc<dyn UploadListener>) {
        self.ingestor.set_listener(listener);
    }

    pub fn get_session_values(&self, id: &SessionId) -> PanelResult<ValueMatrix> {
        self.sessions
            .find(id)
            .map(|s| s.values())
            .ok_or_else(|| PanelError::UnknownSession(id.clone()))
    }

    /// Check credentials and record the result on the session. Returns
    /// whether the session is now authenticated.
    pub fn authenticate_session(
        &self,
        id: &SessionId,
        credentials: Credentials,
    ) -> PanelResult<bool> {
        let session = self
            .sessions
            .find(id)
            .ok_or_else(|| PanelError::UnknownSession(id.clone()))?;
        let ok = self.credentials_match(&credentials);
        if ok {
            info!(session_id = %id, user = %credentials.user, "Session authenticated");
            session.set_authenticated(Some(credentials), true);
        } else {
            warn!(session_id = %id, user = %credentials.user, "Authentication failed");
            session.set_authenticated(None, false);
        }
        Ok(ok)
    }

    fn credentials_match(&self, credentials: &Credentials) -> bool {
        if credentials.user.is_empty() {
            return false;
        }
        let table = &self.config.credentials;
        if table.is_empty() {
            return true;
        }
        table
            .get(&credentials.user)
            .is_some_and(|password| *password == credentials.password)
    }

    pub fn logoff_session(&self, id: &SessionId) -> PanelResult<()> {
        let session = self
            .sessions
            .find(id)
            .ok_or_else(|| PanelError::UnknownSession(id.clone()))?;
        session.logoff();
        info!(session_id = %id, "Session logged off");
        Ok(())
    }

    /// Tokens from the last statistics snapshot.
    #[must_use]
    pub fn stats_tokens(&self) -> BTreeMap<String, TokenValue> {
        self.stats.tokens()
    }

    #[must_use]
    pub fn prometheus(&self) -> String {
        self.stats.to_prometheus()
    }

    // --- timer work -------------------------------------------------------

    /// One timer-driven collection. Skipped unless Running or Paused.
    pub fn collect_garbage(&self) -> Option<GcReport> {
        if !self.mode.is_running() {
            debug!(mode = %self.mode.get(), "GC skipped in current mode");
            return None;
        }
        Some(self.run_gc(false))
    }

    fn run_gc(&self, cleanup: bool) -> GcReport {
        let report = self.sessions.collect(&self.policy, cleanup);
        self.stats.record_gc(&report);
        if let Some(requests) = self.collect_requests(cleanup) {
            self.stats.record_request_gc(&requests);
        }
        report
    }

    fn collect_requests(&self, cleanup: bool) -> Option<RequestGcReport> {
        let divisor = if cleanup { self.policy.cleanup_factor } else { 1 };
        let idle = Duration::from_secs(self.config.request_delete_age) / divisor;
        let zombie = idle * self.policy.zombie_factor;
        let mut report = self.requests.collect(idle, zombie, self.policy.lock_timeout)?;
        for reclaimed in report.reclaimed.drain(..) {
            let session = reclaimed.session;
            if reclaimed.post_mode != PostMode::None {
                self.ingestor.abort(&session);
            }
            session.release();
            warn!(
                slot = reclaimed.slot,
                session_id = %session.id(),
                refs = session.ref_count(),
                "Zombie request released its session"
            );
        }
        Some(report)
    }

    /// Sample gauges and publish a new statistics snapshot.
    pub fn refresh_stats(&self) -> Arc<StatsSnapshot> {
        let gauges = Gauges {
            mode: self.mode.get(),
            sessions: self.sessions.len(),
            sessions_busy: self.sessions.busy_count(),
            request_slots: self.requests.len(),
            requests_active: self.requests.active(),
            queue_async: self.dispatcher.queue_depth(),
            action_slots: self.dispatcher.slots().len(),
        };
        self.stats.refresh(gauges, self.dispatcher.metrics())
    }

    // --- persistence ------------------------------------------------------

    /// Save to `session_store_dir`. `Ok(0)` if no directory is configured.
    pub fn save_sessions(&self) -> PanelResult<usize> {
        match &self.config.session_store_dir {
            Some(dir) => self.sessions.save(dir),
            None => {
                debug!("No session store directory configured; not saving");
                Ok(0)
            }
        }
    }

    pub fn load_sessions(&self) -> PanelResult<usize> {
        match &self.config.session_store_dir {
            Some(dir) => self.sessions.load(dir),
            None => Ok(0),
        }
    }

    // --- accessors --------------------------------------------------------

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn policy(&self) -> &GcPolicy {
        &self.policy
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    #[must_use]
    pub fn requests(&self) -> &RequestPool {
        &self.requests
    }

    #[must_use]
    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }
}

impl Drop for ServerContext {
    fn drop(&mut self) {
        if let Some(mut timers) = self.timers.get_mut().take() {
            timers.stop();
        }
        self.dispatcher.stop_workers();
    }
}
