//! # Request Slot Pool
//!
//! One [`Request`] is bound to each in-flight HTTP exchange. Requests are never
//! freed while the pool exists: the HTTP layer's completion callback
//! [`RequestPool::release`]s them and a later [`RequestPool::acquire`] resets
//! and reuses any entry that has been idle for longer than the grace window.
//!
//! The pool grows on demand. Its size is bounded by peak connection
//! concurrency plus the grace window, and [`RequestPool::collect`] shrinks it
//! again after a burst.

use crate::ids::SessionId;
use crate::session::Session;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Opaque per-exchange handle owned by the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// How the body of the current exchange is being consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostMode {
    #[default]
    None,
    FormData,
    RawUpload,
}

#[derive(Debug)]
struct RequestState {
    connection: Option<ConnectionId>,
    created: Instant,
    last_access: Instant,
    session: Option<Arc<Session>>,
    authenticated: bool,
    post_mode: PostMode,
}

#[derive(Debug)]
pub struct Request {
    slot: u64,
    refs: AtomicI64,
    state: Mutex<RequestState>,
}

impl Request {
    fn new(slot: u64, connection: ConnectionId) -> Self {
        let now = Instant::now();
        Self {
            slot,
            refs: AtomicI64::new(1),
            state: Mutex::new(RequestState {
                connection: Some(connection),
                created: now,
                last_access: now,
                session: None,
                authenticated: false,
                post_mode: PostMode::None,
            }),
        }
    }

    fn reset(&self, connection: ConnectionId) {
        let now = Instant::now();
        let mut state = self.state.lock();
        *state = RequestState {
            connection: Some(connection),
            created: now,
            last_access: now,
            session: None,
            authenticated: false,
            post_mode: PostMode::None,
        };
        self.refs.store(1, Ordering::Release);
    }

    /// Stable index of this slot inside its pool.
    #[must_use]
    pub fn slot(&self) -> u64 {
        self.slot
    }

    #[must_use]
    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn connection(&self) -> Option<ConnectionId> {
        self.state.lock().connection
    }

    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.state.lock().session.as_ref().map(|s| s.id().clone())
    }

    /// The session this exchange holds a reference on.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session>> {
        self.state.lock().session.as_ref().map(Arc::clone)
    }

    pub fn bind_session(&self, session: Arc<Session>) {
        let mut state = self.state.lock();
        state.authenticated = session.is_authenticated();
        state.session = Some(session);
        state.last_access = Instant::now();
    }

    /// Unbind the session, returning it once. Later calls return `None`.
    ///
    /// The handle is the one the reference was taken on, so a completion that
    /// arrives after the id was collected and reused never touches the
    /// newer session.
    pub fn take_session(&self) -> Option<Arc<Session>> {
        self.state.lock().session.take()
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.state.lock().authenticated = authenticated;
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.lock().authenticated
    }

    #[must_use]
    pub fn post_mode(&self) -> PostMode {
        self.state.lock().post_mode
    }

    pub fn set_post_mode(&self, mode: PostMode) {
        self.state.lock().post_mode = mode;
    }

    pub fn touch(&self) {
        self.state.lock().last_access = Instant::now();
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_access.elapsed()
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.state.lock().created.elapsed()
    }

    fn is_reusable(&self, grace: Duration) -> bool {
        self.ref_count() <= 0 && self.idle_for() > grace
    }
}

/// A zombie request's binding, handed back so its session can be released.
#[derive(Debug)]
pub struct ReclaimedRequest {
    pub slot: u64,
    pub session: Arc<Session>,
    pub post_mode: PostMode,
}

/// Result of one [`RequestPool::collect`] pass.
#[derive(Debug, Default)]
pub struct RequestGcReport {
    pub dropped: usize,
    pub zombies: usize,
    pub remaining: usize,
    /// Sessions unbound from zombies; the caller still owes their release.
    pub reclaimed: Vec<ReclaimedRequest>,
}

pub struct RequestPool {
    entries: Mutex<Vec<Arc<Request>>>,
    grace: Duration,
    next_slot: AtomicU64,
    acquired: AtomicU64,
}

impl RequestPool {
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            grace,
            next_slot: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
        }
    }

    /// Bind a request object to a new exchange, reusing an idle entry when one
    /// has been released for longer than the grace window.
    pub fn acquire(&self, connection: ConnectionId) -> Arc<Request> {
        let mut entries = self.entries.lock();
        self.acquired.fetch_add(1, Ordering::Relaxed);

        if let Some(req) = entries.iter().find(|r| r.is_reusable(self.grace)) {
            req.reset(connection);
            debug!(slot = req.slot(), connection = connection.0, "Request slot reused");
            return Arc::clone(req);
        }

        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let req = Arc::new(Request::new(slot, connection));
        entries.push(Arc::clone(&req));
        debug!(
            slot,
            connection = connection.0,
            pool_size = entries.len(),
            "Request slot allocated"
        );
        req
    }

    /// Completion callback from the HTTP layer. Releasing an already idle
    /// request is a no-op apart from the timestamp.
    pub fn release(&self, req: &Request) {
        let prev = req
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            });
        if prev.is_err() {
            debug!(slot = req.slot(), "Release on idle request ignored");
        }
        req.touch();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|r| r.ref_count() > 0)
            .count()
    }

    /// Total number of acquisitions since start.
    #[must_use]
    pub fn acquired_total(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Shrink the pool and reclaim requests whose completion never arrived.
    ///
    /// Idle entries older than `idle_age` are dropped; entries still
    /// referenced after `zombie_age` are forced idle and their session binding
    /// is moved into [`RequestGcReport::reclaimed`]. Returns `None` if the pool
    /// lock could not be taken within `lock_timeout`.
    pub fn collect(
        &self,
        idle_age: Duration,
        zombie_age: Duration,
        lock_timeout: Duration,
    ) -> Option<RequestGcReport> {
        let Some(mut entries) = self.entries.try_lock_for(lock_timeout) else {
            warn!("Request pool busy; skipping GC cycle");
            return None;
        };

        let mut report = RequestGcReport::default();
        entries.retain(|req| {
            let idle = req.idle_for();
            if req.ref_count() <= 0 {
                if idle > idle_age && Arc::strong_count(req) == 1 {
                    report.dropped += 1;
                    return false;
                }
            } else if req.age() > zombie_age && idle > zombie_age {
                warn!(
                    slot = req.slot(),
                    age_secs = req.age().as_secs(),
                    "Zombie request forced idle"
                );
                req.refs.store(0, Ordering::Release);
                if let Some(session) = req.take_session() {
                    report.reclaimed.push(ReclaimedRequest {
                        slot: req.slot(),
                        session,
                        post_mode: req.post_mode(),
                    });
                }
                req.set_post_mode(PostMode::None);
                report.zombies += 1;
            }
            true
        });
        report.remaining = entries.len();

        if report.dropped > 0 || report.zombies > 0 {
            info!(
                dropped = report.dropped,
                zombies = report.zombies,
                remaining = report.remaining,
                "Request pool collected"
            );
        }
        Some(report)
    }
}
