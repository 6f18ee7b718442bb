use crate::ids::SessionId;
use crate::post::IngestState;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Sessions with fewer matrix entries than this look like probes.
pub const MIN_MATRIX_ENTRIES: usize = 4;

/// Coarse client classification taken from the User-Agent header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    #[default]
    Unknown,
    Browser,
    Mobile,
    Bot,
}

impl AgentKind {
    #[must_use]
    pub fn classify(user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        if ua.is_empty() {
            return AgentKind::Unknown;
        }
        const BOTS: [&str; 8] = [
            "bot", "crawler", "spider", "slurp", "curl", "wget", "python-requests", "scanner",
        ];
        if BOTS.iter().any(|b| ua.contains(b)) {
            AgentKind::Bot
        } else if ua.contains("mobile") || ua.contains("android") || ua.contains("iphone") {
            AgentKind::Mobile
        } else if ua.contains("mozilla") || ua.contains("webkit") || ua.contains("gecko") {
            AgentKind::Browser
        } else {
            AgentKind::Unknown
        }
    }
}

/// Credentials presented by a client.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Insertion-ordered key/value matrix. Setting an existing key keeps its slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueMatrix(Vec<(String, String)>);

impl ValueMatrix {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0.iter().cloned().collect()
    }
}

impl FromIterator<(String, String)> for ValueMatrix {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut m = ValueMatrix::new();
        for (k, v) in iter {
            m.set(k, v);
        }
        m
    }
}

#[derive(Debug)]
struct SessionMeta {
    authenticated: bool,
    credentials: Option<Credentials>,
    cookies: BTreeMap<String, String>,
    agent: AgentKind,
    created: SystemTime,
    last_seen: SystemTime,
}

/// Server-side state for one logical client.
///
/// Owned by the [`SessionStore`](super::SessionStore); everything else holds
/// it through a lookup. `refs` and `busy` are the GC veto and are read
/// without any session lock. The value matrix has its own lock so a long read
/// of session values never blocks metadata updates or store lookups.
pub struct Session {
    id: SessionId,
    refs: AtomicI64,
    uses: AtomicU64,
    busy: AtomicBool,
    meta: Mutex<SessionMeta>,
    values: RwLock<ValueMatrix>,
    ingest: Mutex<IngestState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("refs", &self.ref_count())
            .field("uses", &self.use_count())
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            refs: AtomicI64::new(0),
            uses: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            meta: Mutex::new(SessionMeta {
                authenticated: false,
                credentials: None,
                cookies: BTreeMap::new(),
                agent: AgentKind::Unknown,
                created: now,
                last_seen: now,
            }),
            values: RwLock::new(ValueMatrix::new()),
            ingest: Mutex::new(IngestState::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    // --- GC signals -------------------------------------------------------

    #[must_use]
    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    /// Count one more holder and one more use, and stamp last-seen.
    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
        self.uses.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Drop one holder. Never goes below zero.
    pub fn release(&self) {
        let released = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            });
        if released.is_err() {
            debug!(session_id = %self.id, "Release on unreferenced session ignored");
        }
        self.touch();
    }

    #[must_use]
    pub fn use_count(&self) -> u64 {
        self.uses.load(Ordering::Relaxed)
    }

    pub(crate) fn set_use_count(&self, uses: u64) {
        self.uses.store(uses, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }

    /// A busy or referenced session must not be deleted.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.is_busy() || self.ref_count() > 0
    }

    // --- timestamps -------------------------------------------------------

    pub fn touch(&self) {
        self.meta.lock().last_seen = SystemTime::now();
    }

    #[must_use]
    pub fn created(&self) -> SystemTime {
        self.meta.lock().created
    }

    #[must_use]
    pub fn last_seen(&self) -> SystemTime {
        self.meta.lock().last_seen
    }

    /// Time since the session was last seen.
    #[must_use]
    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_seen())
            .unwrap_or_default()
    }

    /// Restore timestamps, e.g. from a persisted record.
    pub fn set_timestamps(&self, created: SystemTime, last_seen: SystemTime) {
        let mut meta = self.meta.lock();
        meta.created = created;
        meta.last_seen = last_seen;
    }

    // --- authentication ---------------------------------------------------

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.meta.lock().authenticated
    }

    /// Cache credentials and set the authenticated flag.
    pub fn set_authenticated(&self, credentials: Option<Credentials>, authenticated: bool) {
        let mut meta = self.meta.lock();
        meta.credentials = credentials;
        meta.authenticated = authenticated;
    }

    #[must_use]
    pub fn user(&self) -> Option<String> {
        self.meta.lock().credentials.as_ref().map(|c| c.user.clone())
    }

    pub fn logoff(&self) {
        let mut meta = self.meta.lock();
        meta.authenticated = false;
        meta.credentials = None;
    }

    #[must_use]
    pub fn agent(&self) -> AgentKind {
        self.meta.lock().agent
    }

    pub fn set_agent(&self, agent: AgentKind) {
        self.meta.lock().agent = agent;
    }

    // --- cookies ----------------------------------------------------------

    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
        self.meta.lock().cookies.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.meta.lock().cookies.get(name).cloned()
    }

    #[must_use]
    pub fn cookies(&self) -> BTreeMap<String, String> {
        self.meta.lock().cookies.clone()
    }

    pub(crate) fn set_cookies(&self, cookies: BTreeMap<String, String>) {
        self.meta.lock().cookies = cookies;
    }

    // --- value matrix -----------------------------------------------------

    #[must_use]
    pub fn value(&self, key: &str) -> Option<String> {
        self.values.read().get(key).map(str::to_owned)
    }

    pub fn set_value(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().set(key, value);
    }

    pub fn remove_value(&self, key: &str) -> Option<String> {
        self.values.write().remove(key)
    }

    /// Copy of the matrix, taken under the matrix lock only.
    #[must_use]
    pub fn values(&self) -> ValueMatrix {
        self.values.read().clone()
    }

    pub(crate) fn replace_values(&self, values: ValueMatrix) {
        *self.values.write() = values;
    }

    #[must_use]
    pub fn matrix_len(&self) -> usize {
        self.values.read().len()
    }

    // --- classification ---------------------------------------------------

    /// Never authenticated, too little state, or a known bot.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.agent() == AgentKind::Bot
            || !self.is_authenticated()
            || self.matrix_len() < MIN_MATRIX_ENTRIES
    }

    /// Worth persisting: not a bot, and authenticated or carrying state.
    #[must_use]
    pub fn is_interesting(&self) -> bool {
        if self.agent() == AgentKind::Bot {
            return false;
        }
        self.is_authenticated() || self.matrix_len() > 0 || !self.meta.lock().cookies.is_empty()
    }

    // --- POST / upload sub-state ------------------------------------------

    pub(crate) fn ingest(&self) -> MutexGuard<'_, IngestState> {
        self.ingest.lock()
    }
}
