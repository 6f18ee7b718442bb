//! Session reclamation.
//!
//! Four policies share one pattern: take the store lock (giving up after a
//! short timeout so the timer thread never stalls), mark candidates, then
//! re-check the busy/reference veto on each candidate immediately before
//! removing it. Removed sessions are torn down after the lock is released.

use super::core::Session;
use super::store::{SessionMap, SessionStore};
use crate::config::ServerConfig;
use crate::ids::SessionId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ages and limits for the collectors, derived from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct GcPolicy {
    pub session_delete_age: Duration,
    pub rejected_delete_age: Duration,
    pub zombie_factor: u32,
    /// Divisor applied to every age in cleanup mode
    pub cleanup_factor: u32,
    pub max_sessions: usize,
    pub heap_trim_threshold: usize,
    pub lock_timeout: Duration,
    pub delete_referenced_rejected: bool,
}

impl GcPolicy {
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            session_delete_age: Duration::from_secs(config.session_delete_age),
            rejected_delete_age: Duration::from_secs(config.rejected_delete_age),
            zombie_factor: config.zombie_factor,
            cleanup_factor: config.cleanup_factor.max(1),
            max_sessions: config.max_sessions,
            heap_trim_threshold: config.heap_trim_threshold,
            lock_timeout: config.gc_lock_timeout(),
            delete_referenced_rejected: config.delete_referenced_rejected,
        }
    }

    fn tighten(&self, age: Duration, cleanup: bool) -> Duration {
        if cleanup {
            age / self.cleanup_factor
        } else {
            age
        }
    }

    #[must_use]
    pub fn unused_age(&self, cleanup: bool) -> Duration {
        self.tighten(self.session_delete_age, cleanup)
    }

    #[must_use]
    pub fn zombie_age(&self, cleanup: bool) -> Duration {
        self.tighten(self.session_delete_age * self.zombie_factor, cleanup)
    }

    #[must_use]
    pub fn rejected_age(&self, cleanup: bool) -> Duration {
        self.tighten(self.rejected_delete_age, cleanup)
    }

    /// Session count the storm limiter reduces to.
    #[must_use]
    pub fn storm_target(&self) -> usize {
        self.max_sessions * 3 / 4
    }
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Outcome of one full collection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcReport {
    pub unused: usize,
    pub zombies: usize,
    pub rejected: usize,
    pub storm: usize,
    /// Sweeps skipped because the store lock was contended
    pub skipped: usize,
    /// Live sessions afterwards; 0 if the lock could not be re-taken
    pub remaining: usize,
}

impl GcReport {
    #[must_use]
    pub fn deleted(&self) -> usize {
        self.unused + self.zombies + self.rejected + self.storm
    }
}

/// Remove marked sessions whose veto still does not apply. `ignore_refs`
/// lets the zombie sweep (and optionally the rejected sweep) delete
/// referenced sessions; busy always vetoes.
fn delete_marked(
    sessions: &mut SessionMap,
    marked: Vec<SessionId>,
    ignore_refs: bool,
    removed: &mut Vec<Arc<Session>>,
) -> usize {
    let mut count = 0;
    for id in marked {
        let Some(session) = sessions.get(&id) else {
            continue;
        };
        let vetoed = session.is_busy() || (!ignore_refs && session.ref_count() > 0);
        if vetoed {
            debug!(session_id = %id, "Session became active after marking; kept");
            continue;
        }
        if let Some(session) = sessions.remove(&id) {
            removed.push(session);
            count += 1;
        }
    }
    count
}

impl SessionStore {
    fn sweep<F>(
        &self,
        policy: &GcPolicy,
        name: &'static str,
        ignore_refs: bool,
        removed: &mut Vec<Arc<Session>>,
        select: F,
    ) -> Option<usize>
    where
        F: Fn(&Session) -> bool,
    {
        let Some(mut sessions) = self.try_lock(policy.lock_timeout) else {
            warn!(sweep = name, "Session store busy; skipping GC sweep");
            return None;
        };
        let marked: Vec<SessionId> = sessions
            .values()
            .filter(|s| select(s))
            .map(|s| s.id().clone())
            .collect();
        let count = delete_marked(&mut sessions, marked, ignore_refs, removed);
        if count > 0 {
            debug!(sweep = name, deleted = count, remaining = sessions.len(), "GC sweep");
        }
        Some(count)
    }

    /// Delete unreferenced, idle sessions older than the base delete age.
    pub fn sweep_unused(
        &self,
        policy: &GcPolicy,
        cleanup: bool,
        removed: &mut Vec<Arc<Session>>,
    ) -> Option<usize> {
        let age = policy.unused_age(cleanup);
        self.sweep(policy, "unused", false, removed, |s| {
            !s.is_pinned() && s.age() > age
        })
    }

    /// Delete any non-busy session far beyond the normal age, even if
    /// referenced. Backstop against leaked references.
    pub fn sweep_zombies(
        &self,
        policy: &GcPolicy,
        cleanup: bool,
        removed: &mut Vec<Arc<Session>>,
    ) -> Option<usize> {
        let age = policy.zombie_age(cleanup);
        self.sweep(policy, "zombie", true, removed, |s| {
            !s.is_busy() && s.age() > age
        })
    }

    /// Delete probes and abandoned sessions sooner than regular ones.
    pub fn sweep_rejected(
        &self,
        policy: &GcPolicy,
        cleanup: bool,
        removed: &mut Vec<Arc<Session>>,
    ) -> Option<usize> {
        let age = policy.rejected_age(cleanup);
        let ignore_refs = policy.delete_referenced_rejected;
        self.sweep(policy, "rejected", ignore_refs, removed, |s| {
            !s.is_busy() && (ignore_refs || s.ref_count() <= 0) && s.is_rejected() && s.age() > age
        })
    }

    /// Emergency reduction when the live count exceeds `max_sessions`.
    ///
    /// Deletes the least-used, oldest, single-use, idle sessions until the
    /// count is at most 75% of the maximum or no eligible session remains.
    pub fn limit_storm(
        &self,
        policy: &GcPolicy,
        removed: &mut Vec<Arc<Session>>,
    ) -> Option<usize> {
        let Some(mut sessions) = self.try_lock(policy.lock_timeout) else {
            warn!(sweep = "storm", "Session store busy; skipping storm limiter");
            return None;
        };
        if sessions.len() <= policy.max_sessions {
            return Some(0);
        }

        let target = policy.storm_target();
        let excess = sessions.len().saturating_sub(target);
        let mut eligible: Vec<(u64, std::time::SystemTime, SessionId)> = sessions
            .values()
            .filter(|s| !s.is_pinned() && s.use_count() <= 1)
            .map(|s| (s.use_count(), s.last_seen(), s.id().clone()))
            .collect();
        eligible.sort();
        let marked: Vec<SessionId> = eligible
            .into_iter()
            .take(excess)
            .map(|(_, _, id)| id)
            .collect();

        let before = sessions.len();
        let count = delete_marked(&mut sessions, marked, false, removed);
        warn!(
            before,
            after = sessions.len(),
            max_sessions = policy.max_sessions,
            deleted = count,
            "Session storm limiter engaged"
        );
        Some(count)
    }

    /// Run every policy once. `cleanup` tightens all ages (content rescan).
    pub fn collect(&self, policy: &GcPolicy, cleanup: bool) -> GcReport {
        let mut report = GcReport::default();
        let mut removed = Vec::new();

        match self.sweep_unused(policy, cleanup, &mut removed) {
            Some(n) => report.unused = n,
            None => report.skipped += 1,
        }
        match self.sweep_zombies(policy, cleanup, &mut removed) {
            Some(n) => report.zombies = n,
            None => report.skipped += 1,
        }
        match self.sweep_rejected(policy, cleanup, &mut removed) {
            Some(n) => report.rejected = n,
            None => report.skipped += 1,
        }
        match self.limit_storm(policy, &mut removed) {
            Some(n) => report.storm = n,
            None => report.skipped += 1,
        }

        for session in &removed {
            crate::post::teardown(session);
        }
        report.remaining = self
            .try_lock(policy.lock_timeout)
            .map_or(0, |sessions| sessions.len());

        if report.deleted() > 0 {
            info!(
                unused = report.unused,
                zombies = report.zombies,
                rejected = report.rejected,
                storm = report.storm,
                remaining = report.remaining,
                cleanup,
                "Session GC completed"
            );
        }
        if policy.heap_trim_threshold > 0 && removed.len() >= policy.heap_trim_threshold {
            drop(removed);
            crate::memory::heap_trim_hint();
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Credentials;
    use std::time::SystemTime;

    fn sid(s: &str) -> SessionId {
        s.parse().unwrap()
    }

    fn policy() -> GcPolicy {
        GcPolicy {
            session_delete_age: Duration::from_secs(100),
            rejected_delete_age: Duration::from_secs(10),
            zombie_factor: 40,
            cleanup_factor: 4,
            max_sessions: 100,
            heap_trim_threshold: 0,
            lock_timeout: Duration::from_millis(10),
            delete_referenced_rejected: false,
        }
    }

    fn backdate(s: &Session, secs: u64) {
        let t = SystemTime::now() - Duration::from_secs(secs);
        s.set_timestamps(t, t);
    }

    fn keeper(store: &SessionStore, id: &str, age: u64) -> Arc<Session> {
        let s = store.find_or_create(&sid(id));
        s.set_authenticated(
            Some(Credentials {
                user: "u".into(),
                password: "p".into(),
            }),
            true,
        );
        for i in 0..4 {
            s.set_value(format!("k{i}"), "v");
        }
        backdate(&s, age);
        s
    }

    #[test]
    fn test_cleanup_tightens_ages() {
        let p = policy();
        assert_eq!(p.unused_age(false), Duration::from_secs(100));
        assert_eq!(p.unused_age(true), Duration::from_secs(25));
        assert_eq!(p.zombie_age(false), Duration::from_secs(4000));
        assert_eq!(p.storm_target(), 75);
    }

    #[test]
    fn test_unused_sweep_respects_age_and_refs() {
        let store = SessionStore::new();
        keeper(&store, "old", 200);
        keeper(&store, "young", 5);
        let held = keeper(&store, "held", 200);
        held.retain();
        backdate(&held, 200);

        let mut removed = Vec::new();
        let n = store.sweep_unused(&policy(), false, &mut removed).unwrap();
        assert_eq!(n, 1);
        assert!(store.find(&sid("old")).is_none());
        assert!(store.find(&sid("young")).is_some());
        assert!(store.find(&sid("held")).is_some());
    }

    #[test]
    fn test_zombie_sweep_ignores_refs_but_not_busy() {
        let store = SessionStore::new();
        let leaked = keeper(&store, "leaked", 5000);
        leaked.retain();
        backdate(&leaked, 5000);
        let busy = keeper(&store, "busy", 5000);
        busy.set_busy(true);

        let mut removed = Vec::new();
        assert_eq!(store.sweep_zombies(&policy(), false, &mut removed), Some(1));
        assert!(store.find(&sid("leaked")).is_none());
        assert!(store.find(&sid("busy")).is_some());
    }

    #[test]
    fn test_rejected_sweep_targets_probes() {
        let store = SessionStore::new();
        let probe = store.find_or_create(&sid("probe"));
        backdate(&probe, 20);
        keeper(&store, "real", 20);

        let mut removed = Vec::new();
        assert_eq!(store.sweep_rejected(&policy(), false, &mut removed), Some(1));
        assert!(store.find(&sid("probe")).is_none());
        assert!(store.find(&sid("real")).is_some());
    }

    #[test]
    fn test_rejected_referenced_kept_by_default() {
        let store = SessionStore::new();
        let probe = store.checkout(&sid("probe"), None);
        backdate(&probe, 20);

        let mut removed = Vec::new();
        assert_eq!(store.sweep_rejected(&policy(), false, &mut removed), Some(0));

        let mut lax = policy();
        lax.delete_referenced_rejected = true;
        assert_eq!(store.sweep_rejected(&lax, false, &mut removed), Some(1));
    }

    #[test]
    fn test_storm_limiter_prefers_oldest_single_use() {
        let store = SessionStore::new();
        let mut p = policy();
        p.max_sessions = 8;
        for i in 0..10 {
            let s = store.find_or_create(&sid(&format!("s{i}")));
            s.set_use_count(1);
            backdate(&s, 100 - i);
        }
        let regular = store.find(&sid("s0")).unwrap();
        regular.set_use_count(5);

        let mut removed = Vec::new();
        let n = store.limit_storm(&p, &mut removed).unwrap();
        assert_eq!(n, 4);
        assert_eq!(store.len(), 6);
        assert!(store.find(&sid("s0")).is_some());
        assert!(store.find(&sid("s1")).is_none());
        assert!(store.find(&sid("s4")).is_none());
        assert!(store.find(&sid("s5")).is_some());
    }

    #[test]
    fn test_collect_skips_when_lock_held() {
        let store = SessionStore::new();
        let guard = store.lock();
        let handle = {
            let p = policy();
            std::thread::scope(|scope| scope.spawn(|| store.collect(&p, false)).join().unwrap())
        };
        drop(guard);
        assert_eq!(handle.skipped, 4);
        assert_eq!(handle.deleted(), 0);
    }
}
