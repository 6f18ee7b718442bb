//! # Statistics Module
//!
//! Counters for the session/request core and the token snapshot the page
//! templates read.
//!
//! Hot paths bump atomics in [`Stats`]. The timer thread calls
//! [`Stats::refresh`] every `stats_interval`, which samples the gauges
//! (session count, queue depth, process memory) and publishes an immutable
//! [`StatsSnapshot`]. Template substitution reads tokens from the last
//! snapshot only, so a page never triggers a sweep over the session map.
//!
//! ## Tokens
//!
//! | Token                  | Value                                  |
//! |------------------------|----------------------------------------|
//! | `server.requests`      | requests accepted since start          |
//! | `server.sessions`      | live sessions                          |
//! | `server.queue.async`   | Async actions queued or running        |
//! | `server.bytes_served`  | response bytes reported by the HTTP layer |
//! | `server.mode`          | current server mode (text)             |
//! | `server.uptime`        | seconds since the core was created     |
//! | `process.rss_bytes`    | resident set size                      |
//!
//! plus the per-policy GC and dispatch counters listed by [`Stats::tokens`].

use crate::dispatcher::DispatchMetrics;
use crate::memory::{trim_hints, MemoryStats};
use crate::mode::ServerMode;
use crate::request::RequestGcReport;
use crate::session::GcReport;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A template token value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TokenValue {
    Number(u64),
    Text(String),
}

impl fmt::Display for TokenValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenValue::Number(n) => write!(f, "{n}"),
            TokenValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for TokenValue {
    fn from(n: u64) -> Self {
        TokenValue::Number(n)
    }
}

impl From<usize> for TokenValue {
    fn from(n: usize) -> Self {
        TokenValue::Number(n as u64)
    }
}

impl From<&str> for TokenValue {
    fn from(s: &str) -> Self {
        TokenValue::Text(s.to_string())
    }
}

/// Point-in-time values the counters cannot provide.
#[derive(Debug, Clone, Copy)]
pub struct Gauges {
    pub mode: ServerMode,
    pub sessions: usize,
    pub sessions_busy: usize,
    pub request_slots: usize,
    pub requests_active: usize,
    pub queue_async: usize,
    pub action_slots: usize,
}

impl Default for Gauges {
    fn default() -> Self {
        Self {
            mode: ServerMode::Created,
            sessions: 0,
            sessions_busy: 0,
            request_slots: 0,
            requests_active: 0,
            queue_async: 0,
            action_slots: 0,
        }
    }
}

/// Published view, replaced wholesale on each refresh.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub mode: Option<ServerMode>,
    pub uptime_secs: u64,
    pub requests: u64,
    pub bytes_served: u64,
    pub upload_bytes: u64,
    pub chunks_rejected: u64,
    pub sessions: usize,
    pub sessions_busy: usize,
    pub request_slots: usize,
    pub requests_active: usize,
    pub queue_async: usize,
    pub action_slots: usize,
    pub actions_inline: u64,
    pub actions_queued: u64,
    pub actions_fallback: u64,
    pub actions_failed: u64,
    pub actions_unhandled: u64,
    pub gc_unused: u64,
    pub gc_zombies: u64,
    pub gc_rejected: u64,
    pub gc_storm: u64,
    pub gc_skipped: u64,
    pub storm_runs: u64,
    pub request_slots_dropped: u64,
    pub request_zombies: u64,
    pub rss_bytes: u64,
    pub vss_bytes: u64,
    pub heap_trims: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    bytes_served: AtomicU64,
    upload_bytes: AtomicU64,
    chunks_rejected: AtomicU64,
    gc_unused: AtomicU64,
    gc_zombies: AtomicU64,
    gc_rejected: AtomicU64,
    gc_storm: AtomicU64,
    gc_skipped: AtomicU64,
    storm_runs: AtomicU64,
    request_slots_dropped: AtomicU64,
    request_zombies: AtomicU64,
}

fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

pub struct Stats {
    started: Instant,
    counters: Counters,
    snapshot: RwLock<Arc<StatsSnapshot>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: Counters::default(),
            snapshot: RwLock::new(Arc::new(StatsSnapshot::default())),
        }
    }

    pub fn record_request(&self) {
        add(&self.counters.requests, 1);
    }

    pub fn record_bytes_served(&self, bytes: u64) {
        add(&self.counters.bytes_served, bytes);
    }

    pub fn record_upload_bytes(&self, bytes: u64) {
        add(&self.counters.upload_bytes, bytes);
    }

    pub fn record_rejected_chunk(&self) {
        add(&self.counters.chunks_rejected, 1);
    }

    pub fn record_gc(&self, report: &GcReport) {
        let c = &self.counters;
        add(&c.gc_unused, report.unused as u64);
        add(&c.gc_zombies, report.zombies as u64);
        add(&c.gc_rejected, report.rejected as u64);
        add(&c.gc_storm, report.storm as u64);
        add(&c.gc_skipped, report.skipped as u64);
        if report.storm > 0 {
            add(&c.storm_runs, 1);
        }
    }

    pub fn record_request_gc(&self, report: &RequestGcReport) {
        add(&self.counters.request_slots_dropped, report.dropped as u64);
        add(&self.counters.request_zombies, report.zombies as u64);
    }

    #[must_use]
    pub fn requests(&self) -> u64 {
        get(&self.counters.requests)
    }

    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Build and publish a new snapshot.
    pub fn refresh(&self, gauges: Gauges, dispatch: &DispatchMetrics) -> Arc<StatsSnapshot> {
        let c = &self.counters;
        let memory = MemoryStats::current();
        let snapshot = Arc::new(StatsSnapshot {
            mode: Some(gauges.mode),
            uptime_secs: self.uptime_secs(),
            requests: get(&c.requests),
            bytes_served: get(&c.bytes_served),
            upload_bytes: get(&c.upload_bytes),
            chunks_rejected: get(&c.chunks_rejected),
            sessions: gauges.sessions,
            sessions_busy: gauges.sessions_busy,
            request_slots: gauges.request_slots,
            requests_active: gauges.requests_active,
            queue_async: gauges.queue_async,
            action_slots: gauges.action_slots,
            actions_inline: DispatchMetrics::get(&dispatch.inline),
            actions_queued: DispatchMetrics::get(&dispatch.queued),
            actions_fallback: DispatchMetrics::get(&dispatch.fallback),
            actions_failed: DispatchMetrics::get(&dispatch.failed),
            actions_unhandled: DispatchMetrics::get(&dispatch.unhandled),
            gc_unused: get(&c.gc_unused),
            gc_zombies: get(&c.gc_zombies),
            gc_rejected: get(&c.gc_rejected),
            gc_storm: get(&c.gc_storm),
            gc_skipped: get(&c.gc_skipped),
            storm_runs: get(&c.storm_runs),
            request_slots_dropped: get(&c.request_slots_dropped),
            request_zombies: get(&c.request_zombies),
            rss_bytes: memory.rss_bytes,
            vss_bytes: memory.vss_bytes,
            heap_trims: trim_hints(),
        });
        *self.snapshot.write() = Arc::clone(&snapshot);
        snapshot
    }

    /// Last published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<StatsSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Named tokens for template substitution, from the last snapshot.
    #[must_use]
    pub fn tokens(&self) -> BTreeMap<String, TokenValue> {
        let s = self.snapshot();
        let mode = s.mode.map_or("unknown", ServerMode::as_str);
        let entries: [(&str, TokenValue); 28] = [
            ("server.mode", mode.into()),
            ("server.uptime", s.uptime_secs.into()),
            ("server.requests", s.requests.into()),
            ("server.requests.active", s.requests_active.into()),
            ("server.request_slots", s.request_slots.into()),
            ("server.sessions", s.sessions.into()),
            ("server.sessions.busy", s.sessions_busy.into()),
            ("server.queue.async", s.queue_async.into()),
            ("server.action_slots", s.action_slots.into()),
            ("server.bytes_served", s.bytes_served.into()),
            ("server.upload_bytes", s.upload_bytes.into()),
            ("server.chunks_rejected", s.chunks_rejected.into()),
            ("server.actions.inline", s.actions_inline.into()),
            ("server.actions.queued", s.actions_queued.into()),
            ("server.actions.fallback", s.actions_fallback.into()),
            ("server.actions.failed", s.actions_failed.into()),
            ("server.actions.unhandled", s.actions_unhandled.into()),
            ("gc.unused", s.gc_unused.into()),
            ("gc.zombies", s.gc_zombies.into()),
            ("gc.rejected", s.gc_rejected.into()),
            ("gc.storm", s.gc_storm.into()),
            ("gc.skipped", s.gc_skipped.into()),
            ("gc.storm_runs", s.storm_runs.into()),
            ("gc.request_slots", s.request_slots_dropped.into()),
            ("gc.request_zombies", s.request_zombies.into()),
            ("process.rss_bytes", s.rss_bytes.into()),
            ("process.vss_bytes", s.vss_bytes.into()),
            ("process.heap_trims", s.heap_trims.into()),
        ];
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    /// The last snapshot in Prometheus text exposition format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::with_capacity(2048);

        let mut metric = |name: &str, kind: &str, help: &str, value: u64| {
            out.push_str(&format!("# HELP panel_{name} {help}\n"));
            out.push_str(&format!("# TYPE panel_{name} {kind}\n"));
            out.push_str(&format!("panel_{name} {value}\n"));
        };
        metric("requests_total", "counter", "Requests accepted", s.requests);
        metric("bytes_served_total", "counter", "Response bytes served", s.bytes_served);
        metric("upload_bytes_total", "counter", "Upload bytes written", s.upload_bytes);
        metric("chunks_rejected_total", "counter", "Body chunks rejected", s.chunks_rejected);
        metric("sessions", "gauge", "Live sessions", s.sessions as u64);
        metric("sessions_busy", "gauge", "Sessions busy or referenced", s.sessions_busy as u64);
        metric("request_slots", "gauge", "Pooled request slots", s.request_slots as u64);
        metric("requests_active", "gauge", "Request slots in use", s.requests_active as u64);
        metric("queue_async", "gauge", "Async actions queued or running", s.queue_async as u64);
        metric("uptime_seconds", "gauge", "Seconds since start", s.uptime_secs);
        metric("process_rss_bytes", "gauge", "Resident Set Size in bytes", s.rss_bytes);

        out.push_str("# HELP panel_actions_total Action invocations by path\n");
        out.push_str("# TYPE panel_actions_total counter\n");
        for (path, n) in [
            ("inline", s.actions_inline),
            ("queued", s.actions_queued),
            ("fallback", s.actions_fallback),
        ] {
            out.push_str(&format!("panel_actions_total{{path=\"{path}\"}} {n}\n"));
        }
        out.push_str("# HELP panel_actions_failed_total Action invocations that failed\n");
        out.push_str("# TYPE panel_actions_failed_total counter\n");
        out.push_str(&format!("panel_actions_failed_total {}\n", s.actions_failed));

        out.push_str("# HELP panel_gc_deleted_total Sessions deleted by policy\n");
        out.push_str("# TYPE panel_gc_deleted_total counter\n");
        for (policy, n) in [
            ("unused", s.gc_unused),
            ("zombie", s.gc_zombies),
            ("rejected", s.gc_rejected),
            ("storm", s.gc_storm),
        ] {
            out.push_str(&format!("panel_gc_deleted_total{{policy=\"{policy}\"}} {n}\n"));
        }
        out.push_str("# HELP panel_gc_skipped_total Sweeps skipped on lock contention\n");
        out.push_str("# TYPE panel_gc_skipped_total counter\n");
        out.push_str(&format!("panel_gc_skipped_total {}\n", s.gc_skipped));

        let mode = s.mode.map_or("unknown", ServerMode::as_str);
        out.push_str("# HELP panel_mode Current server mode\n");
        out.push_str("# TYPE panel_mode gauge\n");
        out.push_str(&format!("panel_mode{{mode=\"{mode}\"}} 1\n"));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_reflect_last_refresh_only() {
        let stats = Stats::new();
        stats.record_request();
        stats.record_request();
        stats.record_bytes_served(512);
        // Not yet published.
        assert_eq!(stats.tokens()["server.requests"], TokenValue::Number(0));

        let gauges = Gauges {
            mode: ServerMode::Running,
            sessions: 3,
            queue_async: 1,
            ..Gauges::default()
        };
        stats.refresh(gauges, &DispatchMetrics::default());
        let tokens = stats.tokens();
        assert_eq!(tokens["server.requests"], TokenValue::Number(2));
        assert_eq!(tokens["server.sessions"], TokenValue::Number(3));
        assert_eq!(tokens["server.queue.async"], TokenValue::Number(1));
        assert_eq!(tokens["server.bytes_served"], TokenValue::Number(512));
        assert_eq!(tokens["server.mode"], TokenValue::Text("running".into()));
        assert!(tokens.contains_key("process.rss_bytes"));
        assert!(tokens.contains_key("server.uptime"));
    }

    #[test]
    fn test_gc_counters_accumulate() {
        let stats = Stats::new();
        let report = GcReport {
            unused: 2,
            storm: 5,
            ..GcReport::default()
        };
        stats.record_gc(&report);
        stats.record_gc(&report);
        let snap = stats.refresh(Gauges::default(), &DispatchMetrics::default());
        assert_eq!(snap.gc_unused, 4);
        assert_eq!(snap.gc_storm, 10);
        assert_eq!(snap.storm_runs, 2);
    }

    #[test]
    fn test_prometheus_format() {
        let stats = Stats::new();
        stats.record_request();
        stats.refresh(
            Gauges {
                mode: ServerMode::Paused,
                ..Gauges::default()
            },
            &DispatchMetrics::default(),
        );
        let text = stats.to_prometheus();
        assert!(text.contains("# TYPE panel_requests_total counter"));
        assert!(text.contains("panel_requests_total 1\n"));
        assert!(text.contains("panel_gc_deleted_total{policy=\"storm\"} 0"));
        assert!(text.contains("panel_mode{mode=\"paused\"} 1"));
    }

    #[test]
    fn test_token_display() {
        assert_eq!(TokenValue::Number(42).to_string(), "42");
        assert_eq!(TokenValue::from("idle").to_string(), "idle");
    }
}
