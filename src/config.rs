//! # Configuration Module
//!
//! Configuration for the session/request core. The core does not own the
//! appliance's configuration file format; it consumes a small YAML document
//! (or the defaults) and lets `PANEL_*` environment variables override
//! individual values.
//!
//! ## Environment Variables
//!
//! | Variable                     | Field                 |
//! |------------------------------|-----------------------|
//! | `PANEL_MAX_SESSIONS`         | `max_sessions`        |
//! | `PANEL_SESSION_DELETE_AGE`   | `session_delete_age`  |
//! | `PANEL_REJECTED_DELETE_AGE`  | `rejected_delete_age` |
//! | `PANEL_REQUEST_DELETE_AGE`   | `request_delete_age`  |
//! | `PANEL_ZOMBIE_FACTOR`        | `zombie_factor`       |
//! | `PANEL_UPLOAD_DIR`           | `upload_dir`          |
//! | `PANEL_SESSION_STORE_DIR`    | `session_store_dir`   |
//! | `PANEL_WORKERS`              | `worker_count`        |
//! | `PANEL_STACK_SIZE`           | `worker_stack_size`   |
//! | `PANEL_VERBOSITY`            | `verbosity`           |
//!
//! All ages and intervals are in seconds.
//!
//! ## Example
//!
//! ```yaml
//! max_sessions: 500
//! session_delete_age: 3600
//! upload_dir: /var/tmp/panel-uploads
//! worker_count: 4
//! credentials:
//!   admin: secret
//! ```

use crate::error::{PanelError, PanelResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Live session count that triggers the storm limiter
    pub max_sessions: usize,
    /// Base age before an unreferenced session may be deleted
    pub session_delete_age: u64,
    /// Age after which unauthenticated / trivial sessions are deleted
    pub rejected_delete_age: u64,
    /// Age after which an idle request slot is dropped from the pool
    pub request_delete_age: u64,
    /// Multiplier on `session_delete_age` for the zombie sweep
    pub zombie_factor: u32,
    /// Divisor applied to every age when GC runs in cleanup mode
    pub cleanup_factor: u32,
    /// Minimum idle time before a request slot is reused
    pub request_grace_ms: u64,
    /// Shared temporary directory for streamed uploads
    pub upload_dir: PathBuf,
    /// Root of the persisted session snapshot
    pub session_store_dir: Option<PathBuf>,
    /// Number of async action worker coroutines
    pub worker_count: usize,
    /// Stack size for async action workers
    pub worker_stack_size: usize,
    /// Interval between GC timer ticks
    pub gc_interval: u64,
    /// Interval between statistics snapshots
    pub stats_interval: u64,
    /// How long a GC sweep waits for the store lock before skipping
    pub gc_lock_timeout_ms: u64,
    /// Batch deletions at or above this size issue a heap-compaction hint
    pub heap_trim_threshold: usize,
    /// Let the rejected sweep remove referenced sessions
    pub delete_referenced_rejected: bool,
    /// Source-address prefixes accepted at connect time; empty accepts all
    pub allowed_sources: Vec<String>,
    /// user -> password; empty means any non-empty user authenticates.
    /// Read from the file but never written back out.
    #[serde(skip_serializing)]
    pub credentials: HashMap<String, String>,
    /// 0 = errors only .. 4 = trace
    pub verbosity: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            session_delete_age: 3600,
            rejected_delete_age: 300,
            request_delete_age: 600,
            zombie_factor: 40,
            cleanup_factor: 4,
            request_grace_ms: 2000,
            upload_dir: env::temp_dir().join("panelcore-uploads"),
            session_store_dir: None,
            worker_count: 4,
            worker_stack_size: 0x10000,
            gc_interval: 30,
            stats_interval: 5,
            gc_lock_timeout_ms: 50,
            heap_trim_threshold: 64,
            delete_referenced_rejected: false,
            allowed_sources: Vec::new(),
            credentials: HashMap::new(),
            verbosity: 2,
        }
    }
}

fn parse_usize(val: &str) -> Option<usize> {
    if let Some(hex) = val.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).ok()
    } else {
        val.parse().ok()
    }
}

impl ServerConfig {
    /// Load a YAML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> PanelResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PanelError::io(format!("reading {}", path.display()), e))?;
        let mut cfg: ServerConfig = serde_yaml::from_str(&content)
            .map_err(|e| PanelError::Config(format!("{}: {e}", path.display())))?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> PanelResult<Self> {
        let mut cfg = ServerConfig::default();
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self) {
        let read = |name: &str| env::var(name).ok();
        if let Some(v) = read("PANEL_MAX_SESSIONS").and_then(|v| parse_usize(&v)) {
            self.max_sessions = v;
        }
        if let Some(v) = read("PANEL_SESSION_DELETE_AGE").and_then(|v| v.parse().ok()) {
            self.session_delete_age = v;
        }
        if let Some(v) = read("PANEL_REJECTED_DELETE_AGE").and_then(|v| v.parse().ok()) {
            self.rejected_delete_age = v;
        }
        if let Some(v) = read("PANEL_REQUEST_DELETE_AGE").and_then(|v| v.parse().ok()) {
            self.request_delete_age = v;
        }
        if let Some(v) = read("PANEL_ZOMBIE_FACTOR").and_then(|v| v.parse().ok()) {
            self.zombie_factor = v;
        }
        if let Some(v) = read("PANEL_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(v);
        }
        if let Some(v) = read("PANEL_SESSION_STORE_DIR") {
            self.session_store_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = read("PANEL_WORKERS").and_then(|v| parse_usize(&v)) {
            self.worker_count = v;
        }
        if let Some(v) = read("PANEL_STACK_SIZE").and_then(|v| parse_usize(&v)) {
            self.worker_stack_size = v;
        }
        if let Some(v) = read("PANEL_VERBOSITY").and_then(|v| v.parse().ok()) {
            self.verbosity = v;
        }
    }

    pub fn validate(&self) -> PanelResult<()> {
        if self.max_sessions == 0 {
            return Err(PanelError::Config("max_sessions must be > 0".into()));
        }
        if self.worker_count == 0 {
            return Err(PanelError::Config("worker_count must be > 0".into()));
        }
        if self.cleanup_factor == 0 {
            return Err(PanelError::Config("cleanup_factor must be > 0".into()));
        }
        if self.verbosity > 4 {
            return Err(PanelError::Config("verbosity must be 0..=4".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval.max(1))
    }

    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval.max(1))
    }

    #[must_use]
    pub fn request_grace(&self) -> Duration {
        Duration::from_millis(self.request_grace_ms)
    }

    #[must_use]
    pub fn gc_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.gc_lock_timeout_ms)
    }

    /// Log level implied by `verbosity`.
    #[must_use]
    pub fn log_level(&self) -> &'static str {
        match self.verbosity {
            0 => "error",
            1 => "warn",
            2 => "info",
            3 => "debug",
            _ => "trace",
        }
    }
}
