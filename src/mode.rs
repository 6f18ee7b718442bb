//! Server lifecycle mode.
//!
//! One [`ServerMode`] value per server, behind its own lock. Every other
//! component asks this cell whether it may proceed: new requests are accepted
//! only while [`ModeCell::is_responding`], garbage collection only runs while
//! [`ModeCell::is_running`].
//!
//! `Scanning` and `Terminated` can only be entered through
//! [`ModeCell::compare_and_set`], so a content rescan and a shutdown cannot
//! both win. `Terminated` is final.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::{Display, Formatter};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    Created,
    Running,
    Paused,
    Scanning,
    Stopped,
    Disabled,
    Terminated,
}

impl ServerMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ServerMode::Created => "created",
            ServerMode::Running => "running",
            ServerMode::Paused => "paused",
            ServerMode::Scanning => "scanning",
            ServerMode::Stopped => "stopped",
            ServerMode::Disabled => "disabled",
            ServerMode::Terminated => "terminated",
        }
    }

    /// Modes that may only be entered through compare-and-set.
    fn is_guarded(self) -> bool {
        matches!(self, ServerMode::Scanning | ServerMode::Terminated)
    }
}

impl Display for ServerMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct ModeCell {
    mode: Mutex<ServerMode>,
}

impl Default for ModeCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeCell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(ServerMode::Created),
        }
    }

    #[must_use]
    pub fn get(&self) -> ServerMode {
        *self.mode.lock()
    }

    /// Unconditional transition. Refused (returns `false`) for guarded target
    /// modes and once the server is terminated.
    pub fn set(&self, to: ServerMode) -> bool {
        if to.is_guarded() {
            warn!(target_mode = %to, "Guarded mode requires compare_and_set");
            return false;
        }
        let mut mode = self.mode.lock();
        if *mode == ServerMode::Terminated {
            warn!(target_mode = %to, "Server is terminated; mode change ignored");
            return false;
        }
        debug!(from = %*mode, to = %to, "Server mode change");
        *mode = to;
        true
    }

    /// Transition only if the current mode equals `from`.
    pub fn compare_and_set(&self, from: ServerMode, to: ServerMode) -> bool {
        let mut mode = self.mode.lock();
        if *mode != from || *mode == ServerMode::Terminated {
            debug!(
                expected = %from,
                current = %*mode,
                to = %to,
                "Server mode compare_and_set lost"
            );
            return false;
        }
        debug!(from = %from, to = %to, "Server mode change");
        *mode = to;
        true
    }

    #[must_use]
    pub fn is_responding(&self) -> bool {
        self.get() == ServerMode::Running
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.get(), ServerMode::Running | ServerMode::Paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_guarded_modes_need_cas() {
        let cell = ModeCell::new();
        assert!(cell.set(ServerMode::Running));
        assert!(!cell.set(ServerMode::Scanning));
        assert_eq!(cell.get(), ServerMode::Running);
        assert!(cell.compare_and_set(ServerMode::Running, ServerMode::Scanning));
        assert!(!cell.is_running());
        assert!(cell.compare_and_set(ServerMode::Scanning, ServerMode::Running));
    }

    #[test]
    fn test_terminated_is_final() {
        let cell = ModeCell::new();
        cell.set(ServerMode::Running);
        assert!(cell.compare_and_set(ServerMode::Running, ServerMode::Terminated));
        assert!(!cell.set(ServerMode::Running));
        assert!(!cell.compare_and_set(ServerMode::Terminated, ServerMode::Running));
        assert_eq!(cell.get(), ServerMode::Terminated);
    }

    #[test]
    fn test_responding_vs_running() {
        let cell = ModeCell::new();
        assert!(!cell.is_running());
        cell.set(ServerMode::Paused);
        assert!(cell.is_running());
        assert!(!cell.is_responding());
        cell.set(ServerMode::Running);
        assert!(cell.is_responding());
    }

    #[test]
    fn test_only_one_thread_wins_scan() {
        let cell = Arc::new(ModeCell::new());
        cell.set(ServerMode::Running);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    cell.compare_and_set(ServerMode::Running, ServerMode::Scanning)
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
