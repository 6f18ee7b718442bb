//! Session snapshot on disk.
//!
//! ```text
//! <root>/<session-id>/session.json   identity, auth state, timestamps, counts
//! <root>/<session-id>/values.json    value matrix (ordered pairs)
//! <root>/<session-id>/cookies.json   cookie set
//! ```
//!
//! `save` rewrites the whole root while holding the store lock, so two saves
//! never interleave. `load` skips any record it cannot read completely.

use super::core::{AgentKind, Credentials, Session, ValueMatrix};
use super::store::SessionStore;
use crate::error::{PanelError, PanelResult};
use crate::ids::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const RECORD_FILE: &str = "session.json";
const VALUES_FILE: &str = "values.json";
const COOKIES_FILE: &str = "cookies.json";

#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    id: SessionId,
    authenticated: bool,
    user: Option<String>,
    agent: AgentKind,
    created: u64,
    last_seen: u64,
    use_count: u64,
    ref_count: i64,
}

fn to_unix(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

fn from_unix(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> PanelResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| PanelError::io(path.display().to_string(), e.into()))?;
    // `load` only reads final names; a torn write stays in the temp file.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)
        .map_err(|e| PanelError::io(format!("writing {}", tmp.display()), e))?;
    fs::rename(&tmp, path).map_err(|e| PanelError::io(format!("renaming {}", tmp.display()), e))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

impl SessionStore {
    /// Write every persistable session under `root`, replacing previous
    /// contents. Returns the number of sessions written.
    pub fn save(&self, root: &Path) -> PanelResult<usize> {
        let sessions = self.lock();

        if root.exists() {
            fs::remove_dir_all(root)
                .map_err(|e| PanelError::io(format!("clearing {}", root.display()), e))?;
        }
        fs::create_dir_all(root)
            .map_err(|e| PanelError::io(format!("creating {}", root.display()), e))?;

        let mut written = 0;
        for session in sessions.values().filter(|s| s.is_interesting()) {
            let dir = root.join(session.id().as_str());
            fs::create_dir_all(&dir)
                .map_err(|e| PanelError::io(format!("creating {}", dir.display()), e))?;

            let record = SessionRecord {
                id: session.id().clone(),
                authenticated: session.is_authenticated(),
                user: session.user(),
                agent: session.agent(),
                created: to_unix(session.created()),
                last_seen: to_unix(session.last_seen()),
                use_count: session.use_count(),
                ref_count: session.ref_count(),
            };
            write_json(&dir.join(VALUES_FILE), &session.values())?;
            write_json(&dir.join(COOKIES_FILE), &session.cookies())?;
            // Record last: a directory without it is skipped on load.
            write_json(&dir.join(RECORD_FILE), &record)?;
            written += 1;
        }
        info!(root = %root.display(), sessions = written, "Sessions saved");
        Ok(written)
    }

    /// Restore sessions written by [`SessionStore::save`]. Unreadable or
    /// incomplete records are skipped. Returns the number restored.
    pub fn load(&self, root: &Path) -> PanelResult<usize> {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(root = %root.display(), "No session snapshot to load");
                return Ok(0);
            }
            Err(e) => return Err(PanelError::io(format!("reading {}", root.display()), e)),
        };

        let mut loaded = 0;
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            match restore(&dir) {
                Ok(session) => {
                    self.insert(Arc::new(session));
                    loaded += 1;
                }
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Skipping unreadable session record");
                }
            }
        }
        info!(root = %root.display(), sessions = loaded, "Sessions loaded");
        Ok(loaded)
    }
}

fn restore(dir: &Path) -> anyhow::Result<Session> {
    let record: SessionRecord = read_json(&dir.join(RECORD_FILE))?;
    let values: ValueMatrix = read_json(&dir.join(VALUES_FILE))?;
    let cookies: BTreeMap<String, String> = read_json(&dir.join(COOKIES_FILE))?;

    let session = Session::new(record.id);
    session.set_timestamps(from_unix(record.created), from_unix(record.last_seen));
    session.set_use_count(record.use_count);
    session.set_agent(record.agent);
    // Passwords are never persisted; the user name keeps the login visible.
    let credentials = record.user.map(|user| Credentials {
        user,
        password: String::new(),
    });
    session.set_authenticated(credentials, record.authenticated);
    session.replace_values(values);
    session.set_cookies(cookies);
    Ok(session)
}
