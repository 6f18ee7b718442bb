use crate::ids::SessionId;
use crate::mode::ServerMode;
use std::fmt::{Display, Formatter};

/// Errors surfaced to callers of the core.
///
/// Protocol desynchronization and handler failures never show up here: the
/// former is contained at the chunk callback (a `false` return), the latter at
/// the action dispatcher.
#[derive(Debug)]
pub enum PanelError {
    /// Filesystem failure while persisting or restoring sessions.
    Io {
        context: String,
        source: std::io::Error,
    },
    /// A configuration value could not be parsed.
    Config(String),
    /// Operation referenced a session that does not exist.
    UnknownSession(SessionId),
    /// Operation refused because the server is not in a suitable mode.
    ModeRefused {
        current: ServerMode,
        operation: &'static str,
    },
    /// Internal misuse, e.g. dispatch without a session.
    Misuse(&'static str),
}

impl PanelError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PanelError::Io {
            context: context.into(),
            source,
        }
    }
}

impl Display for PanelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PanelError::Io { context, source } => write!(f, "{context}: {source}"),
            PanelError::Config(msg) => write!(f, "invalid configuration: {msg}"),
            PanelError::UnknownSession(id) => write!(f, "unknown session {id}"),
            PanelError::ModeRefused { current, operation } => {
                write!(f, "{operation} refused while server is {current}")
            }
            PanelError::Misuse(what) => write!(f, "internal error: {what}"),
        }
    }
}

impl std::error::Error for PanelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PanelError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type PanelResult<T> = Result<T, PanelError>;
