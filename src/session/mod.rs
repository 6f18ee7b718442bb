//! # Session Module
//!
//! Server-side state for each logical client, the store that owns it, the
//! collectors that reclaim it and the on-disk snapshot.
//!
//! ## Ownership
//!
//! The [`SessionStore`] is the only owner. Requests and action handlers look
//! sessions up by [`SessionId`](crate::ids::SessionId) and hold them only for
//! the duration of an exchange. A session's reference count and busy flag are
//! not about memory safety; they are the domain signal that vetoes deletion.
//!
//! ## Garbage Collection
//!
//! | Sweep     | Deletes                                              | Age                          |
//! |-----------|------------------------------------------------------|------------------------------|
//! | unused    | unreferenced, idle sessions                          | `session_delete_age`         |
//! | zombie    | any idle session, even referenced                    | `zombie_factor` × base age   |
//! | rejected  | unauthenticated, near-empty or bot sessions          | `rejected_delete_age`        |
//! | storm     | oldest single-use sessions above `max_sessions`      | until 75% of the maximum     |
//!
//! In cleanup mode (during a content rescan) every age is divided by
//! `cleanup_factor`. A busy session is never deleted, by any sweep.

mod core;
mod gc;
mod persist;
mod store;

pub use self::core::{AgentKind, Credentials, Session, ValueMatrix, MIN_MATRIX_ENTRIES};
pub use gc::{GcPolicy, GcReport};
pub use store::SessionStore;
