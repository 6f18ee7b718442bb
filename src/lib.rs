//! # panelcore
//!
//! **panelcore** is the session and request lifecycle core of the embedded
//! HTTP server behind a media player's web control panel. It sits between a
//! connection-level HTTP layer and the application's form actions.
//!
//! ## Overview
//!
//! For each HTTP exchange the core binds a pooled [`request::Request`] to a
//! [`session::Session`], streams the body into form parameters or an upload
//! file, and dispatches the completed submission to an action registered
//! for one of its keys. Everything the core allocates per exchange is
//! recycled or reclaimed by a periodic garbage collector, so the server can
//! run for months on a small appliance.
//!
//! ## Architecture
//!
//! - **[`mode`]** - Server lifecycle state machine with compare-and-set transitions
//! - **[`request`]** - Recyclable request slot pool with zombie reclamation
//! - **[`session`]** - Session store, GC sweeps, storm limiter and persistence
//! - **[`post`]** - Form-field accumulation and streaming uploads
//! - **[`dispatcher`]** - Action registry with Sync/Async execution
//! - **[`worker_pool`]** - Bounded coroutine pool behind Async actions
//! - **[`stats`]** - Statistics snapshot, display tokens and Prometheus text
//! - **[`server`]** - [`ServerContext`] tying the above together
//!
//! ## Request Flow
//!
//! ```text
//! accept_source ─► begin_request ─► on_body_chunk* ─► on_body_complete ─► on_request_complete
//!                       │                 │                   │
//!                 RequestPool        Ingestor            ActionDispatcher
//!                 SessionStore    (fields / upload)     (Sync | Async)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use panelcore::{ExecMode, ServerConfig, ServerContext};
//!
//! let ctx = ServerContext::new(ServerConfig::from_env()?)?;
//! ctx.register_action("volume", |action| {
//!     player.set_volume(action.value.parse()?);
//!     Ok(())
//! }, ExecMode::Sync);
//! ctx.start(true)?;
//! ```
//!
//! ## Runtime
//!
//! Async actions run on `may` coroutines. Garbage collection and statistics
//! run on a dedicated OS thread. All shared state uses `parking_lot` locks;
//! collection passes take their locks with a timeout and skip the cycle
//! rather than stall request handling.

pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod ids;
pub mod logging;
pub mod memory;
pub mod mode;
pub mod post;
pub mod request;
pub mod server;
pub mod session;
pub mod stats;
pub mod worker_pool;

pub use config::ServerConfig;
pub use dispatcher::{ActionContext, ActionDispatcher, DispatchOutcome, ExecMode};
pub use error::{PanelError, PanelResult};
pub use ids::SessionId;
pub use mode::ServerMode;
pub use post::Chunk;
pub use request::ConnectionId;
pub use server::{RequestHandle, ServerContext};
pub use session::{Credentials, Session, SessionStore, ValueMatrix};
