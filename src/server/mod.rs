//! # Server Module
//!
//! [`ServerContext`] owns every component of the core: the mode cell, the
//! request pool, the session store, POST ingestion, the action dispatcher
//! and the statistics publisher. The HTTP layer holds it as an `Arc` and
//! drives one exchange through four callbacks:
//!
//! 1. [`ServerContext::begin_request`] binds a pooled request and a session
//! 2. [`ServerContext::on_body_chunk`] feeds each body chunk
//! 3. [`ServerContext::on_body_complete`] flushes the body and dispatches
//! 4. [`ServerContext::on_request_complete`] releases everything
//!
//! A background timer thread runs garbage collection and refreshes the
//! statistics snapshot. It holds only a weak reference to the context.

mod context;
mod timers;

pub use context::{RequestHandle, ServerContext};
