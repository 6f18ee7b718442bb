//! # Dispatcher Module
//!
//! Routes a completed form submission to the action registered for one of
//! its keys.
//!
//! ## Overview
//!
//! Application code binds handlers to form-field keys at startup:
//!
//! ```rust,ignore
//! use panelcore::dispatcher::{ActionContext, ActionDispatcher, ExecMode};
//!
//! let dispatcher = ActionDispatcher::new();
//! dispatcher.register("volume", |ctx: &ActionContext| {
//!     player.set_volume(ctx.value.parse()?);
//!     Ok(())
//! }, ExecMode::Sync);
//! ```
//!
//! A reserved [`DEFAULT_ACTION`] catches every key without its own binding.
//!
//! ## Execution
//!
//! - `Sync` actions run on the caller's thread before the response is built.
//! - `Async` actions are loaded into a recyclable [`ActionSlot`] and queued on
//!   the action [`WorkerPool`](crate::worker_pool::WorkerPool). The worker
//!   clears the slot's running flag under the slot-pool lock when it is done.
//!   If the pool refuses the job it runs inline, so an action is never
//!   silently dropped.
//!
//! ## Error Handling
//!
//! Handlers return `anyhow::Result<()>`. Errors and panics are caught at the
//! dispatch boundary, logged with the action and key, and never reach the
//! HTTP response path.

mod core;
mod slots;

pub use self::core::{
    ActionContext, ActionDispatcher, ActionHandler, ActionItem, DispatchMetrics,
    DispatchOutcome, ExecMode, DEFAULT_ACTION,
};
pub use slots::{ActionSlot, SlotPool};
