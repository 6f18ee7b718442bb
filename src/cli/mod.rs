//! # CLI Module
//!
//! Command-line entry point for running the core standalone on the
//! appliance or on a development machine.
//!
//! ## Commands
//!
//! ### `run`
//!
//! ```bash
//! panelcore run --config /etc/panel.yaml --load-sessions
//! ```
//!
//! Starts the core, logs the statistics tokens every `--token-interval`
//! seconds and shuts down on SIGINT or SIGTERM, saving sessions unless
//! `--no-save` is given.
//!
//! ### `check-config`
//!
//! ```bash
//! panelcore check-config --config /etc/panel.yaml
//! ```
//!
//! Prints the effective configuration (file plus `PANEL_*` overrides) as
//! JSON, or fails with the validation error.

mod commands;

#[cfg(test)]
mod tests;

pub use commands::{run_cli, Cli, Commands};
