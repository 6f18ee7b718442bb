use crate::config::ServerConfig;
use crate::dispatcher::{ActionContext, ExecMode};
use crate::logging::{init_logging_with_config, LogConfig};
use crate::server::ServerContext;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};

/// Command-line interface for the panel core
#[derive(Parser)]
#[command(name = "panelcore")]
#[command(about = "Session and request core of the control-panel server", long_about = None)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the core until SIGINT/SIGTERM, logging statistics tokens
    Run {
        /// YAML configuration file; defaults plus `PANEL_*` overrides if omitted
        #[arg(short, long, env = "PANEL_CONFIG")]
        config: Option<PathBuf>,

        /// Restore sessions from the configured store directory at start
        #[arg(long, default_value_t = false)]
        load_sessions: bool,

        /// Do not save sessions on exit
        #[arg(long, default_value_t = false)]
        no_save: bool,

        /// Seconds between statistics token log lines (0 disables)
        #[arg(long, default_value_t = 60)]
        token_interval: u64,
    },
    /// Validate a configuration and print the effective values as JSON
    CheckConfig {
        #[arg(short, long, env = "PANEL_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    let config = match path {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Run {
            config,
            load_sessions,
            no_save,
            token_interval,
        } => {
            let config = load_config(config.as_deref())?;
            let _guard = init_logging_with_config(&LogConfig::with_verbosity(config.log_level()))?;
            run(config, *load_sessions, !*no_save, *token_interval)
        }
        Commands::CheckConfig { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn run(config: ServerConfig, load_sessions: bool, save: bool, token_interval: u64) -> Result<()> {
    let ctx = ServerContext::new(config)?;
    ctx.register_action(
        crate::dispatcher::DEFAULT_ACTION,
        |action: &ActionContext| {
            info!(
                session_id = %action.session_id,
                key = %action.key,
                value = %action.value,
                "Unbound form action"
            );
            Ok(())
        },
        ExecMode::Sync,
    );
    ctx.start(load_sessions)?;

    let stop = wait_for_signal()?;
    let tick = if token_interval == 0 {
        Duration::MAX
    } else {
        Duration::from_secs(token_interval)
    };
    loop {
        match stop.recv_timeout(tick) {
            Ok(signal) => {
                info!(signal, "Shutdown signal received");
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let tokens = ctx.stats_tokens();
                info!(tokens = %serde_json::to_string(&tokens)?, "Statistics");
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                warn!("Signal listener exited");
                break;
            }
        }
    }

    let saved = ctx.shutdown(save)?;
    info!(saved, "Exiting");
    Ok(())
}

#[cfg(unix)]
fn wait_for_signal() -> Result<mpsc::Receiver<i32>> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let (tx, rx) = mpsc::channel();
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("installing signal handlers")?;
    std::thread::Builder::new()
        .name("panel-signals".into())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                if tx.send(signal).is_err() {
                    warn!("Shutdown signal dropped; main loop gone");
                }
            }
        })
        .context("spawning signal thread")?;
    Ok(rx)
}

#[cfg(not(unix))]
fn wait_for_signal() -> Result<mpsc::Receiver<i32>> {
    let (tx, rx) = mpsc::channel();
    std::mem::forget(tx);
    Ok(rx)
}
