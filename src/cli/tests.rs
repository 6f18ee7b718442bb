//! Unit tests for CLI argument parsing

use crate::cli::{Cli, Commands};
use clap::Parser;

#[test]
fn test_run_command_defaults() {
    let cli = Cli::try_parse_from(["panelcore", "run", "--config", "panel.yaml"]).unwrap();

    match cli.command {
        Commands::Run {
            config,
            load_sessions,
            no_save,
            token_interval,
        } => {
            assert_eq!(config.unwrap().to_string_lossy(), "panel.yaml");
            assert!(!load_sessions);
            assert!(!no_save);
            assert_eq!(token_interval, 60);
        }
        _ => panic!("Expected Run command"),
    }
}

#[test]
fn test_run_command_with_flags() {
    let cli = Cli::try_parse_from([
        "panelcore",
        "run",
        "--load-sessions",
        "--no-save",
        "--token-interval",
        "5",
    ])
    .unwrap();

    match cli.command {
        Commands::Run {
            load_sessions,
            no_save,
            token_interval,
            ..
        } => {
            assert!(load_sessions);
            assert!(no_save);
            assert_eq!(token_interval, 5);
        }
        _ => panic!("Expected Run command"),
    }
}

#[test]
fn test_check_config_command() {
    let cli = Cli::try_parse_from(["panelcore", "check-config", "-c", "x.yaml"]).unwrap();
    assert!(matches!(cli.command, Commands::CheckConfig { config: Some(_) }));
}

#[test]
fn test_unknown_command_rejected() {
    assert!(Cli::try_parse_from(["panelcore", "generate"]).is_err());
}
