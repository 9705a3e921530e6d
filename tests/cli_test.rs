use clap::Parser;
use std::fs;

use screensync::cli::{load_config, Cli, Commands};
use screensync::config::ConfigError;
use screensync::types::Role;

#[test]
fn test_defaults_to_no_subcommand() {
    let cli = Cli::try_parse_from(["screensync"]).unwrap();
    assert!(cli.command.is_none());
    assert_eq!(cli.verbose, 0);
    assert!(cli.role.is_none());
}

#[test]
fn test_play_arguments() {
    let cli = Cli::try_parse_from(["screensync", "play", "--index", "2", "--offset", "5"]).unwrap();
    assert_eq!(
        cli.command,
        Some(Commands::Play {
            index: 2,
            offset: Some(5.0)
        })
    );

    let cli = Cli::try_parse_from(["screensync", "play", "--index", "0"]).unwrap();
    assert_eq!(cli.command, Some(Commands::Play { index: 0, offset: None }));
}

#[test]
fn test_rejects_negative_index() {
    assert!(Cli::try_parse_from(["screensync", "play", "--index", "-1"]).is_err());
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from(["screensync", "check", "--role", "brain", "-vv"]).unwrap();
    assert_eq!(cli.command, Some(Commands::Check));
    assert_eq!(cli.role, Some(Role::Brain));
    assert_eq!(cli.verbose, 2);
}

#[test]
fn test_unknown_role_is_rejected() {
    assert!(Cli::try_parse_from(["screensync", "--role", "toaster"]).is_err());
}

#[test]
fn test_role_override_applies_to_loaded_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.yml");
    fs::write(&path, "node:\n  role: client\n  id: screen-3\n").unwrap();

    let cli = Cli::try_parse_from(["screensync", "--config", path.to_str().unwrap(), "--role", "brain"]).unwrap();
    let config = load_config(&cli).unwrap();
    assert_eq!(config.node.role, Role::Brain);
    assert_eq!(config.node().id, "screen-3");
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.yml");
    fs::write(&path, "heartbeat:\n  interval_secs: 10\n  timeout_secs: 5\n").unwrap();

    let cli = Cli::try_parse_from(["screensync", "--config", path.to_str().unwrap()]).unwrap();
    assert!(matches!(load_config(&cli), Err(ConfigError::Invalid(_))));
}
