//! Command-line interface
//!
//! - `run` (default): supervise this node until a termination signal
//! - `check`: probe the role's preconditions once and report
//! - `play`: publish one playback command to the fleet
//! - `videos`: list the assets this node can resolve

use anyhow::{anyhow, Context};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerEndpoint;
use crate::config::{ConfigError, NodeConfig};
use crate::logging;
use crate::playback::{AssetLibrary, PlaybackCoordinator};
use crate::readiness::ConditionMode;
use crate::supervisor::{CheckItem, NodeSupervisor, StartupError};
use crate::types::Role;

#[derive(Parser, Debug)]
#[command(name = "screensync", author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "SCREENSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Override the configured role
    #[arg(long, global = true)]
    pub role: Option<Role>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Bring the node up and run until stopped
    Run,
    /// Probe readiness preconditions once
    Check,
    /// Ask every node to play a video
    Play {
        /// Index into the sorted media directory
        #[arg(long)]
        index: usize,
        /// Start position in seconds
        #[arg(long)]
        offset: Option<f64>,
    },
    /// List playable assets
    Videos,
}

/// Load configuration and apply command-line overrides
pub fn load_config(cli: &Cli) -> Result<NodeConfig, ConfigError> {
    let mut config = NodeConfig::load(cli.config.as_deref())?;
    if let Some(role) = cli.role {
        config.node.role = role;
    }
    config.validate()?;
    Ok(config)
}

/// Execute the parsed command line; returns the process exit code
pub async fn execute(cli: Cli, shutdown: CancellationToken) -> u8 {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            let err = StartupError::from(e);
            eprintln!("screensync: {}", err);
            return err.exit_code();
        }
    };

    if let Err(e) = logging::init(&config.logging, cli.verbose) {
        eprintln!("screensync: logging unavailable: {}", e);
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, shutdown).await,
        Commands::Check => check(config).await,
        Commands::Play { index, offset } => match play(config, index, offset, shutdown).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("screensync: {:#}", e);
                1
            }
        },
        Commands::Videos => match videos(&config) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("screensync: {:#}", e);
                1
            }
        },
    }
}

async fn run(config: NodeConfig, shutdown: CancellationToken) -> u8 {
    let retention = logging::spawn_retention(&config.logging);
    let result = match NodeSupervisor::new(config) {
        Ok(supervisor) => supervisor.run(shutdown).await,
        Err(e) => Err(e),
    };
    retention.abort();

    match result {
        Ok(()) => 0,
        Err(e) => {
            if !matches!(e, StartupError::Interrupted) {
                eprintln!("screensync: {}", e);
            }
            e.exit_code()
        }
    }
}

async fn check(config: NodeConfig) -> u8 {
    let supervisor = match NodeSupervisor::new(config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            eprintln!("screensync: {}", e);
            return e.exit_code();
        }
    };

    println!("{} ({})", supervisor.node().id, supervisor.node().role);
    let items = supervisor.check().await;
    for item in &items {
        println!("{}", format_check(item));
    }
    CheckItem::exit_code(&items)
}

pub fn format_check(item: &CheckItem) -> String {
    let mode = match item.mode {
        ConditionMode::Required => "required",
        ConditionMode::Advisory => "advisory",
    };
    let state = if item.satisfied { "ok" } else { "NOT READY" };
    format!("  {:<10} {:<9} {}", item.precondition.name(), mode, state)
}

async fn play(config: NodeConfig, index: usize, offset: Option<f64>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let offset = offset.unwrap_or(config.control.default_offset_secs);
    // own client id, so the node's running session is not taken over
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let client_id = format!("{}-cli-{}", config.node().id, &suffix[..8]);

    let session = CancellationToken::new();
    let endpoint = BrokerEndpoint::Mqtt(config.broker.clone());
    let link = tokio::select! {
        _ = shutdown.cancelled() => {
            session.cancel();
            return Err(anyhow!("interrupted"));
        }
        connected = tokio::time::timeout(config.readiness.broker.timeout(), endpoint.connect(&client_id, session.clone())) => {
            match connected {
                Ok(link) => link.context("broker connection failed")?,
                Err(_) => {
                    session.cancel();
                    return Err(anyhow!("broker {} not reachable", config.broker_addr()));
                }
            }
        }
    };

    let mut coordinator = PlaybackCoordinator::new(link.clone());
    if config.media.mount_point.is_dir() {
        coordinator = coordinator.with_library(AssetLibrary::from_config(&config.media));
    }
    let result = coordinator.request_play(index, offset);
    link.disconnect().await.ok();

    let command = result.context("play request rejected")?;
    println!("requested video {} at {}s", command.video_index(), command.offset_seconds());
    Ok(())
}

fn videos(config: &NodeConfig) -> anyhow::Result<()> {
    let library = AssetLibrary::from_config(&config.media);
    let assets = library
        .scan()
        .with_context(|| format!("cannot list {:?}", library.dir()))?;
    if assets.is_empty() {
        println!("no videos in {:?}", library.dir());
    }
    for asset in assets {
        println!("{:>3}  {}", asset.index, asset.name);
    }
    Ok(())
}
