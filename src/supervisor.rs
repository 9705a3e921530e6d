//! Node Supervisor
//!
//! Sequences startup for the node's role, then keeps the role's components
//! running until shutdown.
//!
//! Brain:  mount -> network -> internet (advisory) -> sync -> broker
//!         -> coordinator, roster, control API, agent (if it displays)
//! Client: mount -> display -> internet (advisory) -> sync (best effort)
//!         -> broker reachable -> broker -> agent
//!
//! A required condition that times out ends the process with an exit code
//! naming the failed precondition. The Brain hosts the broker, so it has no
//! broker gate: connecting retries until the broker accepts. Nothing after
//! startup is fatal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::asset_sync::{AssetSync, CommandRunner, ProcessRunner, RepoRef};
use crate::broker::{BrokerEndpoint, BrokerLink, ConnError};
use crate::config::{ConditionConfig, ConfigError, NodeConfig};
use crate::error::Error;
use crate::logging::OutcomeLog;
use crate::mount::{MountError, MountProbe, MountWatcher, Mounter, SystemMounter};
use crate::playback::{
    AgentOptions, AssetLibrary, Backdrop, CommandPlayer, FleetRoster, MediaPlayer, PlaybackAgent, PlaybackCoordinator,
};
use crate::readiness::{
    ConditionMode, DisplayProbe, NetworkProbe, Probe, ReadinessCondition, ReadinessError, ReadinessGate,
    TcpProbe,
};
use crate::types::{Node, Role};

/// Time granted to running tasks to wind down after shutdown is requested
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Fatal startup failures, each with its own process exit code
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("media not available: {0}")]
    Mount(#[from] MountError),
    #[error("display not ready: {0}")]
    Display(ReadinessError),
    #[error("broker not reachable: {0}")]
    Broker(ReadinessError),
    #[error("network not reachable: {0}")]
    Network(ReadinessError),
    #[error("interrupted during startup")]
    Interrupted,
    #[error(transparent)]
    Failed(#[from] Error),
}

impl StartupError {
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Interrupted => 0,
            StartupError::Config(_) => 2,
            StartupError::Mount(_) => 10,
            StartupError::Display(_) => 11,
            StartupError::Broker(_) => 12,
            StartupError::Network(_) => 13,
            StartupError::Failed(_) => 1,
        }
    }
}

/// Precondition kinds, in the order a role checks them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Mount,
    Display,
    Network,
    Internet,
    Broker,
}

impl Precondition {
    pub fn for_role(role: Role) -> &'static [Precondition] {
        match role {
            Role::Brain => &[Precondition::Mount, Precondition::Network, Precondition::Internet],
            Role::Client => &[
                Precondition::Mount,
                Precondition::Display,
                Precondition::Internet,
                Precondition::Broker,
            ],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Precondition::Mount => "mount",
            Precondition::Display => "display",
            Precondition::Network => "network",
            Precondition::Internet => "internet",
            Precondition::Broker => "broker",
        }
    }

    fn failure(&self, error: ReadinessError) -> StartupError {
        match self {
            Precondition::Mount => StartupError::Mount(MountError::NotReady(error)),
            Precondition::Display => StartupError::Display(error),
            Precondition::Network => StartupError::Network(error),
            Precondition::Broker => StartupError::Broker(error),
            // advisory; never fatal
            Precondition::Internet => StartupError::Failed(Error::Readiness(error)),
        }
    }
}

/// Result of probing one precondition once
#[derive(Debug, Clone)]
pub struct CheckItem {
    pub precondition: Precondition,
    pub mode: ConditionMode,
    pub satisfied: bool,
}

impl CheckItem {
    /// Exit code for a set of results: that of the first failed required
    /// precondition, otherwise 0
    pub fn exit_code(items: &[CheckItem]) -> u8 {
        items
            .iter()
            .find(|item| !item.satisfied && item.mode == ConditionMode::Required)
            .map(|item| {
                item.precondition
                    .failure(ReadinessError {
                        condition_name: item.precondition.name().to_string(),
                        elapsed_seconds: 0.0,
                    })
                    .exit_code()
            })
            .unwrap_or(0)
    }
}

/// Probes for the conditions the supervisor waits on
#[derive(Clone)]
pub struct Probes {
    pub display: Arc<dyn Probe>,
    pub network: Arc<dyn Probe>,
    pub internet: Arc<dyn Probe>,
    pub broker: Arc<dyn Probe>,
}

impl Probes {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            display: Arc::new(DisplayProbe::new(
                config.readiness.display_sockets.clone(),
                config.readiness.display_processes.clone(),
            )),
            network: Arc::new(NetworkProbe::new(config.readiness.network_interface.clone())),
            internet: Arc::new(TcpProbe::new(config.readiness.internet_probe.clone())),
            broker: Arc::new(TcpProbe::new(config.broker_addr())),
        }
    }
}

pub struct NodeSupervisor {
    config: NodeConfig,
    node: Node,
    mounter: Arc<dyn Mounter>,
    runner: Arc<dyn CommandRunner>,
    player: Arc<dyn MediaPlayer>,
    broker: BrokerEndpoint,
    probes: Probes,
    log: OutcomeLog,
}

impl NodeSupervisor {
    /// Supervisor using the real system: `mount`, `git`, the configured
    /// player and an MQTT broker
    pub fn new(config: NodeConfig) -> Result<Self, StartupError> {
        config.validate()?;
        Ok(Self {
            node: config.node(),
            mounter: Arc::new(SystemMounter),
            runner: Arc::new(ProcessRunner),
            player: Arc::new(CommandPlayer::from_config(&config.media.player)),
            broker: BrokerEndpoint::Mqtt(config.broker.clone()),
            probes: Probes::from_config(&config),
            config,
            log: OutcomeLog::new("supervisor"),
        })
    }

    pub fn with_mounter(mut self, mounter: Arc<dyn Mounter>) -> Self {
        self.mounter = mounter;
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_player(mut self, player: Arc<dyn MediaPlayer>) -> Self {
        self.player = player;
        self
    }

    pub fn with_broker(mut self, broker: BrokerEndpoint) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_probes(mut self, probes: Probes) -> Self {
        self.probes = probes;
        self
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// Start the role and run until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), StartupError> {
        self.log
            .started(format!("{} starting as {}", self.node.id, self.node.role));

        let link = match self.bring_up(&shutdown).await {
            Ok(link) => link,
            Err(StartupError::Interrupted) => {
                self.log.warned("shutdown requested during startup");
                return Err(StartupError::Interrupted);
            }
            Err(e) => {
                self.log.failed(format!("startup failed (exit code {}): {}", e.exit_code(), e));
                return Err(e);
            }
        };

        self.serve(link, shutdown).await
    }

    /// Probe every precondition of the role once, without waiting
    pub async fn check(&self) -> Vec<CheckItem> {
        let mut items = Vec::new();
        for precondition in Precondition::for_role(self.node.role) {
            let satisfied = self.probe(*precondition).check().await;
            items.push(CheckItem {
                precondition: *precondition,
                mode: self.mode(*precondition),
                satisfied,
            });
        }
        items
    }

    async fn bring_up(&self, shutdown: &CancellationToken) -> Result<BrokerLink, StartupError> {
        interruptible(shutdown, self.ensure_mount()).await?;

        match self.node.role {
            Role::Brain => {
                self.wait_for(Precondition::Network, shutdown).await?;
                self.wait_for(Precondition::Internet, shutdown).await?;
                interruptible(shutdown, async {
                    self.sync().await;
                    Ok(())
                })
                .await?;
            }
            Role::Client => {
                self.wait_for(Precondition::Display, shutdown).await?;
                self.wait_for(Precondition::Internet, shutdown).await?;
                interruptible(shutdown, async {
                    self.sync().await;
                    Ok(())
                })
                .await?;
                self.wait_for(Precondition::Broker, shutdown).await?;
            }
        }

        self.connect(shutdown).await
    }

    async fn ensure_mount(&self) -> Result<(), StartupError> {
        let watcher = MountWatcher::new(
            self.config.readiness.mounts_table.clone(),
            self.mounter.clone(),
            self.config.readiness.mount,
            OutcomeLog::new("mount"),
        );
        watcher
            .ensure_mounted(self.config.media.device.as_deref(), &self.config.media.mount_point)
            .await?;
        Ok(())
    }

    async fn wait_for(&self, precondition: Precondition, shutdown: &CancellationToken) -> Result<(), StartupError> {
        let condition = ReadinessCondition::new(
            precondition.name(),
            self.probe(precondition),
            self.condition(precondition).timeout(),
            self.condition(precondition).poll_interval(),
            self.mode(precondition),
        );
        let mut gate = ReadinessGate::new(OutcomeLog::new("readiness")).with(condition);
        interruptible(shutdown, async {
            gate.wait_all()
                .await
                .map(|_| ())
                .map_err(|e| precondition.failure(e))
        })
        .await
    }

    /// Best effort: a failed sync leaves the local assets as they are
    async fn sync(&self) {
        if !self.config.sync.enabled {
            return;
        }
        let sync = AssetSync::new(self.runner.clone(), OutcomeLog::new("asset_sync"));
        if let Err(e) = sync.sync(&RepoRef::from(&self.config.sync)).await {
            if !e.is_offline() {
                self.log.warned(format!("asset sync failed, continuing with local assets: {}", e));
            }
        }
    }

    async fn connect(&self, shutdown: &CancellationToken) -> Result<BrokerLink, StartupError> {
        let session = CancellationToken::new();
        tokio::select! {
            _ = shutdown.cancelled() => {
                session.cancel();
                Err(StartupError::Interrupted)
            }
            result = self.broker.connect(&self.node.id, session.clone()) => match result {
                Ok(link) => Ok(link),
                Err(ConnError::Cancelled) => Err(StartupError::Interrupted),
                Err(e) => Err(StartupError::Failed(e.into())),
            },
        }
    }

    async fn serve(self, link: BrokerLink, shutdown: CancellationToken) -> Result<(), StartupError> {
        let mut tasks: JoinSet<(&'static str, Result<(), Error>)> = JoinSet::new();
        let library = AssetLibrary::from_config(&self.config.media);

        if self.node.is_brain() {
            let roster = Arc::new(FleetRoster::new(
                self.node.id.clone(),
                Duration::from_secs(self.config.heartbeat.timeout_secs),
            ));
            roster.attach(&link).map_err(Error::from)?;
            let pruner = Arc::clone(&roster).prune_until(shutdown.clone());
            tasks.spawn(async move {
                pruner.await;
                ("roster", Ok(()))
            });
            let coordinator = PlaybackCoordinator::new(link.clone()).with_library(library.clone());

            if self.config.control.enabled {
                let state = ApiState::new(coordinator, roster, self.config.control.default_offset_secs);
                let bind = self.config.control.bind.clone();
                let token = shutdown.clone();
                tasks.spawn(async move { ("api", api::serve(&bind, state, token).await.map_err(Error::from)) });
            }
        }

        if !self.node.is_brain() || self.config.node.displays {
            if self.config.media.backdrop.enabled {
                let backdrop = Backdrop::new(
                    &self.config.media.backdrop,
                    &self.config.media.mount_point,
                    self.runner.clone(),
                );
                tasks.spawn(async move { ("backdrop", backdrop.show().await.map(|_| ()).map_err(Error::from)) });
            }
            let agent = PlaybackAgent::new(
                self.node.id.clone(),
                link.clone(),
                library,
                self.player.clone(),
                AgentOptions::from_config(&self.config),
            );
            let token = shutdown.clone();
            tasks.spawn(async move { ("agent", agent.run(token).await.map_err(Error::from)) });
        }

        self.log
            .succeeded(format!("{} running as {} ({} tasks)", self.node.id, self.node.role, tasks.len()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next() => self.report(joined),
            }
        }

        self.log.started("shutting down");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = tasks.join_next().await {
                self.report(joined);
            }
        })
        .await;
        if drained.is_err() {
            self.log.warned("tasks did not stop in time; aborting them");
            tasks.abort_all();
        }

        if let Err(e) = link.disconnect().await {
            self.log.warned(format!("broker session not closed cleanly: {}", e));
        }
        self.log.succeeded("shutdown complete");
        Ok(())
    }

    fn report(&self, joined: Result<(&'static str, Result<(), Error>), tokio::task::JoinError>) {
        match joined {
            Ok((name, Ok(()))) => self.log.succeeded(format!("{} stopped", name)),
            Ok((name, Err(e))) => self.log.failed(format!("{} stopped: {}", name, e)),
            Err(e) => self.log.failed(format!("task panicked: {}", e)),
        }
    }

    fn probe(&self, precondition: Precondition) -> Arc<dyn Probe> {
        match precondition {
            Precondition::Mount => Arc::new(MountProbe::new(
                self.config.readiness.mounts_table.clone(),
                self.config.media.mount_point.clone(),
            )),
            Precondition::Display => self.probes.display.clone(),
            Precondition::Network => self.probes.network.clone(),
            Precondition::Internet => self.probes.internet.clone(),
            Precondition::Broker => self.probes.broker.clone(),
        }
    }

    fn condition(&self, precondition: Precondition) -> ConditionConfig {
        let readiness = &self.config.readiness;
        match precondition {
            Precondition::Mount => readiness.mount,
            Precondition::Display => readiness.display,
            Precondition::Network => readiness.network,
            Precondition::Broker => readiness.broker,
            Precondition::Internet => readiness.internet,
        }
    }

    fn mode(&self, precondition: Precondition) -> ConditionMode {
        match precondition {
            Precondition::Internet => ConditionMode::Advisory,
            Precondition::Display if !self.config.readiness.display_required => ConditionMode::Advisory,
            _ => ConditionMode::Required,
        }
    }
}

async fn interruptible<T>(
    shutdown: &CancellationToken,
    work: impl Future<Output = Result<T, StartupError>>,
) -> Result<T, StartupError> {
    tokio::select! {
        _ = shutdown.cancelled() => Err(StartupError::Interrupted),
        result = work => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let readiness = || ReadinessError {
            condition_name: "x".into(),
            elapsed_seconds: 1.0,
        };
        let codes = [
            StartupError::Config(ConfigError::Invalid("bad".into())).exit_code(),
            StartupError::Mount(MountError::NotReady(readiness())).exit_code(),
            StartupError::Display(readiness()).exit_code(),
            StartupError::Broker(readiness()).exit_code(),
            StartupError::Network(readiness()).exit_code(),
            StartupError::Failed(Error::internal("boom")).exit_code(),
        ];
        assert_eq!(codes, [2, 10, 11, 12, 13, 1]);
        assert_eq!(StartupError::Interrupted.exit_code(), 0);
    }

    #[test]
    fn test_role_preconditions() {
        assert_eq!(
            Precondition::for_role(Role::Brain),
            &[Precondition::Mount, Precondition::Network, Precondition::Internet]
        );
        assert_eq!(Precondition::for_role(Role::Client)[1], Precondition::Display);
    }

    #[test]
    fn test_check_exit_code_ignores_advisory_failures() {
        let items = vec![
            CheckItem {
                precondition: Precondition::Mount,
                mode: ConditionMode::Required,
                satisfied: true,
            },
            CheckItem {
                precondition: Precondition::Internet,
                mode: ConditionMode::Advisory,
                satisfied: false,
            },
        ];
        assert_eq!(CheckItem::exit_code(&items), 0);

        let mut failing = items.clone();
        failing.push(CheckItem {
            precondition: Precondition::Broker,
            mode: ConditionMode::Required,
            satisfied: false,
        });
        assert_eq!(CheckItem::exit_code(&failing), 12);
    }
}
