//! Playback Agent
//!
//! Runs on every displaying node. One task owns the agent's state; the
//! command subscription only forwards raw payloads into it, so commands are
//! handled strictly in arrival order and a new command preempts whatever is
//! playing (last command wins, nothing is queued behind a playback).
//!
//! ```text
//! Idle --command--> Playing --finished--> Idle
//!   \                  |
//!    +--bad command----+--> Error --> (back to the state it came from)
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{AssetLibrary, MediaPlayer, PlayRequest, PlaybackError, PlaybackHandle};
use crate::broker::{BrokerLink, ConnError, QoS};
use crate::config::NodeConfig;
use crate::logging::OutcomeLog;
use crate::types::{status_topic, AgentState, AgentStatus, PlaybackCommand, COMMAND_TOPIC, HEARTBEAT_TOPIC};

/// An idle loop that exits sooner than this is not restarted
const MIN_IDLE_RUN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Loop asset 0 while idle
    pub idle_loop: bool,
    pub heartbeat_interval: Duration,
}

impl AgentOptions {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            idle_loop: config.media.idle_loop,
            heartbeat_interval: Duration::from_secs(config.heartbeat.interval_secs.max(1)),
        }
    }
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            idle_loop: false,
            heartbeat_interval: Duration::from_secs(3),
        }
    }
}

struct Active {
    handle: Box<dyn PlaybackHandle>,
    index: usize,
    looping: bool,
    started: Instant,
}

pub struct PlaybackAgent {
    node_id: String,
    link: BrokerLink,
    library: AssetLibrary,
    player: Arc<dyn MediaPlayer>,
    options: AgentOptions,
    state: AgentState,
    current: Option<usize>,
    last_error: Option<String>,
    active: Option<Active>,
    status: watch::Sender<AgentStatus>,
    log: OutcomeLog,
}

impl PlaybackAgent {
    pub fn new(
        node_id: impl Into<String>,
        link: BrokerLink,
        library: AssetLibrary,
        player: Arc<dyn MediaPlayer>,
        options: AgentOptions,
    ) -> Self {
        let node_id = node_id.into();
        let (status, _) = watch::channel(AgentStatus::new(node_id.clone(), AgentState::Idle));
        Self {
            node_id,
            link,
            library,
            player,
            options,
            state: AgentState::Idle,
            current: None,
            last_error: None,
            active: None,
            status,
            log: OutcomeLog::new("playback_agent"),
        }
    }

    /// Latest published status
    pub fn status(&self) -> watch::Receiver<AgentStatus> {
        self.status.subscribe()
    }

    /// Subscribe to commands and serve them until `cancel` fires. Current
    /// playback is killed on the way out.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ConnError> {
        let (forward, mut commands) = mpsc::unbounded_channel::<Vec<u8>>();
        self.link.subscribe(COMMAND_TOPIC, QoS::AtLeastOnce, move |message| {
            let _ = forward.send(message.payload);
        })?;
        self.log.started(format!("listening on {} as {}", COMMAND_TOPIC, self.node_id));

        let idle = self.start_idle_loop();
        self.transition(AgentState::Idle, idle);

        let mut heartbeat = time::interval(self.options.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                payload = commands.recv() => match payload {
                    Some(payload) => self.handle_payload(&payload).await,
                    None => break,
                },
                result = wait_finished(&mut self.active), if self.active.is_some() => {
                    self.on_finished(result).await;
                }
                _ = heartbeat.tick() => self.send_heartbeat(),
            }
        }

        self.stop_active().await;
        self.log.succeeded("stopped");
        Ok(())
    }

    async fn handle_payload(&mut self, payload: &[u8]) {
        let command = match PlaybackCommand::parse(payload) {
            Ok(command) => command,
            Err(e) => {
                self.log.warned(format!(
                    "ignoring malformed command '{}': {}",
                    String::from_utf8_lossy(payload).trim(),
                    e
                ));
                return;
            }
        };
        let index = command.video_index();
        self.log.started(format!("play video {} from {}s", index, command.offset_seconds()));

        let asset = match self.library.resolve(index) {
            Ok(asset) => asset,
            Err(e) => {
                // leave whatever is on screen alone
                self.enter_error(&e);
                self.recover();
                return;
            }
        };

        self.stop_active().await;
        let request = PlayRequest {
            path: asset.path,
            offset_seconds: command.offset_seconds(),
            looping: false,
        };
        match self.player.start(&request) {
            Ok(handle) => {
                self.active = Some(Active {
                    handle,
                    index,
                    looping: false,
                    started: Instant::now(),
                });
                self.last_error = None;
                self.transition(AgentState::Playing, Some(index));
            }
            Err(e) => {
                // the preempted playback is gone; report the one that failed
                self.current = Some(index);
                self.enter_error(&e);
                let idle = self.start_idle_loop();
                self.transition(AgentState::Idle, idle);
            }
        }
    }

    async fn on_finished(&mut self, result: Result<(), PlaybackError>) {
        let Some(finished) = self.active.take() else {
            return;
        };

        if finished.looping {
            if let Err(e) = &result {
                self.log.warned(format!("idle loop ended: {}", e));
            }
            let idle = if finished.started.elapsed() >= MIN_IDLE_RUN {
                self.start_idle_loop()
            } else {
                self.log.warned("idle loop exited immediately; not restarting");
                None
            };
            if idle != self.current {
                self.transition(AgentState::Idle, idle);
            }
            return;
        }

        match result {
            Ok(()) => self.log.succeeded(format!("video {} finished", finished.index)),
            Err(e) => self.enter_error(&e),
        }
        let idle = self.start_idle_loop();
        self.transition(AgentState::Idle, idle);
    }

    /// Start looping asset 0 if enabled. Returns the looping index.
    fn start_idle_loop(&mut self) -> Option<usize> {
        if !self.options.idle_loop {
            return None;
        }
        let asset = match self.library.resolve(0) {
            Ok(asset) => asset,
            Err(e) => {
                tracing::debug!(component = "playback_agent", error = %e, "no idle asset");
                return None;
            }
        };
        let request = PlayRequest {
            path: asset.path,
            offset_seconds: 0.0,
            looping: true,
        };
        match self.player.start(&request) {
            Ok(handle) => {
                self.active = Some(Active {
                    handle,
                    index: 0,
                    looping: true,
                    started: Instant::now(),
                });
                Some(0)
            }
            Err(e) => {
                self.log.warned(format!("idle loop not started: {}", e));
                None
            }
        }
    }

    async fn stop_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.handle.stop().await;
        }
    }

    fn enter_error(&mut self, error: &PlaybackError) {
        self.log.failed(error);
        self.last_error = Some(error.to_string());
        self.transition(AgentState::Error, self.current);
    }

    /// Leave `Error` for whatever the player is actually doing
    fn recover(&mut self) {
        let (state, current) = match &self.active {
            Some(active) if !active.looping => (AgentState::Playing, Some(active.index)),
            Some(active) => (AgentState::Idle, Some(active.index)),
            None => (AgentState::Idle, None),
        };
        self.transition(state, current);
    }

    fn transition(&mut self, state: AgentState, current: Option<usize>) {
        self.state = state;
        self.current = current;
        self.publish_status();
    }

    fn publish_status(&self) {
        let mut status = AgentStatus::new(self.node_id.clone(), self.state).with_video(self.current);
        if self.state == AgentState::Error {
            if let Some(error) = &self.last_error {
                status = status.with_error(error.clone());
            }
        }

        match serde_json::to_vec(&status) {
            Ok(payload) => {
                if let Err(e) = self.link.publish(&status_topic(&self.node_id), payload, QoS::AtLeastOnce) {
                    tracing::debug!(component = "playback_agent", error = %e, "status not published");
                }
            }
            Err(e) => self.log.failed(format!("cannot encode status: {}", e)),
        }
        self.status.send_replace(status);
    }

    fn send_heartbeat(&self) {
        if let Err(e) = self
            .link
            .publish(HEARTBEAT_TOPIC, self.node_id.as_bytes(), QoS::AtMostOnce)
        {
            tracing::trace!(component = "playback_agent", error = %e, "heartbeat dropped");
        }
    }
}

async fn wait_finished(active: &mut Option<Active>) -> Result<(), PlaybackError> {
    match active {
        Some(active) => active.handle.finished().await,
        None => std::future::pending().await,
    }
}
