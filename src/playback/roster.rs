use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use chrono::{DateTime, Utc};

use crate::broker::{BrokerLink, ConnError, QoS};
use crate::types::{AgentStatus, HEARTBEAT_TOPIC, STATUS_TOPIC_FILTER};

struct Entry {
    seen: Instant,
    last_seen: DateTime<Utc>,
    status: Option<AgentStatus>,
}

/// A node the Brain has heard from recently
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub node_id: String,
    pub last_seen: DateTime<Utc>,
    pub status: Option<AgentStatus>,
}

/// Liveness of the fleet, fed by heartbeats and status reports.
/// Nodes silent for longer than the timeout are dropped.
pub struct FleetRoster {
    own_id: String,
    timeout: Duration,
    nodes: DashMap<String, Entry>,
}

impl FleetRoster {
    pub fn new(own_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            own_id: own_id.into(),
            timeout,
            nodes: DashMap::new(),
        }
    }

    /// Feed the roster from `clients/status` and `video/status/+`
    pub fn attach(self: &Arc<Self>, link: &BrokerLink) -> Result<(), ConnError> {
        let roster = Arc::clone(self);
        link.subscribe(HEARTBEAT_TOPIC, QoS::AtMostOnce, move |message| {
            let id = String::from_utf8_lossy(&message.payload).trim().to_string();
            roster.record_heartbeat(&id);
        })?;

        let roster = Arc::clone(self);
        link.subscribe(STATUS_TOPIC_FILTER, QoS::AtLeastOnce, move |message| {
            match serde_json::from_slice::<AgentStatus>(&message.payload) {
                Ok(status) => roster.record_status(status),
                Err(e) => tracing::debug!(component = "roster", topic = %message.topic, error = %e, "unreadable status"),
            }
        })
    }

    /// Prune every `timeout` until `cancel` fires, so silent nodes go away
    /// even when nobody asks for the roster
    pub async fn prune_until(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = time::interval(self.timeout.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.prune();
                }
            }
        }
    }

    pub fn record_heartbeat(&self, node_id: &str) {
        if node_id.is_empty() || node_id == self.own_id {
            return;
        }
        let now = Instant::now();
        self.nodes
            .entry(node_id.to_string())
            .and_modify(|e| {
                e.seen = now;
                e.last_seen = Utc::now();
            })
            .or_insert_with(|| {
                tracing::info!(component = "roster", node = node_id, "node joined");
                Entry {
                    seen: now,
                    last_seen: Utc::now(),
                    status: None,
                }
            });
    }

    pub fn record_status(&self, status: AgentStatus) {
        if status.node_id.is_empty() || status.node_id == self.own_id {
            return;
        }
        let mut entry = self.nodes.entry(status.node_id.clone()).or_insert_with(|| Entry {
            seen: Instant::now(),
            last_seen: Utc::now(),
            status: None,
        });
        entry.seen = Instant::now();
        entry.last_seen = Utc::now();
        entry.status = Some(status);
    }

    /// Drop silent nodes and return their ids
    pub fn prune(&self) -> Vec<String> {
        let mut gone = Vec::new();
        self.nodes.retain(|id, entry| {
            let alive = entry.seen.elapsed() <= self.timeout;
            if !alive {
                gone.push(id.clone());
            }
            alive
        });
        for id in &gone {
            tracing::info!(component = "roster", node = %id, "node timed out");
        }
        gone
    }

    pub fn count(&self) -> usize {
        self.prune();
        self.nodes.len()
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.prune();
        let mut records: Vec<NodeRecord> = self
            .nodes
            .iter()
            .map(|entry| NodeRecord {
                node_id: entry.key().clone(),
                last_seen: entry.last_seen,
                status: entry.status.clone(),
            })
            .collect();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        records
    }
}
