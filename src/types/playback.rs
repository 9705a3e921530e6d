//! Playback Wire Types
//!
//! Commands travel as comma-separated ASCII (`"<videoIndex>,<offsetSeconds>"`),
//! status reports as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Topic carrying playback commands from the Brain
pub const COMMAND_TOPIC: &str = "video/request_play";
/// Prefix for per-node status topics
pub const STATUS_TOPIC_PREFIX: &str = "video/status";
/// Filter matching every node's status topic
pub const STATUS_TOPIC_FILTER: &str = "video/status/+";
/// Topic carrying node heartbeats (payload is the node id)
pub const HEARTBEAT_TOPIC: &str = "clients/status";

pub fn status_topic(node_id: &str) -> String {
    format!("{}/{}", STATUS_TOPIC_PREFIX, node_id)
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("expected 2 comma-separated fields, found {0}")]
    FieldCount(usize),
    #[error("invalid video index '{0}'")]
    InvalidIndex(String),
    #[error("invalid offset '{0}'")]
    InvalidOffset(String),
    #[error("offset must be a finite, non-negative number of seconds, got {0}")]
    OffsetOutOfRange(f64),
}

/// Request for every listening agent to play one asset from a given position.
///
/// `offset_seconds` is an absolute seek position into the asset. Immutable
/// once built; `issued_at` is local to whoever built it and is not part of
/// the wire payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackCommand {
    video_index: usize,
    offset_seconds: f64,
    issued_at: DateTime<Utc>,
}

impl PlaybackCommand {
    pub fn new(video_index: usize, offset_seconds: f64) -> Result<Self, PayloadError> {
        if !offset_seconds.is_finite() || offset_seconds < 0.0 {
            return Err(PayloadError::OffsetOutOfRange(offset_seconds));
        }
        Ok(Self {
            video_index,
            offset_seconds,
            issued_at: Utc::now(),
        })
    }

    /// Parse a wire payload such as `b"2,5"`
    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
        let fields: Vec<&str> = text.trim().split(',').map(str::trim).collect();
        if fields.len() != 2 {
            return Err(PayloadError::FieldCount(fields.len()));
        }

        let video_index = fields[0]
            .parse::<usize>()
            .map_err(|_| PayloadError::InvalidIndex(fields[0].to_string()))?;
        let offset_seconds = fields[1]
            .parse::<f64>()
            .map_err(|_| PayloadError::InvalidOffset(fields[1].to_string()))?;

        Self::new(video_index, offset_seconds)
    }

    pub fn to_payload(&self) -> String {
        format!("{},{}", self.video_index, self.offset_seconds)
    }

    pub fn video_index(&self) -> usize {
        self.video_index
    }

    pub fn offset_seconds(&self) -> f64 {
        self.offset_seconds
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

/// Playback agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Playing,
    Error,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Idle => write!(f, "idle"),
            AgentState::Playing => write!(f, "playing"),
            AgentState::Error => write!(f, "error"),
        }
    }
}

/// Status report published by an agent after every state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub node_id: String,
    pub state: AgentState,
    #[serde(default)]
    pub current_video_index: Option<usize>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub reported_at: DateTime<Utc>,
}

impl AgentStatus {
    pub fn new(node_id: impl Into<String>, state: AgentState) -> Self {
        Self {
            node_id: node_id.into(),
            state,
            current_video_index: None,
            last_error: None,
            reported_at: Utc::now(),
        }
    }

    pub fn with_video(mut self, index: Option<usize>) -> Self {
        self.current_video_index = index;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_observed_payload() {
        let command = PlaybackCommand::parse(b"2,5").unwrap();
        assert_eq!(command.video_index(), 2);
        assert_eq!(command.offset_seconds(), 5.0);
        assert_eq!(command.to_payload(), "2,5");
    }

    #[test]
    fn test_parse_fractional_offset_and_whitespace() {
        let command = PlaybackCommand::parse(b" 1 , 2.25\n").unwrap();
        assert_eq!(command.video_index(), 1);
        assert_eq!(command.offset_seconds(), 2.25);
        assert_eq!(command.to_payload(), "1,2.25");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(PlaybackCommand::parse(b"25"), Err(PayloadError::FieldCount(1)));
        assert_eq!(PlaybackCommand::parse(b"1,2,3"), Err(PayloadError::FieldCount(3)));
        assert!(matches!(
            PlaybackCommand::parse(b"x,5"),
            Err(PayloadError::InvalidIndex(_))
        ));
        assert!(matches!(
            PlaybackCommand::parse(b"-1,5"),
            Err(PayloadError::InvalidIndex(_))
        ));
        assert!(matches!(
            PlaybackCommand::parse(b"2,soon"),
            Err(PayloadError::InvalidOffset(_))
        ));
        assert!(matches!(
            PlaybackCommand::parse(b"2,-5"),
            Err(PayloadError::OffsetOutOfRange(_))
        ));
        assert!(matches!(
            PlaybackCommand::parse(b"2,inf"),
            Err(PayloadError::OffsetOutOfRange(_))
        ));
        assert_eq!(PlaybackCommand::parse(&[0xff, 0x2c]), Err(PayloadError::NotUtf8));
    }

    #[test]
    fn test_status_topic() {
        assert_eq!(status_topic("client-7"), "video/status/client-7");
    }

    #[test]
    fn test_agent_status_json_shape() {
        let status = AgentStatus::new("client-1", AgentState::Playing).with_video(Some(2));
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "playing");
        assert_eq!(value["nodeId"], "client-1");
        assert_eq!(value["currentVideoIndex"], 2);
        assert!(value["lastError"].is_null());
        assert!(value.get("current_video_index").is_none());

        let back: AgentStatus = serde_json::from_value(value).unwrap();
        assert_eq!(back, status);
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn well_formed_payloads_parse(index in 0usize..10_000, offset in 0.0f64..86_400.0) {
                let payload = format!("{},{}", index, offset);
                let command = PlaybackCommand::parse(payload.as_bytes()).unwrap();
                prop_assert_eq!(command.video_index(), index);
                prop_assert_eq!(command.offset_seconds(), offset);
            }

            #[test]
            fn payloads_without_comma_are_rejected(text in "[^,]*") {
                prop_assert_eq!(PlaybackCommand::parse(text.as_bytes()), Err(PayloadError::FieldCount(1)));
            }

            #[test]
            fn negative_offsets_are_rejected(index in 0usize..100, offset in -1.0e6f64..-1.0e-6) {
                let payload = format!("{},{}", index, offset);
                prop_assert!(matches!(
                    PlaybackCommand::parse(payload.as_bytes()),
                    Err(PayloadError::OffsetOutOfRange(_))
                ));
            }
        }
    }
}
