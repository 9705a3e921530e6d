//! Core Types
//!
//! Shared data model for every node:
//! - Node identity and role
//! - Playback commands and their wire payload
//! - Agent status reports

pub mod node;
pub mod playback;

pub use node::{Node, Role};
pub use playback::{
    status_topic, AgentState, AgentStatus, PayloadError, PlaybackCommand, COMMAND_TOPIC,
    HEARTBEAT_TOPIC, STATUS_TOPIC_FILTER, STATUS_TOPIC_PREFIX,
};
