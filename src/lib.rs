//! Synchronized video playback for a small fleet of display nodes.
//!
//! A Brain node publishes play commands over MQTT; every displaying node
//! runs a playback agent that seeks to the commanded offset locally. Each
//! node is brought up by a supervisor that waits for its media, display
//! and network before joining the fleet.

pub mod api;
pub mod asset_sync;
pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod mount;
pub mod playback;
pub mod readiness;
pub mod supervisor;
pub mod types;

pub use broker::{BrokerEndpoint, BrokerLink, MemoryBroker};
pub use config::NodeConfig;
pub use error::{Error, Result};
pub use playback::{PlaybackAgent, PlaybackCoordinator};
pub use supervisor::{NodeSupervisor, StartupError};
