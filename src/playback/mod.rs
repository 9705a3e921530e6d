//! Playback
//!
//! Everything between a play command and pixels on a screen:
//! - [`AssetLibrary`] resolves a video index to a file on the mounted media
//! - [`MediaPlayer`] starts and stops the local player
//! - [`PlaybackAgent`] reacts to commands on every displaying node
//! - [`PlaybackCoordinator`] issues commands from the Brain
//! - [`FleetRoster`] tracks which nodes are alive
//! - [`Backdrop`] puts still images behind the videos

pub mod agent;
pub mod backdrop;
pub mod coordinator;
pub mod library;
pub mod player;
pub mod roster;

use std::path::PathBuf;
use thiserror::Error;

use crate::broker::ConnError;
use crate::types::PayloadError;

pub use agent::{AgentOptions, PlaybackAgent};
pub use backdrop::Backdrop;
pub use coordinator::PlaybackCoordinator;
pub use library::{Asset, AssetLibrary};
pub use player::{CommandPlayer, MediaPlayer, PlayRequest, PlaybackHandle};
pub use roster::{FleetRoster, NodeRecord};

/// Failure of a single command; never fatal to the process
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("video index {index} out of range ({available} assets available)")]
    InvalidIndex { index: usize, available: usize },
    #[error("invalid command: {0}")]
    Command(#[from] PayloadError),
    #[error("cannot read media directory {0:?}: {1}")]
    Library(PathBuf, std::io::Error),
    #[error("failed to launch player: {0}")]
    Launch(String),
    #[error("player exited abnormally: {0}")]
    PlayerFailed(String),
    #[error(transparent)]
    Broker(#[from] ConnError),
}
