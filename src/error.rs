use thiserror::Error;

use crate::asset_sync::SyncError;
use crate::broker::ConnError;
use crate::config::ConfigError;
use crate::mount::MountError;
use crate::playback::PlaybackError;
use crate::readiness::ReadinessError;
use crate::types::PayloadError;

/// Crate-level error, wrapping every component failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Readiness(#[from] ReadinessError),

    #[error("Mount error: {0}")]
    Mount(#[from] MountError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Broker error: {0}")]
    Broker(#[from] ConnError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}

impl From<ctrlc::Error> for Error {
    fn from(e: ctrlc::Error) -> Self {
        Error::Internal(format!("signal handler: {}", e))
    }
}
