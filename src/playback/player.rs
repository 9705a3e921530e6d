use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};

use super::PlaybackError;
use crate::config::PlayerConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    pub path: PathBuf,
    /// Absolute seek position into the file
    pub offset_seconds: f64,
    pub looping: bool,
}

/// Starts local playback
pub trait MediaPlayer: Send + Sync {
    /// Launch playback. Returns once the player is running, not when it
    /// finishes.
    fn start(&self, request: &PlayRequest) -> Result<Box<dyn PlaybackHandle>, PlaybackError>;
}

/// A running playback
#[async_trait]
pub trait PlaybackHandle: Send {
    /// Resolves when playback ends on its own
    async fn finished(&mut self) -> Result<(), PlaybackError>;
    /// Stop playback now
    async fn stop(&mut self);
}

/// Runs an external player program, one process per playback.
///
/// `{path}` and `{offset}` in the configured arguments are replaced by the
/// request's file and seek position.
#[derive(Debug, Clone)]
pub struct CommandPlayer {
    program: String,
    args: Vec<String>,
    loop_args: Vec<String>,
}

impl CommandPlayer {
    pub fn new(program: impl Into<String>, args: Vec<String>, loop_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            loop_args,
        }
    }

    pub fn from_config(config: &PlayerConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone(), config.loop_args.clone())
    }

    pub fn arguments(&self, request: &PlayRequest) -> Vec<String> {
        let path = request.path.to_string_lossy();
        let offset = format!("{}", request.offset_seconds);
        let mut args: Vec<String> = Vec::with_capacity(self.args.len() + self.loop_args.len());
        if request.looping {
            args.extend(self.loop_args.iter().cloned());
        }
        args.extend(
            self.args
                .iter()
                .map(|a| a.replace("{path}", &path).replace("{offset}", &offset)),
        );
        args
    }
}

impl MediaPlayer for CommandPlayer {
    fn start(&self, request: &PlayRequest) -> Result<Box<dyn PlaybackHandle>, PlaybackError> {
        let child = Command::new(&self.program)
            .args(self.arguments(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlaybackError::Launch(format!("{}: {}", self.program, e)))?;
        Ok(Box::new(ChildPlayback { child }))
    }
}

struct ChildPlayback {
    child: Child,
}

#[async_trait]
impl PlaybackHandle for ChildPlayback {
    async fn finished(&mut self) -> Result<(), PlaybackError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| PlaybackError::PlayerFailed(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(PlaybackError::PlayerFailed(status.to_string()))
        }
    }

    async fn stop(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(component = "player", error = %e, "player already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(looping: bool) -> PlayRequest {
        PlayRequest {
            path: PathBuf::from("/media/usb/clip.mp4"),
            offset_seconds: 5.0,
            looping,
        }
    }

    #[test]
    fn test_argument_substitution() {
        let player = CommandPlayer::new(
            "cvlc",
            vec!["--start-time={offset}".into(), "{path}".into()],
            vec!["--loop".into()],
        );
        assert_eq!(
            player.arguments(&request(false)),
            vec!["--start-time=5", "/media/usb/clip.mp4"]
        );
        assert_eq!(
            player.arguments(&request(true)),
            vec!["--loop", "--start-time=5", "/media/usb/clip.mp4"]
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_a_launch_error() {
        let player = CommandPlayer::new("screensync-no-such-player", vec![], vec![]);
        let result = player.start(&request(false)).map(|_| ());
        assert!(matches!(result, Err(PlaybackError::Launch(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_natural_exit_and_stop() {
        let quick = CommandPlayer::new("true", vec![], vec![]);
        let mut handle = quick.start(&request(false)).unwrap();
        assert!(handle.finished().await.is_ok());

        let failing = CommandPlayer::new("false", vec![], vec![]);
        let mut handle = failing.start(&request(false)).unwrap();
        assert!(matches!(handle.finished().await, Err(PlaybackError::PlayerFailed(_))));

        let long = CommandPlayer::new("sleep", vec!["30".into()], vec![]);
        let mut handle = long.start(&request(false)).unwrap();
        handle.stop().await;
        let ended = tokio::time::timeout(Duration::from_secs(2), handle.finished()).await;
        assert!(matches!(ended, Ok(Err(PlaybackError::PlayerFailed(_)))));
    }
}
