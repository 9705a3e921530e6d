use std::path::Path;
use std::sync::Arc;

use super::{AssetLibrary, PlaybackError};
use crate::asset_sync::CommandRunner;
use crate::config::BackdropConfig;
use crate::logging::OutcomeLog;

/// Still images from the media mount, handed to an image viewer once at
/// startup. The viewer draws on its own console, so videos cover it and it
/// shows again whenever nothing plays.
pub struct Backdrop {
    images: AssetLibrary,
    program: String,
    args: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    log: OutcomeLog,
}

impl Backdrop {
    pub fn new(config: &BackdropConfig, media_dir: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            images: AssetLibrary::new(media_dir, &config.extensions),
            program: config.program.clone(),
            args: config.args.clone(),
            runner,
            log: OutcomeLog::new("backdrop"),
        }
    }

    /// Show every image, sorted by name. Returns the number of images
    /// shown; none found is not an error.
    pub async fn show(&self) -> Result<usize, PlaybackError> {
        let images = self.images.scan()?;
        if images.is_empty() {
            self.log
                .warned(format!("no images in {}; skipping backdrop", self.images.dir().display()));
            return Ok(0);
        }

        let paths: Vec<String> = images
            .iter()
            .map(|image| image.path.to_string_lossy().into_owned())
            .collect();
        let mut args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        args.extend(paths.iter().map(String::as_str));

        let output = self
            .runner
            .run(&self.program, &args, self.images.dir())
            .await
            .map_err(|e| PlaybackError::Launch(format!("{}: {}", self.program, e)))?;
        if !output.success {
            return Err(PlaybackError::PlayerFailed(format!(
                "{}: {}",
                self.program,
                output.stderr.trim()
            )));
        }

        self.log.succeeded(format!("showing {} image(s)", images.len()));
        Ok(images.len())
    }
}
