use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use super::PlaybackError;
use crate::config::MediaConfig;

/// A playable file and its position in the library
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub index: usize,
    pub name: String,
    #[serde(skip)]
    pub path: PathBuf,
}

/// Media files in one directory, ordered by file name.
///
/// Nothing is cached: every call rescans, so assets that arrive through a
/// sync resolve on the next command.
#[derive(Debug, Clone)]
pub struct AssetLibrary {
    dir: PathBuf,
    extensions: Vec<String>,
}

impl AssetLibrary {
    pub fn new(dir: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            dir: dir.into(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(&config.mount_point, &config.extensions)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn scan(&self) -> Result<Vec<Asset>, PlaybackError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| PlaybackError::Library(self.dir.clone(), e))?;

        let mut files: Vec<(String, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.is_media(path))
            .filter_map(|path| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                Some((name, path))
            })
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(files
            .into_iter()
            .enumerate()
            .map(|(index, (name, path))| Asset { index, name, path })
            .collect())
    }

    pub fn resolve(&self, index: usize) -> Result<Asset, PlaybackError> {
        let mut assets = self.scan()?;
        let available = assets.len();
        if index >= available {
            return Err(PlaybackError::InvalidIndex { index, available });
        }
        Ok(assets.swap_remove(index))
    }

    fn is_media(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|ext| self.extensions.iter().any(|e| *e == ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library(names: &[&str]) -> (tempfile::TempDir, AssetLibrary) {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let extensions = vec!["mp4".to_string(), "mov".to_string(), "mkv".to_string()];
        let library = AssetLibrary::new(dir.path(), &extensions);
        (dir, library)
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let (dir, library) = library(&["b.mp4", "a.MOV", "notes.txt", "c.mkv"]);
        fs::create_dir(dir.path().join("d.mp4")).unwrap();

        let names: Vec<String> = library.scan().unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["a.MOV", "b.mp4", "c.mkv"]);
    }

    #[test]
    fn test_resolve_by_ordinal() {
        let (_dir, library) = library(&["intro.mp4", "loop.mp4", "outro.mp4"]);
        let asset = library.resolve(2).unwrap();
        assert_eq!(asset.name, "outro.mp4");
        assert_eq!(asset.index, 2);
    }

    #[test]
    fn test_resolve_out_of_range() {
        let (_dir, library) = library(&["intro.mp4", "loop.mp4", "outro.mp4"]);
        assert!(matches!(
            library.resolve(9),
            Err(PlaybackError::InvalidIndex { index: 9, available: 3 })
        ));
    }

    #[test]
    fn test_rescans_on_every_call() {
        let (dir, library) = library(&["a.mp4"]);
        assert!(library.resolve(1).is_err());
        fs::write(dir.path().join("b.mp4"), b"").unwrap();
        assert_eq!(library.resolve(1).unwrap().name, "b.mp4");
    }

    #[test]
    fn test_missing_directory() {
        let library = AssetLibrary::new("/nonexistent/screensync-media", &["mp4".to_string()]);
        assert!(matches!(library.scan(), Err(PlaybackError::Library(..))));
    }
}
