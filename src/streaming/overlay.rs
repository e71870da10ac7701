//! Text file behind the viewer's `drawtext` overlay.
//!
//! ffplay re-reads the file every frame, so it is replaced by rename and never
//! observed half written.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, StreamError};

pub const WAITING_TEXT: &str = "Waiting for stream...";

#[derive(Debug)]
pub struct OverlayFile {
    path: PathBuf,
    staging: PathBuf,
    last: String,
}

impl OverlayFile {
    /// Create the file at `path` with the waiting notice.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut staging = path.clone().into_os_string();
        staging.push(".tmp");
        let mut overlay = Self { path, staging: PathBuf::from(staging), last: String::new() };
        overlay.update(WAITING_TEXT)?;
        Ok(overlay)
    }

    /// Per-process file in the system temp directory.
    pub fn in_temp_dir() -> Result<Self> {
        let name = format!("avatar-stream-overlay-{}.txt", std::process::id());
        Self::create(std::env::temp_dir().join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the overlay text. Unchanged text is not rewritten.
    pub fn update(&mut self, text: &str) -> Result<()> {
        if text == self.last {
            return Ok(());
        }
        fs::write(&self.staging, text)
            .map_err(|e| StreamError::frame_io(format!("writing {}", self.staging.display()), e))?;
        fs::rename(&self.staging, &self.path)
            .map_err(|e| StreamError::frame_io(format!("replacing {}", self.path.display()), e))?;
        self.last = text.to_string();
        Ok(())
    }
}

impl Drop for OverlayFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
        let _ = fs::remove_file(&self.staging);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_waiting_notice() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = OverlayFile::create(dir.path().join("overlay.txt")).unwrap();
        assert_eq!(fs::read_to_string(overlay.path()).unwrap(), WAITING_TEXT);
    }

    #[test]
    fn update_replaces_content_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay.txt");
        {
            let mut overlay = OverlayFile::create(&path).unwrap();
            overlay.update("FPS: 30.0\nLatency: 42.0 ms (avg 40.0)").unwrap();
            assert_eq!(
                fs::read_to_string(&path).unwrap(),
                "FPS: 30.0\nLatency: 42.0 ms (avg 40.0)"
            );
            assert!(!dir.path().join("overlay.txt.tmp").exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = OverlayFile::create(dir.path().join("nope/overlay.txt")).unwrap_err();
        assert!(matches!(err, StreamError::FrameIo { .. }));
    }
}
