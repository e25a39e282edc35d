//! Still-frame recording used by the runner and pipeline tests
//!
//! The location is either a directory of images (played back in file-name
//! order) or a single image. Playback position is kept in milliseconds so the
//! runner can skip ahead by however long processing took, matching the
//! pacing of `VideoCaptureSource` without needing OpenCV.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::{Frame, SourceKind, VideoSource};

const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff", "webp"];

/// Recorded frames played back at a nominal frame rate
pub struct ImageSequenceSource {
    location: PathBuf,
    fps: f64,
    temporary: bool,
    frames: Vec<PathBuf>,
    position_ms: f64,
    opened: bool,
}

impl ImageSequenceSource {
    /// Create a source; nothing touches the filesystem until [`VideoSource::open`]
    pub fn new(location: impl AsRef<Path>, fps: f64, temporary: bool) -> Self {
        Self {
            location: location.as_ref().to_path_buf(),
            fps: if fps > 0.0 { fps } else { 1.0 },
            temporary,
            frames: Vec::new(),
            position_ms: 0.0,
            opened: false,
        }
    }

    /// Total number of frames found when the source was last opened
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Current playback position in milliseconds
    pub fn position_ms(&self) -> f64 {
        self.position_ms
    }

    fn frame_duration_ms(&self) -> f64 {
        1000.0 / self.fps
    }

    fn frame_index(&self) -> usize {
        (self.position_ms / self.frame_duration_ms()).floor() as usize
    }
}

fn list_frames(location: &Path) -> Result<Vec<PathBuf>> {
    if location.is_file() {
        return Ok(vec![location.to_path_buf()]);
    }

    let mut frames: Vec<PathBuf> = std::fs::read_dir(location)
        .with_context(|| format!("Failed to list frames in {:?}", location))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    frames.sort();
    Ok(frames)
}

#[async_trait]
impl VideoSource for ImageSequenceSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    async fn open(&mut self) -> Result<()> {
        let location = self.location.clone();
        let frames = tokio::task::spawn_blocking(move || list_frames(&location))
            .await
            .context("frame listing worker join failed")??;

        if frames.is_empty() {
            bail!("no frames found at {:?}", self.location);
        }

        info!(
            "Opened recording {:?}: {} frames at {:.2} fps (position {:.0} ms)",
            self.location,
            frames.len(),
            self.fps,
            self.position_ms
        );
        self.frames = frames;
        self.opened = true;
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<Frame>> {
        if !self.opened {
            bail!("recording {:?} is not open", self.location);
        }

        let index = self.frame_index();
        let Some(path) = self.frames.get(index).cloned() else {
            return Ok(None);
        };

        // Move past this frame before decoding so a corrupt file is skipped on reopen
        self.position_ms += self.frame_duration_ms();

        let image = tokio::task::spawn_blocking({
            let path = path.clone();
            move || image::open(&path)
        })
        .await
        .context("frame decode worker join failed")?
        .with_context(|| format!("Failed to decode frame {:?}", path))?;

        debug!("Read frame {} from {:?}", index, path);
        Ok(Some(Frame::new(image.to_rgb8())))
    }

    fn advance(&mut self, elapsed: Duration) {
        self.position_ms += elapsed.as_secs_f64() * 1000.0;
    }

    fn is_exhausted(&self) -> bool {
        self.opened && self.frame_index() >= self.frames.len()
    }

    fn release(&mut self) {
        self.opened = false;
    }

    fn cleanup(&mut self) -> Result<()> {
        if !self.temporary || !self.location.exists() {
            return Ok(());
        }

        if self.location.is_dir() {
            std::fs::remove_dir_all(&self.location)
        } else {
            std::fs::remove_file(&self.location)
        }
        .with_context(|| format!("Failed to delete temporary recording {:?}", self.location))?;

        info!("Deleted temporary recording {:?}", self.location);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_frames(dir: &Path, count: usize) {
        for i in 0..count {
            let image = RgbImage::from_pixel(8, 6, Rgb([i as u8 * 40, 0, 0]));
            image.save(dir.join(format!("frame_{i:03}.png"))).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), "not a frame").unwrap();
    }

    #[tokio::test]
    async fn test_reads_frames_in_order() {
        let dir = TempDir::new().unwrap();
        write_frames(dir.path(), 3);

        let mut source = ImageSequenceSource::new(dir.path(), 10.0, false);
        source.open().await.unwrap();
        assert_eq!(source.frame_count(), 3);

        for i in 0..3 {
            let frame = source.read().await.unwrap().unwrap();
            assert_eq!(frame.dimensions(), (8, 6));
            assert_eq!(frame.image.get_pixel(0, 0)[0], i as u8 * 40);
        }
        assert!(source.is_exhausted());
        assert!(source.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_advance_skips_frames() {
        let dir = TempDir::new().unwrap();
        write_frames(dir.path(), 5);

        let mut source = ImageSequenceSource::new(dir.path(), 10.0, false);
        source.open().await.unwrap();

        source.read().await.unwrap().unwrap();
        // 100 ms per frame: 250 ms of processing skips two frames
        source.advance(Duration::from_millis(250));
        let frame = source.read().await.unwrap().unwrap();
        assert_eq!(frame.image.get_pixel(0, 0)[0], 3 * 40);
    }

    #[tokio::test]
    async fn test_position_survives_reopen() {
        let dir = TempDir::new().unwrap();
        write_frames(dir.path(), 3);

        let mut source = ImageSequenceSource::new(dir.path(), 1.0, false);
        source.open().await.unwrap();
        source.read().await.unwrap().unwrap();
        source.release();
        assert!(source.read().await.is_err());

        source.open().await.unwrap();
        let frame = source.read().await.unwrap().unwrap();
        assert_eq!(frame.image.get_pixel(0, 0)[0], 40);
    }

    #[tokio::test]
    async fn test_open_missing_location_fails() {
        let mut source = ImageSequenceSource::new("/nonexistent/recording", 25.0, false);
        assert!(source.open().await.is_err());
    }

    #[tokio::test]
    async fn test_open_empty_directory_fails() {
        let dir = TempDir::new().unwrap();
        let mut source = ImageSequenceSource::new(dir.path(), 25.0, false);
        assert!(source.open().await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_removes_temporary_recording() {
        let dir = TempDir::new().unwrap();
        let recording = dir.path().join("download");
        std::fs::create_dir(&recording).unwrap();
        write_frames(&recording, 1);

        let mut kept = ImageSequenceSource::new(&recording, 25.0, false);
        kept.cleanup().unwrap();
        assert!(recording.exists());

        let mut temporary = ImageSequenceSource::new(&recording, 25.0, true);
        temporary.cleanup().unwrap();
        assert!(!recording.exists());
    }

    #[tokio::test]
    async fn test_single_image_location() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("still.png");
        RgbImage::new(4, 4).save(&path).unwrap();

        let mut source = ImageSequenceSource::new(&path, 25.0, false);
        source.open().await.unwrap();
        assert!(source.read().await.unwrap().is_some());
        assert!(source.read().await.unwrap().is_none());
    }
}
