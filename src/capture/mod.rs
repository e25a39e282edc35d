//! Video Capture Layer
//!
//! A [`VideoSource`] yields frames from either a live camera or a file-backed
//! recording. Sources are opened, read and released by the source runner,
//! which owns the retry policy; a source only reports what happened.
//!
//! Videos and streams are decoded with OpenCV (the `video` feature). Cameras
//! that only serve still snapshots over HTTP are polled with reqwest.

pub mod frame;
#[cfg(test)]
pub(crate) mod sequence;
pub mod snapshot;
#[cfg(feature = "video")]
pub mod video;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use frame::{crop_region, Frame};
#[cfg(test)]
pub(crate) use sequence::ImageSequenceSource;
pub use snapshot::HttpSnapshotSource;
#[cfg(feature = "video")]
pub use video::VideoCaptureSource;

use crate::config::SourceConfig;

/// How a source is paced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Camera that produces frames in real time
    #[default]
    Live,
    /// Recording whose playback position the runner advances
    File,
}

/// A capture handle that can be opened, read and released repeatedly
#[async_trait]
pub trait VideoSource: Send {
    /// Pacing strategy for this source
    fn kind(&self) -> SourceKind;

    /// Acquire the capture handle
    async fn open(&mut self) -> Result<()>;

    /// Read the next frame. `Ok(None)` means the source is exhausted.
    async fn read(&mut self) -> Result<Option<Frame>>;

    /// Move the playback position forward (file-backed sources only)
    fn advance(&mut self, _elapsed: Duration) {}

    /// Whether playback has reached the end of the recording
    fn is_exhausted(&self) -> bool {
        false
    }

    /// Drop the capture handle; the source may be opened again later
    fn release(&mut self) {}

    /// Remove any temporary backing files once the source is done for good
    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

const SNAPSHOT_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".bmp"];

/// What a source location points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    /// Local camera by index (`"0"`, `"1"`, ...)
    Device(i32),
    /// Network stream: RTSP, RTMP or HTTP MJPEG
    Stream(String),
    /// HTTP endpoint returning one still image per request
    Snapshot(String),
    /// Recorded video on disk
    File(PathBuf),
}

impl CaptureTarget {
    /// Classify a configured location for the given source kind
    pub fn parse(kind: SourceKind, location: &str) -> Self {
        let location = location.trim();
        if kind == SourceKind::File {
            return Self::File(PathBuf::from(location));
        }
        if let Ok(index) = location.parse::<i32>() {
            return Self::Device(index);
        }

        let lower = location.to_ascii_lowercase();
        let is_http = lower.starts_with("http://") || lower.starts_with("https://");
        let path = lower.split(['?', '#']).next().unwrap_or_default();
        if is_http && SNAPSHOT_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            Self::Snapshot(location.to_string())
        } else {
            Self::Stream(location.to_string())
        }
    }
}

impl fmt::Display for CaptureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(index) => write!(f, "camera device {}", index),
            Self::Stream(url) => write!(f, "stream {}", url),
            Self::Snapshot(url) => write!(f, "snapshot camera {}", url),
            Self::File(path) => write!(f, "recording {:?}", path),
        }
    }
}

/// Build the capture adapter described by a source entry
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn VideoSource>> {
    let target = CaptureTarget::parse(config.kind, &config.location);
    match target {
        CaptureTarget::Snapshot(url) => Ok(Box::new(HttpSnapshotSource::new(
            &url,
            Duration::from_millis(config.timeout_ms),
        ))),
        #[cfg(feature = "video")]
        CaptureTarget::File(path) => Ok(Box::new(VideoCaptureSource::file(
            path,
            config.fps,
            config.temporary,
        ))),
        #[cfg(feature = "video")]
        target => Ok(Box::new(VideoCaptureSource::live(target))),
        #[cfg(not(feature = "video"))]
        target => anyhow::bail!(
            "source {}: {} needs the `video` feature (OpenCV)",
            config.id,
            target
        ),
    }
}
