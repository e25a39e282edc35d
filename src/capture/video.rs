//! OpenCV-backed sources: recorded video files and streaming cameras
//!
//! Recordings are sought by playback time (`CAP_PROP_POS_MSEC`) so the runner
//! can skip whatever played while a frame was being processed. Cameras are
//! either a local device index or a stream URL (RTSP, HTTP MJPEG).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CaptureTarget, Frame, SourceKind, VideoSource};

/// A recording or camera read through `cv::VideoCapture`
pub struct VideoCaptureSource {
    target: CaptureTarget,
    kind: SourceKind,
    temporary: bool,
    cap: Option<VideoCapture>,
    fps: f64,
    frame_count: f64,
    position_ms: f64,
    seek_pending: bool,
}

impl VideoCaptureSource {
    /// A recorded video played back by elapsed time
    pub fn file(path: impl Into<PathBuf>, fps: f64, temporary: bool) -> Self {
        Self::with_target(CaptureTarget::File(path.into()), SourceKind::File, fps, temporary)
    }

    /// A device index or stream URL paced by the runner
    pub fn live(target: CaptureTarget) -> Self {
        Self::with_target(target, SourceKind::Live, 0.0, false)
    }

    fn with_target(target: CaptureTarget, kind: SourceKind, fps: f64, temporary: bool) -> Self {
        Self {
            target,
            kind,
            temporary,
            cap: None,
            fps: fps.max(0.0),
            frame_count: 0.0,
            position_ms: 0.0,
            seek_pending: false,
        }
    }

    /// Current playback position in milliseconds
    pub fn position_ms(&self) -> f64 {
        self.position_ms
    }

    /// Length of the recording, if the container reports one
    pub fn duration_ms(&self) -> Option<f64> {
        (self.fps > 0.0 && self.frame_count > 0.0).then(|| self.frame_count / self.fps * 1000.0)
    }
}

fn open_capture(target: &CaptureTarget) -> Result<VideoCapture> {
    let cap = match target {
        CaptureTarget::Device(index) => VideoCapture::new(*index, videoio::CAP_ANY)
            .with_context(|| format!("Failed to open camera device {}", index))?,
        CaptureTarget::Stream(url) => VideoCapture::from_file(url, videoio::CAP_ANY)
            .with_context(|| format!("Failed to open stream {}", url))?,
        CaptureTarget::File(path) => {
            let Some(path_str) = path.to_str() else {
                bail!("video path {:?} is not valid UTF-8", path);
            };
            VideoCapture::from_file(path_str, videoio::CAP_ANY)
                .with_context(|| format!("Failed to open video {:?}", path))?
        }
        CaptureTarget::Snapshot(url) => bail!("{} is a snapshot URL, not a video stream", url),
    };

    if !cap.is_opened()? {
        bail!("Failed to open {}", target);
    }
    Ok(cap)
}

/// Seek to `position_ms`, falling back to frame seeking for containers
/// that ignore millisecond positions
fn seek(cap: &mut VideoCapture, position_ms: f64, fps: f64) -> Result<()> {
    if cap.set(videoio::CAP_PROP_POS_MSEC, position_ms)? {
        return Ok(());
    }
    if fps > 0.0 && cap.set(videoio::CAP_PROP_POS_FRAMES, (position_ms * fps / 1000.0).floor())? {
        return Ok(());
    }
    bail!("backend cannot seek to {:.0} ms", position_ms)
}

/// Decode one frame; `Ok(None)` when the capture has nothing more to give
fn grab_frame(cap: &mut VideoCapture) -> Result<Option<RgbImage>> {
    let mut bgr = Mat::default();
    if !cap.read(&mut bgr)? || bgr.empty() {
        return Ok(None);
    }

    let mut rgb = Mat::default();
    imgproc::cvt_color_def(&bgr, &mut rgb, imgproc::COLOR_BGR2RGB)?;
    let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
    let data = rgb.data_bytes()?.to_vec();

    match RgbImage::from_raw(width, height, data) {
        Some(image) => Ok(Some(image)),
        None => bail!("decoded frame buffer does not match {}x{}", width, height),
    }
}

#[async_trait]
impl VideoSource for VideoCaptureSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn open(&mut self) -> Result<()> {
        let target = self.target.clone();
        let cap = tokio::task::spawn_blocking(move || open_capture(&target))
            .await
            .context("capture open worker join failed")??;

        // Containers that do not report a rate keep the configured one
        let reported_fps = cap.get(videoio::CAP_PROP_FPS)?;
        if reported_fps > 0.0 {
            self.fps = reported_fps;
        }
        self.frame_count = cap.get(videoio::CAP_PROP_FRAME_COUNT)?.max(0.0);

        info!(
            "Opened {}: {:.2} fps, {:.0} frames (position {:.0} ms)",
            self.target, self.fps, self.frame_count, self.position_ms
        );

        // A reopened recording resumes where it stopped
        self.seek_pending = self.kind == SourceKind::File && self.position_ms > 0.0;
        self.cap = Some(cap);
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<Frame>> {
        let Some(mut cap) = self.cap.take() else {
            bail!("{} is not open", self.target);
        };

        let seek_to = self.seek_pending.then_some(self.position_ms);
        let fps = self.fps;
        let (cap, result) = tokio::task::spawn_blocking(move || {
            let result = match seek_to {
                Some(position_ms) => seek(&mut cap, position_ms, fps).and_then(|_| grab_frame(&mut cap)),
                None => grab_frame(&mut cap),
            };
            (cap, result)
        })
        .await
        .context("frame decode worker join failed")?;
        self.cap = Some(cap);
        self.seek_pending = false;

        let image = match result? {
            Some(image) => image,
            None if self.kind == SourceKind::File => {
                debug!("{} reached end of recording", self.target);
                if let Some(duration) = self.duration_ms() {
                    self.position_ms = self.position_ms.max(duration);
                }
                return Ok(None);
            }
            None => bail!("{} stopped delivering frames", self.target),
        };

        if self.kind == SourceKind::File && self.fps > 0.0 {
            self.position_ms += 1000.0 / self.fps;
        }
        Ok(Some(Frame::new(image)))
    }

    fn advance(&mut self, elapsed: Duration) {
        if self.kind != SourceKind::File {
            return;
        }
        self.position_ms += elapsed.as_secs_f64() * 1000.0;
        self.seek_pending = true;
    }

    fn is_exhausted(&self) -> bool {
        if self.kind != SourceKind::File || self.cap.is_none() {
            return false;
        }
        self.duration_ms()
            .map(|duration| self.position_ms >= duration)
            .unwrap_or(false)
    }

    fn release(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            if let Err(e) = cap.release() {
                warn!("Failed to release {}: {}", self.target, e);
            }
        }
    }

    fn cleanup(&mut self) -> Result<()> {
        let CaptureTarget::File(path) = &self.target else {
            return Ok(());
        };
        if !self.temporary || !path.exists() {
            return Ok(());
        }

        std::fs::remove_file(path)
            .with_context(|| format!("Failed to delete temporary recording {:?}", path))?;
        info!("Deleted temporary recording {:?}", path);
        Ok(())
    }
}
