//! Source runner state machine
//!
//! `Opening -> Running -> (Paused <-> Running) -> Closing -> Stopped`, with
//! `Retrying` wrapping `Opening` whenever the source cannot be opened or a
//! read fails. Nothing but a stop request ends the loop for a live source;
//! file-backed sources also end when playback runs past the recording.
//!
//! The loop only suspends while waiting to be resumed, during backoff and
//! between frames. Frame analysis runs on the blocking pool and is never
//! interrupted half-way.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{FramePipeline, RegionOutcome};
use crate::analysis::{evaluate, Reading, Threshold};
use crate::capture::{Frame, SourceKind, VideoSource};
use crate::config::{RunnerConfig, StorageConfig};
use crate::error::GaugeError;
use crate::storage::{ImageStore, ReadingSink};

/// Observable lifecycle of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Opening,
    Retrying,
    Running,
    Paused,
    Closing,
    Stopped,
}

/// Timing and fallback values for a runner
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub retry_backoff: Duration,
    pub live_frame_interval: Duration,
    /// Image reference recorded when a crop cannot be stored
    pub placeholder_image: String,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default(), &StorageConfig::default())
    }
}

impl RunnerSettings {
    pub fn from_config(runner: &RunnerConfig, storage: &StorageConfig) -> Self {
        Self {
            retry_backoff: Duration::from_millis(runner.retry_backoff_ms),
            live_frame_interval: Duration::from_millis(runner.live_frame_interval_ms),
            placeholder_image: storage.placeholder_image.clone(),
        }
    }
}

/// Control surface for a running source; cheap to clone and usable from any task
#[derive(Clone)]
pub struct SourceHandle {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
    state: Arc<watch::Sender<RunnerState>>,
    thresholds: Arc<RwLock<HashMap<u64, Threshold>>>,
}

impl SourceHandle {
    fn new(thresholds: HashMap<u64, Threshold>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(watch::channel(false).0),
            state: Arc::new(watch::channel(RunnerState::Opening).0),
            thresholds: Arc::new(RwLock::new(thresholds)),
        }
    }

    /// Stop reading new frames; the capture handle stays open
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Request termination; interrupts pause waits, backoff and pacing sleeps
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn subscribe(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    /// Replace the alert threshold of a track; `None` removes it
    pub fn set_threshold(&self, track_id: u64, threshold: Option<Threshold>) {
        let mut thresholds = self.thresholds.write();
        match threshold {
            Some(t) => {
                thresholds.insert(track_id, t);
            }
            None => {
                thresholds.remove(&track_id);
            }
        }
    }

    pub fn threshold(&self, track_id: u64) -> Option<Threshold> {
        self.thresholds.read().get(&track_id).copied()
    }

    fn set_state(&self, state: RunnerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Runner state {:?} -> {:?}", previous, state);
        }
    }
}

/// Why the inner frame loop ended
enum Exit {
    /// Reopen the source after a read failure
    Reopen,
    /// Stop requested or recording exhausted
    Close,
}

/// Drives one video source through a [`FramePipeline`]
pub struct SourceRunner {
    source_id: String,
    source: Mutex<Box<dyn VideoSource>>,
    pipeline: Arc<Mutex<FramePipeline>>,
    sink: Arc<dyn ReadingSink>,
    images: Arc<dyn ImageStore>,
    settings: RunnerSettings,
    handle: SourceHandle,
}

impl SourceRunner {
    pub fn new(
        source_id: impl Into<String>,
        source: Box<dyn VideoSource>,
        pipeline: FramePipeline,
        sink: Arc<dyn ReadingSink>,
        images: Arc<dyn ImageStore>,
        settings: RunnerSettings,
        thresholds: HashMap<u64, Threshold>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            source: Mutex::new(source),
            pipeline: Arc::new(Mutex::new(pipeline)),
            sink,
            images,
            settings,
            handle: SourceHandle::new(thresholds),
        }
    }

    pub fn handle(&self) -> SourceHandle {
        self.handle.clone()
    }

    /// Run until stopped or, for file-backed sources, until playback ends
    pub async fn run(mut self) {
        info!("Source {}: runner started", self.source_id);

        while !self.handle.cancel.is_cancelled() {
            self.handle.set_state(RunnerState::Opening);
            if let Err(e) = self.source.get_mut().open().await {
                let err = GaugeError::SourceUnavailable(format!("{:#}", e));
                warn!("Source {}: {}; retrying in {:?}", self.source_id, err, self.settings.retry_backoff);
                self.handle.set_state(RunnerState::Retrying);
                if !self.sleep(self.settings.retry_backoff).await {
                    break;
                }
                continue;
            }
            info!("Source {}: opened", self.source_id);

            match self.frame_loop().await {
                Exit::Reopen => {
                    self.source.get_mut().release();
                    self.handle.set_state(RunnerState::Retrying);
                    if !self.sleep(self.settings.retry_backoff).await {
                        break;
                    }
                }
                Exit::Close => break,
            }
        }

        self.handle.set_state(RunnerState::Closing);
        self.source.get_mut().release();
        if let Err(e) = self.source.get_mut().cleanup() {
            warn!("Source {}: failed to remove temporary recording: {:#}", self.source_id, e);
        }
        self.handle.set_state(RunnerState::Stopped);
        info!("Source {}: runner stopped", self.source_id);
    }

    async fn frame_loop(&mut self) -> Exit {
        loop {
            if !self.wait_until_resumed().await {
                return Exit::Close;
            }
            self.handle.set_state(RunnerState::Running);

            let read = tokio::select! {
                _ = self.handle.cancel.cancelled() => return Exit::Close,
                read = self.source.get_mut().read() => read,
            };
            let frame = match read {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Source {}: end of recording", self.source_id);
                    return Exit::Close;
                }
                Err(e) => {
                    let err = GaugeError::SourceUnavailable(format!("{:#}", e));
                    warn!("Source {}: {}", self.source_id, err);
                    return Exit::Reopen;
                }
            };

            let started = Instant::now();
            self.process_frame(frame).await;

            match self.source.get_mut().kind() {
                SourceKind::File => {
                    self.source.get_mut().advance(started.elapsed());
                    if self.source.get_mut().is_exhausted() {
                        info!("Source {}: end of recording", self.source_id);
                        return Exit::Close;
                    }
                }
                SourceKind::Live => {
                    if !self.sleep(self.settings.live_frame_interval).await {
                        return Exit::Close;
                    }
                }
            }
        }
    }

    /// Block while paused; `false` when stopped instead of resumed
    async fn wait_until_resumed(&self) -> bool {
        let mut paused = self.handle.paused.subscribe();
        if *paused.borrow_and_update() {
            self.handle.set_state(RunnerState::Paused);
            info!("Source {}: paused", self.source_id);
        }

        tokio::select! {
            _ = self.handle.cancel.cancelled() => false,
            resumed = paused.wait_for(|p| !*p) => resumed.is_ok(),
        }
    }

    /// Sleep unless stopped first; `false` when stopped
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.handle.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn process_frame(&self, frame: Frame) {
        let pipeline = Arc::clone(&self.pipeline);
        let outcome = tokio::task::spawn_blocking(move || pipeline.lock().process(&frame)).await;

        match outcome {
            Ok(Ok(outcome)) => {
                for region in outcome.regions {
                    self.publish(outcome.timestamp, region).await;
                }
            }
            Ok(Err(e)) if e.is_expected() => debug!("Source {}: {}", self.source_id, e),
            Ok(Err(e)) => warn!("Source {}: frame skipped: {}", self.source_id, e),
            Err(e) => error!("Source {}: frame worker failed: {}", self.source_id, e),
        }
    }

    /// Store the crop, persist the reading and raise any alert. Sink failures
    /// are logged and never reach the frame loop.
    async fn publish(&self, timestamp: DateTime<Utc>, region: RegionOutcome) {
        let Ok(value) = region.result else {
            return;
        };
        let track_id = region.track_id;

        let image_ref = match self.images.store(&self.source_id, track_id, &region.crop).await {
            Ok(reference) => reference,
            Err(e) => {
                warn!("Source {}: {}", self.source_id, GaugeError::SinkFailure(e));
                self.settings.placeholder_image.clone()
            }
        };

        let reading = Reading {
            timestamp,
            value,
            unit: region.unit.unwrap_or_default(),
            image_ref,
        };
        info!(
            "Source {} track {}: {} {}",
            self.source_id, track_id, reading.value, reading.unit
        );

        if let Err(e) = self.sink.record(&self.source_id, track_id, &reading).await {
            warn!("Source {}: {}", self.source_id, GaugeError::SinkFailure(e));
        }

        let alert = self
            .handle
            .threshold(track_id)
            .and_then(|threshold| evaluate(&threshold, value, timestamp));
        if let Some(alert) = alert {
            info!(
                "Source {} track {}: {} alert at {}",
                self.source_id,
                track_id,
                alert.status.as_str(),
                alert.reading
            );
            if let Err(e) = self.sink.notify(&self.source_id, track_id, &alert).await {
                warn!("Source {}: {}", self.source_id, GaugeError::SinkFailure(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AlertEvent;
    use crate::capture::ImageSequenceSource;
    use crate::pipeline::test_support;
    use anyhow::{anyhow, bail, Result};
    use async_trait::async_trait;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    fn fast_settings() -> RunnerSettings {
        RunnerSettings {
            retry_backoff: Duration::from_millis(5),
            live_frame_interval: Duration::from_millis(5),
            placeholder_image: "placeholder.png".to_string(),
        }
    }

    /// Source that never opens
    struct Unreachable {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl VideoSource for Unreachable {
        fn kind(&self) -> SourceKind {
            SourceKind::Live
        }

        async fn open(&mut self) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            bail!("connection refused")
        }

        async fn read(&mut self) -> Result<Option<Frame>> {
            Err(anyhow!("not open"))
        }
    }

    /// Live source that serves the synthetic dial and counts reads
    struct Camera {
        reads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl VideoSource for Camera {
        fn kind(&self) -> SourceKind {
            SourceKind::Live
        }

        async fn open(&mut self) -> Result<()> {
            Ok(())
        }

        async fn read(&mut self) -> Result<Option<Frame>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Frame::new(test_support::dial_image())))
        }
    }

    /// Live source whose reads block until the test hands out a permit
    struct GatedCamera {
        entered: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl VideoSource for GatedCamera {
        fn kind(&self) -> SourceKind {
            SourceKind::Live
        }

        async fn open(&mut self) -> Result<()> {
            Ok(())
        }

        async fn read(&mut self) -> Result<Option<Frame>> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await?.forget();
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Frame::new(test_support::dial_image())))
        }
    }

    #[derive(Default)]
    struct Recorder {
        readings: Mutex<Vec<(u64, Reading)>>,
        alerts: Mutex<Vec<AlertEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl ReadingSink for Recorder {
        async fn record(&self, _source_id: &str, track_id: u64, reading: &Reading) -> Result<()> {
            self.readings.lock().push((track_id, reading.clone()));
            if self.fail {
                bail!("database is locked");
            }
            Ok(())
        }

        async fn notify(&self, _source_id: &str, _track_id: u64, alert: &AlertEvent) -> Result<()> {
            self.alerts.lock().push(alert.clone());
            if self.fail {
                bail!("smtp unreachable");
            }
            Ok(())
        }
    }

    struct NoImages;

    #[async_trait]
    impl ImageStore for NoImages {
        async fn store(&self, _source_id: &str, _track_id: u64, _crop: &RgbImage) -> Result<String> {
            bail!("disk full")
        }
    }

    fn runner(source: Box<dyn VideoSource>, sink: Arc<Recorder>) -> SourceRunner {
        SourceRunner::new(
            "test",
            source,
            test_support::pipeline(202.5, true),
            sink,
            Arc::new(NoImages),
            fast_settings(),
            HashMap::new(),
        )
    }

    async fn wait_for_state(handle: &SourceHandle, state: RunnerState) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_source_retries_until_stopped() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let source = Unreachable { attempts: attempts.clone() };
        let runner = runner(Box::new(source), Arc::new(Recorder::default()));
        let handle = runner.handle();
        let task = tokio::spawn(runner.run());

        tokio::time::timeout(Duration::from_secs(10), async {
            while attempts.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!task.is_finished());
        assert_ne!(handle.state(), RunnerState::Closing);
        assert_ne!(handle.state(), RunnerState::Stopped);

        handle.stop();
        tokio::time::timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
        assert_eq!(handle.state(), RunnerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_interrupts_long_backoff() {
        let source = Unreachable { attempts: Arc::new(AtomicUsize::new(0)) };
        let mut runner = runner(Box::new(source), Arc::new(Recorder::default()));
        runner.settings.retry_backoff = Duration::from_secs(3600);
        let handle = runner.handle();
        let task = tokio::spawn(runner.run());

        wait_for_state(&handle, RunnerState::Retrying).await;
        handle.stop();
        tokio::time::timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resume_releases_exactly_one_read() {
        let entered = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));
        let camera = GatedCamera {
            entered: entered.clone(),
            completed: completed.clone(),
            gate: gate.clone(),
        };
        let runner = runner(Box::new(camera), Arc::new(Recorder::default()));
        let handle = runner.handle();
        handle.pause();
        let task = tokio::spawn(runner.run());

        wait_for_state(&handle, RunnerState::Paused).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        handle.resume();
        tokio::time::timeout(Duration::from_secs(10), async {
            while entered.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        // Pause again while that read is still pending, then let it finish
        handle.pause();
        gate.add_permits(1);
        wait_for_state(&handle, RunnerState::Paused).await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        gate.add_permits(5);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(entered.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        handle.stop();
        tokio::time::timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_while_paused() {
        let runner = runner(
            Box::new(Camera { reads: Arc::new(AtomicUsize::new(0)) }),
            Arc::new(Recorder::default()),
        );
        let handle = runner.handle();
        handle.pause();
        let task = tokio::spawn(runner.run());

        wait_for_state(&handle, RunnerState::Paused).await;
        handle.stop();
        tokio::time::timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
        assert_eq!(handle.state(), RunnerState::Stopped);
    }

    #[tokio::test]
    async fn test_failing_sinks_do_not_stop_the_loop() {
        let reads = Arc::new(AtomicUsize::new(0));
        let sink = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let runner = runner(Box::new(Camera { reads: reads.clone() }), sink.clone());
        let handle = runner.handle();
        handle.set_threshold(1, Some(Threshold::new(None, Some(50.0))));
        let task = tokio::spawn(runner.run());

        tokio::time::timeout(Duration::from_secs(30), async {
            while sink.readings.lock().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.stop();
        tokio::time::timeout(Duration::from_secs(10), task).await.unwrap().unwrap();

        let readings = sink.readings.lock();
        let (track_id, first) = &readings[0];
        assert_eq!(*track_id, 1);
        assert!((first.value - 75.0).abs() < 1e-3);
        assert_eq!(first.unit, "psi");
        assert_eq!(first.image_ref, "placeholder.png");

        let alerts = sink.alerts.lock();
        assert!(alerts.len() >= 3);
        assert_eq!(alerts[0].status, crate::analysis::AlertStatus::High);
    }

    #[tokio::test]
    async fn test_temporary_recording_is_removed_after_playback() {
        let dir = TempDir::new().unwrap();
        let recording = dir.path().join("recording");
        std::fs::create_dir(&recording).unwrap();
        for i in 0..3 {
            test_support::dial_image()
                .save(recording.join(format!("frame_{i:03}.png")))
                .unwrap();
        }

        let sink = Arc::new(Recorder::default());
        let source = ImageSequenceSource::new(&recording, 1.0, true);
        let runner = runner(Box::new(source), sink.clone());
        let handle = runner.handle();

        tokio::time::timeout(Duration::from_secs(60), runner.run()).await.unwrap();

        assert_eq!(handle.state(), RunnerState::Stopped);
        assert!(!recording.exists());
        let readings = sink.readings.lock().len();
        assert!((1..=3).contains(&readings), "{readings} readings");
    }
}
