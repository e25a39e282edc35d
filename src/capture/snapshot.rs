//! Live source backed by an HTTP snapshot endpoint
//!
//! Most IP cameras expose a still-image URL (`/snapshot.jpg`, `/cgi-bin/...`)
//! that returns the latest frame on every GET. The runner paces live sources,
//! so each read simply fetches whatever the camera has now.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use super::{Frame, SourceKind, VideoSource};

/// Camera polled over HTTP
pub struct HttpSnapshotSource {
    url: String,
    timeout: Duration,
    client: Option<reqwest::Client>,
}

impl HttpSnapshotSource {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
            client: None,
        }
    }

    async fn fetch(&self, client: &reqwest::Client) -> Result<Frame> {
        let response = client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Failed to reach camera at {}", self.url))?;

        if !response.status().is_success() {
            bail!("Camera returned status {}: {}", response.status(), self.url);
        }

        let bytes = response
            .bytes()
            .await
            .context("Error reading snapshot body")?;

        let image = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .context("snapshot decode worker join failed")?
            .context("Failed to decode snapshot")?;

        Ok(Frame::new(image.to_rgb8()))
    }
}

#[async_trait]
impl VideoSource for HttpSnapshotSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }

    async fn open(&mut self) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .context("Failed to create HTTP client")?;

        // Probe once so an unreachable camera fails at open rather than on first read
        let frame = self.fetch(&client).await?;
        let (width, height) = frame.dimensions();
        info!("Connected to camera {} ({}x{})", self.url, width, height);

        self.client = Some(client);
        Ok(())
    }

    async fn read(&mut self) -> Result<Option<Frame>> {
        let Some(client) = self.client.as_ref() else {
            bail!("camera {} is not open", self.url);
        };

        let frame = self.fetch(client).await?;
        debug!("Fetched snapshot from {}", self.url);
        Ok(Some(frame))
    }

    fn release(&mut self) {
        self.client = None;
    }
}
