//! Gauge crop storage on the local filesystem

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::RgbImage;
use std::path::PathBuf;
use uuid::Uuid;

use super::ImageStore;

/// Writes each crop as a uniquely named PNG and returns its path
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    dir: PathBuf,
}

impl LocalImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create image directory {:?}", dir))?;
        Ok(Self { dir })
    }
}

fn file_stem(source_id: &str) -> String {
    source_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn store(&self, source_id: &str, track_id: u64, crop: &RgbImage) -> Result<String> {
        let path = self.dir.join(format!(
            "{}_{}_{}.png",
            file_stem(source_id),
            track_id,
            Uuid::new_v4()
        ));
        let crop = crop.clone();

        tokio::task::spawn_blocking(move || {
            crop.save(&path)
                .with_context(|| format!("Failed to write crop {:?}", path))?;
            Ok(path.display().to_string())
        })
        .await
        .context("image writer join failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_writes_unique_pngs() {
        let dir = TempDir::new().unwrap();
        let store = LocalImageStore::new(dir.path().join("crops")).unwrap();
        let crop = RgbImage::from_pixel(8, 6, Rgb([10, 20, 30]));

        let first = store.store("plant/boiler 1", 4, &crop).await.unwrap();
        let second = store.store("plant/boiler 1", 4, &crop).await.unwrap();
        assert_ne!(first, second);
        assert!(first.contains("plant_boiler_1_4_"));

        let loaded = image::open(&first).unwrap().to_rgb8();
        assert_eq!(loaded.dimensions(), (8, 6));
        assert_eq!(loaded.get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[tokio::test]
    async fn test_store_into_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let store = LocalImageStore::new(dir.path().join("crops")).unwrap();
        std::fs::remove_dir(dir.path().join("crops")).unwrap();

        let crop = RgbImage::new(2, 2);
        assert!(store.store("boiler", 1, &crop).await.is_err());
    }
}
