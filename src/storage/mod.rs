//! Artefact storage: the shared upload area under `DATA_DIR` holding system
//! images, cvd host packages, kernels and per-device APKs (spec.md §3 "Image
//! Artefact").
//!
//! Grounded on `distribution/src/storage/mod.rs`'s `Storage` trait — a thin
//! async facade over plain files — generalized from content-addressed blobs
//! to named files under a couple of fixed subdirectories.

use crate::domain::{ApkEntry, ImageKind, UploadedFile};
use crate::error::InternalError;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Clone)]
pub struct ArtefactStorage {
    root: PathBuf,
}

impl ArtefactStorage {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        ArtefactStorage {
            root: data_dir.as_ref().to_path_buf(),
        }
    }

    fn images_dir(&self, kind: ImageKind) -> PathBuf {
        match kind {
            ImageKind::System => self.root.join("images").join("system"),
            ImageKind::Cvd => self.root.join("images").join("cvd"),
        }
    }

    fn apks_dir(&self, device_name: &str) -> PathBuf {
        self.root.join("devices").join(device_name).join("apks")
    }

    pub fn device_dir(&self, device_name: &str) -> PathBuf {
        self.root.join("devices").join(device_name)
    }

    /// Creates the device directory ahead of container creation (`VMCreate`
    /// effect 2, spec §4.3.1). Idempotent so retries after a partial failure
    /// don't error on an already-created directory.
    pub async fn ensure_device_dir(&self, device_name: &str) -> Result<(), InternalError> {
        fs::create_dir_all(self.device_dir(device_name)).await?;
        Ok(())
    }

    pub async fn save_image_stream(
        &self,
        kind: ImageKind,
        file_name: &str,
        mut body: impl futures::Stream<Item = std::io::Result<bytes::Bytes>> + Unpin,
    ) -> Result<u64, InternalError> {
        use futures::StreamExt;

        let dir = self.images_dir(kind);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(file_name);
        let mut file = fs::File::create(&path).await?;
        let mut total = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            total += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(total)
    }

    pub async fn list_images(&self, kind: ImageKind) -> Result<Vec<UploadedFile>, InternalError> {
        let dir = self.images_dir(kind);
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            out.push(UploadedFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                kind,
            });
        }
        Ok(out)
    }

    pub fn image_path(&self, kind: ImageKind, file_name: &str) -> PathBuf {
        self.images_dir(kind).join(file_name)
    }

    pub async fn image_exists(&self, kind: ImageKind, file_name: &str) -> bool {
        fs::metadata(self.image_path(kind, file_name)).await.is_ok()
    }

    pub async fn save_apk(
        &self,
        device_name: &str,
        file_name: &str,
        mut body: impl futures::Stream<Item = std::io::Result<bytes::Bytes>> + Unpin,
    ) -> Result<(), InternalError> {
        use futures::StreamExt;

        let dir = self.apks_dir(device_name);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(file_name);
        let mut file = fs::File::create(&path).await?;
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    pub async fn list_apks(&self, device_name: &str) -> Result<Vec<ApkEntry>, InternalError> {
        let dir = self.apks_dir(device_name);
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            out.push(ApkEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: meta.len(),
                uploaded_at: meta
                    .modified()
                    .ok()
                    .map(chrono::DateTime::<chrono::Utc>::from)
                    .unwrap_or_else(chrono::Utc::now),
            });
        }
        Ok(out)
    }

    pub fn apk_path(&self, device_name: &str, file_name: &str) -> PathBuf {
        self.apks_dir(device_name).join(file_name)
    }

    pub async fn remove_device_dir(&self, device_name: &str) -> Result<(), InternalError> {
        let dir = self.device_dir(device_name);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn saves_and_lists_images() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ArtefactStorage::new(dir.path());
        let chunks: Vec<std::io::Result<bytes::Bytes>> =
            vec![Ok(bytes::Bytes::from_static(b"hello"))];
        storage
            .save_image_stream(ImageKind::System, "aosp.zip", stream::iter(chunks))
            .await
            .unwrap();

        let listed = storage.list_images(ImageKind::System).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "aosp.zip");
        assert_eq!(listed[0].size, 5);
        assert!(storage.image_exists(ImageKind::System, "aosp.zip").await);
        assert!(!storage.image_exists(ImageKind::Cvd, "aosp.zip").await);
    }

    #[tokio::test]
    async fn removing_device_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ArtefactStorage::new(dir.path());
        storage.remove_device_dir("never-existed").await.unwrap();
    }
}
