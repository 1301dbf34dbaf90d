use crate::error::IngestError;
use crate::traits::{ImageFormat, PageImage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactEntry {
    pub file: String,
    pub job_id: String,
    pub size: u64,
    /// Hex sha256 of the file contents.
    #[serde(default)]
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    pages: BTreeMap<u32, ArtifactEntry>,
}

/// Rendered page images cached per document under
/// `<root>/<document_id>/page_NNNN.<ext>`, described by a `manifest.json`.
pub struct ArtifactStore {
    root: PathBuf,
    manifest_lock: Mutex<()>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest_lock: Mutex::new(()),
        }
    }

    pub fn document_dir(&self, document_id: &str) -> PathBuf {
        self.root.join(document_id)
    }

    /// Returns the cached image for `page` when its manifest entry exists and
    /// the file on disk still has the recorded size and digest.
    pub async fn load_valid(
        &self,
        document_id: &str,
        page: u32,
    ) -> Result<Option<PageImage>, IngestError> {
        let dir = self.document_dir(document_id);
        let manifest = read_manifest(&dir).await?;
        let Some(entry) = manifest.pages.get(&page) else {
            return Ok(None);
        };

        let path = dir.join(&entry.file);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(_) => return Ok(None),
        };
        if metadata.len() != entry.size {
            tracing::warn!(document_id, page, "cached page artifact is stale, re-rendering");
            return Ok(None);
        }

        let format = Path::new(&entry.file)
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(ImageFormat::from_extension)
            .unwrap_or(ImageFormat::Png);
        let bytes = tokio::fs::read(&path).await?;
        if !entry.sha256.is_empty() && digest(&bytes) != entry.sha256 {
            tracing::warn!(document_id, page, "cached page artifact is corrupt, re-rendering");
            return Ok(None);
        }
        Ok(Some(PageImage {
            page,
            format,
            bytes,
        }))
    }

    pub async fn store(
        &self,
        document_id: &str,
        job_id: &str,
        image: &PageImage,
    ) -> Result<(), IngestError> {
        let dir = self.document_dir(document_id);
        tokio::fs::create_dir_all(&dir).await?;

        let file = format!("page_{:04}.{}", image.page, image.format.extension());
        tokio::fs::write(dir.join(&file), &image.bytes).await?;

        let _guard = self.manifest_lock.lock().await;
        let mut manifest = read_manifest(&dir).await?;
        manifest.pages.insert(
            image.page,
            ArtifactEntry {
                file,
                job_id: job_id.to_string(),
                size: image.bytes.len() as u64,
                sha256: digest(&image.bytes),
                created_at: Utc::now(),
            },
        );
        write_manifest(&dir, &manifest).await
    }

    /// Removes the artifacts created by `job_id`. Artifacts from other jobs are
    /// left in place.
    pub async fn cleanup(&self, document_id: &str, job_id: &str) -> Result<usize, IngestError> {
        let dir = self.document_dir(document_id);
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = read_manifest(&dir).await?;

        let owned: Vec<u32> = manifest
            .pages
            .iter()
            .filter(|(_, entry)| entry.job_id == job_id)
            .map(|(page, _)| *page)
            .collect();

        for page in &owned {
            if let Some(entry) = manifest.pages.remove(page) {
                match tokio::fs::remove_file(dir.join(&entry.file)).await {
                    Ok(()) => {}
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                    Err(error) => return Err(error.into()),
                }
            }
        }

        if !owned.is_empty() {
            write_manifest(&dir, &manifest).await?;
        }
        tracing::debug!(document_id, job_id, removed = owned.len(), "artifacts cleaned up");
        Ok(owned.len())
    }

    pub async fn purge(&self, document_id: &str) -> Result<(), IngestError> {
        let dir = self.document_dir(document_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

fn digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

async fn read_manifest(dir: &Path) -> Result<Manifest, IngestError> {
    match tokio::fs::read(dir.join(MANIFEST)).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Manifest::default()),
        Err(error) => Err(error.into()),
    }
}

async fn write_manifest(dir: &Path, manifest: &Manifest) -> Result<(), IngestError> {
    let content = serde_json::to_vec_pretty(manifest)?;
    let temp = dir.join("manifest.json.tmp");
    tokio::fs::write(&temp, content).await?;
    tokio::fs::rename(&temp, dir.join(MANIFEST)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn image(page: u32, bytes: &[u8]) -> PageImage {
        PageImage {
            page,
            format: ImageFormat::Png,
            bytes: bytes.to_vec(),
        }
    }

    #[tokio::test]
    async fn stored_artifacts_are_reused() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = ArtifactStore::new(dir.path());
        store.store("doc", "job-1", &image(3, b"pixels")).await?;

        let cached = store.load_valid("doc", 3).await?.ok_or("artifact missing")?;
        assert_eq!(cached.bytes, b"pixels");
        assert!(dir.path().join("doc").join("page_0003.png").exists());
        assert!(store.load_valid("doc", 4).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn truncated_artifact_is_invalid() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = ArtifactStore::new(dir.path());
        store.store("doc", "job-1", &image(1, b"full image")).await?;
        std::fs::write(dir.path().join("doc").join("page_0001.png"), b"torn")?;

        assert!(store.load_valid("doc", 1).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn same_size_corruption_is_invalid() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = ArtifactStore::new(dir.path());
        store.store("doc", "job-1", &image(2, b"scan-a")).await?;
        std::fs::write(dir.path().join("doc").join("page_0002.png"), b"scan-b")?;

        assert!(store.load_valid("doc", 2).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_only_touches_own_job() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = ArtifactStore::new(dir.path());
        store.store("doc", "job-old", &image(1, b"one")).await?;
        store.store("doc", "job-new", &image(2, b"two")).await?;

        assert_eq!(store.cleanup("doc", "job-new").await?, 1);
        assert!(store.load_valid("doc", 1).await?.is_some());
        assert!(store.load_valid("doc", 2).await?.is_none());
        assert!(!dir.path().join("doc").join("page_0002.png").exists());

        store.purge("doc").await?;
        assert!(!dir.path().join("doc").exists());
        store.purge("doc").await?;
        Ok(())
    }
}
