use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptPage {
    pub page: u32,
    pub text: String,
    pub confidence: f32,
}

/// OCR output of one document, persisted before chunks reach the index so it
/// can be re-imported if indexing never happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OcrTranscript {
    pub document_id: String,
    pub source_name: String,
    pub pages: Vec<TranscriptPage>,
}

impl OcrTranscript {
    pub fn new(document_id: impl Into<String>, source_name: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            source_name: source_name.into(),
            pages: Vec::new(),
        }
    }

    pub async fn load(path: &Path) -> Result<Self, IngestError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub struct TranscriptStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl TranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, document_id: &str) -> PathBuf {
        self.dir.join(format!("{document_id}.json"))
    }

    /// Stores or replaces the text recognised for one page.
    pub async fn record_page(
        &self,
        document_id: &str,
        source_name: &str,
        page: TranscriptPage,
    ) -> Result<(), IngestError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(document_id);
        let mut transcript = match OcrTranscript::load(&path).await {
            Ok(existing) => existing,
            Err(IngestError::Io(error)) if error.kind() == std::io::ErrorKind::NotFound => {
                OcrTranscript::new(document_id, source_name)
            }
            Err(error) => return Err(error),
        };

        transcript.pages.retain(|existing| existing.page != page.page);
        transcript.pages.push(page);
        transcript.pages.sort_by_key(|existing| existing.page);

        tokio::fs::create_dir_all(&self.dir).await?;
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, serde_json::to_vec_pretty(&transcript)?).await?;
        tokio::fs::rename(&temp, &path).await?;
        Ok(())
    }

    pub async fn remove(&self, document_id: &str) -> Result<bool, IngestError> {
        match tokio::fs::remove_file(self.path_for(document_id)).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

/// Transcript files (`*.json`) directly inside `dir`, sorted by path.
pub fn list_transcripts(dir: &Path) -> Result<Vec<PathBuf>, IngestError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if path.is_file() && is_json {
            paths.push(path);
        }
    }
    paths.sort_unstable();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn pages_are_recorded_in_order_and_replaced() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = TranscriptStore::new(dir.path().join("transcripts"));

        for (page, text) in [(3, "三"), (1, "一"), (3, "三 again")] {
            store
                .record_page(
                    "doc",
                    "kobun.pdf",
                    TranscriptPage {
                        page,
                        text: text.to_string(),
                        confidence: 0.9,
                    },
                )
                .await?;
        }

        let transcript = OcrTranscript::load(&store.path_for("doc")).await?;
        let pages: Vec<(u32, &str)> = transcript
            .pages
            .iter()
            .map(|page| (page.page, page.text.as_str()))
            .collect();
        assert_eq!(pages, vec![(1, "一"), (3, "三 again")]);
        assert_eq!(list_transcripts(store.dir())?, vec![store.path_for("doc")]);

        assert!(store.remove("doc").await?);
        assert!(!store.remove("doc").await?);
        Ok(())
    }
}
