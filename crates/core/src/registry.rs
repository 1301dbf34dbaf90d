use crate::error::IngestError;
use crate::models::Document;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Persistent status, checkpoint and error log for every ingested document,
/// kept in one JSON file that is replaced atomically on each save.
pub struct DocumentRegistry {
    path: Option<PathBuf>,
    documents: Mutex<BTreeMap<String, Document>>,
}

impl DocumentRegistry {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            documents: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn open(path: &Path) -> Result<Self, IngestError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let documents = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let listed: Vec<Document> = serde_json::from_str(&content)?;
            listed
                .into_iter()
                .map(|document| (document.document_id.clone(), document))
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            documents: Mutex::new(documents),
        })
    }

    pub async fn get(&self, document_id: &str) -> Option<Document> {
        self.documents.lock().await.get(document_id).cloned()
    }

    pub async fn list(&self) -> Vec<Document> {
        self.documents.lock().await.values().cloned().collect()
    }

    /// Inserts or replaces `document` and persists the registry. On a failed
    /// save the in-memory entry is rolled back.
    pub async fn put(&self, mut document: Document) -> Result<(), IngestError> {
        document.updated_at = chrono::Utc::now();
        let mut documents = self.documents.lock().await;
        let previous = documents.insert(document.document_id.clone(), document.clone());

        if let Err(error) = self.save(&documents).await {
            match previous {
                Some(previous) => documents.insert(document.document_id.clone(), previous),
                None => documents.remove(&document.document_id),
            };
            return Err(error);
        }
        Ok(())
    }

    pub async fn remove(&self, document_id: &str) -> Result<Option<Document>, IngestError> {
        let mut documents = self.documents.lock().await;
        let Some(removed) = documents.remove(document_id) else {
            return Ok(None);
        };

        if let Err(error) = self.save(&documents).await {
            documents.insert(document_id.to_string(), removed);
            return Err(error);
        }
        Ok(Some(removed))
    }

    async fn save(&self, documents: &BTreeMap<String, Document>) -> Result<(), IngestError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let listed: Vec<&Document> = documents.values().collect();
        let content = serde_json::to_vec_pretty(&listed)?;
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentStatus;
    use tempfile::tempdir;

    #[tokio::test]
    async fn documents_round_trip_through_disk() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("documents.json");

        let registry = DocumentRegistry::open(&path)?;
        let mut document = Document::new("doc-1", "kobun.pdf", "/books/kobun.pdf");
        document.status = DocumentStatus::Partial;
        document.checkpoint = Some(7);
        registry.put(document).await?;

        let reopened = DocumentRegistry::open(&path)?;
        let loaded = reopened.get("doc-1").await.ok_or("document missing")?;
        assert_eq!(loaded.status, DocumentStatus::Partial);
        assert_eq!(loaded.checkpoint, Some(7));
        assert!(!dir.path().join("documents.json.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn remove_reports_missing_documents() -> Result<(), Box<dyn std::error::Error>> {
        let registry = DocumentRegistry::in_memory();
        registry.put(Document::new("doc-1", "a.pdf", "a.pdf")).await?;

        assert!(registry.remove("doc-1").await?.is_some());
        assert!(registry.remove("doc-1").await?.is_none());
        assert!(registry.list().await.is_empty());
        Ok(())
    }
}
