use crate::error::SearchError;
use crate::models::{Chunk, IndexStats, QueryFilters, ScoredChunk};
use crate::traits::VectorStore;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    chunks: HashMap<String, Arc<Chunk>>,
    dimensions: Option<usize>,
}

/// Brute-force cosine index held in memory, optionally backed by a JSON-lines
/// log.
///
/// Readers clone the current snapshot handle and search it without holding a
/// lock, so a query running alongside an upsert sees either the old or the
/// new set of chunks, never a mix. Writes are serialised; the log is appended
/// and synced before the new snapshot is published. An upsert copies the
/// chunk table only while a reader still holds the previous snapshot.
pub struct LocalVectorStore {
    snapshot: RwLock<Arc<Snapshot>>,
    log_path: Option<PathBuf>,
    writer: Mutex<()>,
}

impl LocalVectorStore {
    pub fn in_memory() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            log_path: None,
            writer: Mutex::new(()),
        }
    }

    /// Loads the log at `path`, creating parent directories as needed. Later
    /// records replace earlier ones with the same id; unreadable lines (such
    /// as a line torn by a crash) are skipped.
    ///
    /// A log holding unreadable lines, superseded records or a missing final
    /// newline is rewritten in compacted form before the store is returned, so
    /// later appends always start on a fresh line.
    pub fn open(path: &Path) -> Result<Self, SearchError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut snapshot = Snapshot::default();
        let mut compact = false;
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let mut records = 0usize;
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Chunk>(line) {
                    Ok(chunk) => {
                        records += 1;
                        snapshot.dimensions.get_or_insert(chunk.embedding.len());
                        snapshot.chunks.insert(chunk.chunk_id.clone(), Arc::new(chunk));
                    }
                    Err(error) => {
                        compact = true;
                        tracing::warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            %error,
                            "skipping unreadable index record"
                        );
                    }
                }
            }
            compact |= records > snapshot.chunks.len();
            compact |= !content.is_empty() && !content.ends_with('\n');
        }

        if compact {
            let temp = path.with_extension("jsonl.tmp");
            std::fs::write(&temp, encode_log(&snapshot)?)?;
            std::fs::rename(&temp, path)?;
            tracing::info!(path = %path.display(), chunks = snapshot.chunks.len(), "index log compacted");
        }

        tracing::info!(
            path = %path.display(),
            chunks = snapshot.chunks.len(),
            "vector index loaded"
        );

        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            log_path: Some(path.to_path_buf()),
            writer: Mutex::new(()),
        })
    }

    fn current(&self) -> Arc<Snapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    fn publish(&self, next: Snapshot) {
        let next = Arc::new(next);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    async fn append(&self, chunks: &[Chunk]) -> Result<(), SearchError> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };

        let mut buffer = Vec::new();
        for chunk in chunks {
            serde_json::to_writer(&mut buffer, chunk)?;
            buffer.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&buffer).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn rewrite(&self, snapshot: &Snapshot) -> Result<(), SearchError> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };

        let temp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&temp, encode_log(snapshot)?).await?;
        tokio::fs::rename(&temp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl VectorStore for LocalVectorStore {
    async fn upsert(&self, chunks: Vec<Chunk>) -> Result<(), SearchError> {
        if chunks.is_empty() {
            return Ok(());
        }

        let _writer = self.writer.lock().await;
        let mut dimensions = self.current().dimensions;
        for chunk in &chunks {
            let expected = *dimensions.get_or_insert(chunk.embedding.len());
            if chunk.embedding.len() != expected {
                return Err(SearchError::DimensionMismatch {
                    expected,
                    actual: chunk.embedding.len(),
                });
            }
        }

        self.append(&chunks).await?;

        let mut guard = match self.snapshot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = Arc::make_mut(&mut *guard);
        next.dimensions = dimensions;
        for chunk in chunks {
            next.chunks.insert(chunk.chunk_id.clone(), Arc::new(chunk));
        }
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<ScoredChunk>, SearchError> {
        let snapshot = self.current();
        if top_k == 0 || snapshot.chunks.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(expected) = snapshot.dimensions {
            if expected != embedding.len() {
                return Err(SearchError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                });
            }
        }

        let mut scored: Vec<(f32, &Arc<Chunk>)> = snapshot
            .chunks
            .values()
            .filter(|chunk| filters.matches(chunk))
            .map(|chunk| (cosine_distance(embedding, &chunk.embedding), chunk))
            .collect();

        scored.sort_by(|left, right| {
            left.0
                .total_cmp(&right.0)
                .then_with(|| left.1.chunk_id.cmp(&right.1.chunk_id))
        });

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(distance, chunk)| ScoredChunk {
                chunk: chunk.as_ref().clone(),
                distance,
            })
            .collect())
    }

    async fn stats(&self) -> Result<IndexStats, SearchError> {
        let snapshot = self.current();
        let mut documents = HashSet::new();
        let mut chunks_per_source = BTreeMap::new();
        for chunk in snapshot.chunks.values() {
            documents.insert(chunk.document_id.as_str());
            *chunks_per_source.entry(chunk.source_name.clone()).or_insert(0) += 1;
        }

        Ok(IndexStats {
            chunk_count: snapshot.chunks.len(),
            document_count: documents.len(),
            chunks_per_source,
        })
    }

    async fn count_document(&self, document_id: &str) -> Result<usize, SearchError> {
        Ok(self
            .current()
            .chunks
            .values()
            .filter(|chunk| chunk.document_id == document_id)
            .count())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize, SearchError> {
        let _writer = self.writer.lock().await;
        let current = self.current();

        let kept: HashMap<String, Arc<Chunk>> = current
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.document_id != document_id)
            .map(|(id, chunk)| (id.clone(), Arc::clone(chunk)))
            .collect();
        let removed = current.chunks.len() - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let next = Snapshot {
            dimensions: if kept.is_empty() { None } else { current.dimensions },
            chunks: kept,
        };
        self.rewrite(&next).await?;
        self.publish(next);

        tracing::info!(document_id, removed, "document removed from index");
        Ok(removed)
    }

    async fn clean_duplicates(&self, source_name: Option<&str>) -> Result<usize, SearchError> {
        let _writer = self.writer.lock().await;
        let current = self.current();

        let duplicates = duplicate_ids(
            current
                .chunks
                .values()
                .map(Arc::as_ref)
                .filter(|chunk| source_name.map_or(true, |name| chunk.source_name == name)),
        );
        if duplicates.is_empty() {
            return Ok(0);
        }

        let mut next = current.as_ref().clone();
        for id in &duplicates {
            next.chunks.remove(id);
        }
        self.rewrite(&next).await?;
        self.publish(next);

        tracing::info!(source = ?source_name, removed = duplicates.len(), "duplicate chunks removed");
        Ok(duplicates.len())
    }
}

/// Text that can only repeat through a processing error: longer than ten
/// characters and at least half alphanumeric.
fn is_substantial(text: &str) -> bool {
    let total = text.chars().count();
    let alphanumeric = text.chars().filter(|c| c.is_alphanumeric()).count();
    total > 10 && alphanumeric * 2 >= total
}

fn duplicate_ids<'a>(chunks: impl Iterator<Item = &'a Chunk>) -> Vec<String> {
    let mut ordered: Vec<&Chunk> = chunks.collect();
    ordered.sort_by(|left, right| {
        (&left.document_id, left.page, left.chunk_index, &left.chunk_id)
            .cmp(&(&right.document_id, right.page, right.chunk_index, &right.chunk_id))
    });

    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for chunk in ordered {
        let text = chunk.text.trim();
        if is_substantial(text) && !seen.insert(text) {
            duplicates.push(chunk.chunk_id.clone());
        }
    }
    duplicates
}

/// One JSON record per line, ordered by document, page and chunk index.
fn encode_log(snapshot: &Snapshot) -> Result<Vec<u8>, SearchError> {
    let mut ordered: Vec<&Arc<Chunk>> = snapshot.chunks.values().collect();
    ordered.sort_by(|left, right| {
        (&left.document_id, left.page, left.chunk_index, &left.chunk_id)
            .cmp(&(&right.document_id, right.page, right.chunk_index, &right.chunk_id))
    });

    let mut buffer = Vec::new();
    for chunk in ordered {
        serde_json::to_writer(&mut buffer, chunk.as_ref())?;
        buffer.push(b'\n');
    }
    Ok(buffer)
}

/// `1 - cosine similarity`, clamped to be non-negative. Zero vectors are
/// maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 1.0;
    }
    (1.0 - dot / denom).max(0.0)
}
