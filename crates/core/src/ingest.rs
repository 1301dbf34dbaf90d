use crate::artifacts::ArtifactStore;
use crate::chunking::{build_chunks, make_chunk_id, ChunkingConfig};
use crate::config::{IngestConfig, StorageConfig};
use crate::embeddings::Embedder;
use crate::error::{IngestError, PageError};
use crate::models::{
    Chunk, Document, DocumentStatus, PageFailure, PageRange, QuestionLabel, GRAMMAR_TAG,
    NOTES_SOURCE, NOTE_TAG,
};
use crate::pages::{discover_sources, open_source};
use crate::registry::DocumentRegistry;
use crate::session::StopSignal;
use crate::traits::{OcrEngine, PageSource, QuestionClassifier, VectorStore};
use crate::transcripts::{list_transcripts, OcrTranscript, TranscriptPage, TranscriptStore};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub path: PathBuf,
    pub page_range: Option<PageRange>,
}

impl IngestRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            page_range: None,
        }
    }

    pub fn with_page_range(mut self, page_range: Option<PageRange>) -> Self {
        self.page_range = page_range;
        self
    }
}

/// Identity and stop flag of one ingestion job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub stop: StopSignal,
}

impl JobContext {
    pub fn new() -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            stop: StopSignal::new(),
        }
    }

    pub fn with_stop(stop: StopSignal) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            stop,
        }
    }
}

impl Default for JobContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IngestOutcome {
    pub document_id: String,
    pub source_name: String,
    pub status: DocumentStatus,
    pub checkpoint: Option<u32>,
    pub pages_processed: u32,
    pub chunks_indexed: usize,
    pub failed_pages: Vec<u32>,
    pub stopped: bool,
}

pub struct SkippedSource {
    pub path: PathBuf,
    pub reason: String,
}

pub struct FolderReport {
    pub outcomes: Vec<IngestOutcome>,
    pub skipped: Vec<SkippedSource>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeleteReport {
    pub document_id: String,
    pub chunks_removed: usize,
    pub registry_entry_removed: bool,
    pub transcript_removed: bool,
}

/// Collaborators the pipeline writes through.
pub struct PipelineParts {
    pub store: Arc<dyn VectorStore>,
    pub registry: Arc<DocumentRegistry>,
    pub ocr: Arc<dyn OcrEngine>,
    pub embedder: Arc<dyn Embedder>,
    pub classifier: Arc<dyn QuestionClassifier>,
}

/// Turns paged sources into indexed chunks, one page at a time.
///
/// Each document moves `pending -> processing -> complete | partial | failed`.
/// A job that is stopped keeps its checkpoint and goes back to `pending`;
/// [`IngestionPipeline::resume`] continues after the checkpoint.
pub struct IngestionPipeline {
    store: Arc<dyn VectorStore>,
    registry: Arc<DocumentRegistry>,
    ocr: Arc<dyn OcrEngine>,
    embedder: Arc<dyn Embedder>,
    classifier: Arc<dyn QuestionClassifier>,
    artifacts: ArtifactStore,
    transcripts: TranscriptStore,
    chunking: ChunkingConfig,
    config: IngestConfig,
}

/// How a single page ended. Page faults are logged and skipped; fatal errors
/// stop the job.
enum PageFault {
    Page(PageError),
    Fatal(IngestError),
}

impl From<PageError> for PageFault {
    fn from(error: PageError) -> Self {
        PageFault::Page(error)
    }
}

impl From<IngestError> for PageFault {
    fn from(error: IngestError) -> Self {
        PageFault::Fatal(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Forward,
    Retry,
}

impl IngestionPipeline {
    pub fn new(
        parts: PipelineParts,
        storage: &StorageConfig,
        config: &IngestConfig,
    ) -> Result<Self, IngestError> {
        let chunking = ChunkingConfig::from(config);
        chunking.validate()?;
        if config.embed_batch_size == 0 {
            return Err(IngestError::InvalidArgument(
                "embed_batch_size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            store: parts.store,
            registry: parts.registry,
            ocr: parts.ocr,
            embedder: parts.embedder,
            classifier: parts.classifier,
            artifacts: ArtifactStore::new(storage.artifacts_dir()),
            transcripts: TranscriptStore::new(storage.transcripts_dir()),
            chunking,
            config: config.clone(),
        })
    }

    pub fn registry(&self) -> &DocumentRegistry {
        &self.registry
    }

    pub fn transcripts_dir(&self) -> &Path {
        self.transcripts.dir()
    }

    pub async fn ingest(
        &self,
        request: IngestRequest,
        ctx: &JobContext,
    ) -> Result<IngestOutcome, IngestError> {
        let document_id = document_id_for(&request.path);
        let source_name = source_name_of(&request.path)?;
        let mut document = self
            .registry
            .get(&document_id)
            .await
            .unwrap_or_else(|| {
                Document::new(&document_id, &source_name, request.path.to_string_lossy())
            });
        document.page_range = request.page_range;
        tracing::info!(
            document_id = %document_id,
            source = %source_name,
            job_id = %ctx.job_id,
            "ingestion started"
        );

        let source = match open_source(&request.path) {
            Ok(source) => source,
            Err(error) => return Err(self.fail_document(document, error).await),
        };

        self.run(document, source.as_ref(), ctx, Pass::Forward).await
    }

    /// Continues a document after its checkpoint, re-using cached page
    /// artifacts that are still valid.
    pub async fn resume(
        &self,
        document_id: &str,
        ctx: &JobContext,
    ) -> Result<IngestOutcome, IngestError> {
        let document = self.known_document(document_id).await?;
        if document.status == DocumentStatus::Complete {
            tracing::info!(document_id, "document already complete, nothing to resume");
            return Ok(outcome_of(&document, 0, 0, false));
        }
        tracing::info!(
            document_id,
            checkpoint = ?document.checkpoint,
            job_id = %ctx.job_id,
            "resuming ingestion"
        );

        let path = PathBuf::from(&document.source_path);
        let source = match open_source(&path) {
            Ok(source) => source,
            Err(error) => return Err(self.fail_document(document, error).await),
        };
        self.run(document, source.as_ref(), ctx, Pass::Forward).await
    }

    /// Re-processes only the pages recorded in the document's error log.
    pub async fn retry_failed_pages(
        &self,
        document_id: &str,
        ctx: &JobContext,
    ) -> Result<IngestOutcome, IngestError> {
        let document = self.known_document(document_id).await?;
        if document.page_errors.is_empty() {
            return Ok(outcome_of(&document, 0, 0, false));
        }
        tracing::info!(
            document_id,
            pages = ?document.failed_pages(),
            job_id = %ctx.job_id,
            "retrying failed pages"
        );

        let path = PathBuf::from(&document.source_path);
        let source = match open_source(&path) {
            Ok(source) => source,
            Err(error) => return Err(self.fail_document(document, error).await),
        };
        self.run(document, source.as_ref(), ctx, Pass::Retry).await
    }

    /// Ingests every PDF and page directory below `folder`. Sources that fail
    /// are reported instead of stopping the run.
    pub async fn ingest_folder(
        &self,
        folder: &Path,
        ctx: &JobContext,
    ) -> Result<FolderReport, IngestError> {
        let sources = discover_sources(folder);
        if sources.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no pdf files or page directories found in {}",
                folder.display()
            )));
        }

        let mut outcomes = Vec::new();
        let mut skipped = Vec::new();
        for path in sources {
            if ctx.stop.is_stopped() {
                break;
            }
            match self.ingest(IngestRequest::new(&path), ctx).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => skipped.push(SkippedSource {
                    path,
                    reason: error.to_string(),
                }),
            }
        }
        Ok(FolderReport { outcomes, skipped })
    }

    /// Transcripts whose document has no chunks in the index.
    pub async fn scan_for_unindexed(&self, dir: Option<&Path>) -> Result<Vec<PathBuf>, IngestError> {
        let dir = dir.unwrap_or_else(|| self.transcripts.dir());
        let mut orphans = Vec::new();
        for path in list_transcripts(dir)? {
            let transcript = match OcrTranscript::load(&path).await {
                Ok(transcript) => transcript,
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping unreadable transcript");
                    continue;
                }
            };
            if self.store.count_document(&transcript.document_id).await? == 0 {
                orphans.push(path);
            }
        }
        Ok(orphans)
    }

    /// Chunks, embeds and indexes a stored OCR transcript.
    pub async fn import_transcript(&self, path: &Path) -> Result<IngestOutcome, IngestError> {
        let transcript = OcrTranscript::load(path).await?;
        let mut document = self
            .registry
            .get(&transcript.document_id)
            .await
            .unwrap_or_else(|| {
                Document::new(
                    &transcript.document_id,
                    &transcript.source_name,
                    path.to_string_lossy(),
                )
            });

        let mut all_pages: Vec<u32> = transcript.pages.iter().map(|page| page.page).collect();
        all_pages.sort_unstable();
        let mut chunks_indexed = 0;
        for page in &transcript.pages {
            let chunks = self.page_chunks(&document.document_id, &document.source_name, page.page, &page.text)?;
            chunks_indexed += self.index_chunks(chunks).await?;
            document.page_errors.retain(|failure| failure.page != page.page);
            document.mark_done(page.page, &all_pages);
        }

        let last_page = all_pages.last().copied().unwrap_or(0);
        document.total_pages = document.total_pages.max(last_page);
        document.status = if document.page_errors.is_empty() {
            DocumentStatus::Complete
        } else {
            DocumentStatus::Partial
        };
        document.fatal_error = None;
        self.registry.put(document.clone()).await?;

        tracing::info!(
            document_id = %document.document_id,
            pages = transcript.pages.len(),
            chunks = chunks_indexed,
            "transcript imported"
        );
        Ok(outcome_of(&document, transcript.pages.len() as u32, chunks_indexed, false))
    }

    /// Drops chunks whose text repeats an earlier chunk, optionally only within
    /// one source. Returns how many were removed.
    pub async fn clean_duplicates(&self, source_name: Option<&str>) -> Result<usize, IngestError> {
        let removed = self.store.clean_duplicates(source_name).await?;
        tracing::info!(source = ?source_name, removed, "duplicate chunks cleaned");
        Ok(removed)
    }

    /// Removes a document's chunks, registry entry, artifacts and transcript.
    pub async fn delete_document(&self, document_id: &str) -> Result<DeleteReport, IngestError> {
        let chunks_removed = self.store.delete_document(document_id).await?;
        let registry_entry_removed = self.registry.remove(document_id).await?.is_some();
        self.artifacts.purge(document_id).await?;
        let transcript_removed = self.transcripts.remove(document_id).await?;

        tracing::info!(document_id, chunks_removed, "document deleted");
        Ok(DeleteReport {
            document_id: document_id.to_string(),
            chunks_removed,
            registry_entry_removed,
            transcript_removed,
        })
    }

    async fn known_document(&self, document_id: &str) -> Result<Document, IngestError> {
        self.registry
            .get(document_id)
            .await
            .ok_or_else(|| IngestError::UnknownDocument(document_id.to_string()))
    }

    async fn fail_document(&self, mut document: Document, error: IngestError) -> IngestError {
        tracing::warn!(document_id = %document.document_id, %error, "source unreadable");
        document.status = DocumentStatus::Failed;
        document.fatal_error = Some(error.to_string());
        if let Err(save_error) = self.registry.put(document).await {
            tracing::warn!(error = %save_error, "could not record failed document");
        }
        error
    }

    async fn run(
        &self,
        mut document: Document,
        source: &dyn PageSource,
        ctx: &JobContext,
        pass: Pass,
    ) -> Result<IngestOutcome, IngestError> {
        let all_pages = source.page_numbers();
        let in_range: Vec<u32> = all_pages
            .iter()
            .copied()
            .filter(|page| document.page_range.map_or(true, |range| range.contains(*page)))
            .collect();
        let pages: Vec<u32> = match pass {
            Pass::Forward => in_range
                .iter()
                .copied()
                .filter(|page| !document.pages_done.contains(page))
                .collect(),
            Pass::Retry => {
                let failed = document.failed_pages();
                in_range.iter().copied().filter(|page| failed.contains(page)).collect()
            }
        };

        document.total_pages = all_pages.len() as u32;
        document.status = DocumentStatus::Processing;
        document.fatal_error = None;
        self.registry.put(document.clone()).await?;

        let every = self.config.checkpoint_every.max(1);
        let mut pages_processed = 0u32;
        let mut chunks_indexed = 0usize;
        let mut since_save = 0u32;
        let mut stopped = false;

        for page in pages {
            if ctx.stop.is_stopped() {
                stopped = true;
                break;
            }

            match self.process_page(&document, source, page, ctx).await {
                Ok(count) => {
                    chunks_indexed += count;
                    document.page_errors.retain(|failure| failure.page != page);
                    tracing::info!(document_id = %document.document_id, page, chunks = count, "page indexed");
                }
                Err(PageFault::Page(error)) => {
                    tracing::warn!(document_id = %document.document_id, page, reason = %error.reason, "page failed");
                    document.page_errors.retain(|failure| failure.page != page);
                    document.page_errors.push(PageFailure {
                        page,
                        reason: error.reason,
                        job_id: ctx.job_id.clone(),
                        failed_at: Utc::now(),
                    });
                }
                Err(PageFault::Fatal(error)) => {
                    document.status = DocumentStatus::Failed;
                    document.fatal_error = Some(error.to_string());
                    self.registry.put(document).await?;
                    return Err(error);
                }
            }

            pages_processed += 1;
            document.mark_done(page, &all_pages);
            since_save += 1;
            if since_save >= every {
                since_save = 0;
                self.registry.put(document.clone()).await?;
                tracing::debug!(document_id = %document.document_id, checkpoint = ?document.checkpoint, "checkpoint saved");
            }
        }
        if ctx.stop.is_stopped() {
            stopped = true;
        }

        let reached_end = in_range.iter().all(|page| document.pages_done.contains(page));
        document.status = if !reached_end {
            DocumentStatus::Pending
        } else if document.page_errors.is_empty() {
            DocumentStatus::Complete
        } else {
            DocumentStatus::Partial
        };
        self.registry.put(document.clone()).await?;

        if document.status.is_terminal() && !self.config.keep_artifacts {
            self.artifacts
                .cleanup(&document.document_id, &ctx.job_id)
                .await?;
        }

        tracing::info!(
            document_id = %document.document_id,
            status = %document.status,
            pages = pages_processed,
            chunks = chunks_indexed,
            stopped,
            "ingestion finished"
        );
        Ok(outcome_of(&document, pages_processed, chunks_indexed, stopped))
    }

    async fn process_page(
        &self,
        document: &Document,
        source: &dyn PageSource,
        page: u32,
        ctx: &JobContext,
    ) -> Result<usize, PageFault> {
        let page_error = |reason: String| PageFault::Page(PageError { page, reason });
        let document_id = &document.document_id;

        let cached = self
            .artifacts
            .load_valid(document_id, page)
            .await
            .map_err(|error| page_error(format!("artifact cache: {error}")))?;
        let image = match cached {
            Some(image) => image,
            None => {
                let image = source.render(page)?;
                self.artifacts
                    .store(document_id, &ctx.job_id, &image)
                    .await
                    .map_err(|error| page_error(format!("artifact cache: {error}")))?;
                image
            }
        };

        let output = self
            .ocr
            .recognize(&image)
            .await
            .map_err(|error| page_error(format!("ocr: {error}")))?;
        let text = output.text_above(self.config.min_ocr_confidence);

        self.transcripts
            .record_page(
                document_id,
                &document.source_name,
                TranscriptPage {
                    page,
                    text: text.clone(),
                    confidence: output.mean_confidence(),
                },
            )
            .await?;

        if text.trim().is_empty() {
            tracing::debug!(document_id = %document_id, page, "blank page");
            return Ok(0);
        }

        let chunks = self.page_chunks(document_id, &document.source_name, page, &text)?;
        self.index_chunks(chunks).await.map_err(|error| match error {
            IngestError::Embedding(_) | IngestError::Index(_) => page_error(error.to_string()),
            other => PageFault::Fatal(other),
        })
    }

    fn page_chunks(
        &self,
        document_id: &str,
        source_name: &str,
        page: u32,
        text: &str,
    ) -> Result<Vec<Chunk>, IngestError> {
        let mut chunks = build_chunks(document_id, source_name, page, text, self.chunking, &BTreeSet::new())?;
        for chunk in &mut chunks {
            if self.classifier.classify(&chunk.text) == QuestionLabel::Grammar {
                chunk.tags.insert(GRAMMAR_TAG.to_string());
            }
        }
        Ok(chunks)
    }

    async fn embed_chunks(&self, mut chunks: Vec<Chunk>) -> Result<Vec<Chunk>, IngestError> {
        for batch in chunks.chunks_mut(self.config.embed_batch_size) {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            for (chunk, vector) in batch.iter_mut().zip(vectors) {
                chunk.embedding = vector;
            }
        }
        Ok(chunks)
    }

    async fn index_chunks(&self, chunks: Vec<Chunk>) -> Result<usize, IngestError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let chunks = self.embed_chunks(chunks).await?;
        let count = chunks.len();
        self.store.upsert(chunks).await?;
        Ok(count)
    }
}

fn outcome_of(
    document: &Document,
    pages_processed: u32,
    chunks_indexed: usize,
    stopped: bool,
) -> IngestOutcome {
    IngestOutcome {
        document_id: document.document_id.clone(),
        source_name: document.source_name.clone(),
        status: document.status,
        checkpoint: document.checkpoint,
        pages_processed,
        chunks_indexed,
        failed_pages: document.failed_pages(),
        stopped,
    }
}

/// A personal note as an unembedded chunk of the synthetic notes document.
/// The id depends on topic and text, so saving the same note twice is a no-op.
pub fn note_chunk(text: &str, topic: &str) -> Result<Chunk, IngestError> {
    let text = text.trim();
    let topic = topic.trim();
    if text.is_empty() {
        return Err(IngestError::InvalidArgument("note text is empty".to_string()));
    }
    if topic.is_empty() {
        return Err(IngestError::InvalidArgument("note topic is empty".to_string()));
    }

    Ok(Chunk {
        chunk_id: make_chunk_id(NOTES_SOURCE, 0, 0, &format!("{topic}\n{text}")),
        document_id: NOTES_SOURCE.to_string(),
        source_name: NOTES_SOURCE.to_string(),
        page: 0,
        chunk_index: 0,
        text: text.to_string(),
        char_start: 0,
        char_end: text.chars().count(),
        embedding: Vec::new(),
        tags: BTreeSet::from([NOTE_TAG.to_string()]),
        note_topic: Some(topic.to_string()),
    })
}

/// Stable id for a source path.
pub fn document_id_for(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn source_name_of(path: &Path) -> Result<String, IngestError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))
}
