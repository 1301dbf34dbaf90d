use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Source name used for hand-entered notes.
pub const NOTES_SOURCE: &str = "personal_notes";

pub const NOTE_TAG: &str = "note";

/// Tag for textbook chunks the classifier reads as grammar explanations.
pub const GRAMMAR_TAG: &str = "grammar-point";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Complete,
    Failed,
    Partial,
}

impl DocumentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DocumentStatus::Complete | DocumentStatus::Failed | DocumentStatus::Partial
        )
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Complete => "complete",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Partial => "partial",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageFailure {
    pub page: u32,
    pub reason: String,
    pub job_id: String,
    pub failed_at: DateTime<Utc>,
}

/// Inclusive page range requested for an ingestion job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageRange {
    pub first: u32,
    pub last: u32,
}

impl PageRange {
    pub fn contains(&self, page: u32) -> bool {
        page >= self.first && page <= self.last
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub document_id: String,
    pub source_name: String,
    pub source_path: String,
    pub total_pages: u32,
    pub status: DocumentStatus,
    /// Last page of the unbroken run of processed pages that starts at the
    /// document's first page.
    pub checkpoint: Option<u32>,
    /// Every page processed so far, indexed or logged as failed.
    #[serde(default)]
    pub pages_done: BTreeSet<u32>,
    pub page_range: Option<PageRange>,
    pub page_errors: Vec<PageFailure>,
    pub fatal_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(
        document_id: impl Into<String>,
        source_name: impl Into<String>,
        source_path: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            document_id: document_id.into(),
            source_name: source_name.into(),
            source_path: source_path.into(),
            total_pages: 0,
            status: DocumentStatus::Pending,
            checkpoint: None,
            pages_done: BTreeSet::new(),
            page_range: None,
            page_errors: Vec::new(),
            fatal_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Records `page` as processed and moves the checkpoint to the end of the
    /// contiguous run of done pages in `all_pages`.
    pub fn mark_done(&mut self, page: u32, all_pages: &[u32]) {
        self.pages_done.insert(page);
        self.checkpoint = all_pages
            .iter()
            .take_while(|page| self.pages_done.contains(page))
            .last()
            .copied();
    }

    pub fn failed_pages(&self) -> Vec<u32> {
        let pages: BTreeSet<u32> = self.page_errors.iter().map(|error| error.page).collect();
        pages.into_iter().collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub source_name: String,
    pub page: u32,
    pub chunk_index: u64,
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
    pub embedding: Vec<f32>,
    pub tags: BTreeSet<String>,
    /// Topic label for personal notes.
    pub note_topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct QueryFilters {
    pub document_id: Option<String>,
    pub source_name: Option<String>,
    pub tags: Vec<String>,
}

impl QueryFilters {
    pub fn matches(&self, chunk: &Chunk) -> bool {
        if let Some(document_id) = &self.document_id {
            if &chunk.document_id != document_id {
                return false;
            }
        }
        if let Some(source_name) = &self.source_name {
            if &chunk.source_name != source_name {
                return false;
            }
        }
        self.tags.iter().all(|tag| chunk.tags.contains(tag))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub distance: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStats {
    pub chunk_count: usize,
    pub document_count: usize,
    pub chunks_per_source: std::collections::BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeMode {
    #[default]
    Auto,
    Corpus,
    General,
    Hybrid,
}

impl KnowledgeMode {
    pub fn forced_route(self) -> Option<Route> {
        match self {
            KnowledgeMode::Auto => None,
            KnowledgeMode::Corpus => Some(Route::Corpus),
            KnowledgeMode::General => Some(Route::General),
            KnowledgeMode::Hybrid => Some(Route::Hybrid),
        }
    }
}

impl std::str::FromStr for KnowledgeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "auto" => Ok(KnowledgeMode::Auto),
            "corpus" | "rag" | "textbook" => Ok(KnowledgeMode::Corpus),
            "general" => Ok(KnowledgeMode::General),
            "hybrid" => Ok(KnowledgeMode::Hybrid),
            other => Err(format!("unknown knowledge mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Query {
    pub text: String,
    pub history: Vec<Turn>,
    pub mode: KnowledgeMode,
    pub top_k: Option<usize>,
    pub filters: QueryFilters,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            history: Vec::new(),
            mode: KnowledgeMode::Auto,
            top_k: None,
            filters: QueryFilters::default(),
        }
    }

    pub fn with_mode(mut self, mode: KnowledgeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Route {
    Corpus,
    General,
    Hybrid,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Route::Corpus => "CORPUS",
            Route::General => "GENERAL",
            Route::Hybrid => "HYBRID",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum QuestionLabel {
    Grammar,
    Literature,
    Hybrid,
    Unknown,
}

impl fmt::Display for QuestionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QuestionLabel::Grammar => "GRAMMAR",
            QuestionLabel::Literature => "LITERATURE",
            QuestionLabel::Hybrid => "HYBRID",
            QuestionLabel::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RetrievalMetrics {
    pub density: f32,
    pub diversity: usize,
    pub mean_distance: f32,
    pub result_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteDecision {
    pub route: Route,
    pub confidence: f32,
    pub metrics: RetrievalMetrics,
    pub label: QuestionLabel,
    pub overridden: bool,
    pub needs_clarification: bool,
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub document_id: String,
    pub source_name: String,
    pub pages: Vec<u32>,
    pub note_topic: Option<String>,
}

impl fmt::Display for Citation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(topic) = &self.note_topic {
            return write!(f, "[Note: {topic}]");
        }
        let pages = self
            .pages
            .iter()
            .map(|page| format!("p.{page}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "[{} {}]", self.source_name, pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn citation_formats_pages_and_notes() {
        let pages = Citation {
            document_id: "doc".to_string(),
            source_name: "shirane.pdf".to_string(),
            pages: vec![3, 17],
            note_topic: None,
        };
        assert_eq!(pages.to_string(), "[shirane.pdf p.3, p.17]");

        let note = Citation {
            document_id: "notes".to_string(),
            source_name: NOTES_SOURCE.to_string(),
            pages: Vec::new(),
            note_topic: Some("particles".to_string()),
        };
        assert_eq!(note.to_string(), "[Note: particles]");
    }

    #[test]
    fn knowledge_mode_parses_aliases() {
        assert_eq!("RAG".parse::<KnowledgeMode>(), Ok(KnowledgeMode::Corpus));
        assert_eq!(KnowledgeMode::Auto.forced_route(), None);
        assert_eq!(KnowledgeMode::General.forced_route(), Some(Route::General));
        assert!("poetry".parse::<KnowledgeMode>().is_err());
    }

    #[test]
    fn checkpoint_follows_the_unbroken_run_of_done_pages() {
        let pages = [1, 2, 3, 4];
        let mut document = Document::new("doc", "kobun.pdf", "/scans/kobun.pdf");

        document.mark_done(3, &pages);
        document.mark_done(4, &pages);
        assert_eq!(document.checkpoint, None);

        document.mark_done(1, &pages);
        assert_eq!(document.checkpoint, Some(1));
        document.mark_done(2, &pages);
        assert_eq!(document.checkpoint, Some(4));
        assert_eq!(document.pages_done.len(), 4);
    }

    #[test]
    fn registry_entries_without_done_pages_still_load() -> Result<(), serde_json::Error> {
        let mut value = serde_json::to_value(Document::new("doc", "kobun.pdf", "/scans/kobun.pdf"))?;
        if let Some(fields) = value.as_object_mut() {
            fields.remove("pages_done");
        }
        let document: Document = serde_json::from_value(value)?;
        assert!(document.pages_done.is_empty());
        Ok(())
    }
}
