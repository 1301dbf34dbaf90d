pub mod artifacts;
pub mod chunking;
pub mod citations;
pub mod classifier;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod inference;
pub mod ingest;
pub mod models;
pub mod ocr;
pub mod pages;
pub mod parser;
pub mod prompt;
pub mod queue;
pub mod registry;
pub mod router;
pub mod scorer;
pub mod session;
pub mod stores;
pub mod traits;
pub mod transcripts;

pub use chunking::{build_chunks, chunk_spans, normalize_page_text, ChunkingConfig};
pub use citations::{reconcile, ReconciledAnswer};
pub use classifier::KeywordClassifier;
pub use config::Config;
pub use embeddings::{
    create_embedder, CharacterNgramEmbedder, Embedder, OllamaEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use engine::{AnswerReport, EngineParts, HealthReport, PreparedQuery, QueryEngine, StartedAnswer};
pub use error::{
    ConfigError, EngineError, InferenceError, IngestError, OcrError, PageError, SearchError,
};
pub use inference::OllamaClient;
pub use ingest::{
    document_id_for, note_chunk, DeleteReport, FolderReport, IngestOutcome, IngestRequest,
    IngestionPipeline, JobContext, PipelineParts, SkippedSource,
};
pub use models::{
    Chunk, Citation, Document, DocumentStatus, IndexStats, KnowledgeMode, PageRange, Query,
    QueryFilters, QuestionLabel, Role, Route, RouteDecision, ScoredChunk, Turn,
};
pub use ocr::{create_ocr_engine, FallbackOcr, HttpOcrEngine, TextLayerOcr};
pub use pages::{discover_sources, open_source, ImageDirSource, PdfPageSource};
pub use parser::{ReasoningParser, Segment};
pub use prompt::{AssembledPrompt, PromptTemplates, SourceRef};
pub use queue::{IngestionQueue, JobState, JobStatus};
pub use registry::DocumentRegistry;
pub use router::{KnowledgeRouter, RoutingStats};
pub use scorer::score;
pub use session::{
    SessionEvent, SessionOutcome, SessionRegistry, SessionState, StopSignal, StreamSession,
};
pub use stores::{cosine_distance, LocalVectorStore};
pub use traits::{
    GenerateRequest, InferenceService, OcrEngine, PageSource, QuestionClassifier, TokenStream,
    VectorStore,
};
