use thiserror::Error;

/// Failure that ends ingestion of a whole document. The document is marked
/// `failed` (or left resumable when the job was interrupted).
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown document: {0}")]
    UnknownDocument(String),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("index error: {0}")]
    Index(#[from] SearchError),

    #[error("embedding error: {0}")]
    Embedding(#[from] InferenceError),
}

/// Per-page failure. Recorded in the document's error log; processing moves
/// on to the next page.
#[derive(Debug, Error)]
#[error("page {page}: {reason}")]
pub struct PageError {
    pub page: u32,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OCR endpoint returned {0}")]
    Status(String),

    #[error("OCR response was malformed: {0}")]
    Malformed(String),

    #[error("page image is not supported by this engine: {0}")]
    Unsupported(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("embedding dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("search request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    /// The service could not be reached or refused the request before any
    /// token was produced.
    #[error("model unavailable: {0}")]
    Unavailable(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("token stream failed: {0}")]
    Stream(String),
}

impl InferenceError {
    /// Message safe to show to a learner.
    pub fn user_message(&self) -> &'static str {
        match self {
            InferenceError::Unavailable(_) | InferenceError::Http(_) | InferenceError::Url(_) => {
                "The language model is not reachable right now. Check that it is running and try again."
            }
            InferenceError::BackendResponse { .. } => {
                "The language model sent a response that could not be understood. Please try again."
            }
            InferenceError::Stream(_) => {
                "The answer was interrupted before it finished. Please ask again."
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: String, reason: String },

    #[error("template for {route} is missing placeholder `{placeholder}`")]
    MissingPlaceholder { route: String, placeholder: String },

    #[error("template for {route} must not use placeholder `{placeholder}`")]
    ForbiddenPlaceholder { route: String, placeholder: String },

    #[error("regex error: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("query is empty")]
    EmptyQuery,

    #[error(transparent)]
    Index(#[from] SearchError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl EngineError {
    pub fn user_message(&self) -> String {
        match self {
            EngineError::EmptyQuery => "Please type a question first.".to_string(),
            EngineError::Index(_) => {
                "Your study library could not be searched. Please try again.".to_string()
            }
            EngineError::Inference(error) => error.user_message().to_string(),
            EngineError::Ingest(error) => format!("The note could not be saved: {error}"),
        }
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
