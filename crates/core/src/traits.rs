use crate::error::{InferenceError, OcrError, PageError, SearchError};
use crate::models::{Chunk, IndexStats, QueryFilters, QuestionLabel, ScoredChunk};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces chunks by `chunk_id`.
    async fn upsert(&self, chunks: Vec<Chunk>) -> Result<(), SearchError>;

    /// Nearest neighbours ordered by ascending cosine distance. An empty store
    /// yields an empty result.
    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filters: &QueryFilters,
    ) -> Result<Vec<ScoredChunk>, SearchError>;

    async fn stats(&self) -> Result<IndexStats, SearchError>;

    async fn count_document(&self, document_id: &str) -> Result<usize, SearchError>;

    /// Returns the number of chunks removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize, SearchError>;

    /// Removes chunks whose substantial text repeats an earlier chunk, keeping
    /// the first in document/page order. Short or mostly-punctuation text is
    /// never treated as a duplicate. Returns the number removed.
    async fn clean_duplicates(&self, source_name: Option<&str>) -> Result<usize, SearchError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Pdf,
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Pdf => "pdf",
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Pdf => "application/pdf",
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "pdf" => Some(ImageFormat::Pdf),
            "png" => Some(ImageFormat::Png),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }
}

/// One rendered page, ready for OCR. For PDF sources this is a single-page
/// PDF; for scanned directories it is the image file itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub page: u32,
    pub format: ImageFormat,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OcrRegion {
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OcrOutput {
    pub regions: Vec<OcrRegion>,
}

impl OcrOutput {
    pub fn from_text(text: impl Into<String>, confidence: f32) -> Self {
        let text = text.into();
        if text.trim().is_empty() {
            return Self::default();
        }
        Self {
            regions: vec![OcrRegion { text, confidence }],
        }
    }

    /// Text of the regions at or above `min_confidence`, one region per
    /// paragraph.
    pub fn text_above(&self, min_confidence: f32) -> String {
        self.regions
            .iter()
            .filter(|region| region.confidence >= min_confidence)
            .map(|region| region.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn mean_confidence(&self) -> f32 {
        if self.regions.is_empty() {
            return 0.0;
        }
        self.regions.iter().map(|region| region.confidence).sum::<f32>() / self.regions.len() as f32
    }
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Blank input yields an empty output, not an error.
    async fn recognize(&self, image: &PageImage) -> Result<OcrOutput, OcrError>;
}

/// A paged source document (PDF or a directory of page scans).
pub trait PageSource: Send + Sync {
    fn page_numbers(&self) -> Vec<u32>;

    fn render(&self, page: u32) -> Result<PageImage, PageError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

/// Token fragments in arrival order. Dropping the stream abandons the request.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

#[async_trait]
pub trait InferenceService: Send + Sync {
    fn model(&self) -> &str;

    /// Fails with [`InferenceError::Unavailable`] when the request cannot be
    /// started.
    async fn generate(&self, request: GenerateRequest) -> Result<TokenStream, InferenceError>;

    async fn list_models(&self) -> Result<Vec<String>, InferenceError>;
}

pub trait QuestionClassifier: Send + Sync {
    fn classify(&self, text: &str) -> QuestionLabel;
}
