use crate::error::ConfigError;
use crate::prompt::PromptTemplates;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub retrieval: RetrievalConfig,
    pub router: RouterConfig,
    pub embedding: EmbeddingConfig,
    pub inference: InferenceConfig,
    pub ocr: OcrConfig,
    pub prompts: PromptConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Holds `chunks.jsonl` and `documents.json`.
    pub data_dir: PathBuf,
    /// Holds page artifacts and OCR transcripts.
    pub work_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            work_dir: PathBuf::from("./processed_docs"),
        }
    }
}

impl StorageConfig {
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("chunks.jsonl")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("documents.json")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.work_dir.join("artifacts")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.work_dir.join("transcripts")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub chunk_max_chars: usize,
    pub chunk_overlap_chars: usize,
    pub min_chunk_chars: usize,
    /// Persist the checkpoint after this many pages.
    pub checkpoint_every: u32,
    /// OCR regions below this confidence are dropped.
    pub min_ocr_confidence: f32,
    pub embed_batch_size: usize,
    /// Maximum number of ingestion jobs running at once.
    pub queue_depth: usize,
    pub keep_artifacts: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_max_chars: 500,
            chunk_overlap_chars: 50,
            min_chunk_chars: 1,
            checkpoint_every: 10,
            min_ocr_confidence: 0.0,
            embed_batch_size: 64,
            queue_depth: 2,
            keep_artifacts: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// A result with distance at or below this counts as a hit.
    pub distance_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            distance_threshold: 0.40,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub high_density: f32,
    pub low_density: f32,
    pub min_diversity: usize,
    pub density_weight: f32,
    pub diversity_weight: f32,
    /// Diversity at which the normalised diversity term saturates.
    pub diversity_saturation: usize,
    /// Multiplier applied to best-effort and fallback decisions.
    pub degraded_factor: f32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            high_density: 0.6,
            low_density: 0.2,
            min_diversity: 2,
            density_weight: 0.7,
            diversity_weight: 0.3,
            diversity_saturation: 3,
            degraded_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `ngram` (offline, deterministic) or `ollama`.
    pub provider: String,
    pub model: String,
    pub url: String,
    pub dims: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "ngram".to_string(),
            model: "nomic-embed-text".to_string(),
            url: "http://localhost:11434".to_string(),
            dims: crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS,
            max_retries: 3,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub url: String,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub connect_timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "qwen2.5:72b".to_string(),
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 2_000,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// `text-layer` (read embedded PDF text) or `http`.
    pub provider: String,
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the endpoint's bearer token.
    pub api_key_env: String,
    pub languages: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: "text-layer".to_string(),
            endpoint: None,
            api_key_env: "OCR_API_KEY".to_string(),
            languages: "jpn+eng".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub corpus: Option<String>,
    pub general: Option<String>,
    pub hybrid: Option<String>,
    pub clarification: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Falls back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "no configuration file, using defaults");
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ingest = &self.ingest;
        if ingest.chunk_max_chars == 0 {
            return Err(invalid("ingest.chunk_max_chars", "must be greater than zero"));
        }
        if ingest.chunk_overlap_chars >= ingest.chunk_max_chars {
            return Err(invalid(
                "ingest.chunk_overlap_chars",
                "must be smaller than ingest.chunk_max_chars",
            ));
        }
        if ingest.checkpoint_every == 0 {
            return Err(invalid("ingest.checkpoint_every", "must be at least 1"));
        }
        if ingest.queue_depth == 0 {
            return Err(invalid("ingest.queue_depth", "must be at least 1"));
        }
        if ingest.embed_batch_size == 0 {
            return Err(invalid("ingest.embed_batch_size", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&ingest.min_ocr_confidence) {
            return Err(invalid("ingest.min_ocr_confidence", "must be within [0, 1]"));
        }

        if self.retrieval.top_k == 0 {
            return Err(invalid("retrieval.top_k", "must be at least 1"));
        }
        if self.retrieval.distance_threshold < 0.0 {
            return Err(invalid("retrieval.distance_threshold", "must not be negative"));
        }

        let router = &self.router;
        for (field, value) in [
            ("router.high_density", router.high_density),
            ("router.low_density", router.low_density),
            ("router.density_weight", router.density_weight),
            ("router.diversity_weight", router.diversity_weight),
            ("router.degraded_factor", router.degraded_factor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, "must be within [0, 1]"));
            }
        }
        if router.low_density >= router.high_density {
            return Err(invalid(
                "router.low_density",
                "must be smaller than router.high_density",
            ));
        }
        if router.diversity_saturation == 0 {
            return Err(invalid("router.diversity_saturation", "must be at least 1"));
        }

        if !matches!(self.embedding.provider.as_str(), "ngram" | "ollama") {
            return Err(invalid("embedding.provider", "expected `ngram` or `ollama`"));
        }
        if self.embedding.dims == 0 {
            return Err(invalid("embedding.dims", "must be greater than zero"));
        }
        url::Url::parse(&self.inference.url)
            .map_err(|error| invalid("inference.url", &error.to_string()))?;

        match self.ocr.provider.as_str() {
            "text-layer" => {}
            "http" => {
                if self.ocr.endpoint.as_deref().map_or(true, |value| value.trim().is_empty()) {
                    return Err(invalid("ocr.endpoint", "required when ocr.provider = \"http\""));
                }
            }
            _ => return Err(invalid("ocr.provider", "expected `text-layer` or `http`")),
        }

        PromptTemplates::from_config(&self.prompts)?;
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").expect("defaults are valid");
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.distance_threshold - 0.40).abs() < f32::EPSILON);
        assert_eq!(config.router.min_diversity, 2);
        assert_eq!(config.storage.index_path(), PathBuf::from("./data/chunks.jsonl"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [retrieval]
            distance_threshold = 0.25

            [ingest]
            chunk_max_chars = 300
            checkpoint_every = 4
            "#,
        )
        .expect("config should parse");

        assert!((config.retrieval.distance_threshold - 0.25).abs() < f32::EPSILON);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.ingest.chunk_max_chars, 300);
        assert_eq!(config.ingest.chunk_overlap_chars, 50);
        assert_eq!(config.ingest.checkpoint_every, 4);
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let error = Config::from_toml(
            r#"
            [ingest]
            chunk_max_chars = 100
            chunk_overlap_chars = 100
            "#,
        )
        .unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { field, .. } if field == "ingest.chunk_overlap_chars"));
    }

    #[test]
    fn density_thresholds_must_be_ordered() {
        let error = Config::from_toml(
            r#"
            [router]
            high_density = 0.3
            low_density = 0.5
            "#,
        )
        .unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { field, .. } if field == "router.low_density"));
    }

    #[test]
    fn http_ocr_requires_endpoint() {
        let error = Config::from_toml(
            r#"
            [ocr]
            provider = "http"
            "#,
        )
        .unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { field, .. } if field == "ocr.endpoint"));
    }

    #[test]
    fn broken_prompt_template_is_rejected_at_load() {
        let error = Config::from_toml(
            r#"
            [prompts]
            corpus = "Answer {question} without any context"
            "#,
        )
        .unwrap_err();
        assert!(matches!(error, ConfigError::MissingPlaceholder { .. }));
    }
}
