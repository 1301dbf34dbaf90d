use crate::config::EmbeddingConfig;
use crate::error::InferenceError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    /// One vector per input text, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError>;
}

/// Offline embedder hashing character trigrams into a fixed number of buckets.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().filter(|c| !c.is_whitespace()).collect();

        if chars.is_empty() {
            return vector;
        }

        // Short CJK terms such as 未然形 would otherwise yield a single trigram.
        let width = if chars.len() < 3 { chars.len() } else { 3 };
        for window in chars.windows(width) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

/// Calls `POST /api/embed` on an Ollama server, retrying rate limits, server
/// errors and connection failures with exponential backoff.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
    max_retries: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimensions: config.dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let url = format!("{}/api/embed", self.base_url);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::warn!(attempt, delay_secs = delay.as_secs(), "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let response = match self.client.post(&url).json(&body).send().await {
                Ok(response) => response,
                Err(error) => {
                    last_error = Some(InferenceError::Unavailable(format!(
                        "embedding service at {} is not reachable: {error}",
                        self.base_url
                    )));
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                let parsed: OllamaEmbedResponse = response.json().await?;
                return check_batch(parsed.embeddings, texts.len(), self.dimensions);
            }

            let details = response.text().await.unwrap_or_default();
            let error = InferenceError::BackendResponse {
                backend: "ollama".to_string(),
                details: format!("embed returned {status}: {details}"),
            };
            if status.as_u16() == 429 || status.is_server_error() {
                last_error = Some(error);
                continue;
            }
            return Err(error);
        }

        Err(last_error.unwrap_or_else(|| {
            InferenceError::Unavailable("embedding failed after retries".to_string())
        }))
    }
}

fn check_batch(
    embeddings: Vec<Vec<f32>>,
    expected_len: usize,
    dimensions: usize,
) -> Result<Vec<Vec<f32>>, InferenceError> {
    if embeddings.len() != expected_len {
        return Err(InferenceError::BackendResponse {
            backend: "ollama".to_string(),
            details: format!(
                "expected {expected_len} embeddings, received {}",
                embeddings.len()
            ),
        });
    }
    if let Some(bad) = embeddings.iter().find(|vector| vector.len() != dimensions) {
        return Err(InferenceError::BackendResponse {
            backend: "ollama".to_string(),
            details: format!(
                "embedding has {} dimensions, configured {dimensions}",
                bad.len()
            ),
        });
    }
    Ok(embeddings)
}

/// Builds the embedder named by `embedding.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>, InferenceError> {
    match config.provider.as_str() {
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config)?)),
        _ => Ok(Box::new(CharacterNgramEmbedder {
            dimensions: config.dims,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("助動詞「けり」の用法");
        let second = embedder.embed("助動詞「けり」の用法");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        assert_eq!(embedder.embed("abc").len(), 32);
        assert_eq!(embedder.embed("").len(), 32);
    }

    #[test]
    fn short_terms_still_produce_a_direction() {
        let embedder = CharacterNgramEmbedder::default();
        let vector = embedder.embed("けり");
        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn batch_preserves_input_order() -> Result<(), Box<dyn std::error::Error>> {
        let embedder = CharacterNgramEmbedder { dimensions: 16 };
        let texts = vec!["未然形".to_string(), "源氏物語".to_string()];
        let batch = embedder.embed_batch(&texts).await?;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], embedder.embed("未然形"));
        assert_eq!(batch[1], embedder.embed("源氏物語"));
        Ok(())
    }

    #[test]
    fn mismatched_batch_is_rejected() {
        let error = check_batch(vec![vec![0.0; 4]], 2, 4).unwrap_err();
        assert!(matches!(error, InferenceError::BackendResponse { .. }));
        let error = check_batch(vec![vec![0.0; 3]], 1, 4).unwrap_err();
        assert!(matches!(error, InferenceError::BackendResponse { .. }));
    }
}
