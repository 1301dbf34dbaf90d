use crate::config::InferenceConfig;
use crate::error::InferenceError;
use crate::traits::{GenerateRequest, InferenceService, TokenStream};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;

/// Streaming client for an Ollama server.
///
/// Only the connection has a timeout. A generation may run as long as the
/// model keeps producing tokens; callers stop it by dropping the stream.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct GenerateLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

impl OllamaClient {
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceError> {
        url::Url::parse(&config.url)?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl InferenceService for OllamaClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: GenerateRequest) -> Result<TokenStream, InferenceError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": request.prompt,
            "stream": true,
            "options": {
                "temperature": request.temperature,
                "top_p": request.top_p,
                "num_predict": request.max_tokens,
            },
        });

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                InferenceError::Unavailable(format!(
                    "inference service at {} is not reachable: {error}",
                    self.base_url
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            return Err(InferenceError::Unavailable(format!(
                "model {} rejected the request ({status}): {details}",
                self.model
            )));
        }

        tracing::debug!(model = %self.model, "generation stream opened");
        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let mut lines = LineBuffer::default();
            let mut finished = false;
            while !finished {
                let Some(chunk) = bytes.next().await else {
                    break;
                };
                let chunk = chunk.map_err(|error| InferenceError::Stream(error.to_string()))?;
                for line in lines.push(&chunk) {
                    let event = parse_line(&line)?;
                    if !event.response.is_empty() {
                        yield event.response;
                    }
                    if event.done {
                        finished = true;
                        break;
                    }
                }
            }
            if !finished {
                if let Some(line) = lines.finish() {
                    let event = parse_line(&line)?;
                    if !event.response.is_empty() {
                        yield event.response;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|error| {
                InferenceError::Unavailable(format!(
                    "inference service at {} is not reachable: {error}",
                    self.base_url
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(InferenceError::BackendResponse {
                backend: "ollama".to_string(),
                details: format!("tags returned {status}"),
            });
        }

        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|entry| entry.name).collect())
    }
}

/// Parses one NDJSON line. A server-side `error` field ends the stream.
fn parse_line(line: &str) -> Result<GenerateLine, InferenceError> {
    let event: GenerateLine =
        serde_json::from_str(line).map_err(|error| InferenceError::BackendResponse {
            backend: "ollama".to_string(),
            details: format!("unreadable stream line: {error}"),
        })?;
    if let Some(message) = event.error {
        return Err(InferenceError::Stream(message));
    }
    Ok(event)
}

/// Reassembles newline-delimited records from arbitrarily cut byte chunks.
/// Bytes are held until the newline so multi-byte characters are never split.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(position) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=position).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!text.is_empty()).then_some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_survive_arbitrary_cuts() {
        let payload = "{\"response\":\"未然\",\"done\":false}\n{\"response\":\"形\",\"done\":true}\n";
        let bytes = payload.as_bytes();
        let mut buffer = LineBuffer::default();
        let mut lines = Vec::new();
        // Cut inside the three-byte encoding of 未.
        lines.extend(buffer.push(&bytes[..14]));
        lines.extend(buffer.push(&bytes[14..40]));
        lines.extend(buffer.push(&bytes[40..]));

        assert_eq!(lines.len(), 2);
        assert_eq!(parse_line(&lines[0]).map(|event| event.response).ok(), Some("未然".to_string()));
        let last = parse_line(&lines[1]).ok();
        assert_eq!(last.as_ref().map(|event| event.done), Some(true));
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn trailing_line_without_newline_is_flushed() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"{\"response\":\"x\"}").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("{\"response\":\"x\"}"));
    }

    #[test]
    fn server_error_line_fails_the_stream() {
        let error = parse_line("{\"error\":\"model not found\"}").unwrap_err();
        assert!(matches!(error, InferenceError::Stream(message) if message == "model not found"));

        let error = parse_line("not json").unwrap_err();
        assert!(matches!(error, InferenceError::BackendResponse { .. }));
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let config = InferenceConfig {
            url: "http://127.0.0.1:9".to_string(),
            connect_timeout_secs: 1,
            ..InferenceConfig::default()
        };
        let client = match OllamaClient::new(&config) {
            Ok(client) => client,
            Err(error) => panic!("client should build: {error}"),
        };
        let request = GenerateRequest {
            prompt: "hi".to_string(),
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 8,
        };

        let result = client.generate(request).await;
        assert!(matches!(result, Err(InferenceError::Unavailable(_))));
        assert!(matches!(client.list_models().await, Err(InferenceError::Unavailable(_))));
    }

    #[test]
    fn invalid_url_is_rejected() {
        let config = InferenceConfig {
            url: "not a url".to_string(),
            ..InferenceConfig::default()
        };
        assert!(matches!(OllamaClient::new(&config), Err(InferenceError::Url(_))));
    }
}
