use crate::config::OcrConfig;
use crate::error::OcrError;
use crate::traits::{ImageFormat, OcrEngine, OcrOutput, OcrRegion, PageImage};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use serde::{Deserialize, Serialize};

/// Reads the embedded text layer of a single-page PDF. Scanned pages without
/// a text layer come back empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextLayerOcr;

#[async_trait]
impl OcrEngine for TextLayerOcr {
    async fn recognize(&self, image: &PageImage) -> Result<OcrOutput, OcrError> {
        if image.format != ImageFormat::Pdf {
            return Err(OcrError::Unsupported(format!(
                "text layer reader cannot read {} images",
                image.format.extension()
            )));
        }

        let document = Document::load_mem(&image.bytes)
            .map_err(|error| OcrError::PdfParse(error.to_string()))?;
        let pages: Vec<u32> = document.get_pages().keys().copied().collect();
        let text = document
            .extract_text(&pages)
            .map_err(|error| OcrError::PdfParse(error.to_string()))?;

        Ok(OcrOutput::from_text(text, 1.0))
    }
}

#[derive(Debug, Clone, Serialize)]
struct HttpOcrRequest<'a> {
    image_base64: String,
    mime_type: &'a str,
    page: u32,
    languages: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpOcrResponse {
    #[serde(default)]
    regions: Option<Vec<HttpOcrRegion>>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpOcrRegion {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Posts the page as base64 JSON to an OCR endpoint. A bearer token is read
/// from the environment variable named in the config.
#[derive(Debug, Clone)]
pub struct HttpOcrEngine {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    languages: String,
}

impl HttpOcrEngine {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, languages: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
            languages: languages.into(),
        }
    }

    pub fn from_config(config: &OcrConfig) -> Option<Self> {
        let endpoint = config.endpoint.as_deref()?.trim();
        if endpoint.is_empty() {
            return None;
        }

        let api_key = std::env::var(&config.api_key_env).ok().and_then(|value| {
            let key = value.trim().to_string();
            if key.is_empty() {
                None
            } else {
                Some(key)
            }
        });

        Some(Self::new(endpoint, api_key, config.languages.clone()))
    }
}

#[async_trait]
impl OcrEngine for HttpOcrEngine {
    async fn recognize(&self, image: &PageImage) -> Result<OcrOutput, OcrError> {
        let payload = HttpOcrRequest {
            image_base64: STANDARD.encode(&image.bytes),
            mime_type: image.format.mime_type(),
            page: image.page,
            languages: &self.languages,
        };

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(OcrError::Status(format!(
                "OCR request to {} for page {} returned {}",
                self.endpoint,
                image.page,
                response.status()
            )));
        }

        let payload: HttpOcrResponse = response.json().await?;
        payload_to_output(&payload)
    }
}

fn payload_to_output(payload: &HttpOcrResponse) -> Result<OcrOutput, OcrError> {
    if let Some(listed) = &payload.regions {
        let regions = listed
            .iter()
            .filter_map(|region| {
                let text = region.text.as_ref()?.trim().to_string();
                if text.is_empty() {
                    return None;
                }
                Some(OcrRegion {
                    text,
                    confidence: region.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
                })
            })
            .collect::<Vec<_>>();
        return Ok(OcrOutput { regions });
    }

    if let Some(text) = &payload.text {
        let confidence = payload.confidence.unwrap_or(1.0).clamp(0.0, 1.0);
        return Ok(OcrOutput::from_text(text.trim(), confidence));
    }

    Err(OcrError::Malformed(
        "response carries neither `regions` nor `text`".to_string(),
    ))
}

/// Tries `primary` first and falls back when it yields no text or cannot read
/// the page format.
pub struct FallbackOcr {
    primary: Box<dyn OcrEngine>,
    fallback: Box<dyn OcrEngine>,
}

impl FallbackOcr {
    pub fn new(primary: Box<dyn OcrEngine>, fallback: Box<dyn OcrEngine>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl OcrEngine for FallbackOcr {
    async fn recognize(&self, image: &PageImage) -> Result<OcrOutput, OcrError> {
        match self.primary.recognize(image).await {
            Ok(output) if !output.regions.is_empty() => Ok(output),
            Ok(_) | Err(OcrError::Unsupported(_)) | Err(OcrError::PdfParse(_)) => {
                tracing::debug!(page = image.page, "primary OCR empty, using fallback engine");
                self.fallback.recognize(image).await
            }
            Err(error) => Err(error),
        }
    }
}

/// Builds the OCR engine named by `ocr.provider`.
pub fn create_ocr_engine(config: &OcrConfig) -> Result<Box<dyn OcrEngine>, OcrError> {
    match config.provider.as_str() {
        "http" => {
            let http = HttpOcrEngine::from_config(config).ok_or_else(|| {
                OcrError::Unsupported("ocr.endpoint is required for the http provider".to_string())
            })?;
            Ok(Box::new(FallbackOcr::new(Box::new(TextLayerOcr), Box::new(http))))
        }
        _ => Ok(Box::new(TextLayerOcr)),
    }
}
