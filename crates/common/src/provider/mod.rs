//! Text recognition providers
//!
//! Provides a single call interface over:
//! - A remote vision API (document text detection)
//! - A simulated recognizer for development and tests

use crate::config::ExtractionConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single recognition call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Worth another attempt later
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Timeout(_) | ProviderError::Unavailable(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

/// Remote text recognition
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize_text(&self, file_bytes: &[u8]) -> std::result::Result<String, ProviderError>;

    fn name(&self) -> &str;
}

/// Document text detection over the Vision REST API
pub struct VisionRecognizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct AnnotateRequest {
    requests: Vec<AnnotateImage>,
}

#[derive(Serialize)]
struct AnnotateImage {
    image: ImageContent,
    features: Vec<Feature>,
}

#[derive(Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    full_text_annotation: Option<FullText>,
    error: Option<ApiStatus>,
}

#[derive(Deserialize)]
struct FullText {
    text: String,
}

#[derive(Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

impl VisionRecognizer {
    pub fn new(api_key: String, base_url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://vision.googleapis.com/v1".to_string()),
        })
    }

    fn request_body(file_bytes: &[u8]) -> AnnotateRequest {
        AnnotateRequest {
            requests: vec![AnnotateImage {
                image: ImageContent {
                    content: base64::engine::general_purpose::STANDARD.encode(file_bytes),
                },
                features: vec![Feature {
                    kind: "DOCUMENT_TEXT_DETECTION",
                }],
            }],
        }
    }

    fn parse_response(body: AnnotateResponse) -> std::result::Result<String, ProviderError> {
        let first = body
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("empty responses".to_string()))?;

        if let Some(error) = first.error {
            return Err(ProviderError::Rejected {
                status: 200,
                message: error.message,
            });
        }

        // No annotation means no text was found
        Ok(first.full_text_annotation.map(|t| t.text).unwrap_or_default())
    }
}

#[async_trait]
impl TextRecognizer for VisionRecognizer {
    async fn recognize_text(&self, file_bytes: &[u8]) -> std::result::Result<String, ProviderError> {
        let url = format!("{}/images:annotate", self.base_url);

        let response = self
            .client
            .post(&url)
            .query(&[("key", &self.api_key)])
            .json(&Self::request_body(file_bytes))
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Unavailable(format!("API error {}: {}", status, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: AnnotateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Self::parse_response(body)
    }

    fn name(&self) -> &str {
        "vision"
    }
}

/// Reads the file as UTF-8 text; binary content yields no text
#[derive(Default)]
pub struct SimulatedRecognizer;

#[async_trait]
impl TextRecognizer for SimulatedRecognizer {
    async fn recognize_text(&self, file_bytes: &[u8]) -> std::result::Result<String, ProviderError> {
        Ok(std::str::from_utf8(file_bytes)
            .map(str::to_string)
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

/// Create a recognizer based on configuration
pub fn create_recognizer(config: &ExtractionConfig) -> Result<Arc<dyn TextRecognizer>> {
    match config.provider.as_str() {
        "vision" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "extraction.api_key is required for the vision provider".to_string(),
            })?;
            Ok(Arc::new(VisionRecognizer::new(
                key,
                config.api_base.clone(),
                config.provider_timeout(),
            )?))
        }
        "simulated" => Ok(Arc::new(SimulatedRecognizer)),
        other => {
            tracing::warn!(provider = other, "Unknown recognition provider, using simulated");
            Ok(Arc::new(SimulatedRecognizer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_reads_text() {
        let recognizer = SimulatedRecognizer;
        let text = recognizer.recognize_text("CPF 123.456.789-00".as_bytes()).await.unwrap();
        assert_eq!(text, "CPF 123.456.789-00");
        let binary = recognizer.recognize_text(&[0xff, 0xfe, 0x00]).await.unwrap();
        assert!(binary.is_empty());
    }

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::Timeout(Duration::from_secs(60)).is_transient());
        assert!(ProviderError::Unavailable("503".into()).is_transient());
        assert!(!ProviderError::Rejected { status: 400, message: "bad image".into() }.is_transient());
        assert!(!ProviderError::InvalidResponse("{}".into()).is_transient());
    }

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(VisionRecognizer::request_body(b"abc")).unwrap();
        assert_eq!(body["requests"][0]["image"]["content"], "YWJj");
        assert_eq!(body["requests"][0]["features"][0]["type"], "DOCUMENT_TEXT_DETECTION");
    }

    #[test]
    fn test_parse_response() {
        let ok: AnnotateResponse = serde_json::from_str(
            r#"{"responses":[{"fullTextAnnotation":{"text":"NOME\nFulano"}}]}"#,
        )
        .unwrap();
        assert_eq!(VisionRecognizer::parse_response(ok).unwrap(), "NOME\nFulano");

        let failed: AnnotateResponse =
            serde_json::from_str(r#"{"responses":[{"error":{"message":"Bad image data"}}]}"#).unwrap();
        assert!(matches!(
            VisionRecognizer::parse_response(failed),
            Err(ProviderError::Rejected { .. })
        ));
    }

    #[test]
    fn test_vision_requires_key() {
        let config = ExtractionConfig {
            provider: "vision".into(),
            ..ExtractionConfig::default()
        };
        assert!(create_recognizer(&config).is_err());

        let fallback = ExtractionConfig {
            provider: "unknown".into(),
            ..ExtractionConfig::default()
        };
        assert_eq!(create_recognizer(&fallback).unwrap().name(), "simulated");
    }
}
