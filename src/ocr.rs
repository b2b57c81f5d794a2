//! OCR provider abstraction and implementations.
//!
//! Defines the [`TextExtractor`] trait and concrete implementations:
//! - **[`DisabledExtractor`]**: fails with a fatal error; used when OCR is not configured.
//! - **[`HttpExtractor`]**: posts the image to an OCR HTTP endpoint.
//!
//! Use [`create_extractor`] to instantiate the provider named in `[ocr]`.
//!
//! # HTTP contract
//!
//! ```text
//! POST <ocr.endpoint>
//! Authorization: Bearer $BIZCARD_OCR_API_KEY      (when set)
//! { "image": "<base64>", "content_type": "image/jpeg" }
//!
//! 200 { "lines": [{ "text": "Jane Doe", "confidence": 0.98 }, ...],
//!       "confidence": 0.95 }
//! ```
//!
//! A plain `{ "text": "..." }` body is also accepted and split into lines.
//!
//! # Error classes
//!
//! - HTTP 408, 429 and 5xx, and network errors → transient
//! - other HTTP 4xx (the provider rejected the image) → permanent
//! - 401/403 → fatal (bad credentials)
//!
//! The extractor makes a single attempt per call; the extraction worker
//! wraps it in [`retry`](crate::retry::retry) with the `[ocr]` policy.

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::time::Duration;

use crate::config::OcrConfig;
use crate::error::{PipelineError, PipelineResult};

/// Environment variable holding the OCR API key.
pub const OCR_API_KEY_ENV: &str = "BIZCARD_OCR_API_KEY";

/// One recognized line of text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OcrLine {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// What the OCR provider returned for one image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OcrOutput {
    pub lines: Vec<OcrLine>,
    /// Overall confidence as reported by the provider, if any.
    pub confidence: Option<f64>,
}

impl OcrOutput {
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| OcrLine {
                    text: l.to_string(),
                    confidence: None,
                })
                .collect(),
            confidence: None,
        }
    }

    pub fn line_texts(&self) -> Vec<String> {
        self.lines.iter().map(|l| l.text.clone()).collect()
    }

    pub fn text(&self) -> String {
        self.line_texts().join("\n")
    }

    /// The reported overall confidence, or the mean of per-line confidences.
    pub fn confidence(&self) -> Option<f64> {
        if self.confidence.is_some() {
            return self.confidence;
        }
        let scores: Vec<f64> = self.lines.iter().filter_map(|l| l.confidence).collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }
}

#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Provider name, recorded in each record's metadata.
    fn name(&self) -> &str;

    async fn extract(&self, image: &[u8], content_type: &str) -> PipelineResult<OcrOutput>;
}

// ============ Disabled Provider ============

/// Used when `ocr.provider = "disabled"`. Every call fails with a fatal
/// configuration error, so the extraction worker stops without committing.
pub struct DisabledExtractor;

#[async_trait]
impl TextExtractor for DisabledExtractor {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn extract(&self, _image: &[u8], _content_type: &str) -> PipelineResult<OcrOutput> {
        Err(PipelineError::Config(
            "OCR is disabled. Set [ocr] provider in config.".to_string(),
        ))
    }
}

// ============ HTTP Provider ============

pub struct HttpExtractor {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpExtractor {
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ocr.endpoint required for http provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            endpoint,
            api_key: std::env::var(OCR_API_KEY_ENV).ok(),
            client,
        })
    }
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(default)]
    lines: Option<Vec<OcrLine>>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

fn parse_ocr_response(body: &str) -> PipelineResult<OcrOutput> {
    let resp: OcrResponse =
        serde_json::from_str(body).map_err(|e| PipelineError::decode("OCR response", e))?;
    let mut output = match (resp.lines, resp.text) {
        (Some(lines), _) => OcrOutput {
            lines,
            confidence: None,
        },
        (None, Some(text)) => OcrOutput::from_text(&text),
        (None, None) => {
            return Err(PipelineError::permanent(
                "ocr",
                "response has neither lines nor text",
            ))
        }
    };
    output.confidence = resp.confidence;
    Ok(output)
}

#[async_trait]
impl TextExtractor for HttpExtractor {
    fn name(&self) -> &str {
        "http"
    }

    async fn extract(&self, image: &[u8], content_type: &str) -> PipelineResult<OcrOutput> {
        let body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image),
            "content_type": content_type,
        });

        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| PipelineError::transient("ocr", e))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| PipelineError::transient("ocr", e))?;

        match status {
            200..=299 => parse_ocr_response(&text),
            401 | 403 => Err(PipelineError::Config(format!(
                "OCR endpoint rejected credentials (HTTP {})",
                status
            ))),
            _ => Err(PipelineError::from_status("ocr", status, &text)),
        }
    }
}

/// Create the [`TextExtractor`] named by `config.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledExtractor`] |
/// | `"http"` | [`HttpExtractor`] |
pub fn create_extractor(config: &OcrConfig) -> Result<Box<dyn TextExtractor>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledExtractor)),
        "http" => Ok(Box::new(HttpExtractor::new(config)?)),
        other => bail!("Unknown OCR provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn parses_line_response_with_confidence() {
        let out = parse_ocr_response(
            r#"{"lines":[{"text":"Jane Doe","confidence":0.9},{"text":"Acme","confidence":0.7}],"confidence":0.85}"#,
        )
        .unwrap();
        assert_eq!(out.text(), "Jane Doe\nAcme");
        assert_eq!(out.confidence(), Some(0.85));
    }

    #[test]
    fn confidence_falls_back_to_line_mean() {
        let out =
            parse_ocr_response(r#"{"lines":[{"text":"a","confidence":0.5},{"text":"b","confidence":1.0}]}"#)
                .unwrap();
        assert_eq!(out.confidence(), Some(0.75));
    }

    #[test]
    fn parses_plain_text_response() {
        let out = parse_ocr_response(r#"{"text":"Jane Doe\n\n  Acme Corp \n"}"#).unwrap();
        assert_eq!(out.line_texts(), vec!["Jane Doe", "Acme Corp"]);
        assert_eq!(out.confidence(), None);
    }

    #[test]
    fn malformed_response_is_permanent() {
        assert_eq!(
            parse_ocr_response("not json").unwrap_err().class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            parse_ocr_response("{}").unwrap_err().class(),
            ErrorClass::Permanent
        );
    }

    #[tokio::test]
    async fn disabled_extractor_is_fatal() {
        let config = OcrConfig::default();
        let extractor = create_extractor(&config).unwrap();
        assert_eq!(extractor.name(), "disabled");
        let err = extractor.extract(b"img", "image/jpeg").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = OcrConfig {
            provider: "magic".into(),
            ..OcrConfig::default()
        };
        assert!(create_extractor(&config).is_err());
    }
}
