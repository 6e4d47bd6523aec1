//! HTTP classification backend.
//!
//! The crop is POSTed as `image/png`; the service answers with a JSON object
//! `{"kind": ..., "confidence": ..., "label": ..., "value": ...}`. Prose
//! around the object is tolerated, since model-backed services often add it.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::provider::{ClassificationRequest, ClassifierError, ClassifierVerdict, SymbolClassifier};
use crate::config::BackendConfig;
use crate::core::SchemaScanError;
use crate::model::ComponentKind;

const PROBE_TIMEOUT_SECS: u64 = 3;

pub struct HttpSymbolClassifier {
    client: Client,
    url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    kind: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

impl HttpSymbolClassifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_default();
        Self {
            client,
            url: url.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, SchemaScanError> {
        let url = config
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SchemaScanError::InvalidConfig("backend.url is not set".to_string()))?;
        let classifier = Self::new(url, Duration::from_secs(config.timeout_secs));
        Ok(match &config.api_key {
            Some(key) if !key.is_empty() => classifier.with_api_key(key.clone()),
            _ => classifier,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SymbolClassifier for HttpSymbolClassifier {
    fn name(&self) -> &str {
        "http"
    }

    async fn is_available(&self) -> bool {
        let probe = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .send()
            .await;
        match probe {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                tracing::debug!("classification backend unreachable: {}", e);
                false
            }
        }
    }

    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassifierVerdict, ClassifierError> {
        if self.url.is_empty() {
            return Err(ClassifierError::NotConfigured);
        }
        tracing::debug!(component = %request.component, bytes = request.png.len(), "sending crop to backend");

        let mut builder = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .query(&[
                ("width", request.width.to_string()),
                ("height", request.height.to_string()),
                ("rotation", request.rotation.to_string()),
            ])
            .body(request.png.clone());
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ClassifierError::ApiError { status, message });
        }
        let text = response.text().await?;
        parse_verdict(&text)
    }
}

/// Parse a verdict from a response body that may wrap the JSON in prose.
pub fn parse_verdict(text: &str) -> Result<ClassifierVerdict, ClassifierError> {
    let json = extract_json_object(text)
        .ok_or_else(|| ClassifierError::ParseError("no JSON object in response".to_string()))?;
    let raw: RawVerdict =
        serde_json::from_str(&json).map_err(|e| ClassifierError::ParseError(e.to_string()))?;
    let kind = ComponentKind::parse_lenient(&raw.kind)
        .ok_or_else(|| ClassifierError::ParseError(format!("unknown kind '{}'", raw.kind)))?;
    Ok(ClassifierVerdict {
        kind,
        confidence: raw.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
        label: raw.label.filter(|s| !s.is_empty()),
        value: raw.value.filter(|s| !s.is_empty()),
    })
}

/// First balanced `{...}` object in `text`, ignoring braces inside strings.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
