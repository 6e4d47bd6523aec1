//! Backend classifier trait and its request/response types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{ComponentId, ComponentKind};

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("backend error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("failed to parse response: {0}")]
    ParseError(String),
    #[error("backend is not configured")]
    NotConfigured,
}

/// One unclassified region sent to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationRequest {
    pub component: ComponentId,
    /// PNG-encoded binary crop, ink white on black.
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub rotation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierVerdict {
    pub kind: ComponentKind,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[async_trait]
pub trait SymbolClassifier: Send + Sync {
    fn name(&self) -> &str;

    async fn is_available(&self) -> bool;

    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<ClassifierVerdict, ClassifierError>;
}
