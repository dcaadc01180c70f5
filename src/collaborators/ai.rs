//! AI-provider collaborator interface
//!
//! The adapter sends a system prompt, a user prompt and optional context,
//! and expects a strict JSON object back. Timeouts and rate limits are
//! retryable; security violations and malformed JSON fail fast.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// AI adapter errors
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    /// Retryable
    #[error("AI provider timeout")]
    Timeout,

    /// Retryable
    #[error("AI provider rate limited")]
    RateLimited,

    /// Not retryable: the provider refused on policy grounds
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// Not retryable: the response was not the expected strict JSON
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Provider error: {0}")]
    Provider(String),
}

impl AiError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AiError::Timeout => ErrorCode::AiProviderTimeout,
            AiError::RateLimited => ErrorCode::AiRateLimited,
            AiError::SecurityViolation(_) => ErrorCode::SecurityViolation,
            AiError::MalformedResponse(_) => ErrorCode::AiMalformedResponse,
            AiError::Provider(_) => ErrorCode::AiProviderTimeout,
        }
    }
}

/// One generation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub context: Option<String>,
    pub user_id: Option<String>,
}

/// The strict JSON object the provider must return
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    /// Detected language of the user prompt
    pub language: String,
    /// Canonical units for the generated model (always mm internally)
    pub units: String,
    /// Extracted modeling parameters
    pub parameters: serde_json::Value,
    /// The generated Python modeling script
    pub script: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// The provider needs more information before generating
    #[serde(default)]
    pub requires_clarification: bool,
}

impl AiResponse {
    /// Parse a provider payload, enforcing the strict shape.
    pub fn parse(raw: &str) -> Result<Self, AiError> {
        let response: AiResponse = serde_json::from_str(raw)
            .map_err(|e| AiError::MalformedResponse(e.to_string()))?;
        if response.script.is_empty() && !response.requires_clarification {
            return Err(AiError::MalformedResponse(
                "response carries neither a script nor a clarification request".to_string(),
            ));
        }
        Ok(response)
    }
}

/// The AI-provider collaborator.
#[async_trait]
pub trait AiAdapter: Send + Sync {
    async fn generate(&self, request: &AiRequest) -> Result<AiResponse, AiError>;
}

/// Mock adapter producing a deterministic parametric script.
pub struct MockAiAdapter {
    /// When set, every call fails with this variant's shape
    pub failure: Option<&'static str>,
}

impl MockAiAdapter {
    pub fn new() -> Self {
        Self { failure: None }
    }

    pub fn failing_with(failure: &'static str) -> Self {
        Self {
            failure: Some(failure),
        }
    }
}

impl Default for MockAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiAdapter for MockAiAdapter {
    async fn generate(&self, request: &AiRequest) -> Result<AiResponse, AiError> {
        match self.failure {
            Some("timeout") => return Err(AiError::Timeout),
            Some("rate_limit") => return Err(AiError::RateLimited),
            Some("security") => {
                return Err(AiError::SecurityViolation("blocked prompt".to_string()))
            }
            Some("malformed") => {
                return AiResponse::parse("{\"not\": \"the schema\"}").map_err(Into::into)
            }
            _ => {}
        }

        Ok(AiResponse {
            language: "en".to_string(),
            units: "mm".to_string(),
            parameters: serde_json::json!({
                "shape": "box",
                "width": 40.0,
                "height": 20.0,
                "depth": 10.0,
            }),
            script: format!(
                "import FreeCAD\nimport Part\ndoc = FreeCAD.newDocument()\nbox = doc.addObject('Part::Box', 'Box')\nbox.Width = 40.0\nbox.Height = 20.0\nbox.Length = 10.0\ndoc.recompute()\n# prompt: {}",
                request.user_prompt.replace('\n', " ")
            ),
            warnings: Vec::new(),
            requires_clarification: false,
        })
    }
}
