//! Language-model provider abstraction and implementations.
//!
//! [`LlmProvider`] covers structured extraction, embedding, and streamed
//! generation. Implementations:
//! - **[`GeminiProvider`]**: the Google Generative Language REST API.
//! - **[`MockProvider`]**: deterministic and network-free, for tests and offline runs.
//!
//! # Provider Selection
//!
//! Use [`create_provider`] once at startup and pass the returned handle to
//! the components that need it. An unknown provider name is a startup error,
//! never a per-job one:
//!
//! ```rust
//! # use docrag::config::LlmConfig;
//! # use docrag::llm::create_provider;
//! let config = LlmConfig {
//!     provider: "mock".to_string(),
//!     ..LlmConfig::default()
//! };
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.name(), "mock");
//!
//! let bad = LlmConfig {
//!     provider: "openai".to_string(),
//!     ..LlmConfig::default()
//! };
//! assert!(create_provider(&bad).is_err());
//! ```

mod gemini;
mod mock;

pub use gemini::GeminiProvider;
pub use mock::MockProvider;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

use crate::config::LlmConfig;

/// Provider names accepted in `llm.provider`.
pub const KNOWN_PROVIDERS: &[&str] = &["gemini", "mock"];

/// Errors raised by a language-model provider.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider returned an unparsable response: {0}")]
    Parse(String),

    #[error("provider stream failed: {0}")]
    Stream(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            LlmError::Parse(err.to_string())
        } else {
            LlmError::Request(err.to_string())
        }
    }
}

/// Inline file content attached to a structured-extraction request.
#[derive(Debug, Clone)]
pub struct FilePayload {
    /// Base64-encoded file bytes.
    pub data: String,
    pub mime_type: String,
}

/// Incremental text segments of a generated answer, in arrival order.
///
/// Dropping the stream cancels generation and releases the underlying
/// connection.
pub type TextStream = BoxStream<'static, Result<String, LlmError>>;

/// Capability set shared by every language-model backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name as used in configuration (e.g. `"gemini"`).
    fn name(&self) -> &str;

    /// Generation model identifier (recorded with feedback).
    fn model_name(&self) -> &str;

    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Run `prompt` (optionally over an attached file) and return the model's
    /// answer parsed as a JSON object.
    async fn generate_structured(
        &self,
        prompt: &str,
        file: Option<&FilePayload>,
    ) -> Result<serde_json::Value, LlmError>;

    /// Compute an embedding vector for `text`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    /// Stream an answer to `prompt` under `system_instruction`.
    async fn generate_stream(
        &self,
        prompt: &str,
        system_instruction: &str,
    ) -> Result<TextStream, LlmError>;
}

/// Create the configured [`LlmProvider`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"gemini"` | [`GeminiProvider`] |
/// | `"mock"` | [`MockProvider`] |
///
/// # Errors
///
/// Returns an error for unknown provider names or when the provider cannot
/// be initialized (e.g. missing API key).
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "gemini" => Ok(Arc::new(GeminiProvider::new(config)?)),
        "mock" => Ok(Arc::new(MockProvider::new(config.dims))),
        other => bail!(
            "Unknown LLM provider: '{}'. Must be one of: {}",
            other,
            KNOWN_PROVIDERS.join(", ")
        ),
    }
}

/// Strip Markdown code fences a model may wrap around a JSON answer.
pub(crate) fn strip_json_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// Parse a model answer into a JSON object.
pub(crate) fn parse_json_object(text: &str) -> Result<serde_json::Value, LlmError> {
    let value: serde_json::Value = serde_json::from_str(strip_json_fences(text))
        .map_err(|e| LlmError::Parse(format!("invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(LlmError::Parse("expected a JSON object".to_string()));
    }
    Ok(value)
}
