//! Google Gemini provider.
//!
//! Talks to the Generative Language REST API:
//! - `POST models/{model}:generateContent` for structured extraction
//!   (`responseMimeType = application/json`, file attached as `inline_data`)
//! - `POST models/{embedding_model}:embedContent` for embeddings
//! - `POST models/{model}:streamGenerateContent?alt=sse` for chat answers
//!
//! Requires the API key in the environment variable named by
//! `llm.api_key_env` (default `GEMINI_API_KEY`).
//!
//! # Retry Strategy
//!
//! Unary calls retry transient failures with exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - other HTTP errors → fail immediately
//! - network errors → retry
//!
//! Streaming calls are never retried once the stream has started.
//!
//! `llm.timeout_secs` bounds connection setup and each unary call. A
//! streamed answer has no overall deadline; it ends when the server closes
//! it or the caller drops it.

use anyhow::bail;
use async_trait::async_trait;
use futures_util::{future, stream, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{parse_json_object, FilePayload, LlmError, LlmProvider, TextStream};
use crate::config::LlmConfig;

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    embedding_model: String,
    dims: usize,
    request_timeout: Duration,
    max_retries: u32,
}

impl GeminiProvider {
    /// # Errors
    ///
    /// Returns an error if the API key variable is unset or the HTTP client
    /// cannot be built.
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) if !key.is_empty() => key,
            _ => bail!("{} environment variable not set", config.api_key_env),
        };

        let request_timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            dims: config.dims,
            request_timeout,
            max_retries: config.max_retries,
        })
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model, method)
    }

    /// POST `body` to `url`, retrying rate limits, server errors, and
    /// network failures.
    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, LlmError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                warn!(attempt, ?delay, "retrying Gemini request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(url)
                .timeout(self.request_timeout)
                .header("x-goog-api-key", &self.api_key)
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = LlmError::Status {
                        status: status.as_u16(),
                        body: body_text,
                    };
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::Request("request failed after retries".into())))
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        file: Option<&FilePayload>,
    ) -> Result<Value, LlmError> {
        let mut parts = vec![json!({ "text": prompt })];
        if let Some(file) = file {
            parts.push(json!({
                "inline_data": { "mime_type": file.mime_type, "data": file.data }
            }));
        }

        let body = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": { "responseMimeType": "application/json" },
        });

        debug!(model = %self.model, "requesting structured extraction");
        let response = self
            .post_json(&self.endpoint(&self.model, "generateContent"), &body)
            .await?;

        let text = candidate_text(&response)
            .ok_or_else(|| LlmError::Parse("response has no candidate text".into()))?;
        parse_json_object(&text)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let body = json!({
            "model": format!("models/{}", self.embedding_model),
            "content": { "parts": [{ "text": text }] },
        });

        let response = self
            .post_json(&self.endpoint(&self.embedding_model, "embedContent"), &body)
            .await?;

        parse_embedding(&response)
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system_instruction: &str,
    ) -> Result<TextStream, LlmError> {
        let body = json!({
            "systemInstruction": { "parts": [{ "text": system_instruction }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        });

        let url = format!(
            "{}?alt=sse",
            self.endpoint(&self.model, "streamGenerateContent")
        );
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let segments = response
            .bytes_stream()
            .scan(SseDecoder::default(), |decoder, chunk| {
                let items = match chunk {
                    Ok(bytes) => decoder.push(&bytes),
                    Err(e) => vec![Err(LlmError::Stream(e.to_string()))],
                };
                future::ready(Some(stream::iter(items)))
            })
            .flatten()
            .filter(|item| future::ready(!matches!(item, Ok(text) if text.is_empty())));

        Ok(segments.boxed())
    }
}

/// Concatenate the text parts of the first candidate.
fn candidate_text(response: &Value) -> Option<String> {
    let parts = response
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    Some(text)
}

fn parse_embedding(response: &Value) -> Result<Vec<f32>, LlmError> {
    let values = response
        .get("embedding")
        .and_then(|e| e.get("values"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| LlmError::Parse("missing embedding.values".into()))?;

    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| LlmError::Parse("non-numeric embedding value".into()))
        })
        .collect()
}

/// Incremental decoder for `text/event-stream` responses.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters and events split across network reads decode correctly.
#[derive(Default)]
struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Feed raw bytes; returns the text of every complete `data:` line.
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, LlmError>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data.is_empty() || data == "[DONE]" {
                continue;
            }

            out.push(
                serde_json::from_str::<Value>(data)
                    .map_err(|e| LlmError::Stream(format!("bad event payload: {}", e)))
                    .map(|event| candidate_text(&event).unwrap_or_default()),
            );
        }

        out
    }
}
