//! Deterministic, network-free provider for tests and offline demos.
//!
//! - Extraction decodes plain-text payloads back into `fullText`; other media
//!   types get only a summary and tags, like a model that found no text.
//! - Embeddings are hashed bag-of-words vectors: texts sharing words are
//!   close in cosine distance, so retrieval ranking stays meaningful.
//! - Generation streams a fixed answer word by word, answering with the
//!   not-found phrase when the system instruction carries no context.

use async_trait::async_trait;
use base64::Engine;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::{FilePayload, LlmError, LlmProvider, TextStream};
use crate::prompts::{NOT_FOUND_PHRASE, NO_CONTEXT};

pub const MOCK_MODEL: &str = "mock-model";

pub struct MockProvider {
    dims: usize,
}

impl MockProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn answer_for(&self, prompt: &str, system_instruction: &str) -> String {
        if system_instruction.contains(NO_CONTEXT) {
            NOT_FOUND_PHRASE.to_string()
        } else {
            format!(
                "Based on the provided documents, here is what they say about: {}",
                prompt.trim()
            )
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        MOCK_MODEL
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn generate_structured(
        &self,
        _prompt: &str,
        file: Option<&FilePayload>,
    ) -> Result<Value, LlmError> {
        let mut output = json!({
            "summary": "Mock summary",
            "tags": ["mock", "test"],
        });

        if let Some(file) = file.filter(|f| f.mime_type == "text/plain") {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&file.data)
                .map_err(|e| LlmError::Parse(format!("invalid base64 payload: {}", e)))?;
            output["fullText"] = Value::String(String::from_utf8_lossy(&bytes).into_owned());
        }

        Ok(output)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        Ok(hashed_embedding(text, self.dims))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system_instruction: &str,
    ) -> Result<TextStream, LlmError> {
        let answer = self.answer_for(prompt, system_instruction);
        let segments: Vec<Result<String, LlmError>> = answer
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect();
        Ok(stream::iter(segments).boxed())
    }
}

/// Feature-hash lowercase alphanumeric tokens into a unit vector.
fn hashed_embedding(text: &str, dims: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dims];
    if dims == 0 {
        return vector;
    }

    let lowered = text.to_lowercase();
    for token in lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let digest = Sha256::digest(token.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % dims as u64) as usize;
        vector[index] += 1.0;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_distance;

    #[tokio::test]
    async fn test_text_payload_round_trips_into_full_text() {
        let provider = MockProvider::new(16);
        let payload = FilePayload {
            data: base64::engine::general_purpose::STANDARD.encode("hello there"),
            mime_type: "text/plain".to_string(),
        };
        let out = provider.generate_structured("extract", Some(&payload)).await.unwrap();
        assert_eq!(out["fullText"], "hello there");
        assert_eq!(out["tags"], json!(["mock", "test"]));
    }

    #[tokio::test]
    async fn test_binary_payload_has_no_full_text() {
        let provider = MockProvider::new(16);
        let payload = FilePayload {
            data: base64::engine::general_purpose::STANDARD.encode(b"%PDF-1.4"),
            mime_type: "application/pdf".to_string(),
        };
        let out = provider.generate_structured("extract", Some(&payload)).await.unwrap();
        assert!(out.get("fullText").is_none());
        assert_eq!(out["summary"], "Mock summary");
    }

    #[tokio::test]
    async fn test_embeddings_are_deterministic_and_topical() {
        let provider = MockProvider::new(256);
        let a = provider.embed("kubernetes deployment rollout").await.unwrap();
        let b = provider.embed("kubernetes deployment rollout").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);

        let near = provider.embed("how does the kubernetes rollout work").await.unwrap();
        let far = provider.embed("chocolate cake recipe").await.unwrap();
        assert!(cosine_distance(&a, &near) < cosine_distance(&a, &far));
    }

    #[tokio::test]
    async fn test_stream_answers_not_found_without_context() {
        let provider = MockProvider::new(8);
        let segments: Vec<String> = provider
            .generate_stream("anything?", &format!("CONTEXT:\n{}", NO_CONTEXT))
            .await
            .unwrap()
            .map(|s| s.unwrap())
            .collect()
            .await;
        assert_eq!(segments.concat(), NOT_FOUND_PHRASE);
        assert!(segments.len() > 1);
    }
}
