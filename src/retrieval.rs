//! Owner-scoped semantic retrieval.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::llm::LlmProvider;
use crate::store::Store;

/// A chunk selected as context for an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub content: String,
    pub source_filename: String,
}

#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmProvider>,
    top_k: usize,
}

impl Retriever {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmProvider>, top_k: usize) -> Self {
        Self { store, llm, top_k }
    }

    /// Embed `query` and return the owner's `top_k` closest chunks, most
    /// relevant first. An owner with no documents gets an empty list.
    pub async fn retrieve(&self, query: &str, owner_id: &str) -> Result<Vec<RetrievedChunk>> {
        let vector = self.llm.embed(query).await?;
        let hits = self
            .store
            .nearest_chunks(owner_id, &vector, self.top_k)
            .await?;

        debug!(owner_id, hits = hits.len(), "context retrieved");
        Ok(hits
            .into_iter()
            .map(|hit| RetrievedChunk {
                content: hit.content,
                source_filename: hit.filename,
            })
            .collect())
    }
}

/// Render chunks as `[Source: <filename>]\n<content>` blocks separated by a
/// blank line. No chunks renders as the empty string.
pub fn format_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|c| format!("[Source: {}]\n{}", c.source_filename, c.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}
