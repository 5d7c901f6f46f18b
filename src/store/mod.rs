//! Storage abstraction for docrag.
//!
//! The [`Store`] trait defines every persistence operation the ingestion
//! pipeline, retrieval engine, and chat feedback need, so the pipeline runs
//! unchanged against SQLite ([`SqliteStore`]) or memory ([`InMemoryStore`]).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    AuditLogEntry, Document, DocumentStatus, EmbeddingRecord, Feedback, NewDocument, ScoredChunk,
};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_document`](Store::create_document) | Insert a fresh `Pending` document |
/// | [`get_document`](Store::get_document) | Fetch a document by ID |
/// | [`list_documents`](Store::list_documents) | An owner's documents, newest first |
/// | [`set_status`](Store::set_status) | Advance a document's lifecycle status |
/// | [`set_media_type`](Store::set_media_type) | Record the sniffed media type |
/// | [`complete_document`](Store::complete_document) | Persist content + metadata and mark `Completed` |
/// | [`append_embedding`](Store::append_embedding) | Append one chunk + vector |
/// | [`count_embeddings`](Store::count_embeddings) | Number of chunks stored for a document |
/// | [`delete_embeddings`](Store::delete_embeddings) | Drop a document's chunks (redelivery cleanup) |
/// | [`nearest_chunks`](Store::nearest_chunks) | Owner-scoped cosine-distance ranking |
/// | [`append_audit`](Store::append_audit) | Append an audit entry |
/// | [`audit_log`](Store::audit_log) | Audit entries, oldest first |
/// | [`insert_feedback`](Store::insert_feedback) | Record answer feedback |
/// | [`list_feedback`](Store::list_feedback) | An owner's feedback records |
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_document(&self, doc: &NewDocument) -> Result<Document>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>>;

    async fn set_status(&self, id: &str, status: DocumentStatus) -> Result<()>;

    async fn set_media_type(&self, id: &str, media_type: &str) -> Result<()>;

    /// Store the redacted content and metadata and mark the document `Completed`.
    async fn complete_document(
        &self,
        id: &str,
        content: &str,
        metadata: &serde_json::Value,
    ) -> Result<()>;

    /// Append one chunk and its vector to a document. Records are never updated.
    async fn append_embedding(
        &self,
        document_id: &str,
        chunk_index: i64,
        content: &str,
        vector: &[f32],
    ) -> Result<EmbeddingRecord>;

    async fn count_embeddings(&self, document_id: &str) -> Result<usize>;

    /// Remove every chunk of a document; returns how many were removed.
    async fn delete_embeddings(&self, document_id: &str) -> Result<usize>;

    /// Rank the chunks of `owner_id`'s documents by ascending cosine distance
    /// to `query`, returning at most `k`. Ties keep insertion order.
    async fn nearest_chunks(
        &self,
        owner_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>>;

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<()>;

    /// Audit entries in insertion order, optionally restricted to one document.
    async fn audit_log(&self, document_id: Option<&str>) -> Result<Vec<AuditLogEntry>>;

    async fn insert_feedback(&self, feedback: &Feedback) -> Result<()>;

    async fn list_feedback(&self, owner_id: &str) -> Result<Vec<Feedback>>;
}

/// Sort candidates by distance, keeping insertion order among equal
/// distances, and keep the closest `k`. NaN distances rank last.
pub(crate) fn rank_candidates(mut candidates: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    candidates.sort_by(|a, b| {
        a.distance
            .is_nan()
            .cmp(&b.distance.is_nan())
            .then_with(|| a.distance.total_cmp(&b.distance))
    });
    candidates.truncate(k);
    candidates
}
