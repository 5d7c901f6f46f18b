//! In-memory [`Store`] implementation for tests and single-process demos.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Vector search is brute-force cosine distance over the owner's chunks.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::embedding::cosine_distance;
use crate::models::{
    AuditLogEntry, Document, DocumentStatus, EmbeddingRecord, Feedback, NewDocument, ScoredChunk,
};

use super::{rank_candidates, Store};

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    docs: RwLock<HashMap<String, Document>>,
    embeddings: RwLock<Vec<EmbeddingRecord>>,
    audit: RwLock<Vec<AuditLogEntry>>,
    feedback: RwLock<Vec<Feedback>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update_doc(&self, id: &str, f: impl FnOnce(&mut Document)) -> Result<()> {
        let mut docs = self.docs.write().map_err(|_| anyhow!("document map poisoned"))?;
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| anyhow!("document not found: {}", id))?;
        f(doc);
        doc.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_document(&self, new: &NewDocument) -> Result<Document> {
        let now = Utc::now();
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            owner_id: new.owner_id.clone(),
            filename: new.filename.clone(),
            media_type: None,
            status: DocumentStatus::Pending,
            content: None,
            metadata: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        };
        self.docs
            .write()
            .map_err(|_| anyhow!("document map poisoned"))?
            .insert(doc.id.clone(), doc.clone());
        Ok(doc)
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let docs = self.docs.read().map_err(|_| anyhow!("document map poisoned"))?;
        Ok(docs.get(id).cloned())
    }

    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>> {
        let docs = self.docs.read().map_err(|_| anyhow!("document map poisoned"))?;
        let mut owned: Vec<Document> = docs
            .values()
            .filter(|d| d.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }

    async fn set_status(&self, id: &str, status: DocumentStatus) -> Result<()> {
        self.update_doc(id, |d| d.status = status)
    }

    async fn set_media_type(&self, id: &str, media_type: &str) -> Result<()> {
        self.update_doc(id, |d| d.media_type = Some(media_type.to_string()))
    }

    async fn complete_document(
        &self,
        id: &str,
        content: &str,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        self.update_doc(id, |d| {
            d.status = DocumentStatus::Completed;
            d.content = Some(content.to_string());
            d.metadata = metadata.clone();
        })
    }

    async fn append_embedding(
        &self,
        document_id: &str,
        chunk_index: i64,
        content: &str,
        vector: &[f32],
    ) -> Result<EmbeddingRecord> {
        let record = EmbeddingRecord {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            chunk_index,
            content: content.to_string(),
            vector: vector.to_vec(),
            created_at: Utc::now(),
        };
        self.embeddings
            .write()
            .map_err(|_| anyhow!("embedding list poisoned"))?
            .push(record.clone());
        Ok(record)
    }

    async fn count_embeddings(&self, document_id: &str) -> Result<usize> {
        let records = self
            .embeddings
            .read()
            .map_err(|_| anyhow!("embedding list poisoned"))?;
        Ok(records.iter().filter(|r| r.document_id == document_id).count())
    }

    async fn delete_embeddings(&self, document_id: &str) -> Result<usize> {
        let mut records = self
            .embeddings
            .write()
            .map_err(|_| anyhow!("embedding list poisoned"))?;
        let before = records.len();
        records.retain(|r| r.document_id != document_id);
        Ok(before - records.len())
    }

    async fn nearest_chunks(
        &self,
        owner_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let docs = self.docs.read().map_err(|_| anyhow!("document map poisoned"))?;
        let records = self
            .embeddings
            .read()
            .map_err(|_| anyhow!("embedding list poisoned"))?;

        let candidates: Vec<ScoredChunk> = records
            .iter()
            .filter_map(|r| {
                let doc = docs.get(&r.document_id)?;
                if doc.owner_id != owner_id {
                    return None;
                }
                Some(ScoredChunk {
                    document_id: r.document_id.clone(),
                    filename: doc.filename.clone(),
                    content: r.content.clone(),
                    distance: cosine_distance(query, &r.vector),
                })
            })
            .collect();

        Ok(rank_candidates(candidates, k))
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        self.audit
            .write()
            .map_err(|_| anyhow!("audit log poisoned"))?
            .push(entry.clone());
        Ok(())
    }

    async fn audit_log(&self, document_id: Option<&str>) -> Result<Vec<AuditLogEntry>> {
        let audit = self.audit.read().map_err(|_| anyhow!("audit log poisoned"))?;
        Ok(audit
            .iter()
            .filter(|e| document_id.is_none() || e.document_id.as_deref() == document_id)
            .cloned()
            .collect())
    }

    async fn insert_feedback(&self, feedback: &Feedback) -> Result<()> {
        self.feedback
            .write()
            .map_err(|_| anyhow!("feedback list poisoned"))?
            .push(feedback.clone());
        Ok(())
    }

    async fn list_feedback(&self, owner_id: &str) -> Result<Vec<Feedback>> {
        let feedback = self
            .feedback
            .read()
            .map_err(|_| anyhow!("feedback list poisoned"))?;
        Ok(feedback
            .iter()
            .filter(|f| f.owner_id == owner_id)
            .cloned()
            .collect())
    }
}
