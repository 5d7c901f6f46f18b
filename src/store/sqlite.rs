//! SQLite-backed [`Store`] implementation.
//!
//! Vectors are stored as little-endian `f32` BLOBs and ranked in Rust with
//! cosine distance after an owner-scoped join against `documents`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use crate::models::{
    AuditLogEntry, Document, DocumentStatus, EmbeddingRecord, Feedback, NewDocument, ScoredChunk,
};
use crate::{db, migrate};

use super::{rank_candidates, Store};

/// SQLite implementation of the [`Store`] trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and ensure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn touch(&self, sql: &str, id: &str, value: &str) -> Result<()> {
        let result = sqlx::query(sql)
            .bind(value)
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("document not found: {}", id));
        }
        Ok(())
    }
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    let metadata_json: String = row.get("metadata_json");
    Ok(Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        filename: row.get("filename"),
        media_type: row.get("media_type"),
        status: status.parse()?,
        content: row.get("content"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({})),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    })
}

const DOCUMENT_COLUMNS: &str =
    "id, owner_id, filename, media_type, status, content, metadata_json, created_at, updated_at";

#[async_trait]
impl Store for SqliteStore {
    async fn create_document(&self, new: &NewDocument) -> Result<Document> {
        let now = Utc::now().timestamp_millis();
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO documents (id, owner_id, filename, status, metadata_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, '{}', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.owner_id)
        .bind(&new.filename)
        .bind(DocumentStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_document(&id)
            .await?
            .ok_or_else(|| anyhow!("document vanished after insert: {}", id))
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self, owner_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE owner_id = ? ORDER BY created_at DESC, rowid DESC",
            DOCUMENT_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_document).collect()
    }

    async fn set_status(&self, id: &str, status: DocumentStatus) -> Result<()> {
        self.touch(
            "UPDATE documents SET status = ?, updated_at = ? WHERE id = ?",
            id,
            status.as_str(),
        )
        .await
    }

    async fn set_media_type(&self, id: &str, media_type: &str) -> Result<()> {
        self.touch(
            "UPDATE documents SET media_type = ?, updated_at = ? WHERE id = ?",
            id,
            media_type,
        )
        .await
    }

    async fn complete_document(
        &self,
        id: &str,
        content: &str,
        metadata: &serde_json::Value,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?, content = ?, metadata_json = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(DocumentStatus::Completed.as_str())
        .bind(content)
        .bind(metadata.to_string())
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("document not found: {}", id));
        }
        Ok(())
    }

    async fn append_embedding(
        &self,
        document_id: &str,
        chunk_index: i64,
        content: &str,
        vector: &[f32],
    ) -> Result<EmbeddingRecord> {
        let created_at = Utc::now();
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO embeddings (id, document_id, chunk_index, content, vector, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(document_id)
        .bind(chunk_index)
        .bind(content)
        .bind(vec_to_blob(vector))
        .bind(created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(EmbeddingRecord {
            id,
            document_id: document_id.to_string(),
            chunk_index,
            content: content.to_string(),
            vector: vector.to_vec(),
            created_at,
        })
    }

    async fn count_embeddings(&self, document_id: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn delete_embeddings(&self, document_id: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM embeddings WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn nearest_chunks(
        &self,
        owner_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT e.document_id, e.content, e.vector, d.filename
            FROM embeddings e
            JOIN documents d ON d.id = e.document_id
            WHERE d.owner_id = ?
            ORDER BY e.seq ASC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let candidates: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("vector");
                ScoredChunk {
                    document_id: row.get("document_id"),
                    filename: row.get("filename"),
                    content: row.get("content"),
                    distance: cosine_distance(query, &blob_to_vec(&blob)),
                }
            })
            .collect();

        Ok(rank_candidates(candidates, k))
    }

    async fn append_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (document_id, action, status, details, timestamp)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.document_id)
        .bind(&entry.action)
        .bind(entry.status.as_str())
        .bind(&entry.details)
        .bind(entry.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_log(&self, document_id: Option<&str>) -> Result<Vec<AuditLogEntry>> {
        let rows = match document_id {
            Some(id) => {
                sqlx::query(
                    "SELECT document_id, action, status, details, timestamp FROM audit_log WHERE document_id = ? ORDER BY seq ASC",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT document_id, action, status, details, timestamp FROM audit_log ORDER BY seq ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(AuditLogEntry {
                    document_id: row.get("document_id"),
                    action: row.get("action"),
                    status: status.parse()?,
                    details: row.get("details"),
                    timestamp: from_millis(row.get("timestamp")),
                })
            })
            .collect()
    }

    async fn insert_feedback(&self, feedback: &Feedback) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO feedback (id, owner_id, message_id, is_positive, comment,
                                  prompt_version, model_used, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&feedback.id)
        .bind(&feedback.owner_id)
        .bind(&feedback.message_id)
        .bind(feedback.is_positive)
        .bind(&feedback.comment)
        .bind(&feedback.prompt_version)
        .bind(&feedback.model_used)
        .bind(feedback.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_feedback(&self, owner_id: &str) -> Result<Vec<Feedback>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, message_id, is_positive, comment, prompt_version,
                   model_used, created_at
            FROM feedback WHERE owner_id = ? ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Feedback {
                id: row.get("id"),
                owner_id: row.get("owner_id"),
                message_id: row.get("message_id"),
                is_positive: row.get("is_positive"),
                comment: row.get("comment"),
                prompt_version: row.get("prompt_version"),
                model_used: row.get("model_used"),
                created_at: from_millis(row.get("created_at")),
            })
            .collect())
    }
}
