//! Core data models used throughout docrag.
//!
//! These types represent the documents, embedded chunks, audit entries, and
//! feedback records that flow through the ingestion and retrieval pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an uploaded document.
///
/// Status only advances `Pending → Processing → {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Completed => "COMPLETED",
            DocumentStatus::Failed => "FAILED",
        }
    }

    /// `Completed` and `Failed` are terminal: no job moves a document out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DocumentStatus::Completed | DocumentStatus::Failed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(DocumentStatus::Pending),
            "PROCESSING" => Ok(DocumentStatus::Processing),
            "COMPLETED" => Ok(DocumentStatus::Completed),
            "FAILED" => Ok(DocumentStatus::Failed),
            other => anyhow::bail!("unknown document status: {}", other),
        }
    }
}

/// An uploaded document and its ingestion state.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    /// Original filename as supplied by the uploader.
    pub filename: String,
    /// Media type detected from the file's byte signature during ingestion.
    pub media_type: Option<String>,
    pub status: DocumentStatus,
    /// Redacted full text, set only on completion.
    pub content: Option<String>,
    /// Structured extraction output (summary, tags, ...) without the full text.
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a fresh `Pending` document at upload time.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub owner_id: String,
    pub filename: String,
}

/// A stored chunk of redacted text plus its embedding vector.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub id: String,
    pub document_id: String,
    /// Position of the chunk within its document, in insertion order.
    pub chunk_index: i64,
    pub content: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// A chunk ranked against a query vector.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub document_id: String,
    pub filename: String,
    pub content: String,
    /// Cosine distance to the query (`0.0` = identical direction).
    pub distance: f32,
}

/// Outcome class of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Info,
    Success,
    Failure,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Info => "INFO",
            AuditStatus::Success => "SUCCESS",
            AuditStatus::Failure => "FAILURE",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(AuditStatus::Info),
            "SUCCESS" => Ok(AuditStatus::Success),
            "FAILURE" => Ok(AuditStatus::Failure),
            other => anyhow::bail!("unknown audit status: {}", other),
        }
    }
}

/// Stable vocabulary of pipeline audit actions.
pub mod actions {
    pub const PROCESS_START: &str = "PROCESS_START";
    pub const PII_REDACTION: &str = "PII_REDACTION";
    pub const PROCESS_COMPLETE: &str = "PROCESS_COMPLETE";
    pub const PROCESS_FAILED: &str = "PROCESS_FAILED";
}

/// Immutable record of a pipeline event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    pub document_id: Option<String>,
    pub action: String,
    pub status: AuditStatus,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        document_id: &str,
        action: &str,
        status: AuditStatus,
        details: impl Into<String>,
    ) -> Self {
        Self {
            document_id: Some(document_id.to_string()),
            action: action.to_string(),
            status,
            details: details.into(),
            timestamp: Utc::now(),
        }
    }
}

/// User feedback on a generated answer.
#[derive(Debug, Clone, Serialize)]
pub struct Feedback {
    pub id: String,
    pub owner_id: String,
    /// Client-side identifier of the chat turn; not a persisted entity.
    pub message_id: String,
    pub is_positive: bool,
    pub comment: Option<String>,
    pub prompt_version: String,
    pub model_used: String,
    pub created_at: DateTime<Utc>,
}
