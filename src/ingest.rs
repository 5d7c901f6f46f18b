//! Ingestion pipeline orchestration.
//!
//! Drives one uploaded document through: status → sniff → structured
//! extraction → PII redaction → chunking → embedding → completion, writing
//! an audit entry at each stage boundary.
//!
//! The orchestrator performs no retries of its own. Any stage error is
//! audited as `PROCESS_FAILED` and returned to the worker so the queue can
//! apply its retry policy. While attempts remain the document stays
//! `Processing`, and the next delivery drops its partial chunks and starts
//! over. Only the last attempt marks it `Failed`.

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::chunk::{chunk_text, ChunkError};
use crate::config::ChunkingConfig;
use crate::llm::{FilePayload, LlmError, LlmProvider};
use crate::models::{actions, AuditLogEntry, AuditStatus, DocumentStatus};
use crate::pii::{RedactionError, Redactor};
use crate::prompts::EXTRACTION_PROMPT;
use crate::queue::IngestJob;
use crate::sniff::sniff_media_type;
use crate::store::Store;

/// Placeholder stored when extraction returns no `fullText`.
pub const MISSING_TEXT: &str = "Text not extracted.";

/// Pipeline-fatal errors.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to generate JSON from LLM: {0}")]
    Extraction(#[source] LlmError),

    #[error("embedding failed for chunk {index}: {source}")]
    Embedding {
        index: usize,
        #[source]
        source: LlmError,
    },

    #[error("PII redaction failed: {0}")]
    Redaction(#[from] RedactionError),

    #[error(transparent)]
    Chunking(#[from] ChunkError),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for IngestError {
    fn from(err: anyhow::Error) -> Self {
        IngestError::Storage(format!("{:#}", err))
    }
}

/// What a job did to its document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Completed {
        chunks: usize,
        /// Characters removed by redaction (negative when placeholders are longer).
        redacted_delta: i64,
        /// Redaction service failed and text was stored unredacted.
        redaction_degraded: bool,
    },
    /// Redelivered job for a document already in a terminal state.
    Skipped { status: DocumentStatus },
}

/// The ingestion orchestrator. Collaborators are injected; nothing is global.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmProvider>,
    redactor: Redactor,
    chunking: ChunkingConfig,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmProvider>,
        redactor: Redactor,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            store,
            llm,
            redactor,
            chunking,
        }
    }

    /// Process one job end to end as its only attempt.
    pub async fn process(&self, job: &IngestJob) -> Result<IngestOutcome, IngestError> {
        self.process_attempt(job, 1, 1).await
    }

    /// Process delivery `attempt` of `max_attempts` for a job.
    pub async fn process_attempt(
        &self,
        job: &IngestJob,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<IngestOutcome, IngestError> {
        let doc_id = job.document_id.as_str();

        let doc = match self.store.get_document(doc_id).await? {
            Some(doc) => doc,
            None => {
                let err = IngestError::DocumentNotFound(doc_id.to_string());
                self.audit(doc_id, actions::PROCESS_FAILED, AuditStatus::Failure, err.to_string())
                    .await;
                return Err(err);
            }
        };

        if doc.status.is_terminal() {
            info!(document_id = doc_id, status = %doc.status, "document already settled, skipping redelivered job");
            return Ok(IngestOutcome::Skipped { status: doc.status });
        }

        if doc.status == DocumentStatus::Processing {
            let removed = self.store.delete_embeddings(doc_id).await?;
            warn!(document_id = doc_id, removed, "resuming interrupted document, dropped partial chunks");
        }

        match self.run(job).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if attempt < max_attempts => {
                warn!(document_id = doc_id, attempt, max_attempts, error = %err, "document processing failed, will retry");
                let details = format!("{} (attempt {} of {}, will retry)", err, attempt, max_attempts);
                self.audit(doc_id, actions::PROCESS_FAILED, AuditStatus::Failure, details)
                    .await;
                Err(err)
            }
            Err(err) => {
                error!(document_id = doc_id, attempt, error = %err, "document processing failed");
                self.audit(doc_id, actions::PROCESS_FAILED, AuditStatus::Failure, err.to_string())
                    .await;
                if let Err(e) = self.store.set_status(doc_id, DocumentStatus::Failed).await {
                    error!(document_id = doc_id, error = %e, "could not mark document failed");
                }
                Err(err)
            }
        }
    }

    async fn run(&self, job: &IngestJob) -> Result<IngestOutcome, IngestError> {
        let doc_id = job.document_id.as_str();

        self.store
            .set_status(doc_id, DocumentStatus::Processing)
            .await?;
        self.store
            .append_audit(&AuditLogEntry::new(
                doc_id,
                actions::PROCESS_START,
                AuditStatus::Info,
                format!("Started processing document {}", doc_id),
            ))
            .await?;

        let bytes = tokio::fs::read(&job.file_path)
            .await
            .map_err(|source| IngestError::Io {
                path: job.file_path.clone(),
                source,
            })?;
        let media_type = sniff_media_type(&bytes);
        info!(document_id = doc_id, media_type = media_type.as_mime(), bytes = bytes.len(), "file read");
        self.store
            .set_media_type(doc_id, media_type.as_mime())
            .await?;

        let payload = FilePayload {
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
            mime_type: media_type.as_mime().to_string(),
        };
        let mut metadata = self
            .llm
            .generate_structured(EXTRACTION_PROMPT, Some(&payload))
            .await
            .map_err(IngestError::Extraction)?;

        let full_text = detach_full_text(&mut metadata);

        let redaction = self.redactor.redact(&full_text).await?;
        let mut degraded = redaction.degraded;
        if let Some(summary) = metadata.get("summary").and_then(Value::as_str) {
            let summary = self.redactor.redact(summary).await?;
            degraded |= summary.degraded;
            metadata["summary"] = Value::String(summary.text);
        }

        let original_len = full_text.chars().count() as i64;
        let redacted_delta = original_len - redaction.text.chars().count() as i64;
        let mut details = format!(
            "Redacted {} chars (Original: {})",
            redacted_delta, original_len
        );
        if degraded {
            details.push_str(" [service unavailable, text passed through unredacted]");
        }
        self.store
            .append_audit(&AuditLogEntry::new(
                doc_id,
                actions::PII_REDACTION,
                AuditStatus::Success,
                details,
            ))
            .await?;

        let chunks = chunk_text(&redaction.text, self.chunking.size, self.chunking.overlap)?;
        let mut stored = 0usize;
        for chunk in chunks.iter().filter(|c| !c.trim().is_empty()) {
            let vector = self
                .llm
                .embed(chunk)
                .await
                .map_err(|source| IngestError::Embedding {
                    index: stored,
                    source,
                })?;
            self.store
                .append_embedding(doc_id, stored as i64, chunk, &vector)
                .await?;
            stored += 1;
        }
        info!(document_id = doc_id, chunks = stored, "embeddings stored");

        self.store
            .complete_document(doc_id, &redaction.text, &metadata)
            .await?;
        self.store
            .append_audit(&AuditLogEntry::new(
                doc_id,
                actions::PROCESS_COMPLETE,
                AuditStatus::Success,
                format!("Document {} ready.", doc_id),
            ))
            .await?;

        info!(document_id = doc_id, "document processed");
        Ok(IngestOutcome::Completed {
            chunks: stored,
            redacted_delta,
            redaction_degraded: degraded,
        })
    }

    async fn audit(&self, doc_id: &str, action: &str, status: AuditStatus, details: String) {
        let entry = AuditLogEntry::new(doc_id, action, status, details);
        if let Err(e) = self.store.append_audit(&entry).await {
            error!(document_id = doc_id, error = %e, "failed to write audit entry");
        }
    }
}

/// Remove `fullText` from the extraction result and return it.
fn detach_full_text(metadata: &mut Value) -> String {
    let text = metadata
        .as_object_mut()
        .and_then(|obj| obj.remove("fullText"))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s),
            _ => None,
        });
    text.unwrap_or_else(|| MISSING_TEXT.to_string())
}
