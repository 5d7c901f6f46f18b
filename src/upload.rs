//! Upload handoff: stage a file, register a `Pending` document, queue it.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::models::{Document, NewDocument};
use crate::queue::{IngestJob, JobQueue, SqliteQueue};
use crate::store::{SqliteStore, Store};

/// A staged upload and the job queued for it.
#[derive(Debug, Clone)]
pub struct Upload {
    pub document: Document,
    pub job_id: i64,
}

/// Copy `source` into `upload_dir` under a fresh UUID name, create the
/// document record, and enqueue its ingestion job.
pub async fn upload_file(
    store: &dyn Store,
    queue: &dyn JobQueue,
    upload_dir: &Path,
    source: &Path,
    owner_id: &str,
) -> Result<Upload> {
    if owner_id.trim().is_empty() {
        bail!("owner id must not be empty");
    }

    let filename = source
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Not a file path: {}", source.display()))?
        .to_string();

    tokio::fs::create_dir_all(upload_dir)
        .await
        .with_context(|| format!("Failed to create upload dir: {}", upload_dir.display()))?;

    let staged_name = match source.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
        None => Uuid::new_v4().to_string(),
    };
    let staged_path = upload_dir.join(staged_name);
    tokio::fs::copy(source, &staged_path)
        .await
        .with_context(|| format!("Failed to read upload: {}", source.display()))?;

    let document = store
        .create_document(&NewDocument {
            owner_id: owner_id.to_string(),
            filename,
        })
        .await?;

    let job_id = queue
        .enqueue(&IngestJob {
            document_id: document.id.clone(),
            file_path: staged_path,
        })
        .await?;

    info!(document_id = %document.id, job_id, "upload queued");
    Ok(Upload { document, job_id })
}

/// `docrag upload <file> --owner <id>`
pub async fn run_upload(config: &Config, file: &Path, owner_id: &str) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let queue = SqliteQueue::new(store.pool().clone(), &config.queue);
    let upload = upload_file(
        &store,
        &queue,
        &config.storage.upload_dir,
        file,
        owner_id,
    )
    .await?;

    println!("uploaded {}", upload.document.filename);
    println!("  document: {}", upload.document.id);
    println!("  status: {}", upload.document.status);
    println!("  job: {}", upload.job_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::models::DocumentStatus;
    use crate::queue::InMemoryQueue;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_upload_stages_file_and_queues_job() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("notes.txt");
        std::fs::write(&source, "hello").unwrap();
        let upload_dir = dir.path().join("uploads");

        let store = InMemoryStore::new();
        let queue = InMemoryQueue::new(&QueueConfig::default());
        let upload = upload_file(&store, &queue, &upload_dir, &source, "u1")
            .await
            .unwrap();

        assert_eq!(upload.document.filename, "notes.txt");
        assert_eq!(upload.document.status, DocumentStatus::Pending);

        let claimed = queue.claim().await.unwrap().unwrap();
        assert_eq!(claimed.job.document_id, upload.document.id);
        assert!(claimed.job.file_path.starts_with(&upload_dir));
        assert_ne!(claimed.job.file_path.file_name().unwrap(), "notes.txt");
        assert_eq!(std::fs::read_to_string(&claimed.job.file_path).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_missing_source_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new();
        let queue = InMemoryQueue::new(&QueueConfig::default());
        let result = upload_file(
            &store,
            &queue,
            dir.path(),
            &dir.path().join("absent.txt"),
            "u1",
        )
        .await;
        assert!(result.is_err());
        assert!(store.list_documents("u1").await.unwrap().is_empty());
    }
}
