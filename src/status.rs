//! `docrag status <doc-id>`: a document's state and its audit trail.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::store::{SqliteStore, Store};

pub async fn run_status(config: &Config, id: &str) -> Result<()> {
    let store = SqliteStore::open(config).await?;

    let Some(doc) = store.get_document(id).await? else {
        bail!("document not found: {}", id);
    };
    let chunks = store.count_embeddings(id).await?;

    println!("document {}", doc.id);
    println!("  filename: {}", doc.filename);
    println!("  owner: {}", doc.owner_id);
    println!("  status: {}", doc.status);
    println!(
        "  media type: {}",
        doc.media_type.as_deref().unwrap_or("(not yet detected)")
    );
    println!("  chunks: {}", chunks);
    if let Some(summary) = doc.metadata.get("summary").and_then(|s| s.as_str()) {
        println!("  summary: {}", summary);
    }
    if let Some(tags) = doc.metadata.get("tags").and_then(|t| t.as_array()) {
        let tags: Vec<&str> = tags.iter().filter_map(|t| t.as_str()).collect();
        println!("  tags: {}", tags.join(", "));
    }

    println!("audit:");
    for entry in store.audit_log(Some(id)).await? {
        println!(
            "  {} {} {} {}",
            entry.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            entry.action,
            entry.status.as_str(),
            entry.details
        );
    }
    Ok(())
}
