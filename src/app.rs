//! Wires configuration into the concrete collaborators each command needs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::chat::ChatService;
use crate::config::Config;
use crate::feedback::FeedbackDefaults;
use crate::ingest::Ingestor;
use crate::llm::{create_provider, LlmProvider};
use crate::pii::Redactor;
use crate::queue::SqliteQueue;
use crate::retrieval::Retriever;
use crate::store::SqliteStore;
use crate::worker::WorkerOptions;

pub struct AppContext {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub llm: Arc<dyn LlmProvider>,
}

impl AppContext {
    /// Open the database and construct the configured provider.
    ///
    /// An unknown or misconfigured provider fails here, before any work starts.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(config).await?);
        let llm = create_provider(&config.llm)?;
        Ok(Self {
            config: config.clone(),
            store,
            llm,
        })
    }

    pub fn queue(&self) -> SqliteQueue {
        SqliteQueue::new(self.store.pool().clone(), &self.config.queue)
    }

    pub fn ingestor(&self) -> Result<Ingestor> {
        Ok(Ingestor::new(
            self.store.clone(),
            self.llm.clone(),
            Redactor::from_config(&self.config.pii)?,
            self.config.chunking.clone(),
        ))
    }

    pub fn chat(&self) -> Result<ChatService> {
        let retriever = Retriever::new(
            self.store.clone(),
            self.llm.clone(),
            self.config.retrieval.top_k,
        );
        ChatService::new(retriever, self.llm.clone(), &self.config.chat.prompt_version)
    }

    pub fn feedback_defaults(&self) -> FeedbackDefaults {
        FeedbackDefaults {
            prompt_version: self.config.chat.prompt_version.clone(),
            model_used: self.llm.model_name().to_string(),
        }
    }

    pub fn worker_options(&self, drain: bool) -> WorkerOptions {
        WorkerOptions {
            concurrency: self.config.queue.concurrency,
            poll_interval: Duration::from_millis(self.config.queue.poll_interval_ms),
            heartbeat: Duration::from_secs(self.config.queue.lease_secs) / 3,
            drain,
        }
    }
}
