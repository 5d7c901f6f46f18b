//! Streaming RAG chat sessions.
//!
//! A session moves `FindingContext → Generating → Done`, or to `Error` from
//! any stage. Events are produced by a spawned task into a bounded channel
//! and consumed as a stream, so the order is always
//! `status, status, data*, (done | error)`.
//!
//! Input is validated before the channel opens; those failures are returned
//! to the caller as [`ChatError`] and never reach the stream. Once the stream
//! is open, failures become a single in-band [`ChatEvent::Error`].
//!
//! Dropping the stream (client disconnect) cancels retrieval or generation
//! in flight and drops the provider's response stream.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::app::AppContext;
use crate::config::Config;
use crate::llm::{LlmError, LlmProvider};
use crate::prompts::{self, PromptVersion};
use crate::retrieval::{format_context, Retriever};

/// Data payload of the in-band error event.
pub const STREAM_FAILED: &str = "Stream failed";

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message must not be empty")]
    EmptyMessage,

    #[error("owner id must not be empty")]
    MissingOwner,

    #[error("context retrieval failed: {0}")]
    Retrieval(String),

    #[error("generation failed: {0}")]
    Generation(#[from] LlmError),

    #[error("client disconnected")]
    Delivery,
}

/// Non-terminal progress stages announced as `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatStage {
    FindingContext,
    Generating,
}

impl ChatStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatStage::FindingContext => "finding_context",
            ChatStage::Generating => "generating",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Status(ChatStage),
    /// One generated text segment.
    Data(String),
    Done,
    Error,
}

impl ChatEvent {
    /// SSE event name, if the frame carries one.
    pub fn event_name(&self) -> Option<&'static str> {
        match self {
            ChatEvent::Status(_) => Some("status"),
            ChatEvent::Data(_) => None,
            ChatEvent::Done => Some("done"),
            ChatEvent::Error => Some("error"),
        }
    }

    /// SSE `data:` payload.
    pub fn data(&self) -> String {
        match self {
            ChatEvent::Status(stage) => stage.as_str().to_string(),
            ChatEvent::Data(text) => json!({ "text": text }).to_string(),
            ChatEvent::Done => "[DONE]".to_string(),
            ChatEvent::Error => json!({ "error": STREAM_FAILED }).to_string(),
        }
    }

    /// The complete wire frame, terminated by a blank line.
    pub fn to_frame(&self) -> String {
        match self.event_name() {
            Some(name) => format!("event: {}\ndata: {}\n\n", name, self.data()),
            None => format!("data: {}\n\n", self.data()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Done | ChatEvent::Error)
    }
}

pub type ChatStream = ReceiverStream<ChatEvent>;

/// Opens chat sessions against one retriever, provider, and prompt version.
#[derive(Clone)]
pub struct ChatService {
    retriever: Retriever,
    llm: Arc<dyn LlmProvider>,
    prompt: PromptVersion,
}

impl ChatService {
    /// # Errors
    ///
    /// Fails if `prompt_version` is not registered.
    pub fn new(
        retriever: Retriever,
        llm: Arc<dyn LlmProvider>,
        prompt_version: &str,
    ) -> anyhow::Result<Self> {
        let prompt = prompts::lookup(prompt_version)
            .ok_or_else(|| anyhow::anyhow!("unknown prompt version: {}", prompt_version))?;
        Ok(Self {
            retriever,
            llm,
            prompt,
        })
    }

    pub fn prompt_version(&self) -> &'static str {
        self.prompt.version
    }

    pub fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    /// Validate the request and start a session.
    ///
    /// Must be called within a Tokio runtime.
    pub fn open(&self, owner_id: &str, message: &str) -> Result<ChatStream, ChatError> {
        if owner_id.trim().is_empty() {
            return Err(ChatError::MissingOwner);
        }
        if message.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let session = self.clone();
        let owner_id = owner_id.to_string();
        let message = message.to_string();
        tokio::spawn(async move { session.drive(&owner_id, &message, tx).await });

        Ok(ReceiverStream::new(rx))
    }

    async fn drive(&self, owner_id: &str, message: &str, tx: mpsc::Sender<ChatEvent>) {
        let result = tokio::select! {
            result = self.answer(owner_id, message, &tx) => result,
            _ = tx.closed() => {
                debug!(owner_id, "chat client disconnected, generation cancelled");
                return;
            }
        };

        match result {
            Ok(()) => {
                let _ = tx.send(ChatEvent::Done).await;
            }
            Err(ChatError::Delivery) => {
                debug!(owner_id, "chat client disconnected");
            }
            Err(e) => {
                warn!(owner_id, error = %e, "chat stream failed");
                let _ = tx.send(ChatEvent::Error).await;
            }
        }
    }

    async fn answer(
        &self,
        owner_id: &str,
        message: &str,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<(), ChatError> {
        emit(tx, ChatEvent::Status(ChatStage::FindingContext)).await?;

        let chunks = self
            .retriever
            .retrieve(message, owner_id)
            .await
            .map_err(|e| ChatError::Retrieval(format!("{:#}", e)))?;
        let system = self.prompt.system_instruction(&format_context(&chunks));

        emit(tx, ChatEvent::Status(ChatStage::Generating)).await?;

        let mut segments = self.llm.generate_stream(message, &system).await?;
        while let Some(segment) = segments.next().await {
            emit(tx, ChatEvent::Data(segment?)).await?;
        }
        Ok(())
    }
}

/// `docrag ask <question> --owner <id>`: print SSE frames as they arrive.
pub async fn run_ask(config: &Config, question: &str, owner_id: &str) -> anyhow::Result<()> {
    use std::io::Write;

    let ctx = AppContext::open(config).await?;
    let mut events = ctx.chat()?.open(owner_id, question)?;

    let mut stdout = std::io::stdout();
    while let Some(event) = events.next().await {
        write!(stdout, "{}", event.to_frame())?;
        stdout.flush()?;
        if event == ChatEvent::Error {
            anyhow::bail!("chat stream failed");
        }
    }
    Ok(())
}

async fn emit(tx: &mpsc::Sender<ChatEvent>, event: ChatEvent) -> Result<(), ChatError> {
    tx.send(event).await.map_err(|_| ChatError::Delivery)
}
