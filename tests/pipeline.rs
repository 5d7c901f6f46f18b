//! End-to-end pipeline tests against in-memory storage, the mock provider,
//! and an in-process stand-in for the Presidio analyzer/anonymizer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};

use docrag::chat::{ChatEvent, ChatService, ChatStage};
use docrag::config::{ChunkingConfig, PiiConfig, QueueConfig};
use docrag::ingest::{IngestError, IngestOutcome, Ingestor};
use docrag::llm::{FilePayload, LlmError, LlmProvider, MockProvider, TextStream};
use docrag::models::{actions, AuditStatus, DocumentStatus, NewDocument};
use docrag::pii::{FailurePolicy, Redactor};
use docrag::prompts::{CURRENT_VERSION, NOT_FOUND_PHRASE};
use docrag::queue::{FailOutcome, InMemoryQueue, IngestJob, JobQueue, JobState, QueuedJob};
use docrag::retrieval::Retriever;
use docrag::store::{InMemoryStore, Store};
use docrag::upload::upload_file;
use docrag::worker::{run_worker, WorkerOptions};

const DIMS: usize = 64;

// ============ Fake Presidio ============

#[derive(Default)]
struct PresidioCalls {
    analyze: AtomicUsize,
    anonymize: AtomicUsize,
}

/// Flags every space-separated word containing `@` as an email address.
async fn fake_analyze(
    State(calls): State<Arc<PresidioCalls>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    calls.analyze.fetch_add(1, Ordering::SeqCst);
    let text = body["text"].as_str().unwrap_or_default();

    let mut findings = Vec::new();
    let mut offset = 0;
    for word in text.split(' ') {
        if word.contains('@') {
            findings.push(json!({
                "entity_type": "EMAIL_ADDRESS",
                "start": offset,
                "end": offset + word.len(),
                "score": 0.99,
            }));
        }
        offset += word.len() + 1;
    }
    Json(Value::Array(findings))
}

async fn fake_anonymize(
    State(calls): State<Arc<PresidioCalls>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    calls.anonymize.fetch_add(1, Ordering::SeqCst);
    let mut text = body["text"].as_str().unwrap().to_string();

    let results = body["analyzer_results"].as_array().unwrap();
    for finding in results.iter().rev() {
        let entity = finding["entity_type"].as_str().unwrap();
        let placeholder = body["anonymizers"][entity]["new_value"]
            .as_str()
            .or_else(|| body["anonymizers"]["DEFAULT"]["new_value"].as_str())
            .unwrap();
        let start = finding["start"].as_u64().unwrap() as usize;
        let end = finding["end"].as_u64().unwrap() as usize;
        text.replace_range(start..end, placeholder);
    }
    Json(json!({ "text": text }))
}

async fn spawn_fake_presidio() -> (String, Arc<PresidioCalls>) {
    let calls = Arc::new(PresidioCalls::default());
    let app = Router::new()
        .route("/analyze", post(fake_analyze))
        .route("/anonymize", post(fake_anonymize))
        .with_state(calls.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), calls)
}

/// A local URL with nothing listening on it.
async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn redactor_for(url: &str, fail_open: bool) -> Redactor {
    Redactor::from_config(&PiiConfig {
        analyzer_url: url.to_string(),
        anonymizer_url: url.to_string(),
        fail_open,
        timeout_secs: 5,
        ..PiiConfig::default()
    })
    .unwrap()
}

// ============ Test providers ============

/// Mock provider whose N-th embedding call fails.
struct FailingEmbedder {
    inner: MockProvider,
    fail_on: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl LlmProvider for FailingEmbedder {
    fn name(&self) -> &str {
        "failing"
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        file: Option<&FilePayload>,
    ) -> Result<Value, LlmError> {
        self.inner.generate_structured(prompt, file).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(LlmError::Status {
                status: 503,
                body: "embedding backend unavailable".into(),
            });
        }
        self.inner.embed(text).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system_instruction: &str,
    ) -> Result<TextStream, LlmError> {
        self.inner.generate_stream(prompt, system_instruction).await
    }
}

/// Sets its flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Streams one segment, then never finishes.
struct HangingStreamProvider {
    inner: MockProvider,
    stream_dropped: Arc<AtomicBool>,
}

#[async_trait]
impl LlmProvider for HangingStreamProvider {
    fn name(&self) -> &str {
        "hanging"
    }

    fn model_name(&self) -> &str {
        "hanging-model"
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        file: Option<&FilePayload>,
    ) -> Result<Value, LlmError> {
        self.inner.generate_structured(prompt, file).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.inner.embed(text).await
    }

    async fn generate_stream(&self, _: &str, _: &str) -> Result<TextStream, LlmError> {
        let flag = DropFlag(self.stream_dropped.clone());
        let segments = stream::once(async { Ok("first ".to_string()) })
            .chain(stream::pending())
            .map(move |item| {
                let _alive = &flag;
                item
            });
        Ok(segments.boxed())
    }
}

/// Mock provider that takes `delay` per embedding.
struct SlowEmbedder {
    inner: MockProvider,
    delay: Duration,
}

#[async_trait]
impl LlmProvider for SlowEmbedder {
    fn name(&self) -> &str {
        "slow"
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        file: Option<&FilePayload>,
    ) -> Result<Value, LlmError> {
        self.inner.generate_structured(prompt, file).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed(text).await
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system_instruction: &str,
    ) -> Result<TextStream, LlmError> {
        self.inner.generate_stream(prompt, system_instruction).await
    }
}

/// Queue whose first `failures` claims return an error.
struct FlakyQueue {
    inner: InMemoryQueue,
    failures: AtomicUsize,
}

#[async_trait]
impl JobQueue for FlakyQueue {
    async fn enqueue(&self, job: &IngestJob) -> anyhow::Result<i64> {
        self.inner.enqueue(job).await
    }

    async fn claim(&self) -> anyhow::Result<Option<QueuedJob>> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("database is locked");
        }
        self.inner.claim().await
    }

    async fn complete(&self, job: &QueuedJob) -> anyhow::Result<()> {
        self.inner.complete(job).await
    }

    async fn fail(&self, job: &QueuedJob, error: &str) -> anyhow::Result<FailOutcome> {
        self.inner.fail(job, error).await
    }

    async fn outstanding(&self) -> anyhow::Result<usize> {
        self.inner.outstanding().await
    }

    async fn extend_lease(&self, job: &QueuedJob) -> anyhow::Result<bool> {
        self.inner.extend_lease(job).await
    }

    async fn recover_expired(&self) -> anyhow::Result<usize> {
        self.inner.recover_expired().await
    }
}

// ============ Helpers ============

fn drain_options() -> WorkerOptions {
    WorkerOptions {
        concurrency: 1,
        poll_interval: Duration::from_millis(10),
        heartbeat: Duration::from_secs(1),
        drain: true,
    }
}

fn chunking(size: usize, overlap: usize) -> ChunkingConfig {
    ChunkingConfig { size, overlap }
}

async fn stage_document(
    store: &InMemoryStore,
    dir: &std::path::Path,
    owner: &str,
    filename: &str,
    body: &str,
) -> IngestJob {
    let path = dir.join(format!("{}-{}", owner, filename));
    std::fs::write(&path, body).unwrap();
    let doc = store
        .create_document(&NewDocument {
            owner_id: owner.to_string(),
            filename: filename.to_string(),
        })
        .await
        .unwrap();
    IngestJob {
        document_id: doc.id,
        file_path: path,
    }
}

async fn collect_events(chat: &ChatService, owner: &str, message: &str) -> Vec<ChatEvent> {
    let events = chat.open(owner, message).unwrap();
    tokio::time::timeout(Duration::from_secs(10), events.collect::<Vec<_>>())
        .await
        .expect("chat stream did not finish")
}

// ============ Tests ============

#[tokio::test]
async fn test_upload_to_answer_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let (presidio_url, calls) = spawn_fake_presidio().await;

    let store = Arc::new(InMemoryStore::new());
    let llm: Arc<dyn LlmProvider> = Arc::new(MockProvider::new(DIMS));
    let queue = Arc::new(InMemoryQueue::new(&QueueConfig::default()));

    let original = "Quarterly budget review. Contact jane.doe@example.com for details.";
    let source = tmp.path().join("budget.txt");
    std::fs::write(&source, original).unwrap();

    let upload = upload_file(
        store.as_ref(),
        queue.as_ref(),
        &tmp.path().join("uploads"),
        &source,
        "alice",
    )
    .await
    .unwrap();

    let ingestor = Ingestor::new(
        store.clone(),
        llm.clone(),
        redactor_for(&presidio_url, true),
        ChunkingConfig::default(),
    );
    let stats = run_worker(
        queue.clone(),
        ingestor,
        WorkerOptions {
            concurrency: 1,
            poll_interval: Duration::from_millis(10),
            heartbeat: Duration::from_secs(1),
            drain: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 0);

    let doc = store
        .get_document(&upload.document.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.media_type.as_deref(), Some("text/plain"));
    let content = doc.content.unwrap();
    assert!(content.contains("<EMAIL>"));
    assert!(!content.contains("jane.doe@example.com"));
    assert!(doc.metadata.get("fullText").is_none());
    assert_eq!(doc.metadata["summary"], "Mock summary");
    assert_eq!(calls.anonymize.load(Ordering::SeqCst), 1);

    let audit = store.audit_log(Some(&doc.id)).await.unwrap();
    let trail: Vec<&str> = audit.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(
        trail,
        vec![
            actions::PROCESS_START,
            actions::PII_REDACTION,
            actions::PROCESS_COMPLETE
        ]
    );
    assert_eq!(audit[0].status, AuditStatus::Info);
    assert_eq!(
        audit[1].details,
        format!(
            "Redacted {} chars (Original: {})",
            original.len() - content.len(),
            original.len()
        )
    );
    assert_eq!(audit[2].details, format!("Document {} ready.", doc.id));

    let retriever = Retriever::new(store.clone(), llm.clone(), 5);
    let chat = ChatService::new(retriever, llm.clone(), CURRENT_VERSION).unwrap();
    let events = collect_events(&chat, "alice", "What does the budget review say?").await;

    assert_eq!(events[0], ChatEvent::Status(ChatStage::FindingContext));
    assert_eq!(events[1], ChatEvent::Status(ChatStage::Generating));
    assert_eq!(events.last(), Some(&ChatEvent::Done));
    let data: Vec<&ChatEvent> = events
        .iter()
        .filter(|e| matches!(e, ChatEvent::Data(_)))
        .collect();
    assert!(!data.is_empty());
    assert_eq!(data.len(), events.len() - 3);
}

#[tokio::test]
async fn test_zero_findings_never_calls_anonymizer() {
    let tmp = tempfile::tempdir().unwrap();
    let (presidio_url, calls) = spawn_fake_presidio().await;
    let store = Arc::new(InMemoryStore::new());
    let ingestor = Ingestor::new(
        store.clone(),
        Arc::new(MockProvider::new(DIMS)),
        redactor_for(&presidio_url, true),
        ChunkingConfig::default(),
    );

    let job = stage_document(&store, tmp.path(), "alice", "plain.txt", "Nothing sensitive here.").await;
    ingestor.process(&job).await.unwrap();

    // full text and summary were both analyzed
    assert_eq!(calls.analyze.load(Ordering::SeqCst), 2);
    assert_eq!(calls.anonymize.load(Ordering::SeqCst), 0);
    let doc = store.get_document(&job.document_id).await.unwrap().unwrap();
    assert_eq!(doc.content.as_deref(), Some("Nothing sensitive here."));
}

#[tokio::test]
async fn test_unreachable_pii_service_fails_open() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let ingestor = Ingestor::new(
        store.clone(),
        Arc::new(MockProvider::new(DIMS)),
        redactor_for(&dead_url().await, true),
        ChunkingConfig::default(),
    );

    let text = "Reach me at bob@example.com";
    let job = stage_document(&store, tmp.path(), "bob", "contact.txt", text).await;
    let outcome = ingestor.process(&job).await.unwrap();
    assert!(matches!(
        outcome,
        IngestOutcome::Completed {
            redaction_degraded: true,
            redacted_delta: 0,
            ..
        }
    ));

    let doc = store.get_document(&job.document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.content.as_deref(), Some(text));

    let audit = store.audit_log(Some(&job.document_id)).await.unwrap();
    let redaction = audit
        .iter()
        .find(|e| e.action == actions::PII_REDACTION)
        .unwrap();
    assert_eq!(redaction.status, AuditStatus::Success);
    assert!(redaction.details.starts_with("Redacted 0 chars (Original: 27)"));
}

#[tokio::test]
async fn test_unreachable_pii_service_fails_closed_when_configured() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let redactor = redactor_for(&dead_url().await, false);
    assert_eq!(redactor.policy(), FailurePolicy::Closed);
    let ingestor = Ingestor::new(
        store.clone(),
        Arc::new(MockProvider::new(DIMS)),
        redactor,
        ChunkingConfig::default(),
    );

    let job = stage_document(&store, tmp.path(), "bob", "contact.txt", "bob@example.com").await;
    let err = ingestor.process(&job).await.unwrap_err();
    assert!(matches!(err, IngestError::Redaction(_)));

    let doc = store.get_document(&job.document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
    assert!(doc.content.is_none());
}

#[tokio::test]
async fn test_embedding_failure_midway_keeps_earlier_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let (presidio_url, _) = spawn_fake_presidio().await;
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(FailingEmbedder {
        inner: MockProvider::new(DIMS),
        fail_on: 3,
        calls: AtomicUsize::new(0),
    });
    let ingestor = Ingestor::new(
        store.clone(),
        llm.clone(),
        redactor_for(&presidio_url, true),
        chunking(10, 0),
    );

    // 50 characters in windows of 10 -> 5 chunks
    let body = "aaaaaaaaa bbbbbbbbb ccccccccc ddddddddd eeeeeeeee.";
    assert_eq!(body.chars().count(), 50);
    let job = stage_document(&store, tmp.path(), "alice", "five.txt", body).await;

    let err = ingestor.process(&job).await.unwrap_err();
    assert!(matches!(err, IngestError::Embedding { index: 2, .. }));
    assert_eq!(llm.calls.load(Ordering::SeqCst), 3);

    assert_eq!(store.count_embeddings(&job.document_id).await.unwrap(), 2);
    let doc = store.get_document(&job.document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);

    let audit = store.audit_log(Some(&job.document_id)).await.unwrap();
    let last = audit.last().unwrap();
    assert_eq!(last.action, actions::PROCESS_FAILED);
    assert_eq!(last.status, AuditStatus::Failure);
    assert_eq!(last.details, err.to_string());
    assert!(audit.iter().all(|e| e.action != actions::PROCESS_COMPLETE));
}

#[tokio::test]
async fn test_missing_file_fails_document() {
    let store = Arc::new(InMemoryStore::new());
    let ingestor = Ingestor::new(
        store.clone(),
        Arc::new(MockProvider::new(DIMS)),
        redactor_for(&dead_url().await, true),
        ChunkingConfig::default(),
    );
    let doc = store
        .create_document(&NewDocument {
            owner_id: "alice".into(),
            filename: "gone.txt".into(),
        })
        .await
        .unwrap();
    let job = IngestJob {
        document_id: doc.id.clone(),
        file_path: "/nonexistent/docrag/gone.txt".into(),
    };

    let err = ingestor.process(&job).await.unwrap_err();
    assert!(matches!(err, IngestError::Io { .. }));
    let doc = store.get_document(&doc.id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Failed);
}

#[tokio::test]
async fn test_redelivery_does_not_duplicate_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let ingestor = Ingestor::new(
        store.clone(),
        Arc::new(MockProvider::new(DIMS)),
        redactor_for(&dead_url().await, true),
        chunking(20, 5),
    );
    let job = stage_document(
        &store,
        tmp.path(),
        "alice",
        "notes.txt",
        "The launch moved to March after the security review finished.",
    )
    .await;

    let first = ingestor.process(&job).await.unwrap();
    let IngestOutcome::Completed { chunks, .. } = first else {
        panic!("expected first delivery to complete");
    };
    assert_eq!(store.count_embeddings(&job.document_id).await.unwrap(), chunks);

    let again = ingestor.process(&job).await.unwrap();
    assert_eq!(
        again,
        IngestOutcome::Skipped {
            status: DocumentStatus::Completed
        }
    );
    assert_eq!(store.count_embeddings(&job.document_id).await.unwrap(), chunks);
}

#[tokio::test]
async fn test_interrupted_document_is_rebuilt_from_scratch() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let ingestor = Ingestor::new(
        store.clone(),
        Arc::new(MockProvider::new(DIMS)),
        redactor_for(&dead_url().await, true),
        chunking(20, 5),
    );
    let job = stage_document(&store, tmp.path(), "alice", "notes.txt", "short note").await;

    // A crashed worker left the document mid-flight with a stray chunk.
    store
        .set_status(&job.document_id, DocumentStatus::Processing)
        .await
        .unwrap();
    store
        .append_embedding(&job.document_id, 0, "stale", &[1.0; DIMS])
        .await
        .unwrap();

    let outcome = ingestor.process(&job).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Completed { chunks: 1, .. }));
    assert_eq!(store.count_embeddings(&job.document_id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_retrieval_is_owner_scoped() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let llm: Arc<dyn LlmProvider> = Arc::new(MockProvider::new(DIMS));
    let ingestor = Ingestor::new(
        store.clone(),
        llm.clone(),
        redactor_for(&dead_url().await, true),
        ChunkingConfig::default(),
    );

    let alice = stage_document(
        &store,
        tmp.path(),
        "alice",
        "alice-secrets.txt",
        "Alice's launch codes are kept in the orange vault.",
    )
    .await;
    let bob = stage_document(
        &store,
        tmp.path(),
        "bob",
        "bob-recipes.txt",
        "Bob bakes sourdough bread every Sunday morning.",
    )
    .await;
    ingestor.process(&alice).await.unwrap();
    ingestor.process(&bob).await.unwrap();

    let retriever = Retriever::new(store.clone(), llm.clone(), 5);
    let for_bob = retriever
        .retrieve("where are the launch codes kept?", "bob")
        .await
        .unwrap();
    assert!(!for_bob.is_empty());
    assert!(for_bob.iter().all(|c| c.source_filename == "bob-recipes.txt"));

    let for_alice = retriever
        .retrieve("where are the launch codes kept?", "alice")
        .await
        .unwrap();
    assert_eq!(for_alice[0].source_filename, "alice-secrets.txt");

    let for_carol = retriever.retrieve("anything", "carol").await.unwrap();
    assert!(for_carol.is_empty());
}

#[tokio::test]
async fn test_chat_without_documents_answers_not_found() {
    let store = Arc::new(InMemoryStore::new());
    let llm: Arc<dyn LlmProvider> = Arc::new(MockProvider::new(DIMS));
    let chat = ChatService::new(Retriever::new(store, llm.clone(), 5), llm, CURRENT_VERSION).unwrap();

    let events = collect_events(&chat, "nobody", "What is the deadline?").await;
    let answer: String = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Data(text) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(answer, NOT_FOUND_PHRASE);
    assert_eq!(events.last(), Some(&ChatEvent::Done));
}

#[tokio::test]
async fn test_chat_rejects_empty_message_before_streaming() {
    let store = Arc::new(InMemoryStore::new());
    let llm: Arc<dyn LlmProvider> = Arc::new(MockProvider::new(DIMS));
    let chat = ChatService::new(Retriever::new(store, llm.clone(), 5), llm, CURRENT_VERSION).unwrap();

    assert!(chat.open("alice", "   ").is_err());
    assert!(chat.open("", "hello").is_err());
}

#[tokio::test]
async fn test_generation_failure_ends_with_error_event() {
    struct BrokenStream(MockProvider);

    #[async_trait]
    impl LlmProvider for BrokenStream {
        fn name(&self) -> &str {
            "broken"
        }
        fn model_name(&self) -> &str {
            "broken-model"
        }
        fn dims(&self) -> usize {
            self.0.dims()
        }
        async fn generate_structured(
            &self,
            prompt: &str,
            file: Option<&FilePayload>,
        ) -> Result<Value, LlmError> {
            self.0.generate_structured(prompt, file).await
        }
        async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
            self.0.embed(text).await
        }
        async fn generate_stream(&self, _: &str, _: &str) -> Result<TextStream, LlmError> {
            let segments = vec![
                Ok("partial ".to_string()),
                Err(LlmError::Stream("connection reset".into())),
            ];
            Ok(stream::iter(segments).boxed())
        }
    }

    let store = Arc::new(InMemoryStore::new());
    let llm: Arc<dyn LlmProvider> = Arc::new(BrokenStream(MockProvider::new(DIMS)));
    let chat = ChatService::new(Retriever::new(store, llm.clone(), 5), llm, CURRENT_VERSION).unwrap();

    let events = collect_events(&chat, "alice", "hello?").await;
    assert_eq!(
        events,
        vec![
            ChatEvent::Status(ChatStage::FindingContext),
            ChatEvent::Status(ChatStage::Generating),
            ChatEvent::Data("partial ".into()),
            ChatEvent::Error,
        ]
    );
}

#[tokio::test]
async fn test_client_disconnect_cancels_generation() {
    let dropped = Arc::new(AtomicBool::new(false));
    let store = Arc::new(InMemoryStore::new());
    let llm: Arc<dyn LlmProvider> = Arc::new(HangingStreamProvider {
        inner: MockProvider::new(DIMS),
        stream_dropped: dropped.clone(),
    });
    let chat = ChatService::new(Retriever::new(store, llm.clone(), 5), llm, CURRENT_VERSION).unwrap();

    let mut events = chat.open("alice", "tell me everything").unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, ChatEvent::Data(_)) {
            break;
        }
    }
    assert!(!dropped.load(Ordering::SeqCst));
    drop(events);

    for _ in 0..100 {
        if dropped.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("generation stream was not dropped after disconnect");
}

#[tokio::test]
async fn test_worker_marks_failed_job_dead() {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryQueue::new(&QueueConfig::default()));
    let doc = store
        .create_document(&NewDocument {
            owner_id: "alice".into(),
            filename: "gone.txt".into(),
        })
        .await
        .unwrap();
    let job_id = queue
        .enqueue(&IngestJob {
            document_id: doc.id.clone(),
            file_path: "/nonexistent/docrag/gone.txt".into(),
        })
        .await
        .unwrap();

    let ingestor = Ingestor::new(
        store.clone(),
        Arc::new(MockProvider::new(DIMS)),
        redactor_for(&dead_url().await, true),
        ChunkingConfig::default(),
    );
    let stats = run_worker(
        queue.clone(),
        ingestor,
        WorkerOptions {
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            heartbeat: Duration::from_secs(1),
            drain: true,
        },
    )
    .await
    .unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(queue.state(job_id), Some(JobState::Dead));
    assert!(queue.last_error(job_id).unwrap().contains("failed to read"));
}

#[tokio::test]
async fn test_worker_retries_transient_failure_to_completion() {
    let tmp = tempfile::tempdir().unwrap();
    let (presidio_url, _) = spawn_fake_presidio().await;
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryQueue::new(&QueueConfig {
        max_attempts: 3,
        backoff_secs: 0,
        ..QueueConfig::default()
    }));
    let llm = Arc::new(FailingEmbedder {
        inner: MockProvider::new(DIMS),
        fail_on: 1,
        calls: AtomicUsize::new(0),
    });

    let body = "aaaaaaaaa bbbbbbbbb ccccccccc.";
    let job = stage_document(&store, tmp.path(), "alice", "three.txt", body).await;
    let job_id = queue.enqueue(&job).await.unwrap();

    let ingestor = Ingestor::new(
        store.clone(),
        llm.clone(),
        redactor_for(&presidio_url, true),
        chunking(10, 0),
    );
    let stats = run_worker(queue.clone(), ingestor, drain_options())
        .await
        .unwrap();

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.skipped, 0);
    assert_eq!(queue.state(job_id), Some(JobState::Done));

    let doc = store.get_document(&job.document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(store.count_embeddings(&job.document_id).await.unwrap(), 3);

    let audit = store.audit_log(Some(&job.document_id)).await.unwrap();
    let failed = audit
        .iter()
        .position(|e| e.action == actions::PROCESS_FAILED)
        .expect("missing PROCESS_FAILED");
    let complete = audit
        .iter()
        .position(|e| e.action == actions::PROCESS_COMPLETE)
        .expect("missing PROCESS_COMPLETE");
    assert!(failed < complete);
    assert!(audit[failed].details.contains("attempt 1 of 3, will retry"));
}

#[tokio::test]
async fn test_failure_with_attempts_left_keeps_document_processing() {
    let tmp = tempfile::tempdir().unwrap();
    let (presidio_url, _) = spawn_fake_presidio().await;
    let store = Arc::new(InMemoryStore::new());
    let ingestor = Ingestor::new(
        store.clone(),
        Arc::new(FailingEmbedder {
            inner: MockProvider::new(DIMS),
            fail_on: 2,
            calls: AtomicUsize::new(0),
        }),
        redactor_for(&presidio_url, true),
        chunking(10, 0),
    );
    let body = "aaaaaaaaa bbbbbbbbb ccccccccc.";
    let job = stage_document(&store, tmp.path(), "alice", "three.txt", body).await;

    ingestor.process_attempt(&job, 1, 2).await.unwrap_err();
    let doc = store.get_document(&job.document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Processing);
    assert_eq!(store.count_embeddings(&job.document_id).await.unwrap(), 1);

    let outcome = ingestor.process_attempt(&job, 2, 2).await.unwrap();
    assert!(matches!(outcome, IngestOutcome::Completed { chunks: 3, .. }));
    assert_eq!(store.count_embeddings(&job.document_id).await.unwrap(), 3);
}

#[tokio::test]
async fn test_worker_survives_queue_errors() {
    let tmp = tempfile::tempdir().unwrap();
    let (presidio_url, _) = spawn_fake_presidio().await;
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(FlakyQueue {
        inner: InMemoryQueue::new(&QueueConfig::default()),
        failures: AtomicUsize::new(2),
    });
    let job = stage_document(&store, tmp.path(), "alice", "note.txt", "Short note.").await;
    queue.enqueue(&job).await.unwrap();

    let ingestor = Ingestor::new(
        store.clone(),
        Arc::new(MockProvider::new(DIMS)),
        redactor_for(&presidio_url, true),
        ChunkingConfig::default(),
    );
    let stats = run_worker(queue.clone(), ingestor, drain_options())
        .await
        .unwrap();

    assert_eq!(stats.completed, 1);
    assert_eq!(queue.failures.load(Ordering::SeqCst), 0);
    let doc = store.get_document(&job.document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Completed);
}

#[tokio::test]
async fn test_heartbeat_holds_job_past_its_lease() {
    let tmp = tempfile::tempdir().unwrap();
    let (presidio_url, _) = spawn_fake_presidio().await;
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(
        InMemoryQueue::new(&QueueConfig::default()).with_lease(Duration::from_millis(100)),
    );
    let body = "aaaaaaaaa bbbbbbbbb ccccccccc.";
    let job = stage_document(&store, tmp.path(), "alice", "three.txt", body).await;
    let job_id = queue.enqueue(&job).await.unwrap();

    let ingestor = Ingestor::new(
        store.clone(),
        Arc::new(SlowEmbedder {
            inner: MockProvider::new(DIMS),
            delay: Duration::from_millis(150),
        }),
        redactor_for(&presidio_url, true),
        chunking(10, 0),
    );
    let worker = tokio::spawn(run_worker(
        queue.clone(),
        ingestor,
        WorkerOptions {
            heartbeat: Duration::from_millis(20),
            ..drain_options()
        },
    ));

    while queue.state(job_id) != Some(JobState::Running) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // A second consumer keeps trying to take the job while it is worked on.
    let mut stolen = 0;
    while queue.state(job_id) != Some(JobState::Done) {
        queue.recover_expired().await.unwrap();
        if queue.claim().await.unwrap().is_some() {
            stolen += 1;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = worker.await.unwrap().unwrap();
    assert_eq!(stolen, 0);
    assert_eq!(stats.completed, 1);
    assert_eq!(store.count_embeddings(&job.document_id).await.unwrap(), 3);
}
