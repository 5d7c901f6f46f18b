//! HTTP server for chat, feedback, and document listing.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/chat` | Stream a grounded answer as server-sent events |
//! | `POST` | `/api/chat/feedback` | Record feedback on an answer |
//! | `GET`  | `/api/documents` | List the caller's documents |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! The caller is identified by the `x-owner-id` header. Authentication is
//! expected to happen in front of this server.
//!
//! # Error Contract
//!
//! Errors raised before a stream opens are JSON:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Once a chat stream is open, failures arrive in-band as
//! `event: error\ndata: {"error":"Stream failed"}`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::app::AppContext;
use crate::chat::{ChatError, ChatEvent, ChatService};
use crate::config::Config;
use crate::feedback::{submit_feedback, FeedbackDefaults, FeedbackRequest};
use crate::models::{Document, DocumentStatus};
use crate::store::Store;

pub const OWNER_HEADER: &str = "x-owner-id";

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub chat: ChatService,
    pub feedback_defaults: FeedbackDefaults,
}

/// Start the server on `[server].bind` and run until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let ctx = AppContext::open(config).await?;
    let state = AppState {
        store: ctx.store.clone(),
        chat: ctx.chat()?,
        feedback_defaults: ctx.feedback_defaults(),
    };

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(%bind_addr, provider = ctx.llm.name(), "server listening");
    println!("docrag server listening on http://{}", bind_addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/chat", post(handle_chat))
        .route("/api/chat/feedback", post(handle_feedback))
        .route("/api/documents", get(handle_documents))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: "Internal Server Error".to_string(),
    }
}

fn owner_id(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| bad_request(format!("missing {} header", OWNER_HEADER)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

fn to_sse(event: ChatEvent) -> Event {
    let frame = match event.event_name() {
        Some(name) => Event::default().event(name),
        None => Event::default(),
    };
    frame.data(event.data())
}

async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let owner = owner_id(&headers)?;
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;

    let events = state
        .chat
        .open(&owner, &request.message)
        .map_err(|e| match e {
            ChatError::EmptyMessage | ChatError::MissingOwner => bad_request(e.to_string()),
            other => internal(other.into()),
        })?;

    Ok(Sse::new(events.map(|event| Ok(to_sse(event)))).keep_alive(KeepAlive::default()))
}

// ============ POST /api/chat/feedback ============

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
}

async fn handle_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<FeedbackRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, AppError> {
    let owner = owner_id(&headers)?;
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;
    if request.message_id.trim().is_empty() {
        return Err(bad_request("messageId must not be empty"));
    }

    submit_feedback(
        state.store.as_ref(),
        &owner,
        request,
        &state.feedback_defaults,
    )
    .await
    .map_err(internal)?;

    Ok(Json(StatusResponse { status: "ok" }))
}

// ============ GET /api/documents ============

#[derive(Serialize)]
struct DocumentSummary {
    id: String,
    filename: String,
    status: DocumentStatus,
    media_type: Option<String>,
    metadata: serde_json::Value,
    created_at: String,
}

impl From<Document> for DocumentSummary {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            filename: doc.filename,
            status: doc.status,
            media_type: doc.media_type,
            metadata: doc.metadata,
            created_at: doc.created_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct DocumentList {
    documents: Vec<DocumentSummary>,
}

async fn handle_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DocumentList>, AppError> {
    let owner = owner_id(&headers)?;
    let docs = state
        .store
        .list_documents(&owner)
        .await
        .map_err(internal)?;

    Ok(Json(DocumentList {
        documents: docs.into_iter().map(DocumentSummary::from).collect(),
    }))
}
