//! # docrag
//!
//! Document ingestion with PII redaction, vector indexing, and streamed
//! retrieval-augmented answers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────┐   ┌──────────────────────────────────┐   ┌──────────┐
//! │  upload  │──▶│ queue │──▶│ worker: sniff → extract → redact │──▶│  SQLite  │
//! └──────────┘   └───────┘   │         → chunk → embed          │   │ docs+vec │
//!                            └──────────────────────────────────┘   └────┬─────┘
//!                                                                        │
//!                                  ┌─────────────────────────────────────┤
//!                                  ▼                                     ▼
//!                             ┌──────────┐                         ┌──────────┐
//!                             │ ask (CLI)│                         │ HTTP SSE │
//!                             └──────────┘                         └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docrag init                                  # create database
//! docrag upload report.pdf --owner alice       # stage + queue a document
//! docrag worker --drain                        # process queued documents
//! docrag ask "What is the deadline?" --owner alice
//! docrag serve                                 # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`sniff`] | Magic-number media type detection |
//! | [`pii`] | PII redaction gateway (fail-open) |
//! | [`chunk`] | Sliding-window text chunking |
//! | [`llm`] | Extraction, embedding, and generation providers |
//! | [`ingest`] | Ingestion pipeline orchestrator |
//! | [`queue`] | Durable job queue |
//! | [`worker`] | Queue consumer |
//! | [`retrieval`] | Owner-scoped semantic retrieval |
//! | [`chat`] | Streaming chat sessions |
//! | [`feedback`] | Answer feedback |
//! | [`store`] | Storage trait and backends |
//! | [`server`] | HTTP server |

pub mod app;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod feedback;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pii;
pub mod prompts;
pub mod queue;
pub mod retrieval;
pub mod server;
pub mod sniff;
pub mod status;
pub mod store;
pub mod upload;
pub mod worker;
