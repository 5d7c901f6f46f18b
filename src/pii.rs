//! PII redaction gateway.
//!
//! Wraps an external entity-detection/anonymization service (Presidio's
//! analyzer and anonymizer HTTP APIs) behind the [`PiiDetector`] trait and
//! applies a fixed per-entity replacement table.
//!
//! # Failure policy
//!
//! The gateway is **fail-open** by default: when the service is unreachable
//! or returns an error, the failure is logged at `warn` level and the
//! original text is returned unchanged, flagged as [`Redaction::degraded`].
//! This trades confidentiality for availability and is a deliberate,
//! per-deployment choice: set `pii.fail_open = false` to make service
//! failures propagate as [`RedactionError`] instead.
//!
//! # Protocol
//!
//! 1. `POST {analyzer}/analyze {text, language, return_decision_process: false}`
//!    returns a list of entity findings.
//! 2. Zero findings ⇒ return the text as-is without calling the anonymizer.
//! 3. `POST {anonymizer}/anonymize {text, analyzer_results, anonymizers}`
//!    returns `{text}` with each entity replaced by its placeholder.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PiiConfig;

/// Errors raised by the PII service.
#[derive(Debug, Error)]
pub enum RedactionError {
    #[error("PII service request failed: {0}")]
    Request(String),

    #[error("PII service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("PII service returned an unreadable response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RedactionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RedactionError::Decode(err.to_string())
        } else {
            RedactionError::Request(err.to_string())
        }
    }
}

/// A sensitive-entity span reported by the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityFinding {
    pub entity_type: String,
    pub start: usize,
    pub end: usize,
    pub score: f64,
}

/// An anonymizer operator, serialized as `{"type": "replace", "new_value": ...}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Anonymizer {
    #[serde(rename = "type")]
    pub kind: String,
    pub new_value: String,
}

impl Anonymizer {
    pub fn replace(new_value: &str) -> Self {
        Self {
            kind: "replace".to_string(),
            new_value: new_value.to_string(),
        }
    }
}

/// Placeholder used for any entity type without a dedicated entry.
pub const DEFAULT_PLACEHOLDER: &str = "<REDACTED>";

/// The fixed entity → placeholder table sent with every anonymize call.
///
/// `DEFAULT` is the anonymizer's catch-all key for unlisted entity types.
pub fn replacement_table() -> BTreeMap<String, Anonymizer> {
    [
        ("DEFAULT", DEFAULT_PLACEHOLDER),
        ("PHONE_NUMBER", "<PHONE>"),
        ("EMAIL_ADDRESS", "<EMAIL>"),
        ("PERSON", "<PERSON>"),
        ("CREDIT_CARD", "<CREDIT_CARD>"),
        ("US_SSN", "<ID_NUM>"),
    ]
    .into_iter()
    .map(|(entity, placeholder)| (entity.to_string(), Anonymizer::replace(placeholder)))
    .collect()
}

/// Entity detection and anonymization backend.
#[async_trait]
pub trait PiiDetector: Send + Sync {
    /// Find sensitive-entity spans in `text`.
    async fn analyze(&self, text: &str) -> Result<Vec<EntityFinding>, RedactionError>;

    /// Replace the given spans using the supplied operator table.
    async fn anonymize(
        &self,
        text: &str,
        findings: &[EntityFinding],
        anonymizers: &BTreeMap<String, Anonymizer>,
    ) -> Result<String, RedactionError>;
}

// ============ Presidio client ============

/// HTTP client for Presidio's analyzer and anonymizer services.
pub struct PresidioClient {
    client: reqwest::Client,
    analyzer_url: String,
    anonymizer_url: String,
    language: String,
}

impl PresidioClient {
    pub fn new(config: &PiiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            analyzer_url: config.analyzer_url.trim_end_matches('/').to_string(),
            anonymizer_url: config.anonymizer_url.trim_end_matches('/').to_string(),
            language: config.language.clone(),
        })
    }
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    text: &'a str,
    language: &'a str,
    return_decision_process: bool,
}

#[derive(Serialize)]
struct AnonymizeRequest<'a> {
    text: &'a str,
    analyzer_results: &'a [EntityFinding],
    anonymizers: &'a BTreeMap<String, Anonymizer>,
}

#[derive(Deserialize)]
struct AnonymizeResponse {
    text: String,
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, RedactionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RedactionError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl PiiDetector for PresidioClient {
    async fn analyze(&self, text: &str) -> Result<Vec<EntityFinding>, RedactionError> {
        let response = self
            .client
            .post(format!("{}/analyze", self.analyzer_url))
            .json(&AnalyzeRequest {
                text,
                language: &self.language,
                return_decision_process: false,
            })
            .send()
            .await?;

        let findings = ensure_success(response).await?.json().await?;
        Ok(findings)
    }

    async fn anonymize(
        &self,
        text: &str,
        findings: &[EntityFinding],
        anonymizers: &BTreeMap<String, Anonymizer>,
    ) -> Result<String, RedactionError> {
        let response = self
            .client
            .post(format!("{}/anonymize", self.anonymizer_url))
            .json(&AnonymizeRequest {
                text,
                analyzer_results: findings,
                anonymizers,
            })
            .send()
            .await?;

        let body: AnonymizeResponse = ensure_success(response).await?.json().await?;
        Ok(body.text)
    }
}

// ============ Redactor ============

/// What to do when the PII service fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and pass the original text through.
    Open,
    /// Propagate the service error to the caller.
    Closed,
}

/// Result of redacting one piece of text.
#[derive(Debug, Clone, PartialEq)]
pub struct Redaction {
    pub text: String,
    /// Number of entity spans the analyzer reported.
    pub entities: usize,
    /// True when the service failed and the text was passed through unredacted.
    pub degraded: bool,
}

impl Redaction {
    fn unchanged(text: &str, degraded: bool) -> Self {
        Self {
            text: text.to_string(),
            entities: 0,
            degraded,
        }
    }
}

/// Applies the replacement table through a [`PiiDetector`] under a [`FailurePolicy`].
#[derive(Clone)]
pub struct Redactor {
    detector: Arc<dyn PiiDetector>,
    policy: FailurePolicy,
    table: BTreeMap<String, Anonymizer>,
}

impl Redactor {
    pub fn new(detector: Arc<dyn PiiDetector>, policy: FailurePolicy) -> Self {
        Self {
            detector,
            policy,
            table: replacement_table(),
        }
    }

    /// Build a Presidio-backed redactor from configuration.
    pub fn from_config(config: &PiiConfig) -> anyhow::Result<Self> {
        let policy = if config.fail_open {
            FailurePolicy::Open
        } else {
            FailurePolicy::Closed
        };
        Ok(Self::new(Arc::new(PresidioClient::new(config)?), policy))
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Redact `text`.
    ///
    /// Under [`FailurePolicy::Open`] this never returns an error.
    pub async fn redact(&self, text: &str) -> Result<Redaction, RedactionError> {
        if text.is_empty() {
            return Ok(Redaction::unchanged(text, false));
        }

        match self.try_redact(text).await {
            Ok(redaction) => Ok(redaction),
            Err(e) => match self.policy {
                FailurePolicy::Open => {
                    warn!(error = %e, "PII service unavailable, passing text through unredacted");
                    Ok(Redaction::unchanged(text, true))
                }
                FailurePolicy::Closed => Err(e),
            },
        }
    }

    async fn try_redact(&self, text: &str) -> Result<Redaction, RedactionError> {
        let findings = self.detector.analyze(text).await?;
        if findings.is_empty() {
            debug!("no PII entities found");
            return Ok(Redaction::unchanged(text, false));
        }

        let redacted = self
            .detector
            .anonymize(text, &findings, &self.table)
            .await?;

        debug!(entities = findings.len(), "PII entities redacted");
        Ok(Redaction {
            text: redacted,
            entities: findings.len(),
            degraded: false,
        })
    }
}
