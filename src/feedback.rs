//! Answer feedback.
//!
//! Stateless: each submission becomes one [`Feedback`] row tagged with the
//! prompt version and model that produced the answer. Clients may name
//! both explicitly; otherwise the serving defaults are recorded.

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::Config;
use crate::llm::create_provider;
use crate::models::Feedback;
use crate::store::{SqliteStore, Store};

/// Body of `POST /api/chat/feedback`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    pub message_id: String,
    pub is_positive: bool,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub prompt_version: Option<String>,
    #[serde(default)]
    pub model_used: Option<String>,
}

/// Values recorded when a request leaves them out.
#[derive(Debug, Clone)]
pub struct FeedbackDefaults {
    pub prompt_version: String,
    pub model_used: String,
}

pub async fn submit_feedback(
    store: &dyn Store,
    owner_id: &str,
    request: FeedbackRequest,
    defaults: &FeedbackDefaults,
) -> Result<Feedback> {
    if owner_id.trim().is_empty() {
        bail!("owner id must not be empty");
    }
    if request.message_id.trim().is_empty() {
        bail!("messageId must not be empty");
    }

    let feedback = Feedback {
        id: Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        message_id: request.message_id,
        is_positive: request.is_positive,
        comment: request.comment.filter(|c| !c.trim().is_empty()),
        prompt_version: request
            .prompt_version
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| defaults.prompt_version.clone()),
        model_used: request
            .model_used
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| defaults.model_used.clone()),
        created_at: Utc::now(),
    };

    store.insert_feedback(&feedback).await?;
    Ok(feedback)
}

/// `docrag feedback --owner <id> --message-id <id> (--positive|--negative)`
pub async fn run_feedback(
    config: &Config,
    owner_id: &str,
    request: FeedbackRequest,
) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let defaults = FeedbackDefaults {
        prompt_version: config.chat.prompt_version.clone(),
        model_used: create_provider(&config.llm)?.model_name().to_string(),
    };

    let saved = submit_feedback(&store, owner_id, request, &defaults).await?;
    println!("feedback recorded");
    println!("  id: {}", saved.id);
    println!("  positive: {}", saved.is_positive);
    println!("  prompt version: {}", saved.prompt_version);
    println!("  model: {}", saved.model_used);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn defaults() -> FeedbackDefaults {
        FeedbackDefaults {
            prompt_version: "v1.0.0".into(),
            model_used: "gemini-2.5-flash".into(),
        }
    }

    #[tokio::test]
    async fn test_defaults_applied() {
        let store = InMemoryStore::new();
        let request: FeedbackRequest =
            serde_json::from_str(r#"{"messageId": "m1", "isPositive": true}"#).unwrap();
        let saved = submit_feedback(&store, "u1", request, &defaults())
            .await
            .unwrap();
        assert_eq!(saved.prompt_version, "v1.0.0");
        assert_eq!(saved.model_used, "gemini-2.5-flash");
        assert_eq!(store.list_feedback("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_explicit_values_win() {
        let store = InMemoryStore::new();
        let request: FeedbackRequest = serde_json::from_str(
            r#"{"messageId": "m2", "isPositive": false, "comment": "wrong",
                "promptVersion": "v0.9.0", "modelUsed": "other-model"}"#,
        )
        .unwrap();
        let saved = submit_feedback(&store, "u1", request, &defaults())
            .await
            .unwrap();
        assert!(!saved.is_positive);
        assert_eq!(saved.comment.as_deref(), Some("wrong"));
        assert_eq!(saved.prompt_version, "v0.9.0");
        assert_eq!(saved.model_used, "other-model");
    }

    #[tokio::test]
    async fn test_empty_message_id_rejected() {
        let store = InMemoryStore::new();
        let request = FeedbackRequest {
            message_id: " ".into(),
            is_positive: true,
            comment: None,
            prompt_version: None,
            model_used: None,
        };
        assert!(submit_feedback(&store, "u1", request, &defaults())
            .await
            .is_err());
    }
}
