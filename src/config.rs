use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::llm::KNOWN_PROVIDERS;
use crate::prompts;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub pii: PiiConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
        }
    }
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Window size in characters.
    #[serde(default = "default_chunk_size")]
    pub size: usize,
    /// Characters shared between consecutive windows.
    #[serde(default = "default_chunk_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
            overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Generation model used for extraction and chat answers.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            dims: default_dims(),
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_provider() -> String {
    "gemini".to_string()
}
fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-004".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}
fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct PiiConfig {
    #[serde(default = "default_analyzer_url")]
    pub analyzer_url: String,
    #[serde(default = "default_anonymizer_url")]
    pub anonymizer_url: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// When true, redaction service failures pass the original text through.
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
    #[serde(default = "default_pii_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PiiConfig {
    fn default() -> Self {
        Self {
            analyzer_url: default_analyzer_url(),
            anonymizer_url: default_anonymizer_url(),
            language: default_language(),
            fail_open: default_fail_open(),
            timeout_secs: default_pii_timeout_secs(),
        }
    }
}

fn default_analyzer_url() -> String {
    "http://localhost:5001".to_string()
}
fn default_anonymizer_url() -> String {
    "http://localhost:5002".to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_fail_open() -> bool {
    true
}
fn default_pii_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long a claimed job stays reserved without a heartbeat before
    /// another worker may take it over.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            concurrency: default_concurrency(),
            lease_secs: default_lease_secs(),
        }
    }
}

fn default_queue_name() -> String {
    crate::queue::DOCUMENT_QUEUE.to_string()
}
fn default_max_attempts() -> u32 {
    1
}
fn default_backoff_secs() -> u64 {
    5
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_concurrency() -> usize {
    1
}
fn default_lease_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            prompt_version: default_prompt_version(),
        }
    }
}

fn default_prompt_version() -> String {
    prompts::CURRENT_VERSION.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

/// Deployment-level overrides that take precedence over the TOML file.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(url) = std::env::var("PRESIDIO_ANALYZER_URL") {
        config.pii.analyzer_url = url;
    }
    if let Ok(url) = std::env::var("PRESIDIO_ANONYMIZER_URL") {
        config.pii.anonymizer_url = url;
    }
    if let Ok(provider) = std::env::var("AI_PROVIDER") {
        config.llm.provider = provider.to_lowercase();
    }
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.size == 0 {
        anyhow::bail!("chunking.size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.size {
        anyhow::bail!(
            "chunking.overlap ({}) must be smaller than chunking.size ({})",
            config.chunking.overlap,
            config.chunking.size
        );
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    // Validate provider
    if !KNOWN_PROVIDERS.contains(&config.llm.provider.as_str()) {
        anyhow::bail!(
            "Unknown LLM provider: '{}'. Must be one of: {}",
            config.llm.provider,
            KNOWN_PROVIDERS.join(", ")
        );
    }
    if config.llm.dims == 0 {
        anyhow::bail!("llm.dims must be > 0");
    }

    // Validate queue
    if config.queue.max_attempts == 0 {
        anyhow::bail!("queue.max_attempts must be >= 1");
    }
    if config.queue.concurrency == 0 {
        anyhow::bail!("queue.concurrency must be >= 1");
    }
    if config.queue.lease_secs == 0 {
        anyhow::bail!("queue.lease_secs must be >= 1");
    }

    // Validate prompt version
    if prompts::lookup(&config.chat.prompt_version).is_none() {
        anyhow::bail!(
            "Unknown chat.prompt_version: '{}'. Known versions: {}",
            config.chat.prompt_version,
            prompts::versions().join(", ")
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Config {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = parse("[db]\npath = \"./data/docrag.sqlite\"\n");
        assert_eq!(config.chunking.size, 1000);
        assert_eq!(config.chunking.overlap, 200);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.llm.provider, "gemini");
        assert!(config.pii.fail_open);
        assert_eq!(config.queue.name, "document-processing");
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let config = parse(
            "[db]\npath = \"x.sqlite\"\n[chunking]\nsize = 100\noverlap = 100\n",
        );
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("chunking.overlap"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = parse("[db]\npath = \"x.sqlite\"\n[llm]\nprovider = \"openai\"\n");
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("Unknown LLM provider"));
    }

    #[test]
    fn test_unknown_prompt_version_rejected() {
        let config = parse("[db]\npath = \"x.sqlite\"\n[chat]\nprompt_version = \"v9\"\n");
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = parse(include_str!("../config/docrag.example.toml"));
        validate(&config).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:3000");
    }

    #[test]
    fn test_zero_lease_rejected() {
        let config = parse("[db]\npath = \"x.sqlite\"\n[queue]\nlease_secs = 0\n");
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("queue.lease_secs"));
    }

    #[test]
    fn test_load_config_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docrag.toml");
        std::fs::write(
            &path,
            "[db]\npath = \"data.sqlite\"\n[llm]\nprovider = \"mock\"\n[pii]\nfail_open = false\n",
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert!(!config.pii.fail_open);
    }
}
