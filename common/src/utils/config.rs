use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Selects the embedding backend for vector generation.
#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Use an OpenAI-compatible API for embeddings (default).
    #[default]
    OpenAI,
    /// Deterministic hashed embeddings, for testing and offline runs.
    Hashed,
}

/// Application configuration loaded from files and environment variables.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_query_model")]
    pub query_model: String,
    #[serde(default = "default_processing_model")]
    pub processing_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    #[serde(default)]
    pub embedding_backend: EmbeddingBackend,
    #[serde(default = "default_reranking_enabled")]
    pub reranking_enabled: bool,
    #[serde(default)]
    pub reranking_pool_size: Option<usize>,
    #[serde(default = "default_ingestion_workers")]
    pub ingestion_workers: usize,
    #[serde(default = "default_ingestion_queue_bound")]
    pub ingestion_queue_bound: usize,
    #[serde(default = "default_processing_reap_secs")]
    pub processing_reap_secs: u64,
    #[serde(default = "default_response_cache_capacity")]
    pub response_cache_capacity: usize,
    #[serde(default = "default_response_cache_ttl_secs")]
    pub response_cache_ttl_secs: u64,
    #[serde(default = "default_lexical_index_users")]
    pub lexical_index_users: usize,
    #[serde(default = "default_answer_deadline_secs")]
    pub answer_deadline_secs: u64,
    #[serde(default = "default_retrieve_deadline_secs")]
    pub retrieve_deadline_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_query_model() -> String {
    "gpt-4o".to_string()
}

fn default_processing_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimension() -> usize {
    768
}

fn default_reranking_enabled() -> bool {
    false
}

fn default_ingestion_workers() -> usize {
    2
}

fn default_ingestion_queue_bound() -> usize {
    64
}

fn default_processing_reap_secs() -> u64 {
    600
}

fn default_response_cache_capacity() -> usize {
    500
}

fn default_response_cache_ttl_secs() -> u64 {
    3600
}

fn default_lexical_index_users() -> usize {
    256
}

fn default_answer_deadline_secs() -> u64 {
    30
}

fn default_retrieve_deadline_secs() -> u64 {
    5
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: String::new(),
            surrealdb_username: String::new(),
            surrealdb_password: String::new(),
            surrealdb_namespace: String::new(),
            surrealdb_database: String::new(),
            openai_api_key: String::new(),
            openai_base_url: default_base_url(),
            query_model: default_query_model(),
            processing_model: default_processing_model(),
            embedding_model: default_embedding_model(),
            embedding_dimension: default_embedding_dimension(),
            embedding_backend: EmbeddingBackend::default(),
            reranking_enabled: default_reranking_enabled(),
            reranking_pool_size: None,
            ingestion_workers: default_ingestion_workers(),
            ingestion_queue_bound: default_ingestion_queue_bound(),
            processing_reap_secs: default_processing_reap_secs(),
            response_cache_capacity: default_response_cache_capacity(),
            response_cache_ttl_secs: default_response_cache_ttl_secs(),
            lexical_index_users: default_lexical_index_users(),
            answer_deadline_secs: default_answer_deadline_secs(),
            retrieve_deadline_secs: default_retrieve_deadline_secs(),
        }
    }
}

/// Loads the application configuration from the environment and optional config file.
#[allow(clippy::module_name_repetitions)]
pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
