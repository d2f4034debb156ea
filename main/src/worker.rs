use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use common::{
    llm::OpenAiLlmClient,
    storage::{db::SurrealDbClient, indexes::ensure_runtime_indexes},
    utils::{
        config::{get_config, EmbeddingBackend},
        embedding::EmbeddingProvider,
    },
};
use ingestion_pipeline::{
    pipeline::{DefaultPipelineServices, IngestionConfig, IngestionPipeline},
    run_worker_loop,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    ensure_runtime_indexes(&db, config.embedding_dimension).await?;

    let openai_config = OpenAIConfig::new()
        .with_api_key(config.openai_api_key.clone())
        .with_api_base(config.openai_base_url.clone());
    let openai_client = async_openai::Client::with_config(openai_config);

    let llm = Arc::new(OpenAiLlmClient::new(
        openai_client.clone(),
        config.processing_model.clone(),
    ));

    let embedder = match config.embedding_backend {
        EmbeddingBackend::OpenAI => EmbeddingProvider::openai(
            openai_client,
            config.embedding_model.clone(),
            config.embedding_dimension,
        ),
        EmbeddingBackend::Hashed => EmbeddingProvider::hashed(config.embedding_dimension),
    };

    let services = Arc::new(DefaultPipelineServices::new(Some(llm), embedder));
    let pipeline = Arc::new(IngestionPipeline::new(
        db.clone(),
        IngestionConfig::default(),
        services,
    ));

    run_worker_loop(
        db,
        pipeline,
        config.ingestion_workers,
        config.processing_reap_secs,
    )
    .await
}
