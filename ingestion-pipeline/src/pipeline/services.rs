use std::sync::Arc;

use async_trait::async_trait;
use common::{error::AppError, llm::LlmClient, utils::embedding::EmbeddingProvider};

use crate::extraction::{extract_propositions, extract_triples, RawTriple};

/// External calls the pipeline makes per document; tests swap in fakes.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    fn embedding_dimension(&self) -> usize;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;

    async fn propositions_for(&self, chunk_text: &str) -> Vec<String>;

    async fn triples_for(&self, chunk_text: &str) -> Vec<RawTriple>;
}

pub struct DefaultPipelineServices {
    llm: Option<Arc<dyn LlmClient>>,
    embedder: EmbeddingProvider,
}

impl DefaultPipelineServices {
    pub fn new(llm: Option<Arc<dyn LlmClient>>, embedder: EmbeddingProvider) -> Self {
        Self { llm, embedder }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    fn embedding_dimension(&self) -> usize {
        self.embedder.dimension()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        self.embedder.embed_batch(texts).await
    }

    async fn propositions_for(&self, chunk_text: &str) -> Vec<String> {
        extract_propositions(self.llm.as_deref(), chunk_text).await
    }

    async fn triples_for(&self, chunk_text: &str) -> Vec<RawTriple> {
        extract_triples(self.llm.as_deref(), chunk_text).await
    }
}
