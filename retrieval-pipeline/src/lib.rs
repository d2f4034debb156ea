pub mod graph;
pub mod lexical;
pub mod pipeline;
pub mod query_class;
pub mod reranking;
pub mod response_cache;
pub mod scoring;

use std::fmt;
use std::sync::Arc;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::kg_triple::KgTriple},
    utils::deadline::{with_deadline, Deadline},
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use lexical::LexicalIndexManager;
use pipeline::{run_pipeline, stages::PipelineContext, RetrievalConfig, RetrievalDiagnostics};
use reranking::RerankerPool;

/// A query variant handed to the retriever: the text drives lexical search
/// and classification, the embedding drives vector search.
#[derive(Debug, Clone)]
pub struct QueryInput {
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Which search paths actually served the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyTag {
    Hybrid,
    LexicalOnly,
    VectorOnly,
}

impl fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StrategyTag::Hybrid => "hybrid",
            StrategyTag::LexicalOnly => "lexical_only",
            StrategyTag::VectorOnly => "vector_only",
        };
        f.write_str(label)
    }
}

/// Source attribution attached to answers and cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: String,
    pub doc_title: String,
    pub page: Option<u32>,
}

/// A retrieval survivor with its expansion and provenance.
#[derive(Debug, Clone, Serialize)]
pub struct ContextChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub doc_title: String,
    pub section: Option<String>,
    pub page: Option<u32>,
    pub text: String,
    pub expanded_text: String,
    pub score: f32,
}

impl ContextChunk {
    pub fn citation(&self) -> Citation {
        Citation {
            document_id: self.document_id.clone(),
            doc_title: self.doc_title.clone(),
            page: self.page,
        }
    }
}

/// Ranked retrieval output: expanded chunks, graph triples, and the strategy
/// that produced them.
#[derive(Debug, Default, Serialize)]
pub struct RankedContext {
    pub chunks: Vec<ContextChunk>,
    pub triples: Vec<KgTriple>,
    pub used_strategy: StrategyTag,
    pub diagnostics: RetrievalDiagnostics,
}

impl Default for StrategyTag {
    fn default() -> Self {
        StrategyTag::Hybrid
    }
}

/// Hybrid retriever over the per-user lexical index and the vector store.
pub struct Retriever {
    db: Arc<SurrealDbClient>,
    lexical: Arc<LexicalIndexManager>,
    reranker: Option<Arc<RerankerPool>>,
}

impl Retriever {
    pub fn new(
        db: Arc<SurrealDbClient>,
        lexical: Arc<LexicalIndexManager>,
        reranker: Option<Arc<RerankerPool>>,
    ) -> Self {
        Self {
            db,
            lexical,
            reranker,
        }
    }

    /// Single-query retrieval.
    pub async fn retrieve(
        &self,
        user_id: &str,
        query: QueryInput,
        config: RetrievalConfig,
        deadline: Deadline,
    ) -> Result<RankedContext, AppError> {
        self.retrieve_multi(user_id, vec![query], config, deadline)
            .await
    }

    /// Multi-query retrieval: results of all variants are merged by the best
    /// fused score per chunk before a single rerank pass.
    #[instrument(skip_all, fields(user_id, queries = queries.len()))]
    pub async fn retrieve_multi(
        &self,
        user_id: &str,
        queries: Vec<QueryInput>,
        config: RetrievalConfig,
        deadline: Deadline,
    ) -> Result<RankedContext, AppError> {
        if queries.is_empty() {
            return Err(AppError::Validation("no query variants supplied".into()));
        }

        let reranker_lease = match &self.reranker {
            Some(pool) => Some(pool.checkout().await),
            None => None,
        };

        let ctx = PipelineContext::new(
            &self.db,
            &self.lexical,
            user_id.to_owned(),
            queries,
            config,
            reranker_lease,
        );

        with_deadline("retrieve", deadline, run_pipeline(ctx)).await
    }
}
