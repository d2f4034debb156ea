use serde::Serialize;

/// Captures instrumentation for each retrieval stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalDiagnostics {
    pub query_count: usize,
    pub lexical_candidates: usize,
    pub vector_candidates: usize,
    pub fused_kept: usize,
    pub reranker_applied: bool,
    pub expanded_chunks: usize,
    pub triples_attached: usize,
    pub degraded_expansion: bool,
}
