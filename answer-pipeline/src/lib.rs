pub mod decompose;
pub mod generation;
pub mod rewrite;
pub mod self_rag;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{
    error::{AppError, UserFacingError},
    llm::LlmClient,
    storage::{
        db::SurrealDbClient,
        types::{
            answer_feedback::{AnswerFeedback, Thumbs},
            user_doc_state::UserDocState,
        },
    },
    utils::{
        deadline::{with_deadline, Deadline},
        embedding::{enrich_for_embedding, EmbeddingProvider},
    },
};
use futures::future::join_all;
use retrieval_pipeline::{
    pipeline::{ExpansionMode, RetrievalConfig},
    Citation, ContextChunk, QueryInput, RankedContext, Retriever, StrategyTag,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use generation::{pick_agent, AgentTag};
use self_rag::Sufficiency;

/// Per-request knobs for the answer path.
#[derive(Debug, Clone)]
pub struct AnswerOptions {
    pub use_cache: bool,
    pub max_self_rag_iterations: usize,
    pub expansion: ExpansionMode,
    pub deadline: Duration,
}

impl Default for AnswerOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            max_self_rag_iterations: 2,
            expansion: ExpansionMode::Sliding,
            deadline: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnswerDiagnostics {
    pub cache_hit: bool,
    pub reformulated_n: usize,
    pub decomposed_n: usize,
    pub strategy_tag: Option<StrategyTag>,
    pub self_rag_iterations: usize,
    pub degraded: bool,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerResult {
    pub query_id: String,
    pub answer_text: Option<String>,
    pub sources: Vec<Citation>,
    pub agent_used: AgentTag,
    pub diagnostics: AnswerDiagnostics,
    pub error: Option<UserFacingError>,
}

const RECENT_ANSWER_CAPACITY: usize = 256;
const SUB_QUERY_RETRIEVE_DEADLINE: Duration = Duration::from_secs(5);

/// Top-level handler for one question: cache probe, rewrite, decomposition,
/// multi-query retrieval, self-RAG verification, grounded generation, and
/// cache store. All stores and clients are injected at construction.
pub struct AnswerOrchestrator {
    db: Arc<SurrealDbClient>,
    llm: Arc<dyn LlmClient>,
    embedder: Arc<EmbeddingProvider>,
    retriever: Arc<Retriever>,
    cache: Arc<retrieval_pipeline::response_cache::ResponseCache>,
    // query_id -> cited document ids, for feedback attribution.
    recent_answers: Mutex<HashMap<String, Vec<String>>>,
}

impl AnswerOrchestrator {
    pub fn new(
        db: Arc<SurrealDbClient>,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<EmbeddingProvider>,
        retriever: Arc<Retriever>,
        cache: Arc<retrieval_pipeline::response_cache::ResponseCache>,
    ) -> Self {
        Self {
            db,
            llm,
            embedder,
            retriever,
            cache,
            recent_answers: Mutex::new(HashMap::new()),
        }
    }

    /// Answers one question. Fails with a typed error; `answer_or_report`
    /// wraps the failure into the caller-facing shape.
    #[instrument(skip_all, fields(user_id, query_chars = query_text.chars().count()))]
    pub async fn answer(
        &self,
        user_id: &str,
        query_text: &str,
        conversation_hint: Option<&str>,
        options: AnswerOptions,
    ) -> Result<AnswerResult, AppError> {
        let query_text = query_text.trim();
        if query_text.is_empty() {
            return Err(AppError::Validation("empty query".into()));
        }

        let deadline = Deadline::after(options.deadline);
        let mut diagnostics = AnswerDiagnostics::default();
        let agent_used = pick_agent(query_text);

        // Step 1: embed the query and probe the semantic cache.
        let enriched_query = enrich_for_embedding("", "", query_text);
        let query_embedding = with_deadline(
            "query embedding",
            deadline,
            self.embedder.embed(&enriched_query),
        )
        .await?;
        let doc_set_version = UserDocState::current_version(user_id, &self.db).await?;

        if options.use_cache {
            if let Some(entry) = self.cache.get(user_id, &query_embedding, doc_set_version) {
                diagnostics.cache_hit = true;
                info!("Answer served from semantic cache");
                let query_id = self.remember_sources(&entry.sources).await;
                return Ok(AnswerResult {
                    query_id,
                    answer_text: Some(entry.answer_text),
                    sources: entry.sources,
                    agent_used,
                    diagnostics,
                    error: None,
                });
            }
        }

        // Step 2: rewrite (non-fatal).
        let (working_query, rewritten) =
            rewrite::rewrite_query(self.llm.as_ref(), query_text, conversation_hint, deadline)
                .await;
        if rewritten {
            diagnostics.reformulated_n += 1;
        }

        // Step 3: conditional decomposition.
        let sub_queries = decompose::decompose(self.llm.as_ref(), &working_query, deadline).await;
        if sub_queries.len() > 1 {
            diagnostics.decomposed_n = sub_queries.len();
        }

        // Steps 4 + 5: multi-query expansion and parallel retrieval.
        let mut context = self
            .retrieve_for(user_id, &sub_queries, &options, deadline, &mut diagnostics)
            .await?;

        // Step 6: self-RAG verification loop.
        let mut current_query = working_query.clone();
        let mut iterations = 0;
        while iterations < options.max_self_rag_iterations {
            iterations += 1;

            let verdict =
                self_rag::verify(self.llm.as_ref(), &current_query, &context.chunks, deadline)
                    .await;
            if verdict.sufficiency == Sufficiency::Sufficient {
                break;
            }
            if iterations >= options.max_self_rag_iterations {
                diagnostics.low_confidence = true;
                break;
            }

            let reformulated = match verdict.reformulated_query {
                Some(query) => Some(query),
                None => self_rag::reformulate(self.llm.as_ref(), &current_query, deadline).await,
            };
            let Some(reformulated) = reformulated else {
                diagnostics.low_confidence = true;
                break;
            };

            debug!(query = %reformulated, "Self-RAG retrying retrieval");
            diagnostics.reformulated_n += 1;
            current_query = reformulated;
            context = self
                .retrieve_for(
                    user_id,
                    std::slice::from_ref(&current_query),
                    &options,
                    deadline,
                    &mut diagnostics,
                )
                .await?;
        }
        diagnostics.self_rag_iterations = iterations;

        // Step 7: generation, grounded when context exists.
        let (answer_text, sources) = if context.chunks.is_empty() {
            let text = generation::generate_general_knowledge_answer(
                self.llm.as_ref(),
                query_text,
                deadline,
            )
            .await?;
            (text, Vec::new())
        } else {
            let generated = generation::generate_answer(
                self.llm.as_ref(),
                agent_used,
                query_text,
                &context,
                deadline,
            )
            .await?;
            if generated.degraded {
                diagnostics.degraded = true;
            }
            (generated.answer_text, generated.sources)
        };

        if context.diagnostics.degraded_expansion {
            diagnostics.degraded = true;
        }

        // Step 8: cache the fresh answer at the version observed on entry.
        if options.use_cache {
            self.cache.put(
                user_id,
                query_text.to_string(),
                query_embedding,
                answer_text.clone(),
                sources.clone(),
                doc_set_version,
            );
        }

        let query_id = self.remember_sources(&sources).await;
        Ok(AnswerResult {
            query_id,
            answer_text: Some(answer_text),
            sources,
            agent_used,
            diagnostics,
            error: None,
        })
    }

    /// Caller-facing wrapper: failures become `{answer_text: None, error}`.
    pub async fn answer_or_report(
        &self,
        user_id: &str,
        query_text: &str,
        conversation_hint: Option<&str>,
        options: AnswerOptions,
    ) -> AnswerResult {
        match self
            .answer(user_id, query_text, conversation_hint, options)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "Answer request failed");
                AnswerResult {
                    query_id: Uuid::new_v4().to_string(),
                    answer_text: None,
                    sources: Vec::new(),
                    agent_used: pick_agent(query_text),
                    diagnostics: AnswerDiagnostics::default(),
                    error: Some(err.user_facing()),
                }
            }
        }
    }

    /// Feedback API: stores the rating attached to the answer's documents.
    pub async fn rate_answer(
        &self,
        user_id: &str,
        query_id: &str,
        thumbs: Thumbs,
        comment: Option<String>,
    ) -> Result<(), AppError> {
        let document_ids = {
            let recent = self.recent_answers.lock().await;
            recent.get(query_id).cloned().unwrap_or_default()
        };

        let feedback = AnswerFeedback::new(
            user_id.to_owned(),
            query_id.to_owned(),
            thumbs,
            comment,
            document_ids,
        );
        self.db.store_item(feedback).await?;

        Ok(())
    }

    /// Fan-out: per sub-query variants are generated, then all sub-queries
    /// retrieve in parallel and the ranked contexts merge by best score.
    async fn retrieve_for(
        &self,
        user_id: &str,
        sub_queries: &[String],
        options: &AnswerOptions,
        deadline: Deadline,
        diagnostics: &mut AnswerDiagnostics,
    ) -> Result<RankedContext, AppError> {
        let mut variant_sets: Vec<Vec<String>> = Vec::with_capacity(sub_queries.len());
        for sub_query in sub_queries {
            let alternates =
                rewrite::alternative_phrasings(self.llm.as_ref(), sub_query, deadline).await;
            diagnostics.reformulated_n += alternates.len();

            let mut variants = vec![sub_query.clone()];
            variants.extend(alternates);
            variant_sets.push(variants);
        }

        let retrievals = variant_sets.into_iter().map(|variants| {
            let config = RetrievalConfig::with_expansion(options.expansion);
            async move {
                let mut inputs = Vec::with_capacity(variants.len());
                for text in variants {
                    let embedding = self
                        .embedder
                        .embed(&enrich_for_embedding("", "", &text))
                        .await?;
                    inputs.push(QueryInput { text, embedding });
                }

                let budget = SUB_QUERY_RETRIEVE_DEADLINE.min(deadline.remaining());
                self.retriever
                    .retrieve_multi(user_id, inputs, config, Deadline::after(budget))
                    .await
            }
        });

        let outcomes = join_all(retrievals).await;

        let mut merged_chunks: HashMap<String, ContextChunk> = HashMap::new();
        let mut merged = RankedContext::default();
        let mut succeeded = false;
        let mut last_error: Option<AppError> = None;

        for outcome in outcomes {
            match outcome {
                Ok(context) => {
                    succeeded = true;
                    for chunk in context.chunks {
                        match merged_chunks.get(&chunk.chunk_id) {
                            Some(existing) if existing.score >= chunk.score => {}
                            _ => {
                                merged_chunks.insert(chunk.chunk_id.clone(), chunk);
                            }
                        }
                    }
                    for triple in context.triples {
                        let duplicate = merged.triples.iter().any(|t| {
                            t.subject == triple.subject
                                && t.predicate == triple.predicate
                                && t.object == triple.object
                        });
                        if !duplicate {
                            merged.triples.push(triple);
                        }
                    }
                    merged.used_strategy = context.used_strategy;
                    merged.diagnostics.degraded_expansion |=
                        context.diagnostics.degraded_expansion;
                    merged.diagnostics.reranker_applied |= context.diagnostics.reranker_applied;
                }
                Err(err) => {
                    warn!(error = %err, "Sub-query retrieval failed");
                    last_error = Some(err);
                }
            }
        }

        if !succeeded {
            return Err(last_error.unwrap_or(AppError::RetrievalUnavailable));
        }

        let mut chunks: Vec<ContextChunk> = merged_chunks.into_values().collect();
        chunks.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        merged.chunks = chunks;

        diagnostics.strategy_tag = Some(merged.used_strategy);

        Ok(merged)
    }

    async fn remember_sources(&self, sources: &[Citation]) -> String {
        let query_id = Uuid::new_v4().to_string();
        let document_ids: Vec<String> = sources.iter().map(|c| c.document_id.clone()).collect();

        let mut recent = self.recent_answers.lock().await;
        if recent.len() >= RECENT_ANSWER_CAPACITY {
            // Bounded map; arbitrary entry eviction is fine for a weak signal.
            if let Some(key) = recent.keys().next().cloned() {
                recent.remove(&key);
            }
        }
        recent.insert(query_id.clone(), document_ids);

        query_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::indexes::ensure_runtime_indexes;
    use common::storage::types::chunk::Chunk;
    use common::storage::types::document::{Document, DocumentStatus};
    use retrieval_pipeline::lexical::LexicalIndexManager;
    use retrieval_pipeline::response_cache::ResponseCache;
    use crate::testing::ScriptedLlm;
    use uuid::Uuid;

    const DIM: usize = 16;

    async fn seeded_db(user: &str, title: &str, texts: &[&str]) -> Arc<SurrealDbClient> {
        let db = Arc::new(
            SurrealDbClient::memory("ans_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        ensure_runtime_indexes(&db, DIM).await.expect("indexes");

        if !texts.is_empty() {
            let provider = EmbeddingProvider::hashed(DIM);
            let mut doc = Document::new(user.into(), title.into(), None, None);
            doc.status = DocumentStatus::Ready;
            db.store_item(doc.clone()).await.expect("store doc");

            let mut rows = Vec::new();
            for (i, text) in texts.iter().enumerate() {
                let chunk = Chunk::new(
                    doc.id.clone(),
                    user.into(),
                    i as u32,
                    (*text).to_string(),
                    None,
                    None,
                    None,
                );
                let enriched = enrich_for_embedding(title, "", text);
                let embedding = provider.embed(&enriched).await.expect("embed");
                rows.push((chunk, embedding));
            }
            Chunk::store_batch_with_embeddings(rows, &db)
                .await
                .expect("store chunks");
            UserDocState::bump_version(user, &db).await.expect("bump");
        }

        db
    }

    fn orchestrator(db: Arc<SurrealDbClient>, llm: ScriptedLlm) -> AnswerOrchestrator {
        let embedder = Arc::new(EmbeddingProvider::hashed(DIM));
        let retriever = Arc::new(Retriever::new(
            db.clone(),
            LexicalIndexManager::new(8),
            None,
        ));
        let cache = Arc::new(ResponseCache::new(16, Duration::from_secs(3600)));
        AnswerOrchestrator::new(db, Arc::new(llm), embedder, retriever, cache)
    }

    fn grounded_llm() -> ScriptedLlm {
        ScriptedLlm::new()
            .with_response(
                "sufficiency_verdict",
                serde_json::json!({"verdict": "sufficient", "reformulated_query": null})
                    .to_string(),
            )
            .with_response(
                "grounded_answer",
                serde_json::json!({
                    "answer": "The Pythagorean theorem states a² + b² = c² [1].",
                    "cited_chunks": [1]
                })
                .to_string(),
            )
    }

    #[tokio::test]
    async fn grounded_answer_cites_the_user_document() {
        let db = seeded_db(
            "user",
            "Geometry",
            &["The Pythagorean theorem states a squared plus b squared equals c squared."],
        )
        .await;
        let orchestrator = orchestrator(db, grounded_llm());

        let result = orchestrator
            .answer(
                "user",
                "What does the Pythagorean theorem say?",
                None,
                AnswerOptions::default(),
            )
            .await
            .expect("answer");

        assert!(result.answer_text.unwrap().contains("Pythagorean"));
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.sources[0].doc_title, "Geometry");
        assert!(!result.diagnostics.cache_hit);
        assert!(result.diagnostics.self_rag_iterations <= 2);
    }

    #[tokio::test]
    async fn second_identical_query_hits_the_cache() {
        let db = seeded_db(
            "user",
            "Geometry",
            &["The Pythagorean theorem states a squared plus b squared equals c squared."],
        )
        .await;
        let orchestrator = orchestrator(db, grounded_llm());

        let first = orchestrator
            .answer(
                "user",
                "What does the Pythagorean theorem say?",
                None,
                AnswerOptions::default(),
            )
            .await
            .expect("first answer");
        assert!(!first.diagnostics.cache_hit);

        let second = orchestrator
            .answer(
                "user",
                "What does the Pythagorean theorem say?",
                None,
                AnswerOptions::default(),
            )
            .await
            .expect("second answer");

        assert!(second.diagnostics.cache_hit);
        assert_eq!(second.answer_text, first.answer_text);
    }

    #[tokio::test]
    async fn empty_corpus_runs_the_self_rag_loop_to_the_cap() {
        let db = seeded_db("user", "unused", &[]).await;
        let llm = ScriptedLlm::new()
            .with_response(
                "query_reformulation",
                serde_json::json!({"query": "quantum chromodynamics basics"}).to_string(),
            )
            .with_plain_response(
                "Your documents do not cover this; from general knowledge: ...".to_string(),
            );
        let orchestrator = orchestrator(db, llm);

        let result = orchestrator
            .answer(
                "user",
                "Explain quantum chromodynamics",
                None,
                AnswerOptions::default(),
            )
            .await
            .expect("answer");

        assert_eq!(result.diagnostics.self_rag_iterations, 2);
        assert!(result.diagnostics.low_confidence);
        assert!(result.sources.is_empty());
        assert!(result
            .answer_text
            .unwrap()
            .contains("general knowledge"));
    }

    #[tokio::test]
    async fn failures_surface_as_user_facing_reports() {
        let db = seeded_db("user", "unused", &[]).await;
        let orchestrator = orchestrator(db, ScriptedLlm::offline());

        let report = orchestrator
            .answer_or_report("user", "", None, AnswerOptions::default())
            .await;

        assert!(report.answer_text.is_none());
        let error = report.error.expect("error report");
        assert_eq!(error.error_kind, "input_invalid");
        assert_eq!(error.suggestion, "rephrase");
    }

    #[tokio::test]
    async fn feedback_is_recorded_against_answer_documents() {
        let db = seeded_db(
            "user",
            "Geometry",
            &["The Pythagorean theorem states a squared plus b squared equals c squared."],
        )
        .await;
        let orchestrator = orchestrator(db.clone(), grounded_llm());

        let result = orchestrator
            .answer(
                "user",
                "What does the Pythagorean theorem say?",
                None,
                AnswerOptions::default(),
            )
            .await
            .expect("answer");

        orchestrator
            .rate_answer("user", &result.query_id, Thumbs::Up, Some("clear".into()))
            .await
            .expect("rate");

        let boosts = AnswerFeedback::document_boosts("user", &db)
            .await
            .expect("boosts");
        assert_eq!(boosts.len(), 1);
        assert!(boosts.values().all(|b| *b > 0.0));
    }
}
