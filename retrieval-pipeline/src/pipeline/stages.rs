use std::collections::{HashMap, HashSet};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            answer_feedback::AnswerFeedback,
            chunk::Chunk,
            chunk_embedding::ChunkEmbedding,
            document::{Document, DocumentStatus},
            kg_triple::KgTriple,
        },
    },
};
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};
use tracing::{debug, instrument, warn};

use crate::{
    graph::augment_with_triples,
    lexical::LexicalIndexManager,
    query_class::{classify_query, QueryClass},
    reranking::RerankerLease,
    scoring::{
        clamp_unit, fuse_scores, merge_scored_by_id, min_max_normalize, sort_by_fused_desc,
        FusionWeights, Scored,
    },
    ContextChunk, QueryInput, StrategyTag,
};

use super::{
    config::{ExpansionMode, RetrievalConfig},
    diagnostics::RetrievalDiagnostics,
    PipelineStageTimings, StageKind,
};

#[derive(Debug, Clone)]
pub struct ExpandedChunk {
    pub chunk: Chunk,
    pub score: f32,
    pub expanded_text: String,
}

pub struct PipelineContext<'a> {
    pub db: &'a SurrealDbClient,
    pub lexical: &'a LexicalIndexManager,
    pub user_id: String,
    pub queries: Vec<QueryInput>,
    pub config: RetrievalConfig,
    pub reranker: Option<RerankerLease>,
    pub candidates: HashMap<String, Scored<Chunk>>,
    pub fused: Vec<Scored<Chunk>>,
    pub expanded: Vec<ExpandedChunk>,
    pub triples: Vec<KgTriple>,
    pub used_strategy: StrategyTag,
    pub results: Vec<ContextChunk>,
    pub diagnostics: RetrievalDiagnostics,
    stage_timings: PipelineStageTimings,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        db: &'a SurrealDbClient,
        lexical: &'a LexicalIndexManager,
        user_id: String,
        queries: Vec<QueryInput>,
        config: RetrievalConfig,
        reranker: Option<RerankerLease>,
    ) -> Self {
        Self {
            db,
            lexical,
            user_id,
            queries,
            config,
            reranker,
            candidates: HashMap::new(),
            fused: Vec::new(),
            expanded: Vec::new(),
            triples: Vec::new(),
            used_strategy: StrategyTag::Hybrid,
            results: Vec::new(),
            diagnostics: RetrievalDiagnostics::default(),
            stage_timings: PipelineStageTimings::default(),
        }
    }

    pub fn primary_query(&self) -> &str {
        self.queries.first().map(|q| q.text.as_str()).unwrap_or("")
    }

    pub fn primary_class(&self) -> QueryClass {
        classify_query(self.primary_query())
    }

    pub fn record_stage_duration(&mut self, kind: StageKind, duration: std::time::Duration) {
        self.stage_timings.record(kind, duration);
    }

    pub fn take_stage_timings(&mut self) -> PipelineStageTimings {
        std::mem::take(&mut self.stage_timings)
    }
}

/// Hybrid candidate collection: lexical and vector search race per query,
/// per-list normalisation, adaptive fusion, then a max-score merge across
/// query variants.
#[instrument(level = "trace", skip_all)]
pub async fn collect_candidates(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let tuning = ctx.config.tuning.clone();
    ctx.diagnostics.query_count = ctx.queries.len();

    let mut lexical_ok = false;
    let mut vector_ok = false;

    let queries = std::mem::take(&mut ctx.queries);
    for query in &queries {
        let class = classify_query(&query.text);
        let weights = FusionWeights::for_class(class);

        let (lexical_result, vector_result) = tokio::join!(
            ctx.lexical
                .search(&ctx.user_id, &query.text, tuning.lexical_take, ctx.db),
            vector_search_with_retry(
                tuning.vector_take,
                query.embedding.clone(),
                ctx.db,
                &ctx.user_id,
            ),
        );

        let mut per_query: HashMap<String, Scored<Chunk>> = HashMap::new();

        match lexical_result {
            Ok(hits) => {
                lexical_ok = true;
                ctx.diagnostics.lexical_candidates += hits.len();

                let raw: Vec<f32> = hits.iter().map(|(_, score)| *score).collect();
                let normalized = min_max_normalize(&raw);
                let scored: Vec<Scored<Chunk>> = hits
                    .into_iter()
                    .zip(normalized)
                    .map(|((chunk, _), score)| Scored::new(chunk).with_lexical_score(score))
                    .collect();
                merge_scored_by_id(&mut per_query, scored);
            }
            Err(err) => {
                warn!(error = %err, "Lexical search failed; continuing without it");
            }
        }

        match vector_result {
            Ok(hits) => {
                vector_ok = true;
                ctx.diagnostics.vector_candidates += hits.len();

                // Cosine scores are already normalised onto [0, 1].
                let scored: Vec<Scored<Chunk>> = hits
                    .into_iter()
                    .map(|hit| Scored::new(hit.chunk).with_vector_score(hit.score))
                    .collect();
                merge_scored_by_id(&mut per_query, scored);
            }
            Err(err) => {
                warn!(error = %err, "Vector search failed; continuing without it");
            }
        }

        for candidate in per_query.values_mut() {
            candidate.update_fused(fuse_scores(&candidate.scores, weights));
        }

        debug!(
            query = %query.text,
            class = %class,
            candidates = per_query.len(),
            "Hybrid candidates for query variant"
        );

        merge_scored_by_id(&mut ctx.candidates, per_query.into_values().collect());
    }
    ctx.queries = queries;

    ctx.used_strategy = match (lexical_ok, vector_ok) {
        (true, true) => StrategyTag::Hybrid,
        (true, false) => StrategyTag::LexicalOnly,
        (false, true) => StrategyTag::VectorOnly,
        (false, false) => return Err(AppError::RetrievalUnavailable),
    };

    // An empty lexical index (new user) degrades the tag, not the request.
    if ctx.used_strategy == StrategyTag::Hybrid && ctx.diagnostics.lexical_candidates == 0 {
        ctx.used_strategy = StrategyTag::VectorOnly;
    }

    Ok(())
}

/// Transient vector-store failures get one quick retry before the request
/// degrades to lexical-only.
async fn vector_search_with_retry(
    take: usize,
    embedding: Vec<f32>,
    db: &SurrealDbClient,
    user_id: &str,
) -> Result<Vec<common::storage::types::chunk_embedding::ChunkSearchResult>, AppError> {
    let strategy = ExponentialBackoff::from_millis(2).factor(25).take(1);

    RetryIf::spawn(
        strategy,
        || ChunkEmbedding::vector_search(take, embedding.clone(), db, user_id),
        |err: &AppError| err.is_transient(),
    )
    .await
}

/// Orders fused candidates and bounds them ahead of reranking. Comparison
/// queries over-fetch and diversify so both sides of the comparison survive.
#[instrument(level = "trace", skip_all)]
pub fn fuse_and_bound(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let tuning = &ctx.config.tuning;
    let mut fused: Vec<Scored<Chunk>> = ctx.candidates.values().cloned().collect();
    sort_by_fused_desc(&mut fused);

    if ctx.primary_class() == QueryClass::Comparison {
        let overfetch = tuning.fused_keep * tuning.comparison_overfetch.max(1);
        fused.truncate(overfetch);
        fused = diversify(fused, tuning.fused_keep);
    } else {
        fused.truncate(tuning.fused_keep);
    }

    ctx.diagnostics.fused_kept = fused.len();
    ctx.fused = fused;
    Ok(())
}

/// Cross-encoder reranking over `(query, chunk text)` pairs. Outages skip the
/// stage and keep the fused ordering.
#[instrument(level = "trace", skip_all)]
pub async fn rerank(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let tuning = ctx.config.tuning.clone();
    let keep_top = tuning.rerank_keep_top.max(1);

    if ctx.fused.len() <= 1 {
        ctx.fused.truncate(keep_top);
        return Ok(());
    }

    let Some(reranker) = ctx.reranker.as_ref() else {
        debug!("No reranker lease provided; keeping fused ordering");
        ctx.fused.truncate(keep_top);
        return Ok(());
    };

    let documents: Vec<String> = ctx
        .fused
        .iter()
        .map(|scored| scored.item.text.clone())
        .collect();

    match reranker.rerank(ctx.primary_query(), documents).await {
        Ok(scores) if scores.len() == ctx.fused.len() => {
            let normalized = min_max_normalize(&scores);
            let blend = if tuning.rerank_scores_only {
                1.0
            } else {
                clamp_unit(tuning.rerank_blend_weight)
            };

            for (candidate, rerank_score) in ctx.fused.iter_mut().zip(normalized) {
                let blended =
                    clamp_unit(candidate.fused * (1.0 - blend) + rerank_score * blend);
                candidate.update_fused(blended);
            }

            sort_by_fused_desc(&mut ctx.fused);
            ctx.diagnostics.reranker_applied = true;
        }
        Ok(scores) => {
            warn!(
                expected = ctx.fused.len(),
                received = scores.len(),
                "Reranker returned a mismatched score count; keeping fused ordering"
            );
        }
        Err(err) => {
            warn!(error = %err, "Reranking failed; keeping fused ordering");
        }
    }

    ctx.fused.truncate(keep_top);
    Ok(())
}

/// Context expansion and knowledge-graph augmentation run concurrently; the
/// two are independent by contract.
#[instrument(level = "trace", skip_all)]
pub async fn expand_and_augment(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let kept = ctx.fused.clone();
    let primary = ctx.primary_query().to_owned();

    let (expansion, triples_result) = tokio::join!(
        expand_chunks(
            ctx.db,
            kept,
            ctx.config.expansion,
            ctx.config.tuning.adjacent_window,
        ),
        augment_with_triples(&primary, &ctx.user_id, ctx.db),
    );

    let (expanded, degraded) = expansion;
    ctx.diagnostics.expanded_chunks = expanded.len();
    ctx.diagnostics.degraded_expansion = degraded;
    ctx.expanded = expanded;

    match triples_result {
        Ok(triples) => {
            ctx.diagnostics.triples_attached = triples.len();
            ctx.triples = triples;
        }
        Err(err) => {
            // Graph augmentation is additive; its loss never fails a request.
            warn!(error = %err, "Knowledge graph augmentation failed");
        }
    }

    Ok(())
}

async fn expand_chunks(
    db: &SurrealDbClient,
    kept: Vec<Scored<Chunk>>,
    mode: ExpansionMode,
    window: u32,
) -> (Vec<ExpandedChunk>, bool) {
    let mut used_ids: HashSet<String> = kept.iter().map(|s| s.item.id.clone()).collect();
    let mut expanded = Vec::with_capacity(kept.len());
    let mut degraded = false;

    for scored in kept {
        let chunk = scored.item;
        let score = scored.fused;

        let expanded_text = match mode {
            ExpansionMode::None => chunk.text.clone(),
            ExpansionMode::Parent | ExpansionMode::Sliding if chunk.parent_id.is_some() => {
                match Chunk::parent(&chunk.id, db).await {
                    Ok(Some(parent)) => parent.text,
                    Ok(None) => chunk.text.clone(),
                    Err(err) => {
                        warn!(chunk_id = %chunk.id, error = %err, "Parent expansion failed");
                        degraded = true;
                        chunk.text.clone()
                    }
                }
            }
            ExpansionMode::Parent => chunk.text.clone(),
            ExpansionMode::Sliding => match Chunk::adjacent(&chunk.id, window, db).await {
                Ok(neighbors) => {
                    let mut parts = Vec::with_capacity(neighbors.len());
                    for neighbor in neighbors {
                        let is_anchor = neighbor.id == chunk.id;
                        if is_anchor || used_ids.insert(neighbor.id.clone()) {
                            parts.push(neighbor.text);
                        }
                    }
                    if parts.is_empty() {
                        chunk.text.clone()
                    } else {
                        parts.join("\n")
                    }
                }
                Err(err) => {
                    warn!(chunk_id = %chunk.id, error = %err, "Sliding-window expansion failed");
                    degraded = true;
                    chunk.text.clone()
                }
            },
        };

        expanded.push(ExpandedChunk {
            chunk,
            score,
            expanded_text,
        });
    }

    (expanded, degraded)
}

/// Hydrates document titles, drops chunks of non-ready or foreign documents,
/// applies the weak feedback boost, and emits the ordered context.
#[instrument(level = "trace", skip_all)]
pub async fn assemble(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let doc_ids: HashSet<String> = ctx
        .expanded
        .iter()
        .map(|e| e.chunk.document_id.clone())
        .collect();

    let mut documents: HashMap<String, Document> = HashMap::new();
    for doc_id in doc_ids {
        if let Some(doc) = ctx.db.get_item::<Document>(&doc_id).await? {
            documents.insert(doc_id, doc);
        }
    }

    let boosts = if ctx.config.tuning.apply_feedback_boosts {
        AnswerFeedback::document_boosts(&ctx.user_id, ctx.db)
            .await
            .unwrap_or_default()
    } else {
        HashMap::new()
    };

    let mut results = Vec::with_capacity(ctx.expanded.len());
    for entry in ctx.expanded.drain(..) {
        let Some(doc) = documents.get(&entry.chunk.document_id) else {
            continue;
        };
        if doc.status != DocumentStatus::Ready || doc.user_id != ctx.user_id {
            continue;
        }

        let boost = boosts.get(&entry.chunk.document_id).copied().unwrap_or(0.0);
        results.push(ContextChunk {
            chunk_id: entry.chunk.id,
            document_id: entry.chunk.document_id,
            doc_title: doc.title.clone(),
            section: entry.chunk.section_title,
            page: entry.chunk.page,
            text: entry.chunk.text,
            expanded_text: entry.expanded_text,
            score: clamp_unit(entry.score + boost),
        });
    }

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    ctx.results = results;
    Ok(())
}

/// Greedy selection that penalises near-duplicate content, so comparison
/// queries keep chunks from both compared topics.
fn diversify(mut candidates: Vec<Scored<Chunk>>, keep: usize) -> Vec<Scored<Chunk>> {
    if candidates.len() <= keep {
        return candidates;
    }

    let mut selected: Vec<Scored<Chunk>> = vec![candidates.remove(0)];

    while selected.len() < keep && !candidates.is_empty() {
        let mut best_idx = 0;
        let mut best_value = f32::MIN;

        for (idx, candidate) in candidates.iter().enumerate() {
            let max_overlap = selected
                .iter()
                .map(|s| word_overlap(&candidate.item.text, &s.item.text))
                .fold(0.0f32, f32::max);
            let value = candidate.fused * (1.0 - 0.5 * max_overlap);
            if value > best_value {
                best_value = value;
                best_idx = idx;
            }
        }

        selected.push(candidates.remove(best_idx));
    }

    selected
}

fn word_overlap(a: &str, b: &str) -> f32 {
    let words_a: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let words_b: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();

    let union = words_a.union(&words_b).count();
    if union == 0 {
        return 0.0;
    }
    words_a.intersection(&words_b).count() as f32 / union as f32
}
