pub mod config;
pub mod services;

pub use config::{IngestionConfig, IngestionTuning};
pub use services::{DefaultPipelineServices, PipelineServices};

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk::{Chunk, ParentChunk},
            document::{Document, DocumentStatus, SourceType},
            ingestion_job::{IngestionJob, IngestionPayload, JobStatus},
            kg_triple::KgTriple,
            proposition::Proposition,
            user_doc_state::UserDocState,
        },
    },
    utils::embedding::enrich_for_embedding,
};
use futures::{stream, StreamExt};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, info, warn};

use crate::{chunking, classify::classify_document};

pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    config: IngestionConfig,
    services: Arc<dyn PipelineServices>,
}

struct PreparedChunks {
    chunks: Vec<Chunk>,
    parents: Vec<ParentChunk>,
    source_type: SourceType,
    page_count: Option<u32>,
}

impl IngestionPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        config: IngestionConfig,
        services: Arc<dyn PipelineServices>,
    ) -> Self {
        Self {
            db,
            config,
            services,
        }
    }

    /// Runs one ingestion job to completion: the document ends `ready` with
    /// all derived records stored, or `failed` with everything rolled back.
    #[tracing::instrument(
        skip_all,
        fields(job_id = %job.id, document_id = %job.payload.document_id, user_id = %job.user_id)
    )]
    pub async fn process_job(&self, job: IngestionJob) -> Result<(), AppError> {
        let attempts = match &job.status {
            JobStatus::InProgress { attempts, .. } => attempts + 1,
            _ => 1,
        };
        IngestionJob::update_status(
            &job.id,
            JobStatus::InProgress {
                attempts,
                last_attempt: chrono::Utc::now(),
            },
            &self.db,
        )
        .await?;

        let document_id = job.payload.document_id.clone();
        Document::set_status(&document_id, DocumentStatus::Processing, None, &self.db).await?;

        match self.drive_pipeline(&job.payload).await {
            Ok(chunk_count) => {
                Document::set_status(&document_id, DocumentStatus::Ready, None, &self.db).await?;
                UserDocState::bump_version(&job.user_id, &self.db).await?;
                IngestionJob::update_status(&job.id, JobStatus::Completed, &self.db).await?;
                info!(chunk_count, "ingestion job succeeded");
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(error = %reason, "ingestion job failed; rolling back");

                if let Err(rollback_err) = self.rollback(&document_id).await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Document::set_status(
                    &document_id,
                    DocumentStatus::Failed,
                    Some(reason.clone()),
                    &self.db,
                )
                .await?;
                IngestionJob::update_status(&job.id, JobStatus::Error(reason), &self.db).await?;

                Err(err)
            }
        }
    }

    async fn drive_pipeline(&self, payload: &IngestionPayload) -> Result<usize, AppError> {
        let pipeline_started = Instant::now();

        let stage_start = Instant::now();
        let prepared = self.prepare_chunks(payload)?;
        let prepare_ms = stage_start.elapsed().as_millis() as u64;

        let stage_start = Instant::now();
        let (propositions, triples) = self.extract_artifacts(payload, &prepared.chunks).await;
        let extract_ms = stage_start.elapsed().as_millis() as u64;

        let stage_start = Instant::now();
        let embeddings = self.embed_chunks(&payload.title, &prepared.chunks).await?;
        let embed_ms = stage_start.elapsed().as_millis() as u64;

        let stage_start = Instant::now();
        let chunk_count = prepared.chunks.len();
        self.persist(prepared, embeddings, propositions, triples)
            .await?;
        let persist_ms = stage_start.elapsed().as_millis() as u64;

        info!(
            total_ms = pipeline_started.elapsed().as_millis() as u64,
            prepare_ms,
            extract_ms,
            embed_ms,
            persist_ms,
            chunk_count,
            "ingestion pipeline finished"
        );

        Ok(chunk_count)
    }

    /// Classification plus adaptive chunking; fails only on unusable input.
    fn prepare_chunks(&self, payload: &IngestionPayload) -> Result<PreparedChunks, AppError> {
        let source_type = payload
            .source_type
            .unwrap_or_else(|| classify_document(&payload.text, &payload.title));

        let output = chunking::chunk_document(&payload.text, source_type);
        if output.children.is_empty() {
            return Err(AppError::Validation(
                "document produced no usable chunks".into(),
            ));
        }

        let parents: Vec<ParentChunk> = output
            .parents
            .into_iter()
            .map(|text| {
                ParentChunk::new(
                    payload.document_id.clone(),
                    payload.user_id.clone(),
                    text,
                )
            })
            .collect();

        let page_count = output
            .children
            .iter()
            .filter_map(|draft| draft.page)
            .max();

        let chunks: Vec<Chunk> = output
            .children
            .into_iter()
            .enumerate()
            .map(|(ordinal, draft)| {
                let parent_id = draft.parent_index.map(|idx| parents[idx].id.clone());
                Chunk::new(
                    payload.document_id.clone(),
                    payload.user_id.clone(),
                    ordinal as u32,
                    draft.text,
                    draft.page,
                    draft.section_title,
                    parent_id,
                )
            })
            .collect();

        debug!(
            source_type = %source_type,
            chunks = chunks.len(),
            parents = parents.len(),
            "document chunked"
        );

        Ok(PreparedChunks {
            chunks,
            parents,
            source_type,
            page_count,
        })
    }

    /// Proposition and triple extraction per chunk, bounded concurrency,
    /// order-preserving. Extraction failures degrade inside the services.
    async fn extract_artifacts(
        &self,
        payload: &IngestionPayload,
        chunks: &[Chunk],
    ) -> (Vec<Proposition>, Vec<KgTriple>) {
        let concurrency = self.config.tuning.extraction_concurrency.max(1);

        let services = self.services.clone();
        let per_chunk: Vec<(Vec<String>, Vec<crate::extraction::RawTriple>)> =
            stream::iter(chunks.iter())
                .map(|chunk| {
                    let services = services.clone();
                    async move {
                        let propositions = services.propositions_for(&chunk.text).await;
                        let triples = services.triples_for(&chunk.text).await;
                        (propositions, triples)
                    }
                })
                .buffered(concurrency)
                .collect()
                .await;

        let mut propositions = Vec::new();
        let mut triples = Vec::new();
        for (chunk, (chunk_props, chunk_triples)) in chunks.iter().zip(per_chunk) {
            for text in chunk_props {
                propositions.push(Proposition::new(
                    chunk.id.clone(),
                    payload.document_id.clone(),
                    payload.user_id.clone(),
                    text,
                ));
            }
            for raw in chunk_triples {
                if let Some(triple) = KgTriple::checked(
                    chunk.id.clone(),
                    payload.document_id.clone(),
                    payload.user_id.clone(),
                    &raw.subject,
                    &raw.predicate,
                    &raw.object,
                ) {
                    triples.push(triple);
                } else {
                    debug!(chunk_id = %chunk.id, "dropping malformed triple");
                }
            }
        }

        (propositions, triples)
    }

    /// Embeds enriched chunk text in byte-budgeted batches with bounded
    /// exponential backoff. Any batch failing all attempts fails the document.
    async fn embed_chunks(
        &self,
        title: &str,
        chunks: &[Chunk],
    ) -> Result<Vec<Vec<f32>>, AppError> {
        let tuning = &self.config.tuning;

        let enriched: Vec<String> = chunks
            .iter()
            .map(|chunk| {
                enrich_for_embedding(
                    title,
                    chunk.section_title.as_deref().unwrap_or(""),
                    &chunk.text,
                )
            })
            .collect();

        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(enriched.len());

        for batch in batch_by_bytes(&enriched, tuning.embed_batch_byte_budget) {
            let strategy = ExponentialBackoff::from_millis(2)
                .factor(tuning.embed_retry_base_ms / 2)
                .max_delay(Duration::from_millis(tuning.embed_retry_max_delay_ms))
                .map(jitter)
                .take(tuning.embed_attempts.saturating_sub(1));

            let services = self.services.clone();
            let vectors = Retry::spawn(strategy, || services.embed_batch(batch)).await?;

            if vectors.len() != batch.len() {
                return Err(AppError::LlmParsing(format!(
                    "embedder returned {} vectors for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            let dimension = self.services.embedding_dimension();
            if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
                return Err(AppError::InternalError(format!(
                    "embedding dimension {} does not match configured {}",
                    bad.len(),
                    dimension
                )));
            }

            embeddings.extend(vectors);
        }

        Ok(embeddings)
    }

    async fn persist(
        &self,
        prepared: PreparedChunks,
        embeddings: Vec<Vec<f32>>,
        propositions: Vec<Proposition>,
        triples: Vec<KgTriple>,
    ) -> Result<(), AppError> {
        let document_id = prepared
            .chunks
            .first()
            .map(|c| c.document_id.clone())
            .unwrap_or_default();

        ParentChunk::store_batch(prepared.parents, &self.db).await?;

        let rows: Vec<(Chunk, Vec<f32>)> =
            prepared.chunks.into_iter().zip(embeddings).collect();
        Chunk::store_batch_with_embeddings(rows, &self.db).await?;

        Proposition::store_batch(propositions, &self.db).await?;
        KgTriple::store_batch_deduped(triples, &self.db).await?;

        Document::set_classification(
            &document_id,
            prepared.source_type,
            prepared.page_count,
            &self.db,
        )
        .await?;

        Ok(())
    }

    /// Removes every derived record of a document while keeping the document
    /// row for its failure status.
    async fn rollback(&self, document_id: &str) -> Result<(), AppError> {
        let response = self
            .db
            .client
            .query("BEGIN TRANSACTION;")
            .query(
                "DELETE chunk_embedding WHERE document_id = $doc_id; \
                 DELETE chunk WHERE document_id = $doc_id; \
                 DELETE parent_chunk WHERE document_id = $doc_id; \
                 DELETE proposition WHERE document_id = $doc_id; \
                 DELETE kg_triple WHERE document_id = $doc_id;",
            )
            .query("COMMIT TRANSACTION;")
            .bind(("doc_id", document_id.to_owned()))
            .await?;
        response.check()?;

        Ok(())
    }
}

/// Greedy packing of texts into byte-bounded slices, at least one per batch.
fn batch_by_bytes(texts: &[String], budget: usize) -> Vec<&[String]> {
    let mut batches = Vec::new();
    let mut start = 0;

    while start < texts.len() {
        let mut end = start + 1;
        let mut used = texts[start].len();

        while end < texts.len() && used + texts[end].len() <= budget {
            used += texts[end].len();
            end += 1;
        }

        batches.push(&texts[start..end]);
        start = end;
    }

    batches
}

/// Marks documents stuck in `processing` beyond the timeout as failed.
pub async fn reap_stale_documents(
    older_than_secs: u64,
    db: &SurrealDbClient,
) -> Result<usize, AppError> {
    let stale = Document::stale_processing(older_than_secs, db).await?;
    let count = stale.len();

    for doc in stale {
        warn!(document_id = %doc.id, "reaping document stuck in processing");
        Document::set_status(
            &doc.id,
            DocumentStatus::Failed,
            Some("processing timed out".into()),
            db,
        )
        .await?;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::storage::indexes::ensure_runtime_indexes;
    use common::storage::types::chunk_embedding::ChunkEmbedding;
    use common::utils::embedding::EmbeddingProvider;
    use crate::extraction::RawTriple;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    const DIM: usize = 8;

    struct TestServices {
        embedder: EmbeddingProvider,
        fail_embeddings: bool,
        embed_calls: AtomicUsize,
    }

    impl TestServices {
        fn healthy() -> Self {
            Self {
                embedder: EmbeddingProvider::hashed(DIM),
                fail_embeddings: false,
                embed_calls: AtomicUsize::new(0),
            }
        }

        fn broken_embedder() -> Self {
            Self {
                embedder: EmbeddingProvider::hashed(DIM),
                fail_embeddings: true,
                embed_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PipelineServices for TestServices {
        fn embedding_dimension(&self) -> usize {
            DIM
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            self.embed_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_embeddings {
                return Err(AppError::DependencyUnavailable("embedder down".into()));
            }
            self.embedder.embed_batch(texts).await
        }

        async fn propositions_for(&self, chunk_text: &str) -> Vec<String> {
            crate::extraction::fallback_propositions(chunk_text)
        }

        async fn triples_for(&self, _chunk_text: &str) -> Vec<RawTriple> {
            vec![RawTriple {
                subject: "Derivative".into(),
                predicate: "measures".into(),
                object: "Rate Of Change".into(),
            }]
        }
    }

    async fn setup(
        services: Arc<TestServices>,
    ) -> (Arc<SurrealDbClient>, IngestionPipeline, IngestionJob) {
        let db = Arc::new(
            SurrealDbClient::memory("ing_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );
        ensure_runtime_indexes(&db, DIM).await.expect("indexes");

        let doc = Document::new("user".into(), "Calculus Notes".into(), None, None);
        db.store_item(doc.clone()).await.expect("store doc");

        let mut fast_tuning = IngestionTuning::default();
        fast_tuning.embed_retry_base_ms = 2;
        fast_tuning.embed_retry_max_delay_ms = 4;

        let pipeline = IngestionPipeline::new(
            db.clone(),
            IngestionConfig {
                tuning: fast_tuning,
            },
            services,
        );

        let payload = IngestionPayload {
            user_id: "user".into(),
            document_id: doc.id.clone(),
            title: "Calculus Notes".into(),
            text: "The derivative measures the instantaneous rate of change of a function. \
                   The integral accumulates quantities over an interval of the real line. \
                   Limits describe the value a function approaches near a point."
                .into(),
            source_type: Some(SourceType::Notes),
        };
        let job = IngestionJob::new(payload);
        db.store_item(job.clone()).await.expect("store job");

        (db, pipeline, job)
    }

    #[tokio::test]
    async fn successful_ingestion_reaches_ready_with_artifacts() {
        let (db, pipeline, job) = setup(Arc::new(TestServices::healthy())).await;
        let document_id = job.payload.document_id.clone();
        let user_id = job.user_id.clone();

        pipeline.process_job(job).await.expect("process");

        let doc: Document = db.get_item(&document_id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
        assert_eq!(doc.source_type, Some(SourceType::Notes));

        let chunks = Chunk::list_by_user(&user_id, &db).await.expect("chunks");
        assert!(!chunks.is_empty());
        let ordinals: Vec<u32> = chunks.iter().map(|c| c.ordinal).collect();
        let expected: Vec<u32> = (0..chunks.len() as u32).collect();
        assert_eq!(ordinals, expected, "ordinals are dense");

        // Exactly one embedding per chunk.
        let embedded_ids = ChunkEmbedding::ids_for_user(&user_id, &db)
            .await
            .expect("embedding ids");
        let mut chunk_ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let mut embedded_sorted = embedded_ids.clone();
        chunk_ids.sort();
        embedded_sorted.sort();
        assert_eq!(chunk_ids, embedded_sorted);

        let props = Proposition::list_by_chunk(&chunks[0].id, &db)
            .await
            .expect("propositions");
        assert!(!props.is_empty());

        let triples = KgTriple::list_by_user(&user_id, &db).await.expect("triples");
        assert_eq!(triples.len(), 1, "duplicates deduped per user");
        assert_eq!(triples[0].subject, "derivative");

        assert_eq!(
            UserDocState::current_version(&user_id, &db).await.unwrap(),
            1,
            "version bumped once on success"
        );
    }

    #[tokio::test]
    async fn embedding_failure_rolls_back_and_fails_the_document() {
        let (db, pipeline, job) = setup(Arc::new(TestServices::broken_embedder())).await;
        let document_id = job.payload.document_id.clone();
        let user_id = job.user_id.clone();

        let err = pipeline.process_job(job).await.expect_err("must fail");
        assert!(matches!(err, AppError::DependencyUnavailable(_)));

        let doc: Document = db.get_item(&document_id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert!(doc.failure.is_some());

        let chunks = Chunk::list_by_user(&user_id, &db).await.expect("chunks");
        assert!(chunks.is_empty(), "partial chunks rolled back");
        let embedded = ChunkEmbedding::ids_for_user(&user_id, &db)
            .await
            .expect("ids");
        assert!(embedded.is_empty());

        assert_eq!(
            UserDocState::current_version(&user_id, &db).await.unwrap(),
            0,
            "failed ingestion publishes nothing"
        );
    }

    #[tokio::test]
    async fn embedding_calls_are_retried_before_failing() {
        let services = Arc::new(TestServices::broken_embedder());
        let (_db, pipeline, job) = setup(services.clone()).await;

        pipeline.process_job(job).await.expect_err("must fail");

        assert_eq!(
            services.embed_calls.load(Ordering::SeqCst),
            3,
            "one initial call plus two backoff retries per batch"
        );
    }

    #[tokio::test]
    async fn reaper_fails_stuck_documents() {
        let db = Arc::new(
            SurrealDbClient::memory("reap_ns", &Uuid::new_v4().to_string())
                .await
                .expect("in-memory surrealdb"),
        );

        let mut doc = Document::new("user".into(), "Stuck".into(), None, None);
        doc.status = DocumentStatus::Processing;
        db.store_item(doc.clone()).await.expect("store doc");

        // Zero-second threshold reaps immediately.
        let reaped = reap_stale_documents(0, &db).await.expect("reap");
        assert_eq!(reaped, 1);

        let doc: Document = db.get_item(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.failure.as_deref(), Some("processing timed out"));
    }

    #[test]
    fn batching_respects_the_byte_budget() {
        let texts: Vec<String> = (0..5).map(|_| "x".repeat(100)).collect();
        let batches = batch_by_bytes(&texts, 250);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[2].len(), 1);

        let oversized = vec!["y".repeat(1000)];
        let batches = batch_by_bytes(&oversized, 10);
        assert_eq!(batches.len(), 1, "oversized text still forms a batch");
    }
}
