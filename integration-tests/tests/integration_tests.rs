//! End-to-end scenarios over the full ingest/answer stack with scripted
//! model responses and deterministic hashed embeddings.

use std::sync::Arc;
use std::time::Duration;

use answer_pipeline::{testing::ScriptedLlm, AnswerOptions, AnswerOrchestrator};
use common::storage::{
    db::SurrealDbClient,
    indexes::ensure_runtime_indexes,
    types::{
        chunk::Chunk,
        chunk_embedding::ChunkEmbedding,
        document::{Document, DocumentStatus, SourceType},
        ingestion_job::IngestionJob,
        user_doc_state::UserDocState,
    },
};
use common::utils::{
    deadline::Deadline,
    embedding::{enrich_for_embedding, EmbeddingProvider},
};
use ingestion_pipeline::{
    pipeline::{DefaultPipelineServices, IngestionConfig, IngestionPipeline},
    submit_document,
};
use retrieval_pipeline::{
    lexical::LexicalIndexManager,
    pipeline::RetrievalConfig,
    query_class::{classify_query, QueryClass},
    response_cache::{cosine_similarity, ResponseCache},
    QueryInput, Retriever,
};
use uuid::Uuid;

const DIM: usize = 16;
const QUEUE_BOUND: usize = 16;

async fn memory_db() -> Arc<SurrealDbClient> {
    let db = Arc::new(
        SurrealDbClient::memory("e2e_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb"),
    );
    ensure_runtime_indexes(&db, DIM).await.expect("indexes");
    db
}

fn ingestion(db: Arc<SurrealDbClient>) -> IngestionPipeline {
    // No extraction LLM: propositions fall back to sentences, no triples.
    let services = Arc::new(DefaultPipelineServices::new(
        None,
        EmbeddingProvider::hashed(DIM),
    ));
    IngestionPipeline::new(db, IngestionConfig::default(), services)
}

async fn ingest(
    db: &Arc<SurrealDbClient>,
    pipeline: &IngestionPipeline,
    user: &str,
    title: &str,
    text: &str,
    source_type: Option<SourceType>,
) -> String {
    let document_id = submit_document(
        db,
        QUEUE_BOUND,
        user,
        title,
        text.as_bytes().to_vec(),
        source_type,
    )
    .await
    .expect("submit");

    let job = IngestionJob::get_unfinished(db)
        .await
        .expect("jobs")
        .into_iter()
        .find(|job| job.payload.document_id == document_id)
        .expect("job queued");
    pipeline.process_job(job).await.expect("process");

    let doc: Document = db.get_item(&document_id).await.unwrap().unwrap();
    assert_eq!(doc.status, DocumentStatus::Ready);

    document_id
}

fn orchestrator(db: Arc<SurrealDbClient>, llm: ScriptedLlm) -> AnswerOrchestrator {
    let retriever = Arc::new(Retriever::new(
        db.clone(),
        LexicalIndexManager::new(16),
        None,
    ));
    AnswerOrchestrator::new(
        db,
        Arc::new(llm),
        Arc::new(EmbeddingProvider::hashed(DIM)),
        retriever,
        Arc::new(ResponseCache::new(32, Duration::from_secs(3600))),
    )
}

fn sufficient_and_grounded(answer: &str) -> ScriptedLlm {
    ScriptedLlm::new()
        .with_response(
            "sufficiency_verdict",
            serde_json::json!({"verdict": "sufficient", "reformulated_query": null}).to_string(),
        )
        .with_response(
            "grounded_answer",
            serde_json::json!({"answer": answer, "cited_chunks": [1]}).to_string(),
        )
}

#[tokio::test]
async fn scenario_cache_hit_on_repeat_question() {
    let db = memory_db().await;
    let pipeline = ingestion(db.clone());
    ingest(
        &db,
        &pipeline,
        "user",
        "A",
        "The Pythagorean theorem states a²+b²=c².",
        None,
    )
    .await;

    let orchestrator = orchestrator(
        db.clone(),
        sufficient_and_grounded("The theorem states a²+b²=c² [1]."),
    );

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
    assert_eq!(first.sources.len(), 1);
    assert_eq!(first.sources[0].doc_title, "A");

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
async fn scenario_cache_hits_on_nearby_embedding() {
    let cache = ResponseCache::new(8, Duration::from_secs(3600));
    let provider = EmbeddingProvider::hashed(DIM);

    let stored = provider
        .embed(&enrich_for_embedding(
            "",
            "",
            "What does the Pythagorean theorem say?",
        ))
        .await
        .expect("embed");
    cache.put(
        "user",
        "What does the Pythagorean theorem say?".into(),
        stored.clone(),
        "cached answer".into(),
        Vec::new(),
        1,
    );

    // A slightly perturbed vector models a near-identical rephrasing.
    let mut probe = stored.clone();
    probe[0] += 0.05;
    let similarity = cosine_similarity(&stored, &probe);
    assert!(similarity >= 0.95, "perturbation too large: {similarity}");

    let hit = cache.get("user", &probe, 1).expect("semantic hit");
    assert_eq!(hit.answer_text, "cached answer");
}

#[tokio::test]
async fn scenario_decomposition_covers_both_topics() {
    let db = memory_db().await;
    let pipeline = ingestion(db.clone());
    ingest(
        &db,
        &pipeline,
        "user",
        "Dimensionality Reduction Compared",
        "PCA projects data onto directions of maximal variance while LDA finds \
         directions that best separate labelled classes. PCA is unsupervised \
         and LDA is supervised.",
        None,
    )
    .await;
    ingest(
        &db,
        &pipeline,
        "user",
        "PCA Code Examples",
        "To implement PCA in Python, center the matrix, compute the covariance, \
         and take the top eigenvectors. The numpy function linalg.eigh returns \
         the eigenvalues and eigenvectors.",
        None,
    )
    .await;

    let sub_queries = [
        "What is the difference between PCA and LDA?",
        "Show Python code for PCA",
    ];
    assert_eq!(classify_query(sub_queries[0]), QueryClass::Comparison);
    assert_eq!(classify_query(sub_queries[1]), QueryClass::Code);

    let llm = ScriptedLlm::new()
        .with_response(
            "query_decomposition",
            serde_json::json!({"sub_queries": sub_queries}).to_string(),
        )
        .with_response(
            "sufficiency_verdict",
            serde_json::json!({"verdict": "sufficient", "reformulated_query": null}).to_string(),
        )
        .with_response(
            "grounded_answer",
            serde_json::json!({
                "answer": "PCA and LDA differ in supervision [1]; the PCA code uses numpy [2].",
                "cited_chunks": [1, 2, 3, 4]
            })
            .to_string(),
        );
    let orchestrator = orchestrator(db, llm);

    let result = orchestrator
        .answer(
            "user",
            "Compare PCA and LDA and give Python code for PCA",
            None,
            AnswerOptions::default(),
        )
        .await
        .expect("answer");

    assert!(result.diagnostics.decomposed_n >= 2);
    let titles: Vec<&str> = result.sources.iter().map(|s| s.doc_title.as_str()).collect();
    assert!(
        titles.contains(&"Dimensionality Reduction Compared"),
        "comparison source missing: {titles:?}"
    );
    assert!(
        titles.contains(&"PCA Code Examples"),
        "code source missing: {titles:?}"
    );
}

#[tokio::test]
async fn scenario_self_rag_caps_out_on_missing_topic() {
    let db = memory_db().await;
    // Another user's corpus must not leak in.
    let pipeline = ingestion(db.clone());
    ingest(
        &db,
        &pipeline,
        "someone_else",
        "Geometry",
        "The Pythagorean theorem states a²+b²=c².",
        None,
    )
    .await;

    let llm = ScriptedLlm::new()
        .with_response(
            "query_reformulation",
            serde_json::json!({"query": "quantum chromodynamics strong interaction"}).to_string(),
        )
        .with_plain_response(
            "Your uploaded documents do not cover this topic. From general \
             knowledge: quantum chromodynamics describes the strong force."
                .to_string(),
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
    assert!(result.sources.is_empty(), "no user documents can be cited");
    assert!(result.answer_text.unwrap().contains("general knowledge"));
}

#[tokio::test]
async fn scenario_deleting_cited_document_invalidates_cache() {
    let db = memory_db().await;
    let pipeline = ingestion(db.clone());
    let document_id = ingest(
        &db,
        &pipeline,
        "user",
        "Geometry",
        "The Pythagorean theorem states a²+b²=c².",
        None,
    )
    .await;

    let llm = sufficient_and_grounded("The theorem states a²+b²=c² [1].")
        .with_plain_response(
            "Your documents no longer cover this; from general knowledge the \
             theorem states a²+b²=c²."
                .to_string(),
        );
    let orchestrator = orchestrator(db.clone(), llm);

    let first = orchestrator
        .answer(
            "user",
            "What does the Pythagorean theorem say?",
            None,
            AnswerOptions::default(),
        )
        .await
        .expect("first answer");
    assert_eq!(first.sources[0].document_id, document_id);

    Document::delete_cascade(&document_id, &db)
        .await
        .expect("delete");

    let second = orchestrator
        .answer(
            "user",
            "What does the Pythagorean theorem say?",
            None,
            AnswerOptions::default(),
        )
        .await
        .expect("second answer");

    assert!(!second.diagnostics.cache_hit, "version bump invalidates");
    assert!(second.sources.is_empty());
}

#[tokio::test]
async fn scenario_textbook_children_expand_to_parents() {
    let db = memory_db().await;
    let pipeline = ingestion(db.clone());

    let mut text = String::from("# Chapter 1: Eigenvalues\n\n");
    for i in 0..120 {
        text.push_str(&format!(
            "Paragraph {i} explains how eigenvalues scale eigenvectors under a \
             linear transformation of the plane.\n\n"
        ));
    }
    ingest(
        &db,
        &pipeline,
        "user",
        "Linear Algebra Textbook",
        &text,
        Some(SourceType::Textbook),
    )
    .await;

    let chunks = Chunk::list_by_user("user", &db).await.expect("chunks");
    assert!(
        chunks.iter().any(|c| c.parent_id.is_some()),
        "textbook profile produces parent links"
    );

    let retriever = Retriever::new(db.clone(), LexicalIndexManager::new(8), None);
    let provider = EmbeddingProvider::hashed(DIM);
    let query_text = "How do eigenvalues scale eigenvectors?";
    let embedding = provider
        .embed(&enrich_for_embedding("", "", query_text))
        .await
        .expect("embed");

    let context = retriever
        .retrieve(
            "user",
            QueryInput {
                text: query_text.into(),
                embedding,
            },
            RetrievalConfig::default(),
            Deadline::after(Duration::from_secs(5)),
        )
        .await
        .expect("retrieve");

    let top = &context.chunks[0];
    let anchor = chunks
        .iter()
        .find(|c| c.id == top.chunk_id)
        .expect("retrieved chunk exists");
    let parent = Chunk::parent(&anchor.id, &db)
        .await
        .expect("parent lookup")
        .expect("textbook child has a parent");

    assert_eq!(top.expanded_text, parent.text);
    assert_ne!(top.expanded_text, top.text);
}

#[tokio::test]
async fn property_vector_ids_track_chunk_ids_across_ingest_and_delete() {
    let db = memory_db().await;
    let pipeline = ingestion(db.clone());

    let keep = ingest(
        &db,
        &pipeline,
        "user",
        "Kept",
        "Integration by parts transfers a derivative between factors.",
        None,
    )
    .await;
    let drop = ingest(
        &db,
        &pipeline,
        "user",
        "Dropped",
        "The ratio test decides convergence of a series from limits.",
        None,
    )
    .await;

    let check = |chunks: Vec<Chunk>, mut embedded: Vec<String>| {
        let mut chunk_ids: Vec<String> = chunks.into_iter().map(|c| c.id).collect();
        chunk_ids.sort();
        embedded.sort();
        assert_eq!(chunk_ids, embedded);
    };

    check(
        Chunk::list_by_user("user", &db).await.expect("chunks"),
        ChunkEmbedding::ids_for_user("user", &db).await.expect("ids"),
    );

    let version_before = UserDocState::current_version("user", &db).await.unwrap();
    Document::delete_cascade(&drop, &db).await.expect("delete");
    let version_after = UserDocState::current_version("user", &db).await.unwrap();
    assert!(version_after > version_before);

    let chunks = Chunk::list_by_user("user", &db).await.expect("chunks");
    assert!(chunks.iter().all(|c| c.document_id == keep));
    check(
        chunks,
        ChunkEmbedding::ids_for_user("user", &db).await.expect("ids"),
    );
}

#[tokio::test]
async fn property_reupload_reproduces_chunk_texts_and_ordinals() {
    let db = memory_db().await;
    let pipeline = ingestion(db.clone());

    let text = (0..40)
        .map(|i| format!("Statement {i} covers a distinct fact about series convergence. "))
        .collect::<String>();

    let first = ingest(&db, &pipeline, "user_a", "Doc", &text, None).await;
    let second = ingest(&db, &pipeline, "user_b", "Doc", &text, None).await;

    let fetch = |user: &'static str, doc: String| {
        let db = db.clone();
        async move {
            let mut chunks: Vec<Chunk> = Chunk::list_by_user(user, &db)
                .await
                .expect("chunks")
                .into_iter()
                .filter(|c| c.document_id == doc)
                .collect();
            chunks.sort_by_key(|c| c.ordinal);
            chunks
                .into_iter()
                .map(|c| (c.ordinal, c.text))
                .collect::<Vec<_>>()
        }
    };

    let first_chunks = fetch("user_a", first).await;
    let second_chunks = fetch("user_b", second).await;
    assert!(!first_chunks.is_empty());
    assert_eq!(first_chunks, second_chunks);
}
