use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use common::{error::AppError, utils::config::AppConfig};
use fastembed::{RerankInitOptions, TextRerank};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

/// Cross-encoder scoring `(query, document)` pairs. Scores are in [0, 1] and
/// align with the input document order.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    async fn score(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError>;
}

/// Local ONNX cross-encoder. `TextRerank` needs `&mut self`, so each engine
/// sits behind its own mutex.
pub struct FastembedEncoder {
    engine: Mutex<TextRerank>,
}

impl FastembedEncoder {
    pub fn new(init_options: RerankInitOptions) -> Result<Self, AppError> {
        let engine = TextRerank::try_new(init_options)
            .map_err(|e| AppError::DependencyUnavailable(e.to_string()))?;
        Ok(Self {
            engine: Mutex::new(engine),
        })
    }
}

#[async_trait]
impl CrossEncoder for FastembedEncoder {
    async fn score(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        let count = documents.len();
        let mut guard = self.engine.lock().await;

        let results = guard
            .rerank(query.to_owned(), documents, false, None)
            .map_err(|e| AppError::DependencyUnavailable(e.to_string()))?;

        // fastembed returns hits sorted by score; restore input order.
        let mut scores = vec![0.0f32; count];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }

        Ok(scores)
    }
}

/// A small pool of cross-encoder engines guarded by a semaphore. Checkout
/// enforces backpressure; dropping the lease releases the permit.
pub struct RerankerPool {
    engines: Vec<Arc<dyn CrossEncoder>>,
    semaphore: Arc<Semaphore>,
}

impl RerankerPool {
    pub fn new(engines: Vec<Arc<dyn CrossEncoder>>) -> Result<Arc<Self>, AppError> {
        if engines.is_empty() {
            return Err(AppError::Validation(
                "reranker pool needs at least one engine".to_string(),
            ));
        }

        let permits = engines.len();
        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(permits)),
        }))
    }

    /// Builds a fastembed-backed pool when reranking is enabled in config.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<Self>>, AppError> {
        if !config.reranking_enabled {
            return Ok(None);
        }

        let pool_size = config.reranking_pool_size.unwrap_or(2).max(1);
        let mut engines: Vec<Arc<dyn CrossEncoder>> = Vec::with_capacity(pool_size);
        for x in 0..pool_size {
            debug!("Creating reranking engine: {x}");
            engines.push(Arc::new(FastembedEncoder::new(
                RerankInitOptions::default(),
            )?));
        }

        Self::new(engines).map(Some)
    }

    /// Check out capacity + pick an engine.
    pub async fn checkout(self: &Arc<Self>) -> RerankerLease {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");

        let idx = pick_engine_index(self.engines.len());
        let engine = self.engines[idx].clone();

        RerankerLease {
            _permit: permit,
            engine,
        }
    }
}

/// Active lease on a single cross-encoder engine.
pub struct RerankerLease {
    // When this drops the semaphore permit is released.
    _permit: OwnedSemaphorePermit,
    engine: Arc<dyn CrossEncoder>,
}

impl RerankerLease {
    pub async fn rerank(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
        self.engine.score(query, documents).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores documents by shared-word overlap with the query.
    pub struct OverlapEncoder;

    #[async_trait]
    impl CrossEncoder for OverlapEncoder {
        async fn score(&self, query: &str, documents: Vec<String>) -> Result<Vec<f32>, AppError> {
            let query_terms: Vec<String> = query
                .to_lowercase()
                .split_whitespace()
                .map(str::to_owned)
                .collect();

            Ok(documents
                .iter()
                .map(|doc| {
                    let lower = doc.to_lowercase();
                    let matched = query_terms.iter().filter(|t| lower.contains(*t)).count();
                    matched as f32 / query_terms.len().max(1) as f32
                })
                .collect())
        }
    }

    struct BrokenEncoder;

    #[async_trait]
    impl CrossEncoder for BrokenEncoder {
        async fn score(&self, _query: &str, _documents: Vec<String>) -> Result<Vec<f32>, AppError> {
            Err(AppError::DependencyUnavailable("reranker offline".into()))
        }
    }

    #[tokio::test]
    async fn lease_scores_in_document_order() {
        let engines: Vec<Arc<dyn CrossEncoder>> = vec![Arc::new(OverlapEncoder)];
        let pool = RerankerPool::new(engines).expect("pool");
        let lease = pool.checkout().await;

        let scores = lease
            .rerank(
                "gradient descent",
                vec![
                    "gradient descent minimizes loss".into(),
                    "fruit salad recipe".into(),
                ],
            )
            .await
            .expect("rerank");

        assert_eq!(scores.len(), 2);
        assert!(scores[0] > scores[1]);
    }

    #[tokio::test]
    async fn checkout_limits_concurrent_leases() {
        let engines: Vec<Arc<dyn CrossEncoder>> = vec![Arc::new(OverlapEncoder)];
        let pool = RerankerPool::new(engines).expect("pool");

        let first = pool.checkout().await;
        assert_eq!(pool.semaphore.available_permits(), 0);
        drop(first);
        assert_eq!(pool.semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn broken_engine_surfaces_dependency_error() {
        let engines: Vec<Arc<dyn CrossEncoder>> = vec![Arc::new(BrokenEncoder)];
        let pool = RerankerPool::new(engines).expect("pool");
        let lease = pool.checkout().await;

        let err = lease
            .rerank("q", vec!["doc".into()])
            .await
            .expect_err("encoder offline");
        assert!(matches!(err, AppError::DependencyUnavailable(_)));
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(RerankerPool::new(Vec::new()).is_err());
    }
}
