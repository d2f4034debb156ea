use serde::{Deserialize, Serialize};

/// Tunables for the ingestion pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionTuning {
    /// First embedding retry delay; doubles per attempt.
    pub embed_retry_base_ms: u64,
    /// Ceiling for the embedding retry delay.
    pub embed_retry_max_delay_ms: u64,
    /// Total embedding attempts per batch.
    pub embed_attempts: usize,
    /// Bytes of enriched text packed into one embedding request.
    pub embed_batch_byte_budget: usize,
    /// Chunks whose proposition/triple extraction runs concurrently.
    pub extraction_concurrency: usize,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            embed_retry_base_ms: 500,
            embed_retry_max_delay_ms: 8_000,
            embed_attempts: 3,
            embed_batch_byte_budget: 64 * 1024,
            extraction_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
}
