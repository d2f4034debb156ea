use surrealdb::Error;

use super::db::SurrealDbClient;

/// Defines the indexes whose shape depends on runtime configuration.
///
/// The embedding index dimension must match the configured embedding
/// provider, so it cannot be part of a static migration.
pub async fn ensure_runtime_indexes(
    db: &SurrealDbClient,
    embedding_dimension: usize,
) -> Result<(), Error> {
    db.client
        .query(format!(
            "DEFINE INDEX OVERWRITE idx_embedding_chunks ON chunk_embedding \
             FIELDS embedding HNSW DIMENSION {embedding_dimension} DIST COSINE"
        ))
        .await?;

    db.client
        .query("DEFINE INDEX IF NOT EXISTS idx_chunk_document ON chunk FIELDS document_id")
        .await?;
    db.client
        .query("DEFINE INDEX IF NOT EXISTS idx_chunk_user ON chunk FIELDS user_id")
        .await?;
    db.client
        .query("DEFINE INDEX IF NOT EXISTS idx_job_status ON ingestion_job FIELDS status")
        .await?;
    db.client
        .query("DEFINE INDEX IF NOT EXISTS idx_document_user ON document FIELDS user_id")
        .await?;
    db.client
        .query("DEFINE INDEX IF NOT EXISTS idx_triple_subject ON kg_triple FIELDS user_id, subject")
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn runtime_indexes_apply_cleanly() {
        let db = SurrealDbClient::memory("idx_ns", &Uuid::new_v4().to_string())
            .await
            .expect("failed to start in-memory surrealdb");

        ensure_runtime_indexes(&db, 8)
            .await
            .expect("failed to define runtime indexes");

        // Redefining with a different dimension must also succeed.
        ensure_runtime_indexes(&db, 16)
            .await
            .expect("failed to redefine runtime indexes");
    }
}
