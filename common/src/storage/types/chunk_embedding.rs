use chrono::Utc;
use serde::Deserialize;
use surrealdb::RecordId;

use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    storage::types::{chunk::Chunk, stored_object},
};

// One embedding per chunk; the embedding record reuses the chunk's id so the
// mapping stays 1:1 across upserts.
stored_object!(ChunkEmbedding, "chunk_embedding", {
    chunk_id: RecordId,
    document_id: String,
    user_id: String,
    embedding: Vec<f32>
});

/// Search hit including the hydrated chunk.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ChunkSearchResult {
    pub chunk: Chunk,
    pub score: f32,
}

impl ChunkEmbedding {
    pub fn new(chunk: &Chunk, embedding: Vec<f32>) -> Self {
        let now = Utc::now();
        Self {
            id: chunk.id.clone(),
            created_at: now,
            updated_at: now,
            chunk_id: RecordId::from_table_key("chunk", &chunk.id),
            document_id: chunk.document_id.clone(),
            user_id: chunk.user_id.clone(),
            embedding,
        }
    }

    /// Idempotent per chunk id: re-submitting an embedding replaces the row.
    pub async fn upsert(chunk: &Chunk, embedding: Vec<f32>, db: &SurrealDbClient) -> Result<(), AppError> {
        let row = Self::new(chunk, embedding);

        db.client
            .query("UPSERT type::thing('chunk_embedding', $id) CONTENT $row")
            .bind(("id", row.id.clone()))
            .bind(("row", row))
            .await?
            .check()?;

        Ok(())
    }

    /// ANN search over a user's namespace. Scores are cosine similarity mapped
    /// onto [0, 1] via (1 + cos) / 2, descending.
    pub async fn vector_search(
        take: usize,
        query_embedding: Vec<f32>,
        db: &SurrealDbClient,
        user_id: &str,
    ) -> Result<Vec<ChunkSearchResult>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            chunk_id: Chunk,
            score: f32,
        }

        let sql = format!(
            r#"
            SELECT
                chunk_id,
                vector::similarity::cosine(embedding, $embedding) AS score
            FROM chunk_embedding
            WHERE user_id = $user_id
              AND embedding <|{take},100|> $embedding
            ORDER BY score DESC
            LIMIT {take}
            FETCH chunk_id;
            "#,
        );

        let mut response = db
            .query(&sql)
            .bind(("embedding", query_embedding))
            .bind(("user_id", user_id.to_string()))
            .await
            .map_err(|e| AppError::DependencyUnavailable(format!("vector search failed: {e}")))?;

        let rows: Vec<Row> = response.take::<Vec<Row>>(0).unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|r| ChunkSearchResult {
                chunk: r.chunk_id,
                score: (1.0 + r.score) / 2.0,
            })
            .collect())
    }

    /// Every embedded chunk id in a user's namespace, for invariant audits.
    pub async fn ids_for_user(
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<String>, AppError> {
        #[derive(Deserialize)]
        struct IdRow {
            #[serde(deserialize_with = "crate::storage::types::deserialize_flexible_id")]
            id: String,
        }

        let mut response = db
            .query("SELECT id FROM chunk_embedding WHERE user_id = $user_id")
            .bind(("user_id", user_id.to_owned()))
            .await?;

        let rows: Vec<IdRow> = response.take(0)?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }
}
