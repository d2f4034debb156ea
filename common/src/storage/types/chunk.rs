use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    storage::types::{chunk_embedding::ChunkEmbedding, stored_object},
};

stored_object!(Chunk, "chunk", {
    document_id: String,
    user_id: String,
    ordinal: u32,
    text: String,
    page: Option<u32>,
    section_title: Option<String>,
    parent_id: Option<String>
});

// Parents are retrieval-invisible: they are never embedded or indexed, only
// substituted into the context at assembly time.
stored_object!(ParentChunk, "parent_chunk", {
    document_id: String,
    user_id: String,
    text: String
});

#[derive(Serialize)]
struct ChunkWithEmbedding {
    chunk: Chunk,
    embedding: ChunkEmbedding,
}

impl Chunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document_id: String,
        user_id: String,
        ordinal: u32,
        text: String,
        page: Option<u32>,
        section_title: Option<String>,
        parent_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            document_id,
            user_id,
            ordinal,
            text,
            page,
            section_title,
            parent_id,
        }
    }

    /// Atomically store a document's chunks together with their embeddings.
    ///
    /// A reader either observes every chunk of the document or none, so the
    /// version bump that follows this call publishes a complete document.
    pub async fn store_batch_with_embeddings(
        rows: Vec<(Chunk, Vec<f32>)>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        if rows.is_empty() {
            return Ok(());
        }

        let payload: Vec<ChunkWithEmbedding> = rows
            .into_iter()
            .map(|(chunk, embedding)| {
                let embedding = ChunkEmbedding::new(&chunk, embedding);
                ChunkWithEmbedding { chunk, embedding }
            })
            .collect();

        let response = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(
                "FOR $row IN $rows { \
                     CREATE type::thing('chunk', $row.chunk.id) CONTENT $row.chunk; \
                     CREATE type::thing('chunk_embedding', $row.embedding.id) CONTENT $row.embedding; \
                 };",
            )
            .query("COMMIT TRANSACTION;")
            .bind(("rows", payload))
            .await?;

        response.check()?;

        Ok(())
    }

    pub async fn get(id: &str, db: &SurrealDbClient) -> Result<Chunk, AppError> {
        db.get_item::<Chunk>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("chunk {id}")))
    }

    /// Chunks of the same document with ordinals in `[ord - window, ord + window]`,
    /// sorted by ordinal. The anchor chunk is included.
    pub async fn adjacent(
        chunk_id: &str,
        window: u32,
        db: &SurrealDbClient,
    ) -> Result<Vec<Chunk>, AppError> {
        let anchor = Self::get(chunk_id, db).await?;
        let low = anchor.ordinal.saturating_sub(window);
        let high = anchor.ordinal + window;

        let mut response = db
            .query(
                "SELECT * FROM chunk \
                 WHERE document_id = $document_id \
                   AND ordinal >= $low AND ordinal <= $high \
                 ORDER BY ordinal ASC",
            )
            .bind(("document_id", anchor.document_id.clone()))
            .bind(("low", low as i64))
            .bind(("high", high as i64))
            .await?;

        Ok(response.take(0)?)
    }

    /// The parent chunk substituted for this child during context expansion,
    /// if the chunking profile produced one.
    pub async fn parent(
        chunk_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<ParentChunk>, AppError> {
        let chunk = Self::get(chunk_id, db).await?;
        let Some(parent_id) = chunk.parent_id else {
            return Ok(None);
        };

        Ok(db.get_item::<ParentChunk>(&parent_id).await?)
    }

    pub async fn list_by_user(user_id: &str, db: &SurrealDbClient) -> Result<Vec<Chunk>, AppError> {
        let mut response = db
            .query("SELECT * FROM chunk WHERE user_id = $user_id ORDER BY document_id, ordinal ASC")
            .bind(("user_id", user_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }
}

impl ParentChunk {
    pub fn new(document_id: String, user_id: String, text: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            document_id,
            user_id,
            text,
        }
    }

    pub async fn store_batch(
        parents: Vec<ParentChunk>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        if parents.is_empty() {
            return Ok(());
        }

        let response = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(
                "FOR $parent IN $parents { \
                     CREATE type::thing('parent_chunk', $parent.id) CONTENT $parent; \
                 };",
            )
            .query("COMMIT TRANSACTION;")
            .bind(("parents", parents))
            .await?;

        response.check()?;

        Ok(())
    }
}
