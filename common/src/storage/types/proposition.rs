use chrono::Utc;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::stored_object};

// An atomic, pronoun-resolved factual statement derived from a chunk.
stored_object!(Proposition, "proposition", {
    chunk_id: String,
    document_id: String,
    user_id: String,
    text: String
});

impl Proposition {
    pub fn new(chunk_id: String, document_id: String, user_id: String, text: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            chunk_id,
            document_id,
            user_id,
            text,
        }
    }

    pub async fn store_batch(
        propositions: Vec<Proposition>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        if propositions.is_empty() {
            return Ok(());
        }

        let response = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(
                "FOR $prop IN $props { \
                     CREATE type::thing('proposition', $prop.id) CONTENT $prop; \
                 };",
            )
            .query("COMMIT TRANSACTION;")
            .bind(("props", propositions))
            .await?;

        response.check()?;

        Ok(())
    }

    pub async fn list_by_chunk(
        chunk_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Proposition>, AppError> {
        let mut response = db
            .query("SELECT * FROM proposition WHERE chunk_id = $chunk_id ORDER BY created_at ASC")
            .bind(("chunk_id", chunk_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_and_list_by_chunk() {
        let db = SurrealDbClient::memory("prop_ns", &Uuid::new_v4().to_string())
            .await
            .expect("failed to start in-memory surrealdb");

        let props = vec![
            Proposition::new(
                "chunk_1".into(),
                "doc_1".into(),
                "user".into(),
                "The Pythagorean theorem relates the sides of a right triangle.".into(),
            ),
            Proposition::new(
                "chunk_1".into(),
                "doc_1".into(),
                "user".into(),
                "The hypotenuse is the longest side of a right triangle.".into(),
            ),
            Proposition::new(
                "chunk_2".into(),
                "doc_1".into(),
                "user".into(),
                "PCA projects data onto directions of maximal variance.".into(),
            ),
        ];

        Proposition::store_batch(props, &db).await.expect("store");

        let listed = Proposition::list_by_chunk("chunk_1", &db)
            .await
            .expect("list");
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|p| p.chunk_id == "chunk_1"));
    }
}
