use chrono::Utc;
use std::collections::HashSet;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::stored_object};

// Entity-relationship fact extracted from a chunk, lowercase-normalised.
stored_object!(KgTriple, "kg_triple", {
    chunk_id: String,
    document_id: String,
    user_id: String,
    subject: String,
    predicate: String,
    object: String
});

impl KgTriple {
    /// Normalises the fields; returns None when the triple fails schema
    /// (an empty field after trimming).
    pub fn checked(
        chunk_id: String,
        document_id: String,
        user_id: String,
        subject: &str,
        predicate: &str,
        object: &str,
    ) -> Option<Self> {
        let subject = subject.trim().to_lowercase();
        let predicate = predicate.trim().to_lowercase();
        let object = object.trim().to_lowercase();

        if subject.is_empty() || predicate.is_empty() || object.is_empty() {
            return None;
        }

        let now = Utc::now();
        Some(Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            chunk_id,
            document_id,
            user_id,
            subject,
            predicate,
            object,
        })
    }

    fn key(&self) -> (String, String, String) {
        (
            self.subject.clone(),
            self.predicate.clone(),
            self.object.clone(),
        )
    }

    /// Stores triples, deduplicating against both the incoming batch and the
    /// user's existing namespace.
    pub async fn store_batch_deduped(
        triples: Vec<KgTriple>,
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        if triples.is_empty() {
            return Ok(0);
        }

        let user_id = triples[0].user_id.clone();
        let existing = Self::list_by_user(&user_id, db).await?;
        let mut seen: HashSet<(String, String, String)> =
            existing.iter().map(KgTriple::key).collect();

        let fresh: Vec<KgTriple> = triples
            .into_iter()
            .filter(|triple| seen.insert(triple.key()))
            .collect();

        if fresh.is_empty() {
            return Ok(0);
        }

        let stored = fresh.len();
        let response = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(
                "FOR $triple IN $triples { \
                     CREATE type::thing('kg_triple', $triple.id) CONTENT $triple; \
                 };",
            )
            .query("COMMIT TRANSACTION;")
            .bind(("triples", fresh))
            .await?;

        response.check()?;

        Ok(stored)
    }

    pub async fn list_by_user(
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<KgTriple>, AppError> {
        let mut response = db
            .query("SELECT * FROM kg_triple WHERE user_id = $user_id")
            .bind(("user_id", user_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    /// Triples whose subject matches any of the given (already lowercased) terms.
    pub async fn for_subjects(
        subjects: Vec<String>,
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<KgTriple>, AppError> {
        if subjects.is_empty() {
            return Ok(Vec::new());
        }

        let mut response = db
            .query(
                "SELECT * FROM kg_triple \
                 WHERE user_id = $user_id AND subject IN $subjects",
            )
            .bind(("user_id", user_id.to_owned()))
            .bind(("subjects", subjects))
            .await?;

        Ok(response.take(0)?)
    }
}
