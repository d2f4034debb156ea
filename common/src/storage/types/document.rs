use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::stored_object};

/// Structural category of an uploaded document; drives the chunking profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Textbook,
    Paper,
    Notes,
    Code,
    General,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceType::Textbook => "textbook",
            SourceType::Paper => "paper",
            SourceType::Notes => "notes",
            SourceType::Code => "code",
            SourceType::General => "general",
        };
        f.write_str(label)
    }
}

/// Lifecycle of a document: pending -> processing -> {ready, failed}.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

stored_object!(Document, "document", {
    user_id: String,
    title: String,
    source_type: Option<SourceType>,
    page_count: Option<u32>,
    status: DocumentStatus,
    failure: Option<String>
});

impl Document {
    pub fn new(
        user_id: String,
        title: String,
        source_type: Option<SourceType>,
        page_count: Option<u32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            user_id,
            title,
            source_type,
            page_count,
            status: DocumentStatus::Pending,
            failure: None,
        }
    }

    /// Transition the stored status. Only the ingestion pipeline calls this;
    /// legal transitions are pending -> processing -> {ready, failed} plus the
    /// reaper's processing -> failed.
    pub async fn set_status(
        id: &str,
        status: DocumentStatus,
        failure: Option<String>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('document', $id) SET \
                 status = $status, failure = $failure, updated_at = time::now()",
            )
            .bind(("id", id.to_owned()))
            .bind(("status", status))
            .bind(("failure", failure))
            .await?
            .check()?;

        Ok(())
    }

    /// Also stamps the resolved source type and page count once classification ran.
    pub async fn set_classification(
        id: &str,
        source_type: SourceType,
        page_count: Option<u32>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('document', $id) SET \
                 source_type = $source_type, page_count = $page_count, updated_at = time::now()",
            )
            .bind(("id", id.to_owned()))
            .bind(("source_type", source_type))
            .bind(("page_count", page_count))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn list_by_user(
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Document>, AppError> {
        let mut response = db
            .query("SELECT * FROM document WHERE user_id = $user_id ORDER BY created_at ASC")
            .bind(("user_id", user_id.to_owned()))
            .await?;

        Ok(response.take(0)?)
    }

    /// Deletes a document and every derived record in one transaction, then
    /// bumps the owner's document-set version so stale lexical indexes and
    /// cached answers stop matching.
    ///
    /// The embedding rows go in the same transaction: a document never counts
    /// as deleted while its vectors are still searchable.
    pub async fn delete_cascade(id: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        let doc: Document = db
            .get_item(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {id}")))?;

        let response = db
            .client
            .query("BEGIN TRANSACTION;")
            .query(
                "DELETE chunk_embedding WHERE document_id = $doc_id; \
                 DELETE chunk WHERE document_id = $doc_id; \
                 DELETE parent_chunk WHERE document_id = $doc_id; \
                 DELETE proposition WHERE document_id = $doc_id; \
                 DELETE kg_triple WHERE document_id = $doc_id; \
                 DELETE type::thing('document', $doc_id);",
            )
            .query("COMMIT TRANSACTION;")
            .bind(("doc_id", id.to_owned()))
            .await?;
        response.check()?;

        super::user_doc_state::UserDocState::bump_version(&doc.user_id, db).await?;

        Ok(())
    }

    /// Documents stuck in `processing` longer than the reap timeout.
    pub async fn stale_processing(
        older_than_secs: u64,
        db: &SurrealDbClient,
    ) -> Result<Vec<Document>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM document \
                 WHERE status = 'processing' \
                   AND updated_at < time::now() - type::duration($age)",
            )
            .bind(("age", format!("{older_than_secs}s")))
            .await?;

        Ok(response.take(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn status_transitions_persist() {
        let db = SurrealDbClient::memory("doc_ns", &Uuid::new_v4().to_string())
            .await
            .expect("failed to start in-memory surrealdb");

        let doc = Document::new("user_a".into(), "Linear Algebra".into(), None, None);
        db.store_item(doc.clone()).await.expect("store document");

        Document::set_status(&doc.id, DocumentStatus::Processing, None, &db)
            .await
            .expect("set processing");
        Document::set_status(
            &doc.id,
            DocumentStatus::Failed,
            Some("embedding failed".into()),
            &db,
        )
        .await
        .expect("set failed");

        let fetched: Document = db
            .get_item(&doc.id)
            .await
            .expect("fetch")
            .expect("document present");
        assert_eq!(fetched.status, DocumentStatus::Failed);
        assert_eq!(fetched.failure.as_deref(), Some("embedding failed"));
    }

    #[tokio::test]
    async fn list_by_user_filters_owner() {
        let db = SurrealDbClient::memory("doc_ns", &Uuid::new_v4().to_string())
            .await
            .expect("failed to start in-memory surrealdb");

        let mine = Document::new("user_a".into(), "Mine".into(), None, None);
        let theirs = Document::new("user_b".into(), "Theirs".into(), None, None);
        db.store_item(mine.clone()).await.expect("store mine");
        db.store_item(theirs).await.expect("store theirs");

        let docs = Document::list_by_user("user_a", &db).await.expect("list");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, mine.id);
    }
}
