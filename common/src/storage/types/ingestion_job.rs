use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    storage::types::{document::SourceType, stored_object},
};

pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Queued,
    InProgress {
        attempts: u32,
        #[serde(
            serialize_with = "crate::storage::types::serialize_datetime",
            deserialize_with = "crate::storage::types::deserialize_datetime"
        )]
        last_attempt: DateTime<Utc>,
    },
    Completed,
    Error(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestionPayload {
    pub user_id: String,
    pub document_id: String,
    pub title: String,
    pub text: String,
    pub source_type: Option<SourceType>,
}

stored_object!(IngestionJob, "ingestion_job", {
    payload: IngestionPayload,
    status: JobStatus,
    user_id: String
});

impl IngestionJob {
    pub fn new(payload: IngestionPayload) -> Self {
        let now = Utc::now();
        let user_id = payload.user_id.clone();

        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            payload,
            status: JobStatus::Queued,
            user_id,
        }
    }

    /// Enqueues a job, refusing when the backlog bound is hit.
    pub async fn enqueue_bounded(
        payload: IngestionPayload,
        queue_bound: usize,
        db: &SurrealDbClient,
    ) -> Result<String, AppError> {
        let backlog = Self::queued_count(db).await?;
        if backlog >= queue_bound {
            return Err(AppError::Overloaded(format!(
                "ingestion queue full ({backlog}/{queue_bound})"
            )));
        }

        let job = Self::new(payload);
        let id = job.id.clone();
        db.store_item(job).await?;

        Ok(id)
    }

    pub async fn queued_count(db: &SurrealDbClient) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            total: usize,
        }

        let mut response = db
            .query(
                "SELECT count() AS total FROM ingestion_job \
                 WHERE status = 'Queued' GROUP ALL",
            )
            .await?;

        let rows: Vec<CountRow> = response.take(0)?;
        Ok(rows.first().map(|r| r.total).unwrap_or(0))
    }

    pub async fn update_status(
        id: &str,
        status: JobStatus,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('ingestion_job', $id) SET \
                 status = $status, updated_at = time::now()",
            )
            .bind(("id", id.to_owned()))
            .bind(("status", status))
            .await?
            .check()?;

        Ok(())
    }

    /// Jobs the worker should pick up on startup: queued, plus in-progress
    /// jobs that still have retry budget.
    pub async fn get_unfinished(db: &SurrealDbClient) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM ingestion_job \
                 WHERE status = 'Queued' \
                    OR (status.InProgress != NONE \
                        AND status.InProgress.attempts < $max_attempts) \
                 ORDER BY created_at ASC",
            )
            .bind(("max_attempts", MAX_ATTEMPTS))
            .await?;

        Ok(response.take(0)?)
    }
}
