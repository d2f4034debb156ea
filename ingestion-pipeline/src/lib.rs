pub mod chunking;
pub mod classify;
pub mod extraction;
pub mod pipeline;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            document::{Document, DocumentStatus, SourceType},
            ingestion_job::{IngestionJob, IngestionPayload},
        },
    },
};
use futures::StreamExt;
use surrealdb::Action;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use pipeline::{reap_stale_documents, IngestionPipeline};

/// Call-level ingest API: validates the upload, creates a pending document,
/// and enqueues the background job. A full queue refuses with `Overloaded`.
pub async fn submit_document(
    db: &SurrealDbClient,
    queue_bound: usize,
    user_id: &str,
    title: &str,
    bytes: Vec<u8>,
    source_type: Option<SourceType>,
) -> Result<String, AppError> {
    let text = String::from_utf8(bytes)
        .map_err(|_| AppError::Validation("document bytes are not valid UTF-8 text".into()))?;
    if text.trim().is_empty() {
        return Err(AppError::Validation("document is empty".into()));
    }

    let document = Document::new(user_id.to_owned(), title.to_owned(), source_type, None);
    let document_id = document.id.clone();
    db.store_item(document).await?;

    let payload = IngestionPayload {
        user_id: user_id.to_owned(),
        document_id: document_id.clone(),
        title: title.to_owned(),
        text,
        source_type,
    };

    match IngestionJob::enqueue_bounded(payload, queue_bound, db).await {
        Ok(_) => Ok(document_id),
        Err(err) => {
            // Do not leave an orphan pending document behind a refused upload.
            let _ = db.delete_item::<Document>(&document_id).await;
            Err(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DocumentStatusReport {
    pub status: DocumentStatus,
    pub progress: Option<f32>,
    pub failure: Option<String>,
}

pub async fn document_status(
    db: &SurrealDbClient,
    document_id: &str,
) -> Result<DocumentStatusReport, AppError> {
    let document: Document = db
        .get_item(document_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {document_id}")))?;

    let progress = match document.status {
        DocumentStatus::Pending => Some(0.0),
        DocumentStatus::Processing => Some(0.5),
        DocumentStatus::Ready => Some(1.0),
        DocumentStatus::Failed => None,
    };

    Ok(DocumentStatusReport {
        status: document.status,
        progress,
        failure: document.failure,
    })
}

/// Background worker: drains unfinished jobs on startup, then follows the
/// job table's live stream. A bounded pool limits concurrent ingestions, a
/// document is never ingested twice at once, and a periodic reaper fails
/// documents stuck in `processing`.
pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    ingestion_pipeline: Arc<IngestionPipeline>,
    workers: usize,
    reap_after_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let active_documents: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut reap_interval = tokio::time::interval(Duration::from_secs(60));

    loop {
        let unfinished = IngestionJob::get_unfinished(&db).await?;
        if !unfinished.is_empty() {
            info!("Found {} unfinished jobs", unfinished.len());
            for job in unfinished {
                dispatch_job(
                    job,
                    ingestion_pipeline.clone(),
                    semaphore.clone(),
                    active_documents.clone(),
                )
                .await;
            }
        }

        info!("Listening for new jobs...");
        let mut job_stream = db.listen::<IngestionJob>().await?;

        loop {
            tokio::select! {
                _ = reap_interval.tick() => {
                    match reap_stale_documents(reap_after_secs, &db).await {
                        Ok(0) => {}
                        Ok(reaped) => warn!(reaped, "reaped stuck documents"),
                        Err(err) => error!("Reaper failed: {err}"),
                    }
                }
                notification = job_stream.next() => {
                    match notification {
                        Some(Ok(notification)) => {
                            if matches!(notification.action, Action::Create) {
                                dispatch_job(
                                    notification.data,
                                    ingestion_pipeline.clone(),
                                    semaphore.clone(),
                                    active_documents.clone(),
                                )
                                .await;
                            }
                        }
                        Some(Err(err)) => error!("Error in job notification: {err}"),
                        None => break,
                    }
                }
            }
        }

        error!("Database stream ended unexpectedly, reconnecting...");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

async fn dispatch_job(
    job: IngestionJob,
    pipeline: Arc<IngestionPipeline>,
    semaphore: Arc<Semaphore>,
    active_documents: Arc<Mutex<HashSet<String>>>,
) {
    let document_id = job.payload.document_id.clone();

    {
        let mut active = active_documents.lock().await;
        if !active.insert(document_id.clone()) {
            info!(document_id = %document_id, "document already being ingested; skipping");
            return;
        }
    }

    let permit = semaphore
        .acquire_owned()
        .await
        .expect("worker semaphore closed");

    tokio::spawn(async move {
        let _permit = permit;
        if let Err(err) = pipeline.process_job(job).await {
            error!("Error processing job: {err}");
        }
        active_documents.lock().await.remove(&document_id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::ingestion_job::JobStatus;
    use uuid::Uuid;

    async fn setup() -> SurrealDbClient {
        SurrealDbClient::memory("ingest_api_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb")
    }

    #[tokio::test]
    async fn submit_rejects_non_utf8_bytes() {
        let db = setup().await;
        let err = submit_document(&db, 8, "user", "binary", vec![0xff, 0xfe, 0x00], None)
            .await
            .expect_err("invalid bytes");
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn submit_creates_pending_document_and_queued_job() {
        let db = setup().await;
        let id = submit_document(
            &db,
            8,
            "user",
            "Lecture notes",
            b"The determinant of a matrix measures volume scaling.".to_vec(),
            None,
        )
        .await
        .expect("submit");

        let report = document_status(&db, &id).await.expect("status");
        assert_eq!(report.status, DocumentStatus::Pending);
        assert_eq!(report.progress, Some(0.0));

        let jobs = IngestionJob::get_unfinished(&db).await.expect("jobs");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload.document_id, id);
        assert_eq!(jobs[0].status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn full_queue_refuses_and_cleans_up() {
        let db = setup().await;
        submit_document(&db, 1, "user", "first", b"some content here".to_vec(), None)
            .await
            .expect("first submit");

        let err = submit_document(&db, 1, "user", "second", b"more content".to_vec(), None)
            .await
            .expect_err("queue full");
        assert!(matches!(err, AppError::Overloaded(_)));

        let docs = Document::list_by_user("user", &db).await.expect("docs");
        assert_eq!(docs.len(), 1, "refused upload leaves no orphan document");
    }

    #[tokio::test]
    async fn status_for_missing_document_is_not_found() {
        let db = setup().await;
        let err = document_status(&db, "missing").await.expect_err("absent");
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
