use serde::Deserialize;

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::stored_object};

// Per-user monotonic counter bumped on any mutation of the document set.
// The lexical index and the response cache compare against it to detect
// staleness.
stored_object!(UserDocState, "user_doc_state", {
    user_id: String,
    doc_set_version: u64
});

impl UserDocState {
    /// The user's current document-set version; 0 before any mutation.
    pub async fn current_version(user_id: &str, db: &SurrealDbClient) -> Result<u64, AppError> {
        let state: Option<UserDocState> = db.get_item(user_id).await?;
        Ok(state.map(|s| s.doc_set_version).unwrap_or(0))
    }

    /// Monotonically increments the version, creating the record on first use.
    pub async fn bump_version(user_id: &str, db: &SurrealDbClient) -> Result<u64, AppError> {
        #[derive(Deserialize)]
        struct VersionRow {
            doc_set_version: u64,
        }

        let mut response = db
            .client
            .query(
                "UPSERT type::thing('user_doc_state', $user_id) SET \
                 user_id = $user_id, \
                 doc_set_version = IF doc_set_version != NONE THEN doc_set_version + 1 ELSE 1 END, \
                 created_at = IF created_at != NONE THEN created_at ELSE time::now() END, \
                 updated_at = time::now() \
                 RETURN doc_set_version",
            )
            .bind(("user_id", user_id.to_owned()))
            .await?;

        let rows: Vec<VersionRow> = response.take(0)?;
        rows.first()
            .map(|row| row.doc_set_version)
            .ok_or_else(|| AppError::InternalError("version bump returned no row".into()))
    }
}
