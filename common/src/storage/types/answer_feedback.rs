use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, storage::types::stored_object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Thumbs {
    Up,
    Down,
}

// Weak relevance signal: thumbs ratings shift future document scores slightly
// but are never required for correctness.
stored_object!(AnswerFeedback, "answer_feedback", {
    user_id: String,
    query_id: String,
    thumbs: Thumbs,
    comment: Option<String>,
    document_ids: Vec<String>
});

impl AnswerFeedback {
    pub fn new(
        user_id: String,
        query_id: String,
        thumbs: Thumbs,
        comment: Option<String>,
        document_ids: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            user_id,
            query_id,
            thumbs,
            comment,
            document_ids,
        }
    }

    /// Net per-document boost derived from stored ratings, clamped to a small
    /// additive delta so feedback can nudge ranking but never dominate it.
    pub async fn document_boosts(
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<HashMap<String, f32>, AppError> {
        const BOOST_STEP: f32 = 0.02;
        const BOOST_CAP: f32 = 0.1;

        let mut response = db
            .query("SELECT * FROM answer_feedback WHERE user_id = $user_id")
            .bind(("user_id", user_id.to_owned()))
            .await?;

        let entries: Vec<AnswerFeedback> = response.take(0)?;
        let mut net: HashMap<String, i32> = HashMap::new();
        for entry in entries {
            let delta = match entry.thumbs {
                Thumbs::Up => 1,
                Thumbs::Down => -1,
            };
            for doc_id in entry.document_ids {
                *net.entry(doc_id).or_insert(0) += delta;
            }
        }

        Ok(net
            .into_iter()
            .map(|(doc_id, count)| {
                let boost = (count as f32 * BOOST_STEP).clamp(-BOOST_CAP, BOOST_CAP);
                (doc_id, boost)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn boosts_accumulate_and_clamp() {
        let db = SurrealDbClient::memory("fb_ns", &Uuid::new_v4().to_string())
            .await
            .expect("failed to start in-memory surrealdb");

        for i in 0..8 {
            db.store_item(AnswerFeedback::new(
                "user".into(),
                format!("q{i}"),
                Thumbs::Up,
                None,
                vec!["doc_good".into()],
            ))
            .await
            .expect("store feedback");
        }
        db.store_item(AnswerFeedback::new(
            "user".into(),
            "q_bad".into(),
            Thumbs::Down,
            Some("irrelevant".into()),
            vec!["doc_bad".into()],
        ))
        .await
        .expect("store feedback");

        let boosts = AnswerFeedback::document_boosts("user", &db)
            .await
            .expect("boosts");

        assert!((boosts["doc_good"] - 0.1).abs() < 1e-6, "clamped at cap");
        assert!((boosts["doc_bad"] + 0.02).abs() < 1e-6);
        assert!(AnswerFeedback::document_boosts("other", &db)
            .await
            .expect("boosts")
            .is_empty());
    }
}
