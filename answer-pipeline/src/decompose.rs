use common::{
    error::AppError,
    llm::{structured_call, LlmClient},
    utils::deadline::{with_deadline, Deadline},
};
use retrieval_pipeline::query_class::{classify_query, QueryClass};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const MAX_SUB_QUERIES: usize = 4;

const DECOMPOSE_SYSTEM_PROMPT: &str = "\
Split the compound question into 2 to 4 self-contained sub-questions for
document search. Each sub-question must stand alone and cover one topic or
one ask. Do not answer them.";

#[derive(Debug, Deserialize)]
struct DecomposePayload {
    sub_queries: Vec<String>,
}

fn decompose_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "sub_queries": {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": ["sub_queries"],
        "additionalProperties": false
    })
}

const COORDINATION_MARKERS: &[&str] = &[" and ", " vs ", " vs. ", " versus ", "compared to"];

/// Decomposition triggers on multiple question clauses, coordination between
/// heads, or long non-definition queries. Single-word queries short-circuit.
pub fn needs_decomposition(query: &str) -> bool {
    let trimmed = query.trim();
    if trimmed.split_whitespace().count() <= 1 {
        return false;
    }

    let question_clauses = trimmed.matches('?').count();
    if question_clauses >= 2 {
        return true;
    }

    let lower = trimmed.to_lowercase();
    if COORDINATION_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }

    trimmed.chars().count() > 200 && classify_query(trimmed) != QueryClass::Definition
}

/// LLM decomposition into 2..=4 atomic sub-queries; any failure falls back to
/// the single query.
pub async fn decompose(llm: &dyn LlmClient, query: &str, deadline: Deadline) -> Vec<String> {
    if !needs_decomposition(query) {
        return vec![query.to_string()];
    }

    let attempt: Result<DecomposePayload, AppError> = with_deadline(
        "query decomposition",
        deadline,
        structured_call(
            llm,
            DECOMPOSE_SYSTEM_PROMPT,
            query,
            "query_decomposition",
            decompose_schema(),
        ),
    )
    .await;

    match attempt {
        Ok(payload) => {
            let sub_queries: Vec<String> = payload
                .sub_queries
                .into_iter()
                .map(|q| q.trim().to_string())
                .filter(|q| q.len() > 5)
                .take(MAX_SUB_QUERIES)
                .collect();

            if sub_queries.len() >= 2 {
                debug!(count = sub_queries.len(), "Query decomposed");
                sub_queries
            } else {
                vec![query.to_string()]
            }
        }
        Err(err) => {
            warn!(error = %err, "Decomposition failed; using the whole query");
            vec![query.to_string()]
        }
    }
}
