use common::{
    error::AppError,
    llm::{structured_call, LlmClient},
    utils::deadline::{with_deadline, Deadline},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const REWRITE_SYSTEM_PROMPT: &str = "\
Rewrite the user's question for document search.
Resolve pronouns using the conversation context, expand abbreviations, and
keep the meaning identical. Return the rewritten question only.";

const MULTI_QUERY_SYSTEM_PROMPT: &str = "\
Produce up to 3 alternative phrasings of the question for document search.
Each phrasing must ask for the same information using different wording.
Do not answer the question.";

#[derive(Debug, Deserialize)]
struct RewritePayload {
    rewritten: String,
}

#[derive(Debug, Deserialize)]
struct PhrasingsPayload {
    phrasings: Vec<String>,
}

fn rewrite_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "rewritten": { "type": "string" }
        },
        "required": ["rewritten"],
        "additionalProperties": false
    })
}

fn phrasings_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "phrasings": {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": ["phrasings"],
        "additionalProperties": false
    })
}

/// Pronoun-resolving rewrite. Failure is non-fatal: the original query is
/// used and the flag reports whether a rewrite happened.
pub async fn rewrite_query(
    llm: &dyn LlmClient,
    query: &str,
    conversation_hint: Option<&str>,
    deadline: Deadline,
) -> (String, bool) {
    let user = match conversation_hint {
        Some(hint) => format!("Conversation context:\n{hint}\n\nQuestion:\n{query}"),
        None => format!("Question:\n{query}"),
    };

    let attempt: Result<RewritePayload, AppError> = with_deadline(
        "query rewrite",
        deadline,
        structured_call(
            llm,
            REWRITE_SYSTEM_PROMPT,
            &user,
            "query_rewrite",
            rewrite_schema(),
        ),
    )
    .await;

    match attempt {
        Ok(payload) => {
            let rewritten = payload.rewritten.trim().to_string();
            if rewritten.is_empty() || rewritten == query {
                (query.to_string(), false)
            } else {
                debug!(original = query, rewritten = %rewritten, "Query rewritten");
                (rewritten, true)
            }
        }
        Err(err) => {
            warn!(error = %err, "Query rewrite failed; proceeding with the original");
            (query.to_string(), false)
        }
    }
}

/// Up to 3 alternative phrasings; an outage simply yields none.
pub async fn alternative_phrasings(
    llm: &dyn LlmClient,
    query: &str,
    deadline: Deadline,
) -> Vec<String> {
    let attempt: Result<PhrasingsPayload, AppError> = with_deadline(
        "multi-query expansion",
        deadline,
        structured_call(
            llm,
            MULTI_QUERY_SYSTEM_PROMPT,
            query,
            "query_phrasings",
            phrasings_schema(),
        ),
    )
    .await;

    match attempt {
        Ok(payload) => payload
            .phrasings
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty() && p != query)
            .take(3)
            .collect(),
        Err(err) => {
            warn!(error = %err, "Multi-query expansion failed; using the single query");
            Vec::new()
        }
    }
}
