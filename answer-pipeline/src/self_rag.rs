use common::{
    error::AppError,
    llm::{structured_call, LlmClient},
    utils::deadline::{with_deadline, Deadline},
};
use retrieval_pipeline::ContextChunk;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

const VERIFY_SYSTEM_PROMPT: &str = "\
You judge retrieval quality. Decide whether the retrieved context is
sufficient to answer the question. Only call it insufficient when the context
is clearly irrelevant or missing key information; in that case also supply a
better search query.";

const CONTEXT_PREVIEW_CHUNKS: usize = 5;
const CONTEXT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sufficiency {
    Sufficient,
    Insufficient,
}

#[derive(Debug, Deserialize)]
struct VerdictPayload {
    verdict: Sufficiency,
    reformulated_query: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub sufficiency: Sufficiency,
    pub reformulated_query: Option<String>,
}

impl Verdict {
    pub fn sufficient() -> Self {
        Self {
            sufficiency: Sufficiency::Sufficient,
            reformulated_query: None,
        }
    }
}

fn verdict_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "verdict": {
                "type": "string",
                "enum": ["sufficient", "insufficient"]
            },
            "reformulated_query": {
                "type": ["string", "null"]
            }
        },
        "required": ["verdict", "reformulated_query"],
        "additionalProperties": false
    })
}

/// Judges whether the retrieved context can answer the query.
///
/// Empty context is insufficient without consulting the model. A judge outage
/// defaults to sufficient so verification never blocks an answer; the
/// "insufficient" outcome is a control signal, not an error.
pub async fn verify(
    llm: &dyn LlmClient,
    query: &str,
    chunks: &[ContextChunk],
    deadline: Deadline,
) -> Verdict {
    if chunks.is_empty() {
        return Verdict {
            sufficiency: Sufficiency::Insufficient,
            reformulated_query: None,
        };
    }

    let preview: String = chunks
        .iter()
        .take(CONTEXT_PREVIEW_CHUNKS)
        .map(|chunk| {
            let mut text = chunk.text.clone();
            if text.chars().count() > CONTEXT_PREVIEW_CHARS {
                text = text.chars().take(CONTEXT_PREVIEW_CHARS).collect();
            }
            text
        })
        .collect::<Vec<_>>()
        .join("\n");

    let user = format!("Question: {query}\n\nRetrieved context (truncated):\n{preview}");

    let attempt: Result<VerdictPayload, AppError> = with_deadline(
        "sufficiency verdict",
        deadline,
        structured_call(
            llm,
            VERIFY_SYSTEM_PROMPT,
            &user,
            "sufficiency_verdict",
            verdict_schema(),
        ),
    )
    .await;

    match attempt {
        Ok(payload) => {
            debug!(verdict = ?payload.verdict, "Self-RAG verdict");
            Verdict {
                sufficiency: payload.verdict,
                reformulated_query: payload
                    .reformulated_query
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty() && q != query),
            }
        }
        Err(err) => {
            warn!(error = %err, "Sufficiency verification failed; assuming sufficient");
            Verdict::sufficient()
        }
    }
}

const REFORMULATE_SYSTEM_PROMPT: &str = "\
The previous search for this question returned too little relevant material.
Produce one alternative search query using different key terms.";

#[derive(Debug, Deserialize)]
struct ReformulatePayload {
    query: String,
}

/// A fresh search phrasing for the retry round; None when the model cannot
/// improve on the original.
pub async fn reformulate(
    llm: &dyn LlmClient,
    query: &str,
    deadline: Deadline,
) -> Option<String> {
    let schema = json!({
        "type": "object",
        "properties": {
            "query": { "type": "string" }
        },
        "required": ["query"],
        "additionalProperties": false
    });

    let attempt: Result<ReformulatePayload, AppError> = with_deadline(
        "query reformulation",
        deadline,
        structured_call(llm, REFORMULATE_SYSTEM_PROMPT, query, "query_reformulation", schema),
    )
    .await;

    match attempt {
        Ok(payload) => {
            let reformulated = payload.query.trim().to_string();
            if reformulated.is_empty() || reformulated == query {
                None
            } else {
                Some(reformulated)
            }
        }
        Err(err) => {
            warn!(error = %err, "Reformulation failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLlm;
    use std::time::Duration;

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    fn chunk(text: &str) -> ContextChunk {
        ContextChunk {
            chunk_id: "c1".into(),
            document_id: "d1".into(),
            doc_title: "Doc".into(),
            section: None,
            page: None,
            text: text.into(),
            expanded_text: text.into(),
            score: 0.8,
        }
    }

    #[tokio::test]
    async fn empty_context_is_insufficient_without_an_llm_call() {
        let llm = ScriptedLlm::offline();
        let verdict = verify(&llm, "quantum chromodynamics", &[], deadline()).await;
        assert_eq!(verdict.sufficiency, Sufficiency::Insufficient);
    }

    #[tokio::test]
    async fn sufficient_verdict_passes_through() {
        let llm = ScriptedLlm::new().with_response(
            "sufficiency_verdict",
            serde_json::json!({"verdict": "sufficient", "reformulated_query": null}).to_string(),
        );

        let verdict = verify(&llm, "What is PCA?", &[chunk("PCA reduces dims")], deadline()).await;
        assert_eq!(verdict.sufficiency, Sufficiency::Sufficient);
        assert!(verdict.reformulated_query.is_none());
    }

    #[tokio::test]
    async fn insufficient_verdict_carries_a_reformulation() {
        let llm = ScriptedLlm::new().with_response(
            "sufficiency_verdict",
            serde_json::json!({
                "verdict": "insufficient",
                "reformulated_query": "principal component analysis dimensionality"
            })
            .to_string(),
        );

        let verdict = verify(&llm, "What is PCA?", &[chunk("unrelated text")], deadline()).await;
        assert_eq!(verdict.sufficiency, Sufficiency::Insufficient);
        assert_eq!(
            verdict.reformulated_query.as_deref(),
            Some("principal component analysis dimensionality")
        );
    }

    #[tokio::test]
    async fn judge_outage_defaults_to_sufficient() {
        let llm = ScriptedLlm::offline();
        let verdict = verify(&llm, "What is PCA?", &[chunk("PCA text")], deadline()).await;
        assert_eq!(verdict.sufficiency, Sufficiency::Sufficient);
    }
}
