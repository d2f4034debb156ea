use common::{error::AppError, llm::structured_call, llm::LlmClient};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

const MAX_PROPOSITIONS: usize = 7;
const MIN_FALLBACK_SENTENCE_CHARS: usize = 25;

const PROPOSITION_SYSTEM_PROMPT: &str = "\
Break the provided text into atomic factual propositions.
Rules:
1. Each proposition is a single, self-contained factual statement.
2. Replace pronouns with the entities they refer to, using the text's own context.
3. Keep technical terms, equations, and numbers exactly as written.
4. Produce between 1 and 7 propositions; skip trivial or redundant facts.
5. Do not include opinions or anything not stated in the text.";

const TRIPLE_SYSTEM_PROMPT: &str = "\
Extract knowledge graph triples (subject, predicate, object) from the provided text.
Rules:
1. Each triple is a factual relationship between two concise noun phrases.
2. Use lowercase canonical entity forms and short verb phrases.
3. Extract only relationships explicitly stated or strongly implied.
4. Produce at most 8 triples; prefer the most important relationships.";

#[derive(Debug, Deserialize)]
struct PropositionPayload {
    propositions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RawTriple {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

#[derive(Debug, Deserialize)]
struct TriplePayload {
    triples: Vec<RawTriple>,
}

fn proposition_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "propositions": {
                "type": "array",
                "items": { "type": "string" }
            }
        },
        "required": ["propositions"],
        "additionalProperties": false
    })
}

fn triple_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "triples": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "subject": { "type": "string" },
                        "predicate": { "type": "string" },
                        "object": { "type": "string" }
                    },
                    "required": ["subject", "predicate", "object"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["triples"],
        "additionalProperties": false
    })
}

/// Atomic statements for a chunk. LLM outages degrade to the sentence
/// fallback; extraction never fails an ingestion.
pub async fn extract_propositions(llm: Option<&dyn LlmClient>, chunk_text: &str) -> Vec<String> {
    if let Some(llm) = llm {
        let attempt: Result<PropositionPayload, AppError> = structured_call(
            llm,
            PROPOSITION_SYSTEM_PROMPT,
            chunk_text,
            "chunk_propositions",
            proposition_schema(),
        )
        .await;

        match attempt {
            Ok(payload) => {
                let propositions: Vec<String> = payload
                    .propositions
                    .into_iter()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .take(MAX_PROPOSITIONS)
                    .collect();
                if !propositions.is_empty() {
                    return propositions;
                }
            }
            Err(err) => {
                warn!(error = %err, "Proposition extraction failed; using sentence fallback");
            }
        }
    }

    fallback_propositions(chunk_text)
}

/// One proposition per sentence of reasonable length.
pub fn fallback_propositions(chunk_text: &str) -> Vec<String> {
    split_sentences(chunk_text)
        .into_iter()
        .filter(|s| s.chars().count() >= MIN_FALLBACK_SENTENCE_CHARS)
        .take(MAX_PROPOSITIONS)
        .collect()
}

/// Raw triples for a chunk. Normalisation and schema checks happen at the
/// storage layer; an LLM outage yields no triples rather than a failure.
pub async fn extract_triples(llm: Option<&dyn LlmClient>, chunk_text: &str) -> Vec<RawTriple> {
    let Some(llm) = llm else {
        return Vec::new();
    };

    let attempt: Result<TriplePayload, AppError> = structured_call(
        llm,
        TRIPLE_SYSTEM_PROMPT,
        chunk_text,
        "chunk_triples",
        triple_schema(),
    )
    .await;

    match attempt {
        Ok(payload) => payload.triples,
        Err(err) => {
            warn!(error = %err, "Triple extraction failed; skipping graph data for chunk");
            Vec::new()
        }
    }
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            let sentence = current.trim().to_string();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            current.clear();
        }
    }

    let last = current.trim();
    if !last.is_empty() {
        sentences.push(last.to_string());
    }

    sentences
}
