use std::fmt;

use common::{
    error::AppError,
    llm::{structured_call, LlmClient},
    utils::deadline::{with_deadline, Deadline},
};
use retrieval_pipeline::{Citation, RankedContext};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

/// Prompt persona selected per question; the orchestrator switches templates,
/// not object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTag {
    Concept,
    Code,
    Research,
    Practice,
}

impl fmt::Display for AgentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentTag::Concept => "concept",
            AgentTag::Code => "code",
            AgentTag::Research => "research",
            AgentTag::Practice => "practice",
        };
        f.write_str(label)
    }
}

const CODE_MARKERS: &[&str] = &["code", "implement", "snippet", "function", "python", "rust"];
const PRACTICE_MARKERS: &[&str] = &["practice", "quiz", "exercise", "problem set", "test me"];
const RESEARCH_MARKERS: &[&str] = &["compare", " vs ", "versus", "paper", "research", "literature"];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

pub fn pick_agent(query: &str) -> AgentTag {
    let lower = format!(" {} ", query.to_lowercase());

    if contains_any(&lower, PRACTICE_MARKERS) {
        AgentTag::Practice
    } else if contains_any(&lower, CODE_MARKERS) {
        AgentTag::Code
    } else if contains_any(&lower, RESEARCH_MARKERS) {
        AgentTag::Research
    } else {
        AgentTag::Concept
    }
}

fn system_prompt(tag: AgentTag) -> &'static str {
    match tag {
        AgentTag::Concept => {
            "You are an academic study assistant explaining concepts from the \
             student's own documents. Answer from the provided context, cite \
             sources with bracketed numbers like [1], and say so when the \
             context does not fully answer the question."
        }
        AgentTag::Code => {
            "You are a programming tutor. Answer with working, commented code \
             grounded in the provided context where possible, cite sources \
             with bracketed numbers like [1], and explain the key steps."
        }
        AgentTag::Research => {
            "You are a research assistant comparing and synthesising material \
             from the student's documents. Contrast the sources explicitly, \
             cite them with bracketed numbers like [1], and note \
             disagreements between them."
        }
        AgentTag::Practice => {
            "You are a study coach. Build practice-oriented explanations and \
             worked examples from the provided context, citing sources with \
             bracketed numbers like [1]."
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnswerPayload {
    answer: String,
    cited_chunks: Vec<usize>,
}

fn answer_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "answer": { "type": "string" },
            "cited_chunks": {
                "type": "array",
                "items": { "type": "integer" }
            }
        },
        "required": ["answer", "cited_chunks"],
        "additionalProperties": false
    })
}

#[derive(Debug, Clone)]
pub struct GeneratedAnswer {
    pub answer_text: String,
    pub sources: Vec<Citation>,
    /// Set when the structured path failed and citations could not be tied to
    /// specific chunks.
    pub degraded: bool,
}

fn format_context(context: &RankedContext) -> String {
    let mut out = String::new();

    for (i, chunk) in context.chunks.iter().enumerate() {
        out.push_str(&format!("[{}] Source: {}", i + 1, chunk.doc_title));
        if let Some(page) = chunk.page {
            out.push_str(&format!(", page {page}"));
        }
        if let Some(section) = &chunk.section {
            out.push_str(&format!(", section: {section}"));
        }
        out.push('\n');
        out.push_str(&chunk.expanded_text);
        out.push_str("\n---\n");
    }

    if !context.triples.is_empty() {
        out.push_str("Known facts from the knowledge graph:\n");
        for triple in &context.triples {
            out.push_str(&format!(
                "- {} {} {}\n",
                triple.subject, triple.predicate, triple.object
            ));
        }
    }

    out
}

fn dedup_citations(citations: Vec<Citation>) -> Vec<Citation> {
    let mut seen = std::collections::HashSet::new();
    citations
        .into_iter()
        .filter(|c| seen.insert((c.doc_title.clone(), c.page)))
        .collect()
}

/// Grounded generation with numbered citations. If the structured response
/// cannot be parsed even after the strict retry, a plain completion answers
/// with every context source attached and the degraded flag set.
pub async fn generate_answer(
    llm: &dyn LlmClient,
    tag: AgentTag,
    query: &str,
    context: &RankedContext,
    deadline: Deadline,
) -> Result<GeneratedAnswer, AppError> {
    let formatted = format_context(context);
    let user = format!(
        "Context from the student's documents:\n==================\n{formatted}\n\
         Question:\n==================\n{query}\n\n\
         Answer using the numbered context entries. List the entry numbers you \
         actually cited in cited_chunks."
    );

    let attempt: Result<AnswerPayload, AppError> = with_deadline(
        "answer generation",
        deadline,
        structured_call(llm, system_prompt(tag), &user, "grounded_answer", answer_schema()),
    )
    .await;

    match attempt {
        Ok(payload) => {
            let mut cited: Vec<Citation> = payload
                .cited_chunks
                .iter()
                .filter_map(|n| n.checked_sub(1))
                .filter_map(|idx| context.chunks.get(idx))
                .map(|chunk| chunk.citation())
                .collect();

            if cited.is_empty() {
                cited = context.chunks.iter().map(|c| c.citation()).collect();
            }

            Ok(GeneratedAnswer {
                answer_text: payload.answer,
                sources: dedup_citations(cited),
                degraded: false,
            })
        }
        Err(err @ AppError::LlmParsing(_)) => {
            warn!(error = %err, "Structured generation failed; falling back to plain completion");

            let answer_text = with_deadline(
                "plain answer generation",
                deadline,
                llm.complete(system_prompt(tag), &user),
            )
            .await?;

            Ok(GeneratedAnswer {
                answer_text,
                sources: dedup_citations(
                    context.chunks.iter().map(|c| c.citation()).collect(),
                ),
                degraded: true,
            })
        }
        Err(err) => Err(err),
    }
}

const GENERAL_KNOWLEDGE_SYSTEM_PROMPT: &str = "\
The student's documents contain nothing relevant to this question. Answer
from general knowledge, open with a note that the uploaded documents do not
cover the topic, and do not fabricate citations.";

/// Used when retrieval found nothing: an uncited general-knowledge answer
/// that says so.
pub async fn generate_general_knowledge_answer(
    llm: &dyn LlmClient,
    query: &str,
    deadline: Deadline,
) -> Result<String, AppError> {
    with_deadline(
        "general knowledge answer",
        deadline,
        llm.complete(GENERAL_KNOWLEDGE_SYSTEM_PROMPT, query),
    )
    .await
}
