use serde::{Deserialize, Serialize};
use std::fmt;

/// Retrieval-relevant query type; governs fusion weights and over-fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    Definition,
    Comparison,
    Code,
    Procedural,
    General,
}

impl fmt::Display for QueryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QueryClass::Definition => "definition",
            QueryClass::Comparison => "comparison",
            QueryClass::Code => "code",
            QueryClass::Procedural => "procedural",
            QueryClass::General => "general",
        };
        f.write_str(label)
    }
}

const DEFINITION_PREFIXES: &[&str] = &["what is", "what are", "define", "explain", "describe"];
const COMPARISON_MARKERS: &[&str] = &[
    " vs ",
    " vs. ",
    " versus ",
    "difference between",
    "compare",
    "comparing",
    "compared to",
];
const PROCEDURAL_PREFIXES: &[&str] = &["how to", "how do", "how can", "steps to"];
const CODE_MARKERS: &[&str] = &[
    "code",
    "implement",
    "snippet",
    "function",
    "python",
    "rust",
    "write a",
];

/// Rule-based classification; cheap enough to run on every (sub-)query.
pub fn classify_query(query: &str) -> QueryClass {
    let q = query.trim().to_lowercase();
    let padded = format!(" {q} ");

    if COMPARISON_MARKERS.iter().any(|m| padded.contains(m)) {
        return QueryClass::Comparison;
    }

    if PROCEDURAL_PREFIXES.iter().any(|p| q.starts_with(p)) {
        if CODE_MARKERS.iter().any(|m| q.contains(m)) {
            return QueryClass::Code;
        }
        return QueryClass::Procedural;
    }

    if CODE_MARKERS.iter().any(|m| q.contains(m)) {
        return QueryClass::Code;
    }

    if DEFINITION_PREFIXES.iter().any(|p| q.starts_with(p)) {
        return QueryClass::Definition;
    }

    QueryClass::General
}
