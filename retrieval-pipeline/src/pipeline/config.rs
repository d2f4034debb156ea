use serde::{Deserialize, Serialize};
use std::fmt;

/// How surviving chunks get their `expanded_text`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionMode {
    /// Adjacent chunks by ordinal; a parent substitutes when one exists.
    #[default]
    Sliding,
    /// Parent text only; falls back to the chunk itself without a parent.
    Parent,
    /// No expansion.
    None,
}

impl fmt::Display for ExpansionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExpansionMode::Sliding => "sliding",
            ExpansionMode::Parent => "parent",
            ExpansionMode::None => "none",
        };
        f.write_str(label)
    }
}

/// Tunable parameters that govern each retrieval stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalTuning {
    /// Candidates pulled from the lexical index per query.
    pub lexical_take: usize,
    /// Candidates pulled from the vector index per query.
    pub vector_take: usize,
    /// Fused candidates kept ahead of reranking.
    pub fused_keep: usize,
    /// Final chunk count after reranking.
    pub rerank_keep_top: usize,
    /// Blend between fused score and cross-encoder score.
    pub rerank_blend_weight: f32,
    pub rerank_scores_only: bool,
    /// Neighbours on each side for sliding-window expansion.
    pub adjacent_window: u32,
    /// Over-fetch factor for comparison queries before diversification.
    pub comparison_overfetch: usize,
    /// Apply stored thumbs ratings as a small per-document score shift.
    pub apply_feedback_boosts: bool,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            lexical_take: 20,
            vector_take: 20,
            fused_keep: 20,
            rerank_keep_top: 5,
            rerank_blend_weight: 0.65,
            rerank_scores_only: false,
            adjacent_window: 1,
            comparison_overfetch: 2,
            apply_feedback_boosts: true,
        }
    }
}

/// Per-request retrieval configuration.
#[derive(Debug, Clone, Default)]
pub struct RetrievalConfig {
    pub tuning: RetrievalTuning,
    pub expansion: ExpansionMode,
}

impl RetrievalConfig {
    pub fn with_expansion(expansion: ExpansionMode) -> Self {
        Self {
            tuning: RetrievalTuning::default(),
            expansion,
        }
    }
}
