use std::{cmp::Ordering, collections::HashMap};

use common::storage::types::StoredObject;
use serde::{Deserialize, Serialize};

use crate::query_class::QueryClass;

/// Holds optional subscores gathered from the two retrieval signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scores {
    pub lexical: Option<f32>,
    pub vector: Option<f32>,
}

/// Generic wrapper combining an item with its accumulated retrieval scores.
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub item: T,
    pub scores: Scores,
    pub fused: f32,
}

impl<T> Scored<T> {
    pub fn new(item: T) -> Self {
        Self {
            item,
            scores: Scores::default(),
            fused: 0.0,
        }
    }

    pub const fn with_lexical_score(mut self, score: f32) -> Self {
        self.scores.lexical = Some(score);
        self
    }

    pub const fn with_vector_score(mut self, score: f32) -> Self {
        self.scores.vector = Some(score);
        self
    }

    pub const fn update_fused(&mut self, fused: f32) {
        self.fused = fused;
    }
}

/// Weights for linear lexical/vector fusion. The pair always sums to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub lexical: f32,
    pub vector: f32,
}

impl FusionWeights {
    /// Weights adapted to the classified query type.
    pub const fn for_class(class: QueryClass) -> Self {
        match class {
            QueryClass::Definition => Self {
                lexical: 0.5,
                vector: 0.5,
            },
            QueryClass::Comparison => Self {
                lexical: 0.2,
                vector: 0.8,
            },
            QueryClass::Code => Self {
                lexical: 0.6,
                vector: 0.4,
            },
            QueryClass::Procedural => Self {
                lexical: 0.4,
                vector: 0.6,
            },
            QueryClass::General => Self {
                lexical: 0.3,
                vector: 0.7,
            },
        }
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self::for_class(QueryClass::General)
    }
}

pub const fn clamp_unit(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    if scores.is_empty() {
        return Vec::new();
    }

    let mut min = f32::MAX;
    let mut max = f32::MIN;

    for s in scores {
        if !s.is_finite() {
            continue;
        }
        if *s < min {
            min = *s;
        }
        if *s > max {
            max = *s;
        }
    }

    if !min.is_finite() || !max.is_finite() {
        return scores.iter().map(|_| 0.0).collect();
    }

    if (max - min).abs() < f32::EPSILON {
        return vec![1.0; scores.len()];
    }

    scores
        .iter()
        .map(|score| {
            if score.is_finite() {
                clamp_unit((score - min) / (max - min))
            } else {
                0.0
            }
        })
        .collect()
}

pub fn fuse_scores(scores: &Scores, weights: FusionWeights) -> f32 {
    let lexical = scores.lexical.unwrap_or(0.0);
    let vector = scores.vector.unwrap_or(0.0);

    clamp_unit(lexical.mul_add(weights.lexical, vector * weights.vector))
}

/// Merges candidate lists, keeping the best subscore of each signal per id.
/// Used both for lexical/vector fusion and for multi-query merging.
pub fn merge_scored_by_id<T>(target: &mut HashMap<String, Scored<T>>, incoming: Vec<Scored<T>>)
where
    T: StoredObject + Clone,
{
    use std::collections::hash_map::Entry;

    for scored in incoming {
        let id = scored.item.get_id().to_owned();
        match target.entry(id) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                if let Some(score) = scored.scores.lexical {
                    let best = existing.scores.lexical.unwrap_or(f32::MIN).max(score);
                    existing.scores.lexical = Some(best);
                }
                if let Some(score) = scored.scores.vector {
                    let best = existing.scores.vector.unwrap_or(f32::MIN).max(score);
                    existing.scores.vector = Some(best);
                }
                if scored.fused > existing.fused {
                    existing.fused = scored.fused;
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(scored);
            }
        }
    }
}

pub fn sort_by_fused_desc<T>(items: &mut [Scored<T>])
where
    T: StoredObject,
{
    items.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.item.get_id().cmp(b.item.get_id()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::chunk::Chunk;

    fn chunk(id: &str) -> Chunk {
        let mut c = Chunk::new(
            "doc".into(),
            "user".into(),
            0,
            "text".into(),
            None,
            None,
            None,
        );
        c.id = id.to_string();
        c
    }

    #[test]
    fn weights_sum_to_one_for_every_class() {
        for class in [
            QueryClass::Definition,
            QueryClass::Comparison,
            QueryClass::Code,
            QueryClass::Procedural,
            QueryClass::General,
        ] {
            let w = FusionWeights::for_class(class);
            assert!(
                ((w.lexical + w.vector) - 1.0).abs() < 1e-6,
                "weights for {class:?} must sum to 1"
            );
        }
    }

    #[test]
    fn fusion_weighs_both_signals() {
        let scores = Scores {
            lexical: Some(1.0),
            vector: Some(0.5),
        };
        let fused = fuse_scores(&scores, FusionWeights::for_class(QueryClass::General));
        assert!((fused - (0.3 + 0.35)).abs() < 1e-6);
    }

    #[test]
    fn min_max_handles_constant_and_empty_inputs() {
        assert!(min_max_normalize(&[]).is_empty());
        assert_eq!(min_max_normalize(&[2.0, 2.0]), vec![1.0, 1.0]);
        let normalized = min_max_normalize(&[1.0, 3.0, 2.0]);
        assert_eq!(normalized, vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn merge_keeps_best_score_per_signal() {
        let mut merged = HashMap::new();
        merge_scored_by_id(
            &mut merged,
            vec![Scored::new(chunk("a")).with_vector_score(0.4)],
        );
        merge_scored_by_id(
            &mut merged,
            vec![
                Scored::new(chunk("a")).with_vector_score(0.9),
                Scored::new(chunk("b")).with_lexical_score(0.2),
            ],
        );

        assert_eq!(merged.len(), 2);
        assert_eq!(merged["a"].scores.vector, Some(0.9));
        assert_eq!(merged["b"].scores.lexical, Some(0.2));
    }

    #[test]
    fn sort_breaks_ties_deterministically() {
        let mut items = vec![
            Scored::new(chunk("b")),
            Scored::new(chunk("a")),
            Scored::new(chunk("c")),
        ];
        for item in &mut items {
            item.update_fused(0.5);
        }
        sort_by_fused_desc(&mut items);
        let ids: Vec<&str> = items.iter().map(|s| s.item.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
