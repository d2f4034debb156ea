use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::Citation;

/// A cached answer plus everything needed to validate a hit.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub query_text: String,
    pub query_embedding: Vec<f32>,
    pub answer_text: String,
    pub sources: Vec<Citation>,
    pub doc_set_version: u64,
    created_at: Instant,
    sequence: u64,
}

/// Per-user semantic cache. A lookup hits only when the query embedding is
/// within the similarity threshold *and* the entry was stored at the user's
/// current document-set version; version movement is the invalidation.
pub struct ResponseCache {
    similarity_threshold: f32,
    ttl: Duration,
    max_entries_per_user: usize,
    entries: RwLock<HashMap<String, Vec<CacheEntry>>>,
    sequence: RwLock<u64>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub users: usize,
    pub entries: usize,
}

impl ResponseCache {
    pub fn new(max_entries_per_user: usize, ttl: Duration) -> Self {
        Self {
            similarity_threshold: 0.95,
            ttl,
            max_entries_per_user: max_entries_per_user.max(1),
            entries: RwLock::new(HashMap::new()),
            sequence: RwLock::new(0),
        }
    }

    /// Most recent valid entry with cosine >= threshold at the current
    /// version, or None.
    pub fn get(
        &self,
        user_id: &str,
        query_embedding: &[f32],
        current_version: u64,
    ) -> Option<CacheEntry> {
        let mut map = self.entries.write().ok()?;
        let user_entries = map.get_mut(user_id)?;

        let now = Instant::now();
        user_entries.retain(|entry| now.duration_since(entry.created_at) <= self.ttl);

        let best = user_entries
            .iter()
            .filter(|entry| entry.doc_set_version == current_version)
            .filter(|entry| {
                cosine_similarity(&entry.query_embedding, query_embedding)
                    >= self.similarity_threshold
            })
            .max_by_key(|entry| entry.sequence)?;

        debug!(
            user_id,
            matched = %best.query_text,
            "Semantic cache hit"
        );
        Some(best.clone())
    }

    /// Inserts an entry stamped with the current version, evicting the oldest
    /// entries above capacity. Entries are immutable once stored.
    pub fn put(
        &self,
        user_id: &str,
        query_text: String,
        query_embedding: Vec<f32>,
        answer_text: String,
        sources: Vec<Citation>,
        doc_set_version: u64,
    ) {
        let sequence = {
            let Ok(mut seq) = self.sequence.write() else {
                return;
            };
            *seq += 1;
            *seq
        };

        let entry = CacheEntry {
            query_text,
            query_embedding,
            answer_text,
            sources,
            doc_set_version,
            created_at: Instant::now(),
            sequence,
        };

        let Ok(mut map) = self.entries.write() else {
            return;
        };
        let user_entries = map.entry(user_id.to_owned()).or_default();
        user_entries.push(entry);

        while user_entries.len() > self.max_entries_per_user {
            let oldest = user_entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.sequence)
                .map(|(i, _)| i);
            match oldest {
                Some(i) => {
                    user_entries.remove(i);
                }
                None => break,
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let Ok(map) = self.entries.read() else {
            return CacheStats::default();
        };
        CacheStats {
            users: map.len(),
            entries: map.values().map(Vec::len).sum(),
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}
