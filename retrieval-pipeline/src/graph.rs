use std::collections::HashSet;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::kg_triple::KgTriple},
};
use tracing::debug;

const MAX_HOPS: usize = 2;
const TRIPLE_CAP: usize = 32;

const QUERY_STOP_WORDS: &[&str] = &[
    "what", "how", "why", "when", "where", "which", "who", "is", "are", "was", "were", "do",
    "does", "did", "the", "a", "an", "in", "on", "at", "to", "for", "of", "with", "by", "from",
    "and", "or", "not", "can", "could", "would", "should", "will", "this", "that", "it", "its",
    "be", "been", "being", "have", "has", "had", "about", "into", "used", "using", "between",
    "explain", "describe", "tell", "me", "give", "say", "state",
];

/// Candidate entity mentions pulled from a query: informative unigrams plus
/// adjacent bigrams, lowercased to match stored triple subjects.
pub fn extract_query_entities(query: &str) -> Vec<String> {
    let words: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter_map(|raw| {
            let w = raw.trim().to_lowercase();
            if w.len() >= 2 {
                Some(w)
            } else {
                None
            }
        })
        .collect();

    let informative: Vec<&String> = words
        .iter()
        .filter(|w| !QUERY_STOP_WORDS.contains(&w.as_str()))
        .collect();

    let mut entities: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    // Bigrams first; a compound term like "gradient descent" is the better
    // graph key when it exists.
    for pair in words.windows(2) {
        if QUERY_STOP_WORDS.contains(&pair[0].as_str())
            || QUERY_STOP_WORDS.contains(&pair[1].as_str())
        {
            continue;
        }
        let bigram = format!("{} {}", pair[0], pair[1]);
        if seen.insert(bigram.clone()) {
            entities.push(bigram);
        }
    }

    for word in informative {
        if seen.insert(word.clone()) {
            entities.push(word.clone());
        }
    }

    entities
}

/// Multi-hop augmentation: seed subjects from the query, then follow objects
/// as next-hop subjects. Bounded at two hops and 32 triples.
pub async fn augment_with_triples(
    query: &str,
    user_id: &str,
    db: &SurrealDbClient,
) -> Result<Vec<KgTriple>, AppError> {
    let mut frontier = extract_query_entities(query);
    if frontier.is_empty() {
        return Ok(Vec::new());
    }

    let mut visited_subjects: HashSet<String> = HashSet::new();
    let mut collected: Vec<KgTriple> = Vec::new();
    let mut seen_triples: HashSet<(String, String, String)> = HashSet::new();

    for hop in 0..MAX_HOPS {
        frontier.retain(|subject| visited_subjects.insert(subject.clone()));
        if frontier.is_empty() || collected.len() >= TRIPLE_CAP {
            break;
        }

        let hits = KgTriple::for_subjects(frontier.clone(), user_id, db).await?;
        debug!(hop, subjects = frontier.len(), hits = hits.len(), "Graph hop");

        let mut next_frontier = Vec::new();
        for triple in hits {
            let key = (
                triple.subject.clone(),
                triple.predicate.clone(),
                triple.object.clone(),
            );
            if !seen_triples.insert(key) {
                continue;
            }

            next_frontier.push(triple.object.clone());
            collected.push(triple);

            if collected.len() >= TRIPLE_CAP {
                break;
            }
        }

        frontier = next_frontier;
    }

    collected.truncate(TRIPLE_CAP);
    Ok(collected)
}
