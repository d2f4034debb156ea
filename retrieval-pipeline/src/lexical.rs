use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{chunk::Chunk, user_doc_state::UserDocState},
    },
};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

// No stemming: technical terms like "boosting" and "boost" must stay distinct.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter_map(|raw| {
            let term = raw.trim().to_lowercase();
            if term.is_empty() || STOP_WORDS.contains(&term.as_str()) {
                None
            } else {
                Some(term)
            }
        })
        .collect()
}

/// Immutable per-user BM25 snapshot. Searches never block a rebuild; they
/// read whichever snapshot was current when they started.
pub struct Bm25Index {
    version: u64,
    postings: HashMap<String, Vec<(usize, u32)>>,
    doc_lengths: Vec<u32>,
    avgdl: f32,
    chunks: Vec<Chunk>,
}

impl Bm25Index {
    pub fn build(version: u64, chunks: Vec<Chunk>) -> Self {
        let mut postings: HashMap<String, Vec<(usize, u32)>> = HashMap::new();
        let mut doc_lengths = Vec::with_capacity(chunks.len());

        for (doc_idx, chunk) in chunks.iter().enumerate() {
            let terms = tokenize(&chunk.text);
            doc_lengths.push(terms.len() as u32);

            let mut tf: HashMap<String, u32> = HashMap::new();
            for term in terms {
                *tf.entry(term).or_insert(0) += 1;
            }
            for (term, count) in tf {
                postings.entry(term).or_default().push((doc_idx, count));
            }
        }

        let avgdl = if doc_lengths.is_empty() {
            0.0
        } else {
            doc_lengths.iter().sum::<u32>() as f32 / doc_lengths.len() as f32
        };

        Self {
            version,
            postings,
            doc_lengths,
            avgdl,
            chunks,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Top-k chunks by BM25. Raw scores; the caller min-max normalises for
    /// fusion.
    pub fn search(&self, query: &str, k: usize) -> Vec<(Chunk, f32)> {
        if self.chunks.is_empty() || k == 0 {
            return Vec::new();
        }

        let n = self.chunks.len() as f32;
        let mut accumulator: HashMap<usize, f32> = HashMap::new();

        for term in tokenize(query) {
            let Some(posting) = self.postings.get(&term) else {
                continue;
            };

            let df = posting.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for &(doc_idx, tf) in posting {
                let tf = tf as f32;
                let dl = self.doc_lengths[doc_idx] as f32;
                let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / self.avgdl.max(1.0));
                let score = idf * tf * (BM25_K1 + 1.0) / denom;
                *accumulator.entry(doc_idx).or_insert(0.0) += score;
            }
        }

        let mut hits: Vec<(usize, f32)> = accumulator.into_iter().collect();
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.chunks[a.0].id.cmp(&self.chunks[b.0].id))
        });
        hits.truncate(k);

        hits.into_iter()
            .map(|(doc_idx, score)| (self.chunks[doc_idx].clone(), score))
            .collect()
    }
}

struct UserEntry {
    rebuild: Mutex<()>,
    snapshot: RwLock<Option<Arc<Bm25Index>>>,
    last_used: AtomicU64,
}

/// Per-user lexical indexes, rebuilt lazily when the stored document-set
/// version moves. Memory is bounded by evicting the least recently used
/// users.
pub struct LexicalIndexManager {
    max_users: usize,
    users: Mutex<HashMap<String, Arc<UserEntry>>>,
    clock: AtomicU64,
}

impl LexicalIndexManager {
    pub fn new(max_users: usize) -> Arc<Self> {
        Arc::new(Self {
            max_users: max_users.max(1),
            users: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
        })
    }

    async fn entry_for(&self, user_id: &str) -> Arc<UserEntry> {
        let mut users = self.users.lock().await;
        let tick = self.clock.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = users.get(user_id) {
            entry.last_used.store(tick, Ordering::Relaxed);
            return entry.clone();
        }

        if users.len() >= self.max_users {
            let evict = users
                .iter()
                .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(user) = evict {
                debug!(%user, "Evicting least recently used lexical index");
                users.remove(&user);
            }
        }

        let entry = Arc::new(UserEntry {
            rebuild: Mutex::new(()),
            snapshot: RwLock::new(None),
            last_used: AtomicU64::new(tick),
        });
        users.insert(user_id.to_owned(), entry.clone());
        entry
    }

    /// Returns a snapshot current as of the version observed at call time.
    /// Rebuilds are serialised per user; a search that began before a rebuild
    /// completes reads the previous snapshot.
    #[instrument(level = "trace", skip(self, db))]
    pub async fn snapshot(
        &self,
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Arc<Bm25Index>, AppError> {
        let current_version = UserDocState::current_version(user_id, db).await?;
        let entry = self.entry_for(user_id).await;

        {
            let snapshot = entry
                .snapshot
                .read()
                .map_err(|_| AppError::InternalError("lexical snapshot lock poisoned".into()))?;
            if let Some(index) = snapshot.as_ref() {
                if index.version() == current_version {
                    return Ok(index.clone());
                }
            }
        }

        let _rebuild_guard = entry.rebuild.lock().await;

        // Another rebuild may have finished while this one waited for the lock.
        {
            let snapshot = entry
                .snapshot
                .read()
                .map_err(|_| AppError::InternalError("lexical snapshot lock poisoned".into()))?;
            if let Some(index) = snapshot.as_ref() {
                if index.version() == current_version {
                    return Ok(index.clone());
                }
            }
        }

        debug!(%user_id, version = current_version, "Rebuilding lexical index");
        let chunks = Chunk::list_by_user(user_id, db).await?;
        let index = Arc::new(Bm25Index::build(current_version, chunks));

        let mut snapshot = entry
            .snapshot
            .write()
            .map_err(|_| AppError::InternalError("lexical snapshot lock poisoned".into()))?;
        *snapshot = Some(index.clone());

        Ok(index)
    }

    /// Top-k BM25 search against the freshest available snapshot.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<(Chunk, f32)>, AppError> {
        let index = self.snapshot(user_id, db).await?;
        Ok(index.search(query, k))
    }
}
