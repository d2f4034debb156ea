use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::debug;

use crate::error::AppError;

/// Texts handed to the embedder never exceed this many bytes.
pub const MAX_EMBED_BYTES: usize = 8 * 1024;

/// Prefix applied to chunk and query text before embedding. Queries use empty
/// title/section.
pub fn enrich_for_embedding(title: &str, section: &str, text: &str) -> String {
    format!("Document: {title} | Section: {section}\n\n{text}")
}

/// Truncates at a UTF-8 character boundary so oversized queries and chunks
/// stay valid strings.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Vector generation backend. `Hashed` produces deterministic vectors and
/// backs tests and offline runs.
pub enum EmbeddingProvider {
    OpenAi {
        client: Client<OpenAIConfig>,
        model: String,
        dimension: usize,
    },
    Hashed {
        dimension: usize,
    },
}

impl EmbeddingProvider {
    pub fn openai(client: Client<OpenAIConfig>, model: String, dimension: usize) -> Self {
        Self::OpenAi {
            client,
            model,
            dimension,
        }
    }

    pub fn hashed(dimension: usize) -> Self {
        Self::Hashed { dimension }
    }

    pub fn dimension(&self) -> usize {
        match self {
            Self::OpenAi { dimension, .. } | Self::Hashed { dimension } => *dimension,
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self {
            Self::OpenAi { .. } => "openai",
            Self::Hashed { .. } => "hashed",
        }
    }

    pub async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_batch(&[input.to_owned()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::LlmParsing("No embedding data received".into()))
    }

    /// Embeds a batch of texts; every input is truncated to the embed byte
    /// cap first. All vectors share the configured dimension.
    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let bounded: Vec<String> = inputs
            .iter()
            .map(|text| truncate_utf8(text, MAX_EMBED_BYTES).to_owned())
            .collect();

        match self {
            Self::OpenAi {
                client,
                model,
                dimension,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model)
                    .dimensions(*dimension as u32)
                    .input(bounded)
                    .build()?;

                let response = client.embeddings().create(request).await?;

                if response.data.len() != inputs.len() {
                    return Err(AppError::LlmParsing(format!(
                        "expected {} embeddings, received {}",
                        inputs.len(),
                        response.data.len()
                    )));
                }

                debug!(
                    count = response.data.len(),
                    dimensions = dimension,
                    "Embeddings created"
                );

                Ok(response.data.into_iter().map(|d| d.embedding).collect())
            }
            Self::Hashed { dimension } => Ok(bounded
                .iter()
                .map(|text| hashed_embedding(text, *dimension))
                .collect()),
        }
    }
}

/// Deterministic bag-of-tokens embedding: each token hashes into a bucket and
/// the vector is L2-normalised. Similar texts share buckets, which is enough
/// for retrieval-shaped tests.
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension.max(1)];

    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let mut hasher = DefaultHasher::new();
        token.to_lowercase().hash(&mut hasher);
        let bucket = (hasher.finish() as usize) % vector.len();
        vector[bucket] += 1.0;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }

    vector
}
