//! Text embedding backends.
//!
//! [`HashingEmbedder`] is the deterministic offline backend: signed feature
//! hashing of word tokens and character trigrams into a fixed-width vector.
//! [`OllamaEmbedder`] calls a local Ollama server. Both return L2-normalized
//! vectors, so cosine similarity is a plain dot product.

use std::sync::Arc;

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::llm::OllamaClient;
use crate::text;

/// Maps text to a dense vector.
pub trait Embedder: Send + Sync {
    /// Width of every returned vector.
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> ServiceResult<Vec<f32>>;

    /// Backend label for logs and responses.
    fn name(&self) -> &str;
}

/// Build the configured backend.
pub fn from_config(config: &EmbeddingConfig) -> ServiceResult<Arc<dyn Embedder>> {
    match config.backend {
        EmbeddingBackend::Hashing => Ok(Arc::new(HashingEmbedder::new(config.dimension))),
        EmbeddingBackend::Ollama => Ok(Arc::new(OllamaEmbedder::connect(OllamaClient::new(
            config.ollama.clone(),
        ))?)),
    }
}

// ---------------------------------------------------------------------------
// Hashing embedder
// ---------------------------------------------------------------------------

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.35;

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a(feature.as_bytes());
        let slot = (h % self.dimension as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text::tokenize(text) {
            self.add_feature(&mut vector, &format!("w:{token}"), WORD_WEIGHT);
            let padded: Vec<char> = format!("#{token}#").chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                self.add_feature(&mut vector, &format!("c:{gram}"), TRIGRAM_WEIGHT);
            }
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

/// 64-bit FNV-1a; stable across platforms and releases.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ---------------------------------------------------------------------------
// Ollama embedder
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct OllamaEmbedder {
    client: OllamaClient,
    dimension: usize,
}

impl OllamaEmbedder {
    /// Connect and learn the model's output width from a probe embedding.
    pub fn connect(client: OllamaClient) -> ServiceResult<Self> {
        let probe = client.embed("dimension probe")?;
        if probe.is_empty() {
            return Err(ServiceError::malformed("ollama", "empty embedding"));
        }
        tracing::info!(model = client.model(), dimension = probe.len(), "ollama embedder ready");
        Ok(Self {
            dimension: probe.len(),
            client,
        })
    }
}

impl Embedder for OllamaEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        let mut vector = self.client.embed(text)?;
        if vector.len() != self.dimension {
            return Err(ServiceError::malformed(
                "ollama",
                format!(
                    "embedding width changed: expected {}, got {}",
                    self.dimension,
                    vector.len()
                ),
            ));
        }
        l2_normalize(&mut vector);
        Ok(vector)
    }

    fn name(&self) -> &str {
        self.client.model()
    }
}

// ---------------------------------------------------------------------------
// Vector helpers
// ---------------------------------------------------------------------------

/// Scale to unit length in place. Zero vectors stay zero.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity; 0 when either vector has zero length.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        0.0
    } else {
        dot / (na * nb)
    }
}
