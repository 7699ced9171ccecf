//! Pipeline configuration, loaded from TOML.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working offline pipeline: hashing embeddings, exact search, lexical
//! reranking, no classifier and templated explanations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::candidate::Source;
use crate::error::{ConfigError, ConfigResult};
use crate::llm::OllamaConfig;

/// Top-level configuration for a [`CodingPipeline`](crate::pipeline::CodingPipeline).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub catalog: CatalogConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub funnel: FunnelConfig,
    pub ensemble: EnsembleConfig,
    pub classifier: ClassifierConfig,
    pub reranker: RerankerConfig,
    pub llm: LlmConfig,
    pub guardrails: GuardrailsConfig,
    pub admission: AdmissionConfig,
}

impl PipelineConfig {
    /// Load from a TOML file and validate it.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::MissingPath {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the funnel or the vote meaningless.
    pub fn validate(&self) -> ConfigResult<()> {
        let sizes = [
            ("funnel.default_top_k", self.funnel.default_top_k),
            ("funnel.recall_pool", self.funnel.recall_pool),
            ("funnel.rerank_top_k", self.funnel.rerank_top_k),
            ("funnel.ensemble_pool", self.funnel.ensemble_pool),
            ("funnel.classifier_top_n", self.funnel.classifier_top_n),
            ("funnel.retrieval_vote_depth", self.funnel.retrieval_vote_depth),
            ("funnel.max_top_k", self.funnel.max_top_k),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(invalid(format!("{name} must be at least 1")));
            }
        }

        if self.funnel.default_top_k > self.funnel.max_top_k {
            return Err(invalid(format!(
                "funnel.default_top_k ({}) exceeds funnel.max_top_k ({})",
                self.funnel.default_top_k, self.funnel.max_top_k
            )));
        }

        // The Ollama backend learns its width from the model.
        if self.embedding.backend == EmbeddingBackend::Hashing && self.embedding.dimension < 8 {
            return Err(invalid(format!(
                "embedding.dimension must be at least 8, got {}",
                self.embedding.dimension
            )));
        }

        let w = &self.ensemble.weights;
        for (name, value) in [
            ("reranker", w.reranker),
            ("classifier", w.classifier),
            ("retrieval", w.retrieval),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(format!(
                    "ensemble.weights.{name} must be a non-negative number, got {value}"
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.classifier.threshold) {
            return Err(invalid(format!(
                "classifier.threshold must lie in [0, 1], got {}",
                self.classifier.threshold
            )));
        }

        if self.ensemble.source_timeout_ms == 0 {
            return Err(invalid("ensemble.source_timeout_ms must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

// ── Catalog ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// JSON or JSON Lines catalog file.
    pub path: Option<PathBuf>,
}

// ── Embedding + index ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Deterministic feature hashing, no external service.
    #[default]
    Hashing,
    /// Ollama `/api/embeddings`.
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    /// Vector width for the hashing backend. Remote backends report their own.
    pub dimension: usize,
    pub ollama: OllamaConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Hashing,
            dimension: 384,
            ollama: OllamaConfig {
                model: "nomic-embed-text".into(),
                timeout_ms: 10_000,
                ..OllamaConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Exact cosine similarity over every catalog vector.
    #[default]
    Flat,
    /// Approximate search with HNSW, re-scored exactly.
    Hnsw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub kind: IndexKind,
    pub max_connections: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: IndexKind::Flat,
            max_connections: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

// ── Funnel sizes ────────────────────────────────────────────────────────

/// Candidate counts at each stage of the funnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FunnelConfig {
    /// Result count when a request does not name one.
    pub default_top_k: usize,
    /// Broad recall pool fed to the reranker in `rerank` mode.
    pub recall_pool: usize,
    /// Reranked candidates that cast a vote in `ensemble` mode.
    pub rerank_top_k: usize,
    /// Retrieval candidates fed to the reranker in `ensemble` mode.
    pub ensemble_pool: usize,
    /// Classifier labels considered in `ensemble` mode.
    pub classifier_top_n: usize,
    /// Retrieval candidates that cast a vote in `ensemble` mode.
    pub retrieval_vote_depth: usize,
    /// Largest `top_k` a caller may request.
    pub max_top_k: usize,
}

impl Default for FunnelConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            recall_pool: 50,
            rerank_top_k: 10,
            ensemble_pool: 20,
            classifier_top_n: 20,
            retrieval_vote_depth: 10,
            max_top_k: 50,
        }
    }
}

// ── Ensemble ────────────────────────────────────────────────────────────

/// Per-source vote weights.
///
/// A failed source's weight is omitted for that request, never redistributed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleWeights {
    pub reranker: f32,
    pub classifier: f32,
    pub retrieval: f32,
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self {
            reranker: 0.5,
            classifier: 0.3,
            retrieval: 0.2,
        }
    }
}

impl EnsembleWeights {
    pub fn weight(&self, source: Source) -> f32 {
        match source {
            Source::Reranker => self.reranker,
            Source::Classifier => self.classifier,
            Source::Retrieval => self.retrieval,
            Source::Consensus => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub weights: EnsembleWeights,
    /// Upper bound on each concurrent source in `ensemble` mode.
    pub source_timeout_ms: u64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            weights: EnsembleWeights::default(),
            source_timeout_ms: 5_000,
        }
    }
}

// ── Scoring services ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierBackend {
    /// No classifier; the source reports itself unavailable.
    #[default]
    Disabled,
    /// JSON-over-HTTP inference endpoint.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub backend: ClassifierBackend,
    pub url: String,
    /// Labels below this probability are discarded.
    pub threshold: f32,
    pub timeout_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            backend: ClassifierBackend::Disabled,
            url: "http://localhost:8500/predict".into(),
            threshold: 0.3,
            timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankerBackend {
    /// Token-overlap heuristic only.
    #[default]
    Lexical,
    /// LLM relevance scoring with the lexical heuristic as fallback.
    Ollama,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RerankerConfig {
    pub backend: RerankerBackend,
    pub ollama: OllamaConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// Templated explanations only.
    #[default]
    Offline,
    Ollama,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub ollama: OllamaConfig,
}

// ── Policy ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailsConfig {
    /// Maximum codes per category bucket (e.g. `"I00-I99" = 5`).
    /// Buckets without an entry are unlimited.
    pub max_codes_per_category: BTreeMap<String, usize>,
    /// Title markers that flag an unspecified code.
    pub specificity_markers: Vec<String>,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            max_codes_per_category: BTreeMap::from([
                ("A00-B99".to_string(), 3),
                ("I00-I99".to_string(), 5),
                ("J00-J99".to_string(), 4),
            ]),
            specificity_markers: vec![
                "unspecified".into(),
                "not otherwise specified".into(),
                "nos".into(),
                "nec".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Screen notes before coding. When false every note is admitted.
    pub enabled: bool,
    /// Notes with fewer words are rejected.
    pub min_words: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_words: 5,
        }
    }
}
