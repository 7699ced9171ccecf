//! Relevance reranking of retrieved candidates.
//!
//! A [`Reranker`] re-scores each candidate against the query, ignoring its
//! input score, then sorts and truncates. The scoring backend is chosen at
//! construction: an external [`RelevanceModel`] or the offline
//! [`LexicalScorer`]. [`Reranker::rerank`] never fails; a model error falls
//! back to the lexical heuristic. [`Reranker::try_rerank`] reports the model
//! error instead, which is what the ensemble vote needs.

mod lexical;
mod llm;

use std::sync::Arc;

pub use lexical::LexicalScorer;
pub use llm::LlmRelevanceModel;

use crate::candidate::{ScoreScale, ScoredCandidate, Source, sort_by_score_desc};
use crate::catalog::{CatalogItem, CodeCatalog};
use crate::config::{RerankerBackend, RerankerConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::llm::OllamaClient;

/// Relevance of one document to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct Relevance {
    pub score: f32,
    pub reason: Option<String>,
}

/// A document handed to a relevance model.
#[derive(Debug, Clone, Copy)]
pub struct RerankDoc<'a> {
    pub code: &'a str,
    /// `None` when the code is not in the catalog.
    pub item: Option<&'a CatalogItem>,
}

/// External query–document relevance scorer.
pub trait RelevanceModel: Send + Sync {
    /// One [`Relevance`] per document, in document order.
    fn score(&self, query: &str, docs: &[RerankDoc<'_>]) -> ServiceResult<Vec<Relevance>>;

    /// Native range of the returned scores.
    fn scale(&self) -> ScoreScale;

    fn name(&self) -> &str;
}

/// Scoring backend, fixed at construction.
#[derive(Clone)]
pub enum RelevanceBackend {
    Service(Arc<dyn RelevanceModel>),
    Offline,
}

pub struct Reranker {
    catalog: Arc<CodeCatalog>,
    backend: RelevanceBackend,
    lexical: LexicalScorer,
}

impl Reranker {
    pub fn new(catalog: Arc<CodeCatalog>, backend: RelevanceBackend) -> Self {
        Self {
            catalog,
            backend,
            lexical: LexicalScorer::default(),
        }
    }

    pub fn offline(catalog: Arc<CodeCatalog>) -> Self {
        Self::new(catalog, RelevanceBackend::Offline)
    }

    pub fn from_config(catalog: Arc<CodeCatalog>, config: &RerankerConfig) -> Self {
        let backend = match config.backend {
            RerankerBackend::Lexical => RelevanceBackend::Offline,
            RerankerBackend::Ollama => {
                let client = OllamaClient::new(config.ollama.clone());
                if client.probe() {
                    RelevanceBackend::Service(Arc::new(LlmRelevanceModel::new(Arc::new(client))))
                } else {
                    tracing::warn!(
                        url = %config.ollama.base_url,
                        "ollama not reachable, reranking with the lexical fallback"
                    );
                    RelevanceBackend::Offline
                }
            }
        };
        Self::new(catalog, backend)
    }

    /// Whether an external model is configured.
    pub fn has_model(&self) -> bool {
        matches!(self.backend, RelevanceBackend::Service(_))
    }

    /// Re-score with the model, falling back to the lexical heuristic.
    pub fn rerank(&self, query: &str, candidates: &[ScoredCandidate], top_k: usize) -> Vec<ScoredCandidate> {
        self.rerank_reporting(query, candidates, top_k).0
    }

    /// Like [`rerank`](Self::rerank), also returning the model error that
    /// forced the fallback, if any.
    pub fn rerank_reporting(
        &self,
        query: &str,
        candidates: &[ScoredCandidate],
        top_k: usize,
    ) -> (Vec<ScoredCandidate>, Option<ServiceError>) {
        if candidates.is_empty() {
            return (Vec::new(), None);
        }
        if !self.has_model() {
            return (self.rerank_lexical(query, candidates, top_k), None);
        }
        match self.try_rerank(query, candidates, top_k) {
            Ok(ranked) => (ranked, None),
            Err(e) => {
                tracing::warn!(error = %e, "relevance model failed, using lexical reranking");
                (self.rerank_lexical(query, candidates, top_k), Some(e))
            }
        }
    }

    /// Re-score with the external model only.
    ///
    /// Fails with a service error when no model is configured or the model
    /// call fails.
    pub fn try_rerank(
        &self,
        query: &str,
        candidates: &[ScoredCandidate],
        top_k: usize,
    ) -> ServiceResult<Vec<ScoredCandidate>> {
        let model = match &self.backend {
            RelevanceBackend::Service(model) => model,
            RelevanceBackend::Offline => {
                return Err(ServiceError::unavailable(
                    "reranker",
                    "no relevance model configured",
                ));
            }
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let docs: Vec<RerankDoc<'_>> = candidates
            .iter()
            .map(|c| RerankDoc {
                code: &c.code,
                item: self.catalog.get(&c.code),
            })
            .collect();
        let relevances = model.score(query, &docs)?;
        if relevances.len() != docs.len() {
            return Err(ServiceError::malformed(
                model.name(),
                format!("expected {} scores, got {}", docs.len(), relevances.len()),
            ));
        }

        let scale = model.scale();
        let mut ranked: Vec<ScoredCandidate> = candidates
            .iter()
            .zip(relevances)
            .map(|(c, r)| {
                let scored = ScoredCandidate::new(c.code.clone(), scale.normalize(r.score), Source::Reranker);
                match r.reason {
                    Some(reason) => scored.with_explanation(reason),
                    None => scored,
                }
            })
            .collect();
        sort_by_score_desc(&mut ranked);
        ranked.truncate(top_k);
        tracing::debug!(model = model.name(), kept = ranked.len(), "model rerank");
        Ok(ranked)
    }

    /// Re-score with the token-overlap heuristic.
    pub fn rerank_lexical(&self, query: &str, candidates: &[ScoredCandidate], top_k: usize) -> Vec<ScoredCandidate> {
        let query_tokens = crate::text::token_set(query);
        let mut ranked: Vec<ScoredCandidate> = candidates
            .iter()
            .map(|c| match self.catalog.get(&c.code) {
                Some(item) => {
                    let m = self.lexical.score(&query_tokens, item);
                    let scored = ScoredCandidate::new(c.code.clone(), m.score, Source::Reranker);
                    if m.matched.is_empty() {
                        scored
                    } else {
                        scored.with_explanation(format!("matched: {}", m.matched.join(", ")))
                    }
                }
                None => ScoredCandidate::new(c.code.clone(), 0.0, Source::Reranker),
            })
            .collect();
        sort_by_score_desc(&mut ranked);
        ranked.truncate(top_k);
        ranked
    }
}

impl std::fmt::Debug for Reranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.backend {
            RelevanceBackend::Service(m) => m.name().to_string(),
            RelevanceBackend::Offline => "offline".to_string(),
        };
        f.debug_struct("Reranker").field("backend", &backend).finish()
    }
}
