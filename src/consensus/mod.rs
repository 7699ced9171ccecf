//! Multi-source consensus over the candidate funnel.
//!
//! The [`ConsensusCoordinator`] is the single entry point for every ranking
//! method. It owns handles to the retriever, the reranker and the direct
//! classifier, all injected at construction, and never holds per-request
//! state. In `ensemble` mode the classifier and reranker run on bounded
//! worker threads; a source that fails or overruns its deadline is reported
//! in [`ConsensusResult::degraded`] and simply casts no vote.

mod bounded;
mod vote;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub use vote::{Ballot, ConsensusEntry, weighted_vote};

use crate::candidate::{ScoreScale, ScoredCandidate, Source};
use crate::classify::ClassifierSource;
use crate::config::{EnsembleConfig, FunnelConfig};
use crate::error::{MedcodeResult, ServiceError, ValidationError};
use crate::rerank::Reranker;
use crate::retrieve::CandidateRetriever;

/// How the final ranking is produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Similarity search only.
    Retrieval,
    /// Direct multi-label classifier only.
    Classifier,
    /// Broad retrieval, then relevance reranking.
    #[serde(alias = "llm")]
    Rerank,
    /// Weighted vote over retrieval, classifier and reranker.
    #[default]
    Ensemble,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retrieval => "retrieval",
            Self::Classifier => "classifier",
            Self::Rerank => "rerank",
            Self::Ensemble => "ensemble",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retrieval" => Ok(Self::Retrieval),
            "classifier" => Ok(Self::Classifier),
            "rerank" | "llm" => Ok(Self::Rerank),
            "ensemble" => Ok(Self::Ensemble),
            _ => Err(ValidationError::UnknownMethod {
                method: s.to_string(),
            }),
        }
    }
}

/// A source left out of the computation, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: Source,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTiming {
    pub source: Source,
    pub elapsed_ms: u64,
}

/// Final ranking for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub method: Method,
    /// At most `top_k` entries, scores in [0, 1], best first.
    pub ranked: Vec<ConsensusEntry>,
    /// Sources whose output contributed to `ranked`.
    pub sources_used: Vec<Source>,
    pub degraded: Vec<SourceFailure>,
    pub timings: Vec<SourceTiming>,
}

impl ConsensusResult {
    /// The ranking as consensus-tagged candidates.
    pub fn as_candidates(&self) -> Vec<ScoredCandidate> {
        self.ranked
            .iter()
            .map(|e| {
                let c = ScoredCandidate::new(e.code.clone(), e.score, Source::Consensus);
                match &e.explanation {
                    Some(text) => c.with_explanation(text.clone()),
                    None => c,
                }
            })
            .collect()
    }

    pub fn codes(&self) -> Vec<String> {
        self.ranked.iter().map(|e| e.code.clone()).collect()
    }
}

/// Request-scoped bookkeeping.
#[derive(Default)]
struct Trace {
    sources_used: Vec<Source>,
    degraded: Vec<SourceFailure>,
    timings: Vec<SourceTiming>,
}

impl Trace {
    fn time(&mut self, source: Source, elapsed: Duration) {
        self.timings.push(SourceTiming {
            source,
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    fn degrade(&mut self, source: Source, error: &ServiceError) {
        tracing::warn!(source = %source, error = %error, "source excluded from this request");
        self.degraded.push(SourceFailure {
            source,
            reason: error.to_string(),
        });
    }

    fn finish(self, method: Method, ranked: Vec<ConsensusEntry>) -> ConsensusResult {
        ConsensusResult {
            method,
            ranked,
            sources_used: self.sources_used,
            degraded: self.degraded,
            timings: self.timings,
        }
    }
}

pub struct ConsensusCoordinator {
    retriever: Arc<CandidateRetriever>,
    reranker: Arc<Reranker>,
    classifier: ClassifierSource,
    funnel: FunnelConfig,
    ensemble: EnsembleConfig,
}

impl ConsensusCoordinator {
    pub fn new(
        retriever: Arc<CandidateRetriever>,
        reranker: Arc<Reranker>,
        classifier: ClassifierSource,
        funnel: FunnelConfig,
        ensemble: EnsembleConfig,
    ) -> Self {
        Self {
            retriever,
            reranker,
            classifier,
            funnel,
            ensemble,
        }
    }

    pub fn retriever(&self) -> &Arc<CandidateRetriever> {
        &self.retriever
    }

    pub fn funnel(&self) -> &FunnelConfig {
        &self.funnel
    }

    /// Rank codes for `query` with `method`.
    ///
    /// Fails with a validation error when `top_k` is outside
    /// `1..=max_top_k`, and with a service error when the primary source of
    /// the method (retrieval, or the classifier in `classifier` mode) fails.
    /// Secondary sources degrade instead of failing.
    pub fn predict(&self, query: &str, method: Method, top_k: usize) -> MedcodeResult<ConsensusResult> {
        if top_k == 0 || top_k > self.funnel.max_top_k {
            return Err(ValidationError::OutOfRange {
                name: "top_k",
                value: top_k,
                max: self.funnel.max_top_k,
            }
            .into());
        }

        let start = Instant::now();
        let result = match method {
            Method::Retrieval => self.by_retrieval(query, top_k)?,
            Method::Classifier => self.by_classifier(query, top_k)?,
            Method::Rerank => self.by_rerank(query, top_k)?,
            Method::Ensemble => self.by_ensemble(query, top_k)?,
        };
        tracing::info!(
            method = %method,
            ranked = result.ranked.len(),
            degraded = result.degraded.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "consensus"
        );
        Ok(result)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.ensemble.source_timeout_ms)
    }

    fn embed_and_search(&self, query: &str, top_n: usize, trace: &mut Trace) -> MedcodeResult<(Vec<f32>, Vec<ScoredCandidate>)> {
        let start = Instant::now();
        let embedding = self.retriever.embed_query(query)?;
        let candidates = self.retriever.search(&embedding, top_n)?;
        trace.time(Source::Retrieval, start.elapsed());
        Ok((embedding, candidates))
    }

    // ── Single-source methods ───────────────────────────────────────────

    fn by_retrieval(&self, query: &str, top_k: usize) -> MedcodeResult<ConsensusResult> {
        let mut trace = Trace::default();
        let (_, candidates) = self.embed_and_search(query, top_k, &mut trace)?;
        trace.sources_used.push(Source::Retrieval);
        Ok(trace.finish(Method::Retrieval, single_source(&candidates, ScoreScale::Cosine)))
    }

    fn by_classifier(&self, query: &str, top_k: usize) -> MedcodeResult<ConsensusResult> {
        let mut trace = Trace::default();
        let embedding = self.retriever.embed_query(query)?;

        let classifier = self.classifier.clone();
        let pending = bounded::spawn(Source::Classifier, self.timeout(), move || {
            classifier.predict(&embedding, top_k)
        });
        let (outcome, elapsed) = pending.wait();
        trace.time(Source::Classifier, elapsed);
        let labels = outcome?;

        trace.sources_used.push(Source::Classifier);
        Ok(trace.finish(Method::Classifier, single_source(&labels, ScoreScale::Unit)))
    }

    /// Two-stage funnel: broad recall, then precision reranking.
    fn by_rerank(&self, query: &str, top_k: usize) -> MedcodeResult<ConsensusResult> {
        let mut trace = Trace::default();
        let pool = self.funnel.recall_pool.max(top_k);
        let (_, recalled) = self.embed_and_search(query, pool, &mut trace)?;
        trace.sources_used.push(Source::Retrieval);

        let reranker = Arc::clone(&self.reranker);
        let owned_query = query.to_string();
        let owned_pool = recalled.clone();
        let pending = bounded::spawn(Source::Reranker, self.timeout(), move || {
            Ok(reranker.rerank_reporting(&owned_query, &owned_pool, top_k))
        });
        let (outcome, elapsed) = pending.wait();
        trace.time(Source::Reranker, elapsed);

        let ranked = match outcome {
            Ok((ranked, None)) => ranked,
            Ok((ranked, Some(model_error))) => {
                trace.degrade(Source::Reranker, &model_error);
                ranked
            }
            Err(e) => {
                trace.degrade(Source::Reranker, &e);
                self.reranker.rerank_lexical(query, &recalled, top_k)
            }
        };
        trace.sources_used.push(Source::Reranker);
        Ok(trace.finish(Method::Rerank, single_source(&ranked, ScoreScale::Unit)))
    }

    // ── Ensemble ────────────────────────────────────────────────────────

    fn by_ensemble(&self, query: &str, top_k: usize) -> MedcodeResult<ConsensusResult> {
        let mut trace = Trace::default();
        let timeout = self.timeout();

        let retrieval_start = Instant::now();
        let embedding = self.retriever.embed_query(query)?;

        // The classifier only needs the embedding, so it overlaps the search.
        let classifier = self.classifier.clone();
        let classifier_top_n = self.funnel.classifier_top_n;
        let classifier_embedding = embedding.clone();
        let pending_classifier = bounded::spawn(Source::Classifier, timeout, move || {
            classifier.predict(&classifier_embedding, classifier_top_n)
        });

        let pool = self.retriever.search(&embedding, self.funnel.ensemble_pool.max(top_k))?;
        trace.time(Source::Retrieval, retrieval_start.elapsed());

        let reranker = Arc::clone(&self.reranker);
        let rerank_top_k = self.funnel.rerank_top_k;
        let owned_query = query.to_string();
        let owned_pool = pool.clone();
        let pending_reranker = bounded::spawn(Source::Reranker, timeout, move || {
            reranker.try_rerank(&owned_query, &owned_pool, rerank_top_k)
        });

        let retrieval_votes = &pool[..pool.len().min(self.funnel.retrieval_vote_depth)];
        let classifier_votes = self.collect(pending_classifier, &mut trace);
        let reranker_votes = self.collect(pending_reranker, &mut trace);

        let mut ballots = Vec::with_capacity(3);
        if let Some(votes) = &reranker_votes {
            ballots.push(Ballot {
                source: Source::Reranker,
                scale: ScoreScale::Unit,
                candidates: votes,
            });
        }
        if let Some(votes) = &classifier_votes {
            ballots.push(Ballot {
                source: Source::Classifier,
                scale: ScoreScale::Unit,
                candidates: votes,
            });
        }
        ballots.push(Ballot {
            source: Source::Retrieval,
            scale: ScoreScale::Cosine,
            candidates: retrieval_votes,
        });

        for ballot in &ballots {
            trace.sources_used.push(ballot.source);
        }
        trace.sources_used.sort();

        let mut ranked = weighted_vote(&self.ensemble.weights, &ballots);
        ranked.truncate(top_k);
        Ok(trace.finish(Method::Ensemble, ranked))
    }

    fn collect(&self, pending: bounded::Pending<Vec<ScoredCandidate>>, trace: &mut Trace) -> Option<Vec<ScoredCandidate>> {
        let source = pending.source();
        let (outcome, elapsed) = pending.wait();
        trace.time(source, elapsed);
        match outcome {
            Ok(votes) => Some(votes),
            Err(e) => {
                trace.degrade(source, &e);
                None
            }
        }
    }
}

impl fmt::Debug for ConsensusCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsensusCoordinator")
            .field("retriever", &self.retriever)
            .field("reranker", &self.reranker)
            .field("classifier", &self.classifier)
            .field("weights", &self.ensemble.weights)
            .finish()
    }
}

/// Wrap one source's already-sorted output as a ranking.
fn single_source(candidates: &[ScoredCandidate], scale: ScoreScale) -> Vec<ConsensusEntry> {
    candidates
        .iter()
        .map(|c| ConsensusEntry {
            code: c.code.clone(),
            score: scale.normalize(c.score),
            sources: vec![c.source],
            explanation: c.explanation.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogRow, CodeCatalog};
    use crate::classify::MultiLabelClassifier;
    use crate::config::IndexConfig;
    use crate::embed::HashingEmbedder;
    use crate::error::{MedcodeError, ServiceResult};
    use crate::rerank::{RelevanceBackend, RelevanceModel, Relevance, RerankDoc};

    fn catalog() -> Arc<CodeCatalog> {
        Arc::new(
            CodeCatalog::from_rows(vec![
                CatalogRow::new("A000", "Cholera due to Vibrio cholerae 01", "", "Infectious"),
                CatalogRow::new("I2101", "STEMI involving left main coronary artery", "", "Circulatory"),
                CatalogRow::new("J189", "Pneumonia, unspecified organism", "", "Respiratory"),
                CatalogRow::new("R079", "Chest pain, unspecified", "", "Symptoms"),
                CatalogRow::new("I10", "Essential (primary) hypertension", "", "Circulatory"),
            ])
            .unwrap(),
        )
    }

    fn retriever(catalog: Arc<CodeCatalog>) -> Arc<CandidateRetriever> {
        Arc::new(
            CandidateRetriever::build(catalog, Arc::new(HashingEmbedder::new(256)), &IndexConfig::default())
                .unwrap(),
        )
    }

    struct FixedLabels(Vec<(&'static str, f32)>);

    impl MultiLabelClassifier for FixedLabels {
        fn predict(&self, _embedding: &[f32]) -> ServiceResult<Vec<(String, f32)>> {
            Ok(self.0.iter().map(|(c, p)| (c.to_string(), *p)).collect())
        }
        fn name(&self) -> &str {
            "fixed"
        }
    }

    /// Scores I2101 at 0.95 and everything else at 0.1.
    struct FavorStemi;

    impl RelevanceModel for FavorStemi {
        fn score(&self, _query: &str, docs: &[RerankDoc<'_>]) -> ServiceResult<Vec<Relevance>> {
            Ok(docs
                .iter()
                .map(|d| Relevance {
                    score: if d.code == "I2101" { 0.95 } else { 0.1 },
                    reason: None,
                })
                .collect())
        }
        fn scale(&self) -> ScoreScale {
            ScoreScale::Unit
        }
        fn name(&self) -> &str {
            "favor-stemi"
        }
    }

    struct Slow;

    impl RelevanceModel for Slow {
        fn score(&self, _query: &str, _docs: &[RerankDoc<'_>]) -> ServiceResult<Vec<Relevance>> {
            std::thread::sleep(Duration::from_millis(500));
            Err(ServiceError::unavailable("slow", "gave up"))
        }
        fn scale(&self) -> ScoreScale {
            ScoreScale::Unit
        }
        fn name(&self) -> &str {
            "slow"
        }
    }

    fn coordinator(backend: RelevanceBackend, classifier: ClassifierSource, timeout_ms: u64) -> ConsensusCoordinator {
        let catalog = catalog();
        ConsensusCoordinator::new(
            retriever(Arc::clone(&catalog)),
            Arc::new(Reranker::new(catalog, backend)),
            classifier,
            FunnelConfig::default(),
            EnsembleConfig {
                source_timeout_ms: timeout_ms,
                ..EnsembleConfig::default()
            },
        )
    }

    #[test]
    fn method_parses_with_llm_alias() {
        assert_eq!("llm".parse::<Method>().unwrap(), Method::Rerank);
        assert_eq!("Ensemble".parse::<Method>().unwrap(), Method::Ensemble);
        assert!(matches!(
            "vote".parse::<Method>(),
            Err(ValidationError::UnknownMethod { .. })
        ));
        let m: Method = serde_json::from_str("\"llm\"").unwrap();
        assert_eq!(m, Method::Rerank);
    }

    #[test]
    fn top_k_out_of_range_is_rejected() {
        let c = coordinator(RelevanceBackend::Offline, ClassifierSource::Offline, 1_000);
        for k in [0, 51] {
            let err = c.predict("chest pain", Method::Retrieval, k).unwrap_err();
            assert!(matches!(err, MedcodeError::Validation(_)));
        }
    }

    #[test]
    fn retrieval_mode_ranks_stemi_above_cholera() {
        let c = coordinator(RelevanceBackend::Offline, ClassifierSource::Offline, 1_000);
        let result = c.predict("chest pain with ST elevation", Method::Retrieval, 5).unwrap();
        let pos = |code: &str| result.ranked.iter().position(|e| e.code == code);
        let stemi = pos("I2101").unwrap();
        if let Some(cholera) = pos("A000") {
            assert!(stemi < cholera);
        }
        assert_eq!(result.sources_used, vec![Source::Retrieval]);
        assert!(result.ranked.iter().all(|e| (0.0..=1.0).contains(&e.score)));
    }

    #[test]
    fn classifier_mode_requires_a_classifier() {
        let c = coordinator(RelevanceBackend::Offline, ClassifierSource::Offline, 1_000);
        let err = c.predict("chest pain", Method::Classifier, 5).unwrap_err();
        assert!(matches!(err, MedcodeError::Service(_)));
    }

    #[test]
    fn classifier_mode_sorts_by_probability() {
        let classifier = ClassifierSource::service(
            Arc::new(FixedLabels(vec![("I10", 0.4), ("I2101", 0.9), ("A000", 0.1)])),
            0.3,
        );
        let c = coordinator(RelevanceBackend::Offline, classifier, 1_000);
        let result = c.predict("chest pain", Method::Classifier, 5).unwrap();
        assert_eq!(result.codes(), vec!["I2101", "I10"]);
    }

    #[test]
    fn rerank_mode_uses_the_lexical_fallback_offline() {
        let c = coordinator(RelevanceBackend::Offline, ClassifierSource::Offline, 1_000);
        let result = c
            .predict("ST elevation myocardial infarction", Method::Rerank, 3)
            .unwrap();
        assert_eq!(result.ranked[0].code, "I2101");
        assert!(result.ranked.len() <= 3);
        assert!(result.degraded.is_empty());
        assert_eq!(result.sources_used, vec![Source::Retrieval, Source::Reranker]);
    }

    #[test]
    fn ensemble_rewards_agreement() {
        let classifier = ClassifierSource::service(Arc::new(FixedLabels(vec![("I2101", 0.9)])), 0.3);
        let c = coordinator(RelevanceBackend::Service(Arc::new(FavorStemi)), classifier, 5_000);
        let result = c.predict("chest pain with ST elevation", Method::Ensemble, 5).unwrap();

        let top = &result.ranked[0];
        assert_eq!(top.code, "I2101");
        assert!(top.sources.len() >= 2);
        for entry in &result.ranked[1..] {
            if entry.sources.len() == 1 {
                assert!(entry.score < top.score);
            }
        }
        assert!(result.degraded.is_empty());
        assert_eq!(
            result.sources_used,
            vec![Source::Retrieval, Source::Classifier, Source::Reranker]
        );
    }

    #[test]
    fn ensemble_degrades_without_a_reranker() {
        let classifier = ClassifierSource::service(Arc::new(FixedLabels(vec![("I2101", 0.9)])), 0.3);
        let c = coordinator(RelevanceBackend::Offline, classifier, 5_000);
        let result = c.predict("chest pain with ST elevation", Method::Ensemble, 5).unwrap();

        assert!(!result.ranked.is_empty());
        assert!(!result.sources_used.contains(&Source::Reranker));
        assert_eq!(result.degraded.len(), 1);
        assert_eq!(result.degraded[0].source, Source::Reranker);
        assert!(result.ranked.iter().all(|e| !e.sources.contains(&Source::Reranker)));
    }

    #[test]
    fn slow_reranker_times_out_and_is_excluded() {
        let c = coordinator(RelevanceBackend::Service(Arc::new(Slow)), ClassifierSource::Offline, 50);
        let started = Instant::now();
        let result = c.predict("chest pain", Method::Ensemble, 5).unwrap();
        assert!(started.elapsed() < Duration::from_millis(450));
        assert_eq!(result.sources_used, vec![Source::Retrieval]);
        let degraded: Vec<_> = result.degraded.iter().map(|f| f.source).collect();
        assert!(degraded.contains(&Source::Reranker));
        assert!(degraded.contains(&Source::Classifier));
    }

    #[test]
    fn rerank_mode_falls_back_to_lexical_on_timeout() {
        let c = coordinator(RelevanceBackend::Service(Arc::new(Slow)), ClassifierSource::Offline, 50);
        let started = Instant::now();
        let result = c.predict("chest pain", Method::Rerank, 5).unwrap();
        assert!(started.elapsed() < Duration::from_millis(450));
        assert!(!result.ranked.is_empty());
        assert_eq!(result.ranked[0].code, "R079");
        assert_eq!(result.sources_used, vec![Source::Retrieval, Source::Reranker]);
        assert_eq!(result.degraded.len(), 1);
        assert_eq!(result.degraded[0].source, Source::Reranker);
    }

    #[test]
    fn candidates_are_tagged_as_consensus() {
        let c = coordinator(RelevanceBackend::Offline, ClassifierSource::Offline, 1_000);
        let result = c.predict("hypertension", Method::Retrieval, 3).unwrap();
        assert!(result.as_candidates().iter().all(|c| c.source == Source::Consensus));
    }
}
