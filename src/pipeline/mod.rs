//! End-to-end coding pipeline.
//!
//! admission → consensus → evidence → guardrails → grounding. The pipeline
//! holds only read-only shared handles, so one instance serves concurrent
//! requests; every intermediate value is request-local.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::admission::{AdmissionGate, DISCLAIMER, OpenGate, PhiScreen};
use crate::candidate::Source;
use crate::catalog::CodeCatalog;
use crate::classify::ClassifierSource;
use crate::config::{AdmissionConfig, FunnelConfig, PipelineConfig};
use crate::consensus::{ConsensusCoordinator, ConsensusEntry, ConsensusResult, Method, SourceFailure, SourceTiming};
use crate::embed;
use crate::error::{ConfigError, MedcodeError, MedcodeResult, ValidationError};
use crate::evidence::{EvidenceAssembler, EvidenceItem};
use crate::grounding::{Grounding, GroundingFormatter, OFFLINE_MODEL};
use crate::guardrails::{GuardrailsEngine, GuardrailsResult, PolicyViolation};
use crate::rerank::Reranker;
use crate::retrieve::CandidateRetriever;

// ── Response ────────────────────────────────────────────────────────────

/// One recommended code with its evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub code: String,
    pub title: String,
    pub description: String,
    pub category: String,
    /// Consensus score in [0, 1].
    pub score: f32,
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub note_spans: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Safety {
    /// False when the admission gate rejected the note.
    pub checks_passed: bool,
    /// False when guardrails found an error or critical violation.
    pub is_safe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub disclaimer: String,
}

/// Wall time per stage, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub admission: u64,
    pub consensus: u64,
    pub evidence: u64,
    pub guardrails: u64,
    pub grounding: u64,
    pub total: u64,
    /// Per-source times inside the consensus stage.
    pub sources: Vec<SourceTiming>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResponse {
    pub query: String,
    pub method: Method,
    pub predictions: Vec<Prediction>,
    /// 0 to 100.
    pub confidence: u8,
    pub explanation: String,
    pub model_used: String,
    pub safety: Safety,
    pub warnings: Vec<String>,
    pub violations: Vec<PolicyViolation>,
    pub sources_used: Vec<Source>,
    pub degraded: Vec<SourceFailure>,
    pub timings: StageTimings,
    pub latency_ms: u64,
}

impl FinalResponse {
    fn empty(query: &str, method: Method, checks_passed: bool, reason: String, timings: StageTimings) -> Self {
        Self {
            query: query.to_string(),
            method,
            predictions: Vec::new(),
            confidence: 0,
            explanation: reason.clone(),
            model_used: OFFLINE_MODEL.to_string(),
            safety: Safety {
                checks_passed,
                is_safe: false,
                reason: Some(reason),
                disclaimer: DISCLAIMER.to_string(),
            },
            warnings: Vec::new(),
            violations: Vec::new(),
            sources_used: Vec::new(),
            degraded: Vec::new(),
            latency_ms: timings.total,
            timings,
        }
    }

    pub fn codes(&self) -> Vec<&str> {
        self.predictions.iter().map(|p| p.code.as_str()).collect()
    }
}

// ── Pipeline ────────────────────────────────────────────────────────────

/// Collaborators of a [`CodingPipeline`], for explicit wiring.
pub struct PipelineParts {
    pub catalog: Arc<CodeCatalog>,
    pub consensus: ConsensusCoordinator,
    pub guardrails: GuardrailsEngine,
    pub grounding: GroundingFormatter,
    pub admission: Arc<dyn AdmissionGate>,
}

pub struct CodingPipeline {
    catalog: Arc<CodeCatalog>,
    admission: Arc<dyn AdmissionGate>,
    consensus: ConsensusCoordinator,
    evidence: EvidenceAssembler,
    guardrails: GuardrailsEngine,
    grounding: GroundingFormatter,
}

impl CodingPipeline {
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            evidence: EvidenceAssembler::new(Arc::clone(&parts.catalog)),
            catalog: parts.catalog,
            admission: parts.admission,
            consensus: parts.consensus,
            guardrails: parts.guardrails,
            grounding: parts.grounding,
        }
    }

    /// Build every component from configuration.
    ///
    /// `catalog` overrides `config.catalog.path`. All failures here are
    /// configuration errors: the process should not start.
    pub fn from_config(config: &PipelineConfig, catalog: Option<Arc<CodeCatalog>>) -> MedcodeResult<Self> {
        config.validate()?;
        let start = Instant::now();

        let catalog = match catalog {
            Some(catalog) => catalog,
            None => {
                let path = config.catalog.path.as_deref().ok_or_else(|| ConfigError::Invalid {
                    message: "catalog.path is not set and no catalog was given".into(),
                })?;
                Arc::new(CodeCatalog::load(path)?)
            }
        };

        let embedder = embed::from_config(&config.embedding).map_err(|e| ConfigError::IndexBuild {
            message: e.to_string(),
        })?;
        let retriever = CandidateRetriever::build(Arc::clone(&catalog), embedder, &config.index)?;
        let reranker = Reranker::from_config(Arc::clone(&catalog), &config.reranker);
        let consensus = ConsensusCoordinator::new(
            Arc::new(retriever),
            Arc::new(reranker),
            ClassifierSource::from_config(&config.classifier),
            config.funnel.clone(),
            config.ensemble.clone(),
        );

        let pipeline = Self::new(PipelineParts {
            catalog,
            consensus,
            guardrails: GuardrailsEngine::new(&config.guardrails),
            grounding: GroundingFormatter::from_config(&config.llm),
            admission: admission_gate(&config.admission),
        });
        tracing::info!(
            codes = pipeline.catalog.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "coding pipeline ready"
        );
        Ok(pipeline)
    }

    /// Load configuration from a TOML file and build.
    pub fn open(config_path: &Path) -> MedcodeResult<Self> {
        let config = PipelineConfig::load(config_path)?;
        Self::from_config(&config, None)
    }

    pub fn catalog(&self) -> &Arc<CodeCatalog> {
        &self.catalog
    }

    pub fn funnel(&self) -> &FunnelConfig {
        self.consensus.funnel()
    }

    /// Recommend codes for a clinical note.
    ///
    /// Fails only on invalid input. A rejected note and a failed primary
    /// source both produce a response with no predictions and a reason.
    pub fn predict(&self, query: &str, top_k: Option<usize>, method: Method) -> MedcodeResult<FinalResponse> {
        let started = Instant::now();
        if query.trim().is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }
        let funnel = self.consensus.funnel();
        let top_k = top_k.unwrap_or(funnel.default_top_k);
        if top_k == 0 || top_k > funnel.max_top_k {
            return Err(ValidationError::OutOfRange {
                name: "top_k",
                value: top_k,
                max: funnel.max_top_k,
            }
            .into());
        }

        let mut timings = StageTimings::default();

        let stage = Instant::now();
        let decision = self.admission.is_safe_note(query);
        timings.admission = elapsed_ms(stage);
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "Note rejected".to_string());
            tracing::info!(reason = %reason, "note blocked at admission");
            timings.total = elapsed_ms(started);
            return Ok(FinalResponse::empty(query, method, false, reason, timings));
        }

        let stage = Instant::now();
        let consensus = match self.consensus.predict(query, method, top_k) {
            Ok(result) => result,
            Err(MedcodeError::Service(e)) => {
                tracing::warn!(method = %method, error = %e, "primary source failed, no predictions");
                timings.consensus = elapsed_ms(stage);
                timings.total = elapsed_ms(started);
                let reason = format!("Primary {} source failed: {e}", primary_source(method));
                return Ok(FinalResponse::empty(query, method, true, reason, timings));
            }
            Err(e) => return Err(e),
        };
        timings.consensus = elapsed_ms(stage);
        timings.sources = consensus.timings.clone();

        let stage = Instant::now();
        let evidence = self.evidence.assemble(query, &consensus.as_candidates());
        timings.evidence = elapsed_ms(stage);

        let stage = Instant::now();
        let guardrails = self.check_evidence(query, &evidence);
        timings.guardrails = elapsed_ms(stage);

        let stage = Instant::now();
        let grounding = self.grounding.explain(query, &evidence, &guardrails);
        timings.grounding = elapsed_ms(stage);

        timings.total = elapsed_ms(started);
        let response = assemble_response(query, consensus, evidence, guardrails, grounding, timings);
        tracing::info!(
            method = %method,
            predictions = response.predictions.len(),
            confidence = response.confidence,
            is_safe = response.safety.is_safe,
            latency_ms = response.latency_ms,
            "prediction complete"
        );
        Ok(response)
    }

    /// Run the guardrails over arbitrary codes, using catalog titles where known.
    pub fn check_codes(&self, codes: &[String]) -> GuardrailsResult {
        let titles: Vec<String> = codes
            .iter()
            .map(|code| {
                self.catalog
                    .get(code)
                    .map(|item| item.title.clone())
                    .unwrap_or_default()
            })
            .collect();
        self.guardrails.check("", codes, &titles)
    }

    fn check_evidence(&self, query: &str, evidence: &[EvidenceItem]) -> GuardrailsResult {
        let codes: Vec<String> = evidence.iter().map(|e| e.code.clone()).collect();
        let titles: Vec<String> = evidence.iter().map(|e| e.title.clone()).collect();
        self.guardrails.check(query, &codes, &titles)
    }
}

impl std::fmt::Debug for CodingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodingPipeline")
            .field("codes", &self.catalog.len())
            .field("consensus", &self.consensus)
            .field("grounding", &self.grounding)
            .finish()
    }
}

fn admission_gate(config: &AdmissionConfig) -> Arc<dyn AdmissionGate> {
    if config.enabled {
        Arc::new(PhiScreen::new(config))
    } else {
        tracing::warn!("admission screening disabled");
        Arc::new(OpenGate)
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

fn primary_source(method: Method) -> Source {
    match method {
        Method::Classifier => Source::Classifier,
        Method::Retrieval | Method::Rerank | Method::Ensemble => Source::Retrieval,
    }
}

fn assemble_response(
    query: &str,
    consensus: ConsensusResult,
    evidence: Vec<EvidenceItem>,
    guardrails: GuardrailsResult,
    grounding: Grounding,
    timings: StageTimings,
) -> FinalResponse {
    let mut entries: HashMap<String, ConsensusEntry> = consensus
        .ranked
        .into_iter()
        .map(|e| (e.code.clone(), e))
        .collect();

    let predictions = evidence
        .into_iter()
        .map(|item| {
            let entry = entries.remove(&item.code);
            Prediction {
                score: item.relevance_score,
                sources: entry.as_ref().map(|e| e.sources.clone()).unwrap_or_default(),
                explanation: entry.and_then(|e| e.explanation),
                code: item.code,
                title: item.title,
                description: item.description,
                category: item.category,
                note_spans: item.note_spans,
            }
        })
        .collect();

    FinalResponse {
        query: query.to_string(),
        method: consensus.method,
        predictions,
        confidence: grounding.confidence,
        explanation: grounding.explanation,
        model_used: grounding.model_used,
        safety: Safety {
            checks_passed: true,
            is_safe: grounding.is_safe,
            reason: None,
            disclaimer: DISCLAIMER.to_string(),
        },
        warnings: grounding.warnings,
        violations: guardrails.violations,
        sources_used: consensus.sources_used,
        degraded: consensus.degraded,
        latency_ms: timings.total,
        timings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogRow;
    use crate::config::{EnsembleConfig, IndexConfig};
    use crate::embed::{Embedder, HashingEmbedder};
    use crate::error::{ServiceError, ServiceResult};

    const NOTE: &str = "Patient with crushing pain and acute ST elevation myocardial infarction";

    fn catalog() -> Arc<CodeCatalog> {
        Arc::new(
            CodeCatalog::from_rows(vec![
                CatalogRow::new("A000", "Cholera due to Vibrio cholerae 01", "", "Infectious"),
                CatalogRow::new("I2101", "STEMI involving left main coronary artery", "", "Circulatory"),
                CatalogRow::new("R079", "Chest pain, unspecified", "", "Symptoms"),
            ])
            .unwrap(),
        )
    }

    fn pipeline() -> CodingPipeline {
        CodingPipeline::from_config(&PipelineConfig::default(), Some(catalog())).unwrap()
    }

    #[test]
    fn predicts_with_default_config() {
        let response = pipeline().predict(NOTE, Some(3), Method::Rerank).unwrap();
        assert!(response.safety.checks_passed);
        assert_eq!(response.predictions[0].code, "I2101");
        assert!(response.predictions.len() <= 3);
        assert!((30..=90).contains(&response.confidence));
        assert_eq!(response.safety.disclaimer, DISCLAIMER);
        assert_eq!(response.model_used, OFFLINE_MODEL);
    }

    #[test]
    fn empty_query_is_a_validation_error() {
        let err = pipeline().predict("   ", None, Method::Ensemble).unwrap_err();
        assert!(matches!(err, MedcodeError::Validation(ValidationError::EmptyQuery)));
    }

    #[test]
    fn blocked_note_has_no_predictions() {
        let response = pipeline().predict("chest pain", None, Method::Ensemble).unwrap();
        assert!(!response.safety.checks_passed);
        assert!(response.predictions.is_empty());
        assert_eq!(response.safety.reason.as_deref(), Some("Note too short (<5 words)"));
    }

    #[test]
    fn disabled_admission_admits_short_notes() {
        let mut config = PipelineConfig::default();
        config.admission.enabled = false;
        let pipeline = CodingPipeline::from_config(&config, Some(catalog())).unwrap();
        let response = pipeline.predict("chest pain", Some(2), Method::Rerank).unwrap();
        assert!(response.safety.checks_passed);
        assert_eq!(response.predictions[0].code, "R079");
    }

    #[test]
    fn ensemble_reports_degraded_sources() {
        let response = pipeline().predict(NOTE, Some(5), Method::Ensemble).unwrap();
        assert!(!response.predictions.is_empty());
        assert_eq!(response.sources_used, vec![Source::Retrieval]);
        let degraded: Vec<_> = response.degraded.iter().map(|d| d.source).collect();
        assert_eq!(degraded, vec![Source::Classifier, Source::Reranker]);
    }

    struct Unreachable;

    impl Embedder for Unreachable {
        fn dimension(&self) -> usize {
            16
        }
        fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
            // Index the catalog, fail on notes.
            if text.contains("crushing") {
                Err(ServiceError::unavailable("embedder", "connection refused"))
            } else {
                HashingEmbedder::new(16).embed(text)
            }
        }
        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[test]
    fn retrieval_failure_yields_empty_predictions_with_reason() {
        let catalog = catalog();
        let retriever =
            CandidateRetriever::build(Arc::clone(&catalog), Arc::new(Unreachable), &IndexConfig::default()).unwrap();
        let pipeline = CodingPipeline::new(PipelineParts {
            consensus: ConsensusCoordinator::new(
                Arc::new(retriever),
                Arc::new(Reranker::offline(Arc::clone(&catalog))),
                ClassifierSource::Offline,
                FunnelConfig::default(),
                EnsembleConfig::default(),
            ),
            catalog,
            guardrails: GuardrailsEngine::default(),
            grounding: GroundingFormatter::offline(),
            admission: Arc::new(PhiScreen::default()),
        });
        let response = pipeline.predict(NOTE, None, Method::Retrieval).unwrap();
        assert!(response.predictions.is_empty());
        assert!(response.safety.checks_passed);
        assert!(response.safety.reason.unwrap().contains("retrieval"));
    }

    #[test]
    fn check_codes_looks_up_titles() {
        let result = pipeline().check_codes(&["R07.9".to_string()]);
        assert!(result.is_valid);
        assert!(result.violations.iter().any(|v| v.rule_id == "specificity_001"));
    }
}
