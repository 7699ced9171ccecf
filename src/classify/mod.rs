//! Direct multi-label classification source.
//!
//! The classifier maps a query embedding straight to `(code, probability)`
//! pairs. It is an external service; without one configured the source is
//! [`ClassifierSource::Offline`] and reports itself unavailable, which the
//! ensemble treats like any other outage.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::candidate::{ScoreScale, ScoredCandidate, Source};
use crate::catalog::canonical_code;
use crate::config::{ClassifierBackend, ClassifierConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::llm::map_transport_error;

/// External multi-label scorer over query embeddings.
pub trait MultiLabelClassifier: Send + Sync {
    /// Probabilities in [0, 1], in no particular order.
    fn predict(&self, embedding: &[f32]) -> ServiceResult<Vec<(String, f32)>>;

    fn name(&self) -> &str;
}

/// Classifier backend, fixed at construction.
#[derive(Clone)]
pub enum ClassifierSource {
    Service {
        classifier: Arc<dyn MultiLabelClassifier>,
        threshold: f32,
    },
    Offline,
}

impl ClassifierSource {
    pub fn service(classifier: Arc<dyn MultiLabelClassifier>, threshold: f32) -> Self {
        Self::Service {
            classifier,
            threshold,
        }
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        match config.backend {
            ClassifierBackend::Disabled => Self::Offline,
            ClassifierBackend::Http => Self::service(
                Arc::new(HttpClassifier::new(&config.url, config.timeout_ms)),
                config.threshold,
            ),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Service { .. })
    }

    /// Labels at or above the threshold, most probable first, at most `top_n`.
    ///
    /// Ties break by code so the order does not depend on the service's
    /// output order.
    pub fn predict(&self, embedding: &[f32], top_n: usize) -> ServiceResult<Vec<ScoredCandidate>> {
        let (classifier, threshold) = match self {
            Self::Service {
                classifier,
                threshold,
            } => (classifier, *threshold),
            Self::Offline => {
                return Err(ServiceError::unavailable(
                    "classifier",
                    "no classifier configured",
                ));
            }
        };

        let mut labels: Vec<ScoredCandidate> = classifier
            .predict(embedding)?
            .into_iter()
            .map(|(code, p)| {
                ScoredCandidate::new(canonical_code(&code), ScoreScale::Unit.normalize(p), Source::Classifier)
            })
            .filter(|c| !c.code.is_empty() && c.score >= threshold)
            .collect();
        labels.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.code.cmp(&b.code))
        });
        let mut seen = HashSet::new();
        labels.retain(|c| seen.insert(c.code.clone()));
        labels.truncate(top_n);
        tracing::debug!(classifier = classifier.name(), labels = labels.len(), "classifier predict");
        Ok(labels)
    }
}

impl std::fmt::Debug for ClassifierSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service {
                classifier,
                threshold,
            } => f
                .debug_struct("ClassifierSource::Service")
                .field("classifier", &classifier.name())
                .field("threshold", threshold)
                .finish(),
            Self::Offline => f.write_str("ClassifierSource::Offline"),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP classifier
// ---------------------------------------------------------------------------

/// JSON-over-HTTP inference endpoint.
///
/// Request: `{"embedding": [f32...]}`.
/// Response: `{"predictions": [{"code": "I2101", "probability": 0.91}, ...]}`.
pub struct HttpClassifier {
    url: String,
    timeout_ms: u64,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct PredictResponse {
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
struct Prediction {
    code: String,
    probability: f32,
}

impl HttpClassifier {
    pub fn new(url: &str, timeout_ms: u64) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(timeout_ms))
            .build();
        Self {
            url: url.to_string(),
            timeout_ms,
            agent,
        }
    }
}

impl MultiLabelClassifier for HttpClassifier {
    fn predict(&self, embedding: &[f32]) -> ServiceResult<Vec<(String, f32)>> {
        let body = serde_json::json!({ "embedding": embedding });
        let body_str = serde_json::to_string(&body)
            .map_err(|e| ServiceError::malformed("classifier", format!("JSON serialize error: {e}")))?;

        let resp = self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_string(&body_str)
            .map_err(|e: ureq::Error| map_transport_error("classifier", self.timeout_ms, e))?;
        let resp_str = resp
            .into_string()
            .map_err(|e| ServiceError::malformed("classifier", e.to_string()))?;
        let parsed: PredictResponse = serde_json::from_str(&resp_str)
            .map_err(|e| ServiceError::malformed("classifier", e.to_string()))?;

        Ok(parsed
            .predictions
            .into_iter()
            .map(|p| (p.code, p.probability))
            .collect())
    }

    fn name(&self) -> &str {
        &self.url
    }
}
