//! Scored candidates and the sources that produce them.
//!
//! Scores are source-local: a cosine similarity, a classifier probability and
//! a reranker relevance are not comparable until mapped through
//! [`ScoreScale::normalize`] into [0, 1].

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which component produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Retrieval,
    Classifier,
    Reranker,
    Consensus,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retrieval => "retrieval",
            Self::Classifier => "classifier",
            Self::Reranker => "reranker",
            Self::Consensus => "consensus",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retrieval" => Ok(Self::Retrieval),
            "classifier" => Ok(Self::Classifier),
            "reranker" => Ok(Self::Reranker),
            "consensus" => Ok(Self::Consensus),
            other => Err(format!("unknown source: {other}")),
        }
    }
}

/// A code proposed by one source, with a score on that source's scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub code: String,
    pub score: f32,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl ScoredCandidate {
    pub fn new(code: impl Into<String>, score: f32, source: Source) -> Self {
        Self {
            code: code.into(),
            score,
            source,
            explanation: None,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }
}

/// The native range of a source's scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreScale {
    /// Cosine similarity in [-1, 1]; negatives carry no support.
    Cosine,
    /// Already a probability or relevance in [0, 1].
    Unit,
}

impl ScoreScale {
    /// Map a raw score into [0, 1]. Non-finite scores map to 0.
    pub fn normalize(self, raw: f32) -> f32 {
        if !raw.is_finite() {
            return 0.0;
        }
        match self {
            Self::Cosine | Self::Unit => raw.clamp(0.0, 1.0),
        }
    }
}

/// Sort descending by score. The sort is stable, so ties keep input order.
pub fn sort_by_score_desc(candidates: &mut [ScoredCandidate]) {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}
