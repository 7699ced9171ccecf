//! Offline evaluation against labeled notes.
//!
//! Cases are JSON Lines, one `{"note": "...", "codes": ["I21.01", ...]}` per
//! line. Gold and predicted codes are compared in canonical form.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::canonical_code;
use crate::consensus::Method;
use crate::error::{ConfigError, ConfigResult, MedcodeResult};
use crate::pipeline::CodingPipeline;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalCase {
    pub note: String,
    pub codes: Vec<String>,
}

/// Mean metrics over a case set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub method: Method,
    pub k: usize,
    pub cases: usize,
    /// Cases the admission gate rejected; they score zero.
    pub blocked: usize,
    pub top1_accuracy: f64,
    pub top_k_accuracy: f64,
    pub precision_at_k: f64,
    pub recall_at_k: f64,
    pub f1_at_k: f64,
    pub mrr: f64,
    pub coverage: f64,
    pub mean_latency_ms: f64,
}

// ── Metrics ─────────────────────────────────────────────────────────────

/// Fraction of gold codes found in the first `k` predictions.
pub fn top_k_accuracy(predicted: &[String], gold: &[String], k: usize) -> f64 {
    recall_at_k(predicted, gold, k)
}

pub fn precision_at_k(predicted: &[String], gold: &[String], k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    let hits = predicted.iter().take(k).filter(|p| gold.contains(p)).count();
    hits as f64 / k as f64
}

pub fn recall_at_k(predicted: &[String], gold: &[String], k: usize) -> f64 {
    if gold.is_empty() {
        return 0.0;
    }
    let top: Vec<&String> = predicted.iter().take(k).collect();
    let hits = gold.iter().filter(|g| top.contains(g)).count();
    hits as f64 / gold.len() as f64
}

pub fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        return 0.0;
    }
    2.0 * precision * recall / (precision + recall)
}

/// 1 / rank of the first correct prediction, or 0.
pub fn reciprocal_rank(predicted: &[String], gold: &[String]) -> f64 {
    predicted
        .iter()
        .position(|p| gold.contains(p))
        .map_or(0.0, |i| 1.0 / (i + 1) as f64)
}

/// Fraction of cases with at least one correct prediction.
pub fn coverage(predicted: &[Vec<String>], gold: &[Vec<String>]) -> f64 {
    if predicted.is_empty() {
        return 0.0;
    }
    let covered = predicted
        .iter()
        .zip(gold)
        .filter(|(p, g)| p.iter().any(|code| g.contains(code)))
        .count();
    covered as f64 / predicted.len() as f64
}

// ── Runner ──────────────────────────────────────────────────────────────

pub fn load_cases(path: &Path) -> ConfigResult<Vec<EvalCase>> {
    if !path.exists() {
        return Err(ConfigError::MissingPath {
            path: path.to_path_buf(),
        });
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<EvalCase>(line).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: format!("line {}: {e}", i + 1),
            })
        })
        .collect()
}

/// Run every case through the pipeline and average the metrics.
pub fn evaluate(pipeline: &CodingPipeline, cases: &[EvalCase], method: Method, k: usize) -> MedcodeResult<EvaluationReport> {
    let mut report = EvaluationReport {
        method,
        k,
        cases: cases.len(),
        ..EvaluationReport::default()
    };
    if cases.is_empty() {
        return Ok(report);
    }

    let mut all_predicted = Vec::with_capacity(cases.len());
    let mut all_gold = Vec::with_capacity(cases.len());
    let mut latency_ms = 0.0;

    for case in cases {
        let response = pipeline.predict(&case.note, Some(k), method)?;
        if !response.safety.checks_passed {
            report.blocked += 1;
        }
        latency_ms += response.latency_ms as f64;

        let predicted: Vec<String> = response.predictions.into_iter().map(|p| p.code).collect();
        let gold: Vec<String> = case.codes.iter().map(|c| canonical_code(c)).collect();

        let precision = precision_at_k(&predicted, &gold, k);
        let recall = recall_at_k(&predicted, &gold, k);
        report.top1_accuracy += top_k_accuracy(&predicted, &gold, 1);
        report.top_k_accuracy += top_k_accuracy(&predicted, &gold, k);
        report.precision_at_k += precision;
        report.recall_at_k += recall;
        report.f1_at_k += f1(precision, recall);
        report.mrr += reciprocal_rank(&predicted, &gold);

        all_predicted.push(predicted);
        all_gold.push(gold);
    }

    let n = cases.len() as f64;
    report.top1_accuracy /= n;
    report.top_k_accuracy /= n;
    report.precision_at_k /= n;
    report.recall_at_k /= n;
    report.f1_at_k /= n;
    report.mrr /= n;
    report.coverage = coverage(&all_predicted, &all_gold);
    report.mean_latency_ms = latency_ms / n;

    tracing::info!(
        method = %method,
        cases = report.cases,
        mrr = report.mrr,
        recall_at_k = report.recall_at_k,
        "evaluation complete"
    );
    Ok(report)
}
