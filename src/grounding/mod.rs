//! Natural-language grounding of the final ranking.
//!
//! The formatter asks a text generator to explain the ranked evidence and
//! any guardrail warnings. Generation is optional: without a generator, or
//! when the call fails or returns nothing usable, a deterministic template
//! built from the evidence alone is used instead. Grounding never fails.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{LlmBackend, LlmConfig};
use crate::evidence::EvidenceItem;
use crate::guardrails::GuardrailsResult;
use crate::llm::{OllamaClient, TextGenerator, extract_json};

/// Label reported when the template produced the explanation.
pub const OFFLINE_MODEL: &str = "offline-template";

const SYSTEM_PROMPT: &str = "You are a medical coding expert assistant. \
Provide accurate, evidence-based ICD-10 coding recommendations and answer in JSON only.";

/// Codes cited by the explanation.
const CITED: usize = 3;

/// Deterministic confidence bounds, in percent.
const MIN_CONFIDENCE: f32 = 30.0;
const MAX_CONFIDENCE: f32 = 90.0;
const EMPTY_EVIDENCE_CONFIDENCE: u8 = 45;

/// Explanation of a ranked result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grounding {
    /// Cited codes, all present in the evidence.
    pub codes: Vec<String>,
    /// 0 to 100.
    pub confidence: u8,
    pub explanation: String,
    /// Mirrors `GuardrailsResult::is_valid`.
    pub is_safe: bool,
    pub warnings: Vec<String>,
    pub model_used: String,
}

/// Text generation backend, fixed at construction.
#[derive(Clone)]
pub enum GenerationBackend {
    Service(Arc<dyn TextGenerator>),
    Offline,
}

#[derive(Clone)]
pub struct GroundingFormatter {
    backend: GenerationBackend,
}

impl GroundingFormatter {
    pub fn new(backend: GenerationBackend) -> Self {
        Self { backend }
    }

    pub fn offline() -> Self {
        Self::new(GenerationBackend::Offline)
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        match config.backend {
            LlmBackend::Offline => Self::offline(),
            LlmBackend::Ollama => {
                let client = OllamaClient::new(config.ollama.clone());
                if client.probe() {
                    Self::new(GenerationBackend::Service(Arc::new(client)))
                } else {
                    tracing::warn!(url = %config.ollama.base_url, "ollama not reachable, using template explanations");
                    Self::offline()
                }
            }
        }
    }

    pub fn explain(&self, query: &str, evidence: &[EvidenceItem], guardrails: &GuardrailsResult) -> Grounding {
        let warnings = guardrails.warnings();
        let is_safe = guardrails.is_valid;

        if let GenerationBackend::Service(generator) = &self.backend {
            let prompt = build_prompt(query, evidence, &warnings);
            match generator.generate(&prompt, Some(SYSTEM_PROMPT)) {
                Ok(reply) => {
                    if let Some(parsed) = parse_reply(&reply, evidence) {
                        tracing::debug!(model = generator.model_name(), "grounded by model");
                        return Grounding {
                            codes: parsed.codes,
                            confidence: parsed.confidence.unwrap_or_else(|| deterministic_confidence(evidence)),
                            explanation: parsed.explanation,
                            is_safe,
                            warnings,
                            model_used: generator.model_name().to_string(),
                        };
                    }
                    tracing::warn!(model = generator.model_name(), "empty generation, using template");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "generation failed, using template");
                }
            }
        }

        Grounding {
            codes: top_evidence(evidence).iter().map(|e| e.code.clone()).collect(),
            confidence: deterministic_confidence(evidence),
            explanation: template(query, evidence, &warnings),
            is_safe,
            warnings,
            model_used: OFFLINE_MODEL.to_string(),
        }
    }
}

impl std::fmt::Debug for GroundingFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.backend {
            GenerationBackend::Service(g) => g.model_name().to_string(),
            GenerationBackend::Offline => OFFLINE_MODEL.to_string(),
        };
        f.debug_struct("GroundingFormatter").field("backend", &backend).finish()
    }
}

// ── Confidence ──────────────────────────────────────────────────────────

/// Up to three evidence items with the highest relevance, best first.
fn top_evidence(evidence: &[EvidenceItem]) -> Vec<&EvidenceItem> {
    let mut sorted: Vec<&EvidenceItem> = evidence.iter().collect();
    sorted.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(Ordering::Equal)
    });
    sorted.truncate(CITED);
    sorted
}

/// Monotone in the top relevance scores, bounded to [30, 90].
pub fn deterministic_confidence(evidence: &[EvidenceItem]) -> u8 {
    let top = top_evidence(evidence);
    if top.is_empty() {
        return EMPTY_EVIDENCE_CONFIDENCE;
    }
    let mean = top.iter().map(|e| e.relevance_score.max(0.0)).sum::<f32>() / top.len() as f32;
    (mean * 0.8 * 100.0).round().clamp(MIN_CONFIDENCE, MAX_CONFIDENCE) as u8
}

/// Model-reported confidence: fractions in [0, 1] are scaled to percent.
fn reported_confidence(raw: f64) -> Option<u8> {
    if !raw.is_finite() {
        return None;
    }
    let pct = if raw <= 1.0 { raw * 100.0 } else { raw };
    Some(pct.clamp(0.0, 100.0).round() as u8)
}

// ── Prompt and reply ────────────────────────────────────────────────────

fn build_prompt(query: &str, evidence: &[EvidenceItem], warnings: &[String]) -> String {
    let mut prompt = format!("PATIENT NOTE: {query}\n\nRETRIEVED CODES:\n");
    for (i, item) in evidence.iter().enumerate() {
        let _ = writeln!(prompt, "{}. {} - {}", i + 1, item.code, item.title);
        if !item.description.is_empty() && item.description != item.title {
            let _ = writeln!(prompt, "   Description: {}", item.description);
        }
        if !item.aliases.is_empty() {
            let aliases: Vec<&str> = item.aliases.iter().map(String::as_str).collect();
            let _ = writeln!(prompt, "   Also known as: {}", aliases.join(", "));
        }
    }
    if !warnings.is_empty() {
        prompt.push_str("\nCOMPLIANCE WARNINGS:\n");
        for w in warnings {
            let _ = writeln!(prompt, "- {w}");
        }
    }
    prompt.push_str(
        "\nUsing only the codes above: recommend the most relevant codes (at most 3), \
         explain why each matches the note, address any compliance warnings, and give an \
         overall confidence from 0 to 100.\n\
         Respond as JSON with keys: codes (list), explanations (object of code to text), \
         confidence (int), summary (string).",
    );
    prompt
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct GenerationReply {
    codes: Vec<String>,
    explanations: BTreeMap<String, String>,
    confidence: Option<f64>,
    summary: String,
}

struct ParsedReply {
    codes: Vec<String>,
    confidence: Option<u8>,
    explanation: String,
}

/// Interpret a generation. Non-JSON prose is kept as the explanation; an
/// empty reply yields `None`. Cited codes outside the evidence are dropped.
fn parse_reply(reply: &str, evidence: &[EvidenceItem]) -> Option<ParsedReply> {
    let structured = extract_json(reply, '{', '}')
        .and_then(|json| serde_json::from_str::<GenerationReply>(json).ok());

    let Some(data) = structured else {
        let prose = reply.trim();
        if prose.is_empty() {
            return None;
        }
        return Some(ParsedReply {
            codes: top_evidence(evidence).iter().map(|e| e.code.clone()).collect(),
            confidence: None,
            explanation: prose.to_string(),
        });
    };

    let known = |code: &str| {
        let code = crate::catalog::canonical_code(code);
        evidence.iter().find(|e| e.code == code).map(|e| e.code.clone())
    };
    let mut codes: Vec<String> = Vec::new();
    for code in data.codes.iter().filter_map(|c| known(c)) {
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    if codes.is_empty() {
        codes = top_evidence(evidence).iter().map(|e| e.code.clone()).collect();
    }

    let mut explanation = data.summary.trim().to_string();
    for code in &codes {
        let text = data
            .explanations
            .iter()
            .find(|(k, _)| crate::catalog::canonical_code(k) == *code)
            .map(|(_, v)| v.trim());
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            if !explanation.is_empty() {
                explanation.push('\n');
            }
            let _ = write!(explanation, "{code}: {text}");
        }
    }
    if explanation.is_empty() {
        return None;
    }

    Some(ParsedReply {
        codes,
        confidence: data.confidence.and_then(reported_confidence),
        explanation,
    })
}

// ── Template ────────────────────────────────────────────────────────────

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max).collect();
    cut.push_str("...");
    cut
}

/// Deterministic explanation built from the evidence alone.
fn template(query: &str, evidence: &[EvidenceItem], warnings: &[String]) -> String {
    let top = top_evidence(evidence);
    let mut out = format!(
        "Based on the clinical presentation: '{}'\n\n",
        truncate_chars(query.trim(), 80)
    );

    if top.is_empty() {
        out.push_str("No catalog codes matched this note closely enough to recommend.\n");
    } else {
        out.push_str("Recommended codes, most relevant first:\n\n");
        for (i, item) in top.iter().enumerate() {
            let rank = i + 1;
            let pct = (item.relevance_score * 100.0 * (1.0 - rank as f32 * 0.15)).clamp(30.0, 95.0) as u8;
            let _ = writeln!(out, "{rank}. {} - {} [{pct}% match]", item.code, item.title);
            if !item.description.is_empty() && item.description != item.title {
                let _ = writeln!(out, "   Description: {}", truncate_chars(&item.description, 250));
            }
            if !item.note_spans.is_empty() {
                let _ = writeln!(out, "   Supported by: {}", item.note_spans.join(", "));
            }
            let _ = writeln!(out, "   Relevance score: {:.3}", item.relevance_score);
        }
    }

    if !warnings.is_empty() {
        out.push_str("\nCompliance warnings:\n");
        for w in warnings {
            let _ = writeln!(out, "- {w}");
        }
    }
    let _ = write!(
        out,
        "\nOverall confidence: {}% (evidence-based template)",
        deterministic_confidence(evidence)
    );
    out
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::error::{ServiceError, ServiceResult};
    use crate::guardrails::GuardrailsEngine;

    fn item(code: &str, title: &str, score: f32) -> EvidenceItem {
        EvidenceItem {
            code: code.into(),
            title: title.into(),
            description: title.into(),
            category: String::new(),
            aliases: BTreeSet::new(),
            relevance_score: score,
            note_spans: Vec::new(),
        }
    }

    fn evidence() -> Vec<EvidenceItem> {
        vec![
            item("I2101", "STEMI involving left main coronary artery", 0.9),
            item("R079", "Chest pain, unspecified", 0.6),
            item("I10", "Essential (primary) hypertension", 0.3),
            item("A000", "Cholera due to Vibrio cholerae 01", 0.1),
        ]
    }

    fn clean() -> GuardrailsResult {
        GuardrailsEngine::default().check("q", &["I2101".into()], &["STEMI".into()])
    }

    struct Scripted(Result<&'static str, ()>);

    impl TextGenerator for Scripted {
        fn generate(&self, _prompt: &str, _system: Option<&str>) -> ServiceResult<String> {
            match self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(()) => Err(ServiceError::unavailable("llm", "connection refused")),
            }
        }
        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn with(reply: Result<&'static str, ()>) -> GroundingFormatter {
        GroundingFormatter::new(GenerationBackend::Service(Arc::new(Scripted(reply))))
    }

    #[test]
    fn deterministic_confidence_is_bounded() {
        // mean(0.9, 0.6, 0.3) * 0.8 = 0.48
        assert_eq!(deterministic_confidence(&evidence()), 48);
        assert_eq!(deterministic_confidence(&[item("A1", "x", 1.0)]), 80);
        assert_eq!(deterministic_confidence(&[item("A1", "x", 2.0)]), 90);
        assert_eq!(deterministic_confidence(&[item("A1", "x", 0.01)]), 30);
        assert_eq!(deterministic_confidence(&[]), 45);
    }

    #[test]
    fn confidence_is_monotone_in_relevance() {
        let mut last = 0;
        for s in [0.0, 0.2, 0.4, 0.6, 0.8, 1.0, 1.2] {
            let c = deterministic_confidence(&[item("A1", "x", s)]);
            assert!(c >= last);
            last = c;
        }
    }

    #[test]
    fn offline_uses_the_template() {
        let g = GroundingFormatter::offline().explain("crushing chest pain", &evidence(), &clean());
        assert_eq!(g.model_used, OFFLINE_MODEL);
        assert_eq!(g.codes, vec!["I2101", "R079", "I10"]);
        assert!(g.explanation.contains("I2101 - STEMI"));
        assert!(g.is_safe);
        assert!(g.warnings.is_empty());
        assert!((30..=90).contains(&g.confidence));
    }

    #[test]
    fn template_is_deterministic() {
        let f = GroundingFormatter::offline();
        assert_eq!(f.explain("q", &evidence(), &clean()), f.explain("q", &evidence(), &clean()));
    }

    #[test]
    fn unreachable_ollama_configures_the_template() {
        let config = LlmConfig {
            backend: LlmBackend::Ollama,
            ollama: crate::llm::OllamaConfig {
                base_url: "http://127.0.0.1:1".into(),
                timeout_ms: 500,
                ..Default::default()
            },
        };
        let g = GroundingFormatter::from_config(&config).explain("q", &evidence(), &clean());
        assert_eq!(g.model_used, OFFLINE_MODEL);
    }

    #[test]
    fn failed_generation_falls_back() {
        let g = with(Err(())).explain("q", &evidence(), &clean());
        assert_eq!(g.model_used, OFFLINE_MODEL);
        assert!(!g.explanation.is_empty());
    }

    #[test]
    fn structured_reply_is_used() {
        let reply = r#"Here you go:
{"codes": ["I21.01", "Z999"], "explanations": {"I2101": "ST elevation in the note"},
 "confidence": 82, "summary": "Acute STEMI."}"#;
        let g = with(Ok(reply)).explain("q", &evidence(), &clean());
        assert_eq!(g.model_used, "scripted");
        assert_eq!(g.codes, vec!["I2101"]);
        assert_eq!(g.confidence, 82);
        assert_eq!(g.explanation, "Acute STEMI.\nI2101: ST elevation in the note");
    }

    #[test]
    fn fractional_confidence_is_scaled() {
        let reply = r#"{"codes": ["R079"], "confidence": 0.7, "summary": "Chest pain."}"#;
        let g = with(Ok(reply)).explain("q", &evidence(), &clean());
        assert_eq!(g.confidence, 70);
    }

    #[test]
    fn prose_reply_keeps_deterministic_confidence() {
        let g = with(Ok("Likely an acute STEMI.")).explain("q", &evidence(), &clean());
        assert_eq!(g.explanation, "Likely an acute STEMI.");
        assert_eq!(g.confidence, 48);
    }

    #[test]
    fn warnings_mirror_guardrails() {
        let guardrails = GuardrailsEngine::default().check("q", &["X".into()], &["bad".into()]);
        let g = GroundingFormatter::offline().explain("q", &evidence(), &guardrails);
        assert!(!g.is_safe);
        assert_eq!(g.warnings, guardrails.warnings());
        assert!(g.explanation.contains("Compliance warnings"));
    }
}
