//! Coding-policy guardrails over a proposed code set.
//!
//! Rules run per code (format, specificity), then over the whole set
//! (duplicates, category saturation, clinical coherence). Guardrails only
//! annotate: they never remove or reorder codes, and [`GuardrailsEngine::check`]
//! is a pure function of its arguments and the engine's configuration.
//!
//! Violation order is fixed: per-code violations in input order, then
//! duplicates, then saturation by bucket in order of first appearance, then
//! coherence.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::GuardrailsConfig;

// ── Data ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Whether a violation of this severity invalidates the code set.
    pub fn invalidates(self) -> bool {
        self >= Severity::Error
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One broken rule. Plain data carried in the response, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub rule_id: String,
    pub rule_name: String,
    /// The offending code, or a comma-joined set for set-level rules.
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

impl PolicyViolation {
    /// `"[severity] message"`, the form shown to users.
    pub fn display_line(&self) -> String {
        format!("[{}] {}", self.severity, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailsResult {
    pub codes: Vec<String>,
    pub violations: Vec<PolicyViolation>,
    /// True iff no violation is `error` or `critical`.
    pub is_valid: bool,
}

impl GuardrailsResult {
    fn new(codes: Vec<String>, violations: Vec<PolicyViolation>) -> Self {
        let is_valid = !violations.iter().any(|v| v.severity.invalidates());
        Self {
            codes,
            violations,
            is_valid,
        }
    }

    pub fn warnings(&self) -> Vec<String> {
        self.violations.iter().map(PolicyViolation::display_line).collect()
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.violations.iter().map(|v| v.severity).max()
    }
}

// ── Category buckets ────────────────────────────────────────────────────

/// ICD-10 chapter bucket for a code, keyed by its leading letter.
pub fn category_bucket(code: &str) -> Option<&'static str> {
    let first = code.trim().chars().next()?.to_ascii_uppercase();
    let bucket = match first {
        'A' | 'B' => "A00-B99",
        'C' | 'D' => "C00-D49",
        'E' => "E00-E89",
        'F' => "F00-F99",
        'G' => "G00-G99",
        'H' => "H00-H99",
        'I' => "I00-I99",
        'J' => "J00-J99",
        'K' => "K00-K95",
        'L' => "L00-L99",
        'M' => "M00-M99",
        'N' => "N00-N99",
        'O' => "O00-O9A",
        'P' => "P00-P96",
        'Q' => "Q00-Q99",
        'R' => "R00-R99",
        'S' | 'T' => "S00-T88",
        'U' => "U00-U85",
        'V' | 'W' | 'X' | 'Y' => "V00-Y99",
        'Z' => "Z00-Z99",
        _ => return None,
    };
    Some(bucket)
}

const MALE_ONLY_PREFIXES: &[&str] = &[
    "N40", "N41", "N42", "N43", "N44", "N45", "N46", "N47", "N48", "N49", "N50", "N51", "C60",
    "C61", "C62", "C63",
];

fn is_pregnancy_code(code: &str) -> bool {
    code.starts_with('O') || code.starts_with('o')
}

fn is_male_only_code(code: &str) -> bool {
    let upper = code.to_ascii_uppercase();
    MALE_ONLY_PREFIXES.iter().any(|p| upper.starts_with(p))
}

// ── Engine ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GuardrailsEngine {
    limits: BTreeMap<String, usize>,
    markers: Vec<String>,
}

impl Default for GuardrailsEngine {
    fn default() -> Self {
        Self::new(&GuardrailsConfig::default())
    }
}

impl GuardrailsEngine {
    pub fn new(config: &GuardrailsConfig) -> Self {
        Self {
            limits: config
                .max_codes_per_category
                .iter()
                .map(|(bucket, max)| (bucket.to_ascii_uppercase(), *max))
                .collect(),
            markers: config
                .specificity_markers
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// Evaluate every rule. `titles` is parallel to `codes`; a missing title
    /// counts as empty.
    pub fn check(&self, _query: &str, codes: &[String], titles: &[String]) -> GuardrailsResult {
        let mut violations = Vec::new();

        for (i, code) in codes.iter().enumerate() {
            if let Some(v) = check_format(code) {
                violations.push(v);
            }
            let title = titles.get(i).map(String::as_str).unwrap_or("");
            if let Some(v) = self.check_specificity(code, title) {
                violations.push(v);
            }
        }

        violations.extend(check_duplicates(codes));
        violations.extend(self.check_saturation(codes));
        violations.extend(check_coherence(codes));

        GuardrailsResult::new(codes.to_vec(), violations)
    }

    fn check_specificity(&self, code: &str, title: &str) -> Option<PolicyViolation> {
        let title_lower = title.to_lowercase();
        let words: Vec<&str> = title_lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let marker = self.markers.iter().find(|m| {
            if m.contains(' ') {
                title_lower.contains(m.as_str())
            } else {
                words.contains(&m.as_str())
            }
        })?;

        Some(PolicyViolation {
            rule_id: "specificity_001".into(),
            rule_name: "Code Specificity".into(),
            code: code.to_string(),
            severity: Severity::Warning,
            message: format!("Code '{code}' is unspecified (contains '{marker}')"),
            recommendation: Some(
                "Consider using a more specific code if clinical details are available".into(),
            ),
        })
    }

    fn check_saturation(&self, codes: &[String]) -> Vec<PolicyViolation> {
        let mut buckets: Vec<(&'static str, Vec<&str>)> = Vec::new();
        for code in codes {
            let Some(bucket) = category_bucket(code) else {
                continue;
            };
            match buckets.iter_mut().find(|(b, _)| *b == bucket) {
                Some((_, members)) => members.push(code.as_str()),
                None => buckets.push((bucket, vec![code.as_str()])),
            }
        }

        buckets
            .into_iter()
            .filter_map(|(bucket, members)| {
                let max = *self.limits.get(bucket)?;
                (members.len() > max).then(|| PolicyViolation {
                    rule_id: format!("max_codes_{}", bucket.to_lowercase()),
                    rule_name: "Category Code Limit".into(),
                    code: members.join(","),
                    severity: Severity::Warning,
                    message: format!(
                        "Section {bucket} has {} codes (max recommended: {max})",
                        members.len()
                    ),
                    recommendation: Some("Consider consolidating related codes".into()),
                })
            })
            .collect()
    }
}

fn check_format(code: &str) -> Option<PolicyViolation> {
    if code.chars().count() < 3 {
        return Some(PolicyViolation {
            rule_id: "format_001".into(),
            rule_name: "Code Format Validation".into(),
            code: code.to_string(),
            severity: Severity::Error,
            message: format!("Code '{code}' has invalid format"),
            recommendation: Some("Code must follow ICD-10 format (e.g., A00.0, I2101)".into()),
        });
    }
    if !code.chars().next().is_some_and(|c| c.is_alphabetic()) {
        return Some(PolicyViolation {
            rule_id: "format_002".into(),
            rule_name: "Code Format Validation".into(),
            code: code.to_string(),
            severity: Severity::Error,
            message: format!("Code '{code}' must start with a letter"),
            recommendation: None,
        });
    }
    None
}

fn check_duplicates(codes: &[String]) -> Vec<PolicyViolation> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for code in codes {
        match counts.iter_mut().find(|(c, _)| *c == code.as_str()) {
            Some((_, n)) => *n += 1,
            None => counts.push((code.as_str(), 1)),
        }
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(code, n)| PolicyViolation {
            rule_id: "duplicate_001".into(),
            rule_name: "Duplicate Code".into(),
            code: code.to_string(),
            severity: Severity::Info,
            message: format!("Code '{code}' appears {n} times"),
            recommendation: Some("Report each code once".into()),
        })
        .collect()
}

fn check_coherence(codes: &[String]) -> Option<PolicyViolation> {
    let pregnancy: Vec<&str> = codes
        .iter()
        .map(String::as_str)
        .filter(|c| is_pregnancy_code(c))
        .collect();
    let male_only: Vec<&str> = codes
        .iter()
        .map(String::as_str)
        .filter(|c| is_male_only_code(c))
        .collect();
    if pregnancy.is_empty() || male_only.is_empty() {
        return None;
    }

    let involved: Vec<&str> = pregnancy.iter().chain(&male_only).copied().collect();
    Some(PolicyViolation {
        rule_id: "coherence_001".into(),
        rule_name: "Clinical Coherence".into(),
        code: involved.join(","),
        severity: Severity::Critical,
        message: format!(
            "Pregnancy codes ({}) combined with male-only codes ({})",
            pregnancy.join(","),
            male_only.join(",")
        ),
        recommendation: Some("Review the note; these codes cannot apply to the same patient".into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn format_rule_coverage() {
        let engine = GuardrailsEngine::default();
        let result = engine.check("q", &strings(&["", "X", "A000"]), &strings(&["", "", "Cholera"]));
        let errors: Vec<_> = result
            .violations
            .iter()
            .filter(|v| v.severity == Severity::Error)
            .map(|v| v.code.as_str())
            .collect();
        assert_eq!(errors, vec!["", "X"]);
        assert!(!result.is_valid);

        let clean = engine.check("q", &strings(&["A000"]), &strings(&["Cholera"]));
        assert!(clean.violations.is_empty());
        assert!(clean.is_valid);
    }

    #[test]
    fn non_alphabetic_start_is_format_002() {
        let result = GuardrailsEngine::default().check("q", &strings(&["123"]), &[]);
        assert_eq!(result.violations[0].rule_id, "format_002");
    }

    #[test]
    fn specificity_is_a_warning_on_whole_words() {
        let engine = GuardrailsEngine::default();
        let result = engine.check(
            "q",
            &strings(&["J189", "R69"]),
            &strings(&["Pneumonia, unspecified organism", "Illness, NOS"]),
        );
        assert_eq!(result.violations.len(), 2);
        assert!(result.violations.iter().all(|v| v.severity == Severity::Warning));
        assert!(result.violations[1].message.contains("'nos'"));
        assert!(result.is_valid);

        // "diagnosis" contains "nos" but is not the marker.
        let none = engine.check("q", &strings(&["Z000"]), &strings(&["General diagnosis visit"]));
        assert!(none.violations.is_empty());
    }

    #[test]
    fn saturation_warns_once_and_stays_valid() {
        let config = GuardrailsConfig {
            max_codes_per_category: BTreeMap::from([("I00-I99".to_string(), 5)]),
            ..Default::default()
        };
        let engine = GuardrailsEngine::new(&config);
        let codes = strings(&["I10", "I2101", "I480", "I500", "I639", "I739"]);
        let titles = strings(&["a", "b", "c", "d", "e", "f"]);
        let result = engine.check("q", &codes, &titles);

        let saturation: Vec<_> = result
            .violations
            .iter()
            .filter(|v| v.rule_id.starts_with("max_codes_"))
            .collect();
        assert_eq!(saturation.len(), 1);
        assert_eq!(saturation[0].severity, Severity::Warning);
        assert_eq!(saturation[0].rule_id, "max_codes_i00-i99");
        assert_eq!(saturation[0].code, "I10,I2101,I480,I500,I639,I739");
        assert_eq!(result.violations.len(), 1);
        assert!(result.is_valid);
    }

    #[test]
    fn buckets_without_a_limit_are_unbounded() {
        let codes = strings(&["R05", "R06", "R07", "R50", "R51", "R52"]);
        let result = GuardrailsEngine::default().check("q", &codes, &[]);
        assert!(result.violations.is_empty());
    }

    #[test]
    fn check_is_pure() {
        let engine = GuardrailsEngine::default();
        let codes = strings(&["", "A000", "A001", "A009", "B20", "J189"]);
        let titles = strings(&["", "Cholera", "Cholera", "Cholera, unspecified", "HIV", "Pneumonia NOS"]);
        let a = serde_json::to_string(&engine.check("note", &codes, &titles)).unwrap();
        let b = serde_json::to_string(&engine.check("note", &codes, &titles)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn guardrails_never_reorder_codes() {
        let codes = strings(&["J189", "A000", "J189"]);
        let result = GuardrailsEngine::default().check("q", &codes, &[]);
        assert_eq!(result.codes, codes);
        let dup = result.violations.iter().find(|v| v.rule_id == "duplicate_001").unwrap();
        assert_eq!(dup.severity, Severity::Info);
        assert!(result.is_valid);
    }

    #[test]
    fn pregnancy_with_male_only_code_is_critical() {
        let result = GuardrailsEngine::default().check("q", &strings(&["O800", "N40"]), &[]);
        assert_eq!(result.max_severity(), Some(Severity::Critical));
        assert!(!result.is_valid);
        assert_eq!(result.warnings()[0], "[critical] Pregnancy codes (O800) combined with male-only codes (N40)");
    }

    #[test]
    fn buckets_follow_icd10_chapters() {
        assert_eq!(category_bucket("b20"), Some("A00-B99"));
        assert_eq!(category_bucket("T401"), Some("S00-T88"));
        assert_eq!(category_bucket("9ZZ"), None);
        assert_eq!(category_bucket(""), None);
    }
}
