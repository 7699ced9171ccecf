//! Admission gate applied before any retrieval runs.
//!
//! A rejected note is answered with a structured "blocked" response; the
//! funnel never sees it.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::AdmissionConfig;
use crate::text;

/// Shown with every response.
pub const DISCLAIMER: &str = "Not medical advice. Coding assistance only.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// Why the note was rejected; `None` when allowed.
    pub reason: Option<String>,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

pub trait AdmissionGate: Send + Sync {
    fn is_safe_note(&self, text: &str) -> AdmissionDecision;
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

impl AdmissionGate for OpenGate {
    fn is_safe_note(&self, _text: &str) -> AdmissionDecision {
        AdmissionDecision::allow()
    }
}

// ── PHI screen ──────────────────────────────────────────────────────────

static RE_SSN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());

static RE_TEN_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{10}\b").unwrap());

static RE_MRN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bMRN[:#\s]*\d{5,10}\b").unwrap());

/// Rejects notes that are too short to code or that look like they carry
/// protected health information.
#[derive(Debug, Clone)]
pub struct PhiScreen {
    min_words: usize,
}

impl PhiScreen {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            min_words: config.min_words,
        }
    }

    /// Names of the identifier patterns found in `text`.
    pub fn detect(&self, text: &str) -> Vec<&'static str> {
        let patterns: [(&'static str, &Regex); 3] =
            [("ssn", &RE_SSN), ("ten_digit_id", &RE_TEN_DIGITS), ("mrn", &RE_MRN)];
        patterns
            .into_iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(name, _)| name)
            .collect()
    }
}

impl Default for PhiScreen {
    fn default() -> Self {
        Self::new(&AdmissionConfig::default())
    }
}

impl AdmissionGate for PhiScreen {
    fn is_safe_note(&self, text: &str) -> AdmissionDecision {
        if text::word_count(text) < self.min_words {
            return AdmissionDecision::block(format!("Note too short (<{} words)", self.min_words));
        }
        let found = self.detect(text);
        if !found.is_empty() {
            // Pattern names only; the note itself is never logged.
            tracing::warn!(patterns = ?found, "note blocked by PHI screen");
            return AdmissionDecision::block("Potential PHI detected");
        }
        AdmissionDecision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTE: &str = "Patient presents with crushing chest pain radiating to the left arm";

    #[test]
    fn clinical_note_is_admitted() {
        assert_eq!(PhiScreen::default().is_safe_note(NOTE), AdmissionDecision::allow());
    }

    #[test]
    fn short_note_is_blocked() {
        let d = PhiScreen::default().is_safe_note("chest pain");
        assert!(!d.allowed);
        assert_eq!(d.reason.as_deref(), Some("Note too short (<5 words)"));
    }

    #[test]
    fn identifiers_are_blocked() {
        let screen = PhiScreen::default();
        for note in [
            "SSN 123-45-6789 patient presents with chest pain",
            "callback 5551234567 patient presents with chest pain",
            "MRN: 0048213 patient presents with chest pain today",
        ] {
            let d = screen.is_safe_note(note);
            assert!(!d.allowed, "{note}");
            assert_eq!(d.reason.as_deref(), Some("Potential PHI detected"));
        }
    }

    #[test]
    fn detect_names_each_pattern() {
        let found = PhiScreen::default().detect("MRN 12345 and 123-45-6789");
        assert_eq!(found, vec!["ssn", "mrn"]);
    }

    #[test]
    fn vitals_are_not_identifiers() {
        let note = "BP 160/95, HR 110, troponin 2.4 ng/mL, onset 45 minutes ago";
        assert!(PhiScreen::default().is_safe_note(note).allowed);
    }

    #[test]
    fn open_gate_admits_everything() {
        assert!(OpenGate.is_safe_note("").allowed);
    }
}
