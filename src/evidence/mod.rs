//! Joins ranked codes back to catalog records.
//!
//! Evidence is never fabricated: a candidate whose code is missing from the
//! catalog is dropped (and logged). Output order follows input order.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::candidate::ScoredCandidate;
use crate::catalog::{CatalogItem, CodeCatalog};
use crate::text;

/// A ranked code with its full catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub code: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub aliases: BTreeSet<String>,
    /// Score of the candidate this item was built from.
    pub relevance_score: f32,
    /// Verbatim note fragments that match the title or aliases.
    pub note_spans: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EvidenceAssembler {
    catalog: Arc<CodeCatalog>,
}

impl EvidenceAssembler {
    pub fn new(catalog: Arc<CodeCatalog>) -> Self {
        Self { catalog }
    }

    pub fn assemble(&self, query: &str, ranked: &[ScoredCandidate]) -> Vec<EvidenceItem> {
        ranked
            .iter()
            .filter_map(|candidate| match self.catalog.get(&candidate.code) {
                Some(item) => Some(EvidenceItem {
                    code: item.code.clone(),
                    title: item.title.clone(),
                    description: item.description.clone(),
                    category: item.category.clone(),
                    aliases: item.aliases.clone(),
                    relevance_score: candidate.score,
                    note_spans: note_spans(query, item),
                }),
                None => {
                    tracing::warn!(code = %candidate.code, source = %candidate.source, "no catalog entry, evidence dropped");
                    None
                }
            })
            .collect()
    }
}

/// Words of `note` (verbatim, first occurrence, case-insensitive dedup) that
/// match a title or alias token of `item`, directly or through an
/// abbreviation expansion.
pub fn note_spans(note: &str, item: &CatalogItem) -> Vec<String> {
    let mut vocabulary = text::token_set(&item.title);
    for alias in &item.aliases {
        vocabulary.extend(text::tokenize(alias));
    }

    let mut seen = HashSet::new();
    let mut spans = Vec::new();
    for word in note.split(|c: char| !c.is_alphanumeric()) {
        let lower = text::normalize(word);
        if lower.chars().count() < 2 || text::is_stopword(&lower) {
            continue;
        }
        let hit = vocabulary.contains(&lower)
            || text::expand_abbreviation(&lower)
                .is_some_and(|expansion| expansion.split(' ').any(|t| vocabulary.contains(t)));
        if hit && seen.insert(lower) {
            spans.push(word.to_string());
        }
    }
    spans
}
