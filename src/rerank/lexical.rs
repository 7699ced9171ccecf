use std::collections::BTreeSet;

use crate::catalog::CatalogItem;
use crate::text;

/// Weighted token overlap between a query and a catalog entry.
///
/// Each distinct query token earns the weight of the strongest field it
/// appears in (title > alias > description). The sum is divided by the best
/// possible sum, so scores lie in [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct LexicalScorer {
    pub title_weight: f32,
    pub alias_weight: f32,
    pub description_weight: f32,
}

impl Default for LexicalScorer {
    fn default() -> Self {
        Self {
            title_weight: 3.0,
            alias_weight: 2.0,
            description_weight: 1.0,
        }
    }
}

/// Score plus the query tokens that contributed to it.
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalMatch {
    pub score: f32,
    pub matched: Vec<String>,
}

impl LexicalScorer {
    pub fn score(&self, query_tokens: &BTreeSet<String>, item: &CatalogItem) -> LexicalMatch {
        let max_weight = self
            .title_weight
            .max(self.alias_weight)
            .max(self.description_weight);
        if query_tokens.is_empty() || max_weight <= 0.0 {
            return LexicalMatch {
                score: 0.0,
                matched: Vec::new(),
            };
        }

        let title = text::token_set(&item.title);
        let aliases: BTreeSet<String> = item.aliases.iter().flat_map(|a| text::tokenize(a)).collect();
        let description = text::token_set(&item.description);

        let mut total = 0.0f32;
        let mut matched = Vec::new();
        for token in query_tokens {
            let weight = if title.contains(token) {
                self.title_weight
            } else if aliases.contains(token) {
                self.alias_weight
            } else if description.contains(token) {
                self.description_weight
            } else {
                0.0
            };
            if weight > 0.0 {
                total += weight;
                matched.push(token.clone());
            }
        }

        LexicalMatch {
            score: (total / (max_weight * query_tokens.len() as f32)).clamp(0.0, 1.0),
            matched,
        }
    }
}
