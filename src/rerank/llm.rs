use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::candidate::ScoreScale;
use crate::error::{ServiceError, ServiceResult};
use crate::llm::{TextGenerator, extract_json};

use super::{Relevance, RelevanceModel, RerankDoc};

const MAX_NOTE_CHARS: usize = 2_000;

const SYSTEM_PROMPT: &str = "You are an expert medical coder. Score how relevant each candidate \
    ICD-10 code is to the clinical note. Return ONLY a JSON array of objects with fields: \
    code, confidence (0-1), reason (one short sentence). No other text.";

/// Listwise relevance scoring by a text-generation model.
///
/// All candidates go into one prompt; codes the model leaves out score 0.
pub struct LlmRelevanceModel {
    generator: Arc<dyn TextGenerator>,
}

impl LlmRelevanceModel {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    fn prompt(query: &str, docs: &[RerankDoc<'_>]) -> String {
        let note: String = query.chars().take(MAX_NOTE_CHARS).collect();
        let mut prompt = format!("Clinical note:\n{note}\n\nCandidate codes:\n");
        for (i, doc) in docs.iter().enumerate() {
            let title = doc.item.map(|item| item.title.as_str()).unwrap_or("(no catalog entry)");
            let _ = writeln!(prompt, "{}. {}: {}", i + 1, doc.code, title);
        }
        prompt
    }
}

/// Parse `[{"code", "confidence", "reason"}]`, tolerating prose around it.
fn parse_scores(reply: &str) -> ServiceResult<HashMap<String, Relevance>> {
    let json = extract_json(reply, '[', ']')
        .ok_or_else(|| ServiceError::malformed("reranker", "no JSON array found in response"))?;
    let parsed: Vec<serde_json::Value> = serde_json::from_str(json)
        .map_err(|e| ServiceError::malformed("reranker", format!("JSON parse error: {e}")))?;

    let mut scores = HashMap::new();
    for val in &parsed {
        let Some(code) = val["code"].as_str() else {
            continue;
        };
        let score = val["confidence"].as_f64().unwrap_or(0.0) as f32;
        let reason = val["reason"].as_str().map(str::to_string);
        scores
            .entry(crate::catalog::canonical_code(code))
            .or_insert(Relevance { score, reason });
    }
    Ok(scores)
}

impl RelevanceModel for LlmRelevanceModel {
    fn score(&self, query: &str, docs: &[RerankDoc<'_>]) -> ServiceResult<Vec<Relevance>> {
        let reply = self
            .generator
            .generate(&Self::prompt(query, docs), Some(SYSTEM_PROMPT))?;
        let mut scores = parse_scores(&reply)?;
        Ok(docs
            .iter()
            .map(|doc| {
                scores.remove(doc.code).unwrap_or(Relevance {
                    score: 0.0,
                    reason: None,
                })
            })
            .collect())
    }

    fn scale(&self) -> ScoreScale {
        ScoreScale::Unit
    }

    fn name(&self) -> &str {
        self.generator.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogRow, CodeCatalog};

    struct Canned(&'static str);

    impl TextGenerator for Canned {
        fn generate(&self, _prompt: &str, _system: Option<&str>) -> ServiceResult<String> {
            Ok(self.0.to_string())
        }
        fn model_name(&self) -> &str {
            "canned"
        }
    }

    #[test]
    fn reply_scores_align_with_documents() {
        let catalog = CodeCatalog::from_rows(vec![
            CatalogRow::new("I2101", "STEMI involving left main coronary artery", "", ""),
            CatalogRow::new("A000", "Cholera", "", ""),
        ])
        .unwrap();
        let docs = [
            RerankDoc {
                code: "A000",
                item: catalog.get("A000"),
            },
            RerankDoc {
                code: "I2101",
                item: catalog.get("I2101"),
            },
        ];
        let model = LlmRelevanceModel::new(Arc::new(Canned(
            "Here you go:\n[{\"code\": \"I21.01\", \"confidence\": 0.95, \"reason\": \"ST elevation\"}]",
        )));
        let scores = model.score("chest pain with ST elevation", &docs).unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].score, 0.0);
        assert_eq!(scores[1].score, 0.95);
        assert_eq!(scores[1].reason.as_deref(), Some("ST elevation"));
    }

    #[test]
    fn prose_reply_is_malformed() {
        let model = LlmRelevanceModel::new(Arc::new(Canned("I cannot help with that.")));
        let docs = [RerankDoc {
            code: "A000",
            item: None,
        }];
        assert!(matches!(
            model.score("q", &docs),
            Err(ServiceError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn prompt_lists_every_candidate() {
        let docs = [
            RerankDoc { code: "A000", item: None },
            RerankDoc { code: "B001", item: None },
        ];
        let prompt = LlmRelevanceModel::prompt("note", &docs);
        assert!(prompt.contains("1. A000"));
        assert!(prompt.contains("2. B001"));
    }
}
