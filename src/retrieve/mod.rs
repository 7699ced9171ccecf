//! Similarity-based candidate retrieval over the whole catalog.

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::candidate::{ScoredCandidate, Source};
use crate::catalog::CodeCatalog;
use crate::config::IndexConfig;
use crate::embed::Embedder;
use crate::error::{ConfigError, ConfigResult, MedcodeResult, ServiceResult, ValidationError};
use crate::index::{self, VectorIndex};

/// Embeds queries and returns the most similar catalog entries.
///
/// The catalog is embedded once at construction. Retrieval is deterministic
/// for a fixed catalog, embedder and query.
pub struct CandidateRetriever {
    catalog: Arc<CodeCatalog>,
    embedder: Arc<dyn Embedder>,
    index: Box<dyn VectorIndex>,
}

impl CandidateRetriever {
    /// Embed every catalog entry (in parallel) and build the index.
    pub fn build(
        catalog: Arc<CodeCatalog>,
        embedder: Arc<dyn Embedder>,
        config: &IndexConfig,
    ) -> ConfigResult<Self> {
        let start = Instant::now();
        let items: Vec<_> = catalog.iter().collect();
        let vectors: Vec<Vec<f32>> = items
            .par_iter()
            .map(|item| embedder.embed(&item.searchable_text()))
            .collect::<ServiceResult<_>>()
            .map_err(|e| ConfigError::IndexBuild {
                message: e.to_string(),
            })?;

        let index = index::build(config, embedder.dimension(), vectors);
        tracing::info!(
            codes = catalog.len(),
            embedder = embedder.name(),
            index = ?index.kind(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "candidate retriever ready"
        );

        Ok(Self {
            catalog,
            embedder,
            index,
        })
    }

    /// Embed and search in one step.
    ///
    /// Fails with a validation error when `top_n` is zero and with a service
    /// error when the embedding or index service fails.
    pub fn retrieve(&self, query: &str, top_n: usize) -> MedcodeResult<Vec<ScoredCandidate>> {
        check_top_n(top_n)?;
        let embedding = self.embed_query(query)?;
        Ok(self.search(&embedding, top_n)?)
    }

    pub fn embed_query(&self, query: &str) -> ServiceResult<Vec<f32>> {
        self.embedder.embed(query)
    }

    /// Search with a precomputed query embedding.
    pub fn search(&self, embedding: &[f32], top_n: usize) -> ServiceResult<Vec<ScoredCandidate>> {
        let hits = self.index.search(embedding, top_n)?;
        let candidates: Vec<ScoredCandidate> = hits
            .into_iter()
            .filter_map(|hit| {
                let item = self.catalog.item(hit.index)?;
                Some(ScoredCandidate::new(
                    item.code.clone(),
                    hit.similarity,
                    Source::Retrieval,
                ))
            })
            .collect();
        tracing::debug!(returned = candidates.len(), top_n, "retrieval search");
        Ok(candidates)
    }

    pub fn catalog(&self) -> &Arc<CodeCatalog> {
        &self.catalog
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }
}

impl std::fmt::Debug for CandidateRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateRetriever")
            .field("codes", &self.catalog.len())
            .field("embedder", &self.embedder.name())
            .field("index", &self.index.kind())
            .finish()
    }
}

fn check_top_n(top_n: usize) -> Result<(), ValidationError> {
    if top_n == 0 {
        return Err(ValidationError::OutOfRange {
            name: "top_n",
            value: top_n,
            max: usize::MAX,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogRow;
    use crate::embed::HashingEmbedder;
    use crate::error::{MedcodeError, ServiceError};

    fn retriever() -> CandidateRetriever {
        let catalog = CodeCatalog::from_rows(vec![
            CatalogRow::new("A000", "Cholera due to Vibrio cholerae 01", "", "Infectious"),
            CatalogRow::new("I2101", "STEMI involving left main coronary artery", "", "Circulatory"),
            CatalogRow::new("J189", "Pneumonia, unspecified organism", "", "Respiratory"),
            CatalogRow::new("R079", "Chest pain, unspecified", "", "Symptoms"),
        ])
        .unwrap();
        CandidateRetriever::build(
            Arc::new(catalog),
            Arc::new(HashingEmbedder::new(256)),
            &IndexConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn returns_at_most_top_n_known_codes() {
        let r = retriever();
        let results = r.retrieve("fever and productive cough", 2).unwrap();
        assert!(results.len() <= 2);
        for c in &results {
            assert!(r.catalog().contains(&c.code));
            assert_eq!(c.source, Source::Retrieval);
        }
    }

    #[test]
    fn retrieval_is_idempotent() {
        let r = retriever();
        let a = r.retrieve("chest pain with ST elevation", 4).unwrap();
        let b = r.retrieve("chest pain with ST elevation", 4).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn zero_top_n_is_a_validation_error() {
        let err = retriever().retrieve("chest pain", 0).unwrap_err();
        assert!(matches!(err, MedcodeError::Validation(_)));
    }

    struct Offline;

    impl Embedder for Offline {
        fn dimension(&self) -> usize {
            8
        }
        fn embed(&self, _text: &str) -> ServiceResult<Vec<f32>> {
            Err(ServiceError::unavailable("embedder", "connection refused"))
        }
        fn name(&self) -> &str {
            "offline"
        }
    }

    #[test]
    fn unreachable_embedder_fails_the_build() {
        let catalog = CodeCatalog::from_rows(vec![CatalogRow::new("A000", "Cholera", "", "")]).unwrap();
        let err = CandidateRetriever::build(Arc::new(catalog), Arc::new(Offline), &IndexConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::IndexBuild { .. }));
    }
}
