//! Similarity search over catalog embeddings.
//!
//! Distance convention: both indexes report **cosine similarity** in [-1, 1]
//! (for unit vectors, `1 - cosine distance`). [`HnswIndex`] searches with
//! `DistCosine`, whose distance is `1 - cos`, then re-scores every neighbour
//! exactly against the stored vector, so the two kinds agree on scores and
//! differ only in recall.
//!
//! Results are sorted by descending similarity with ties broken by ascending
//! catalog position, which keeps searches reproducible.

use std::cmp::Ordering;
use std::sync::RwLock;

use anndists::dist::DistCosine;
use hnsw_rs::hnsw::Hnsw;
use rayon::prelude::*;

use crate::config::{IndexConfig, IndexKind};
use crate::embed::cosine;
use crate::error::{ServiceError, ServiceResult};

/// A search hit: catalog position and cosine similarity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub index: usize,
    pub similarity: f32,
}

pub trait VectorIndex: Send + Sync {
    /// Vector width.
    fn dimension(&self) -> usize;

    /// Number of indexed vectors.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `top_n` nearest vectors, best first.
    fn search(&self, query: &[f32], top_n: usize) -> ServiceResult<Vec<Hit>>;

    fn kind(&self) -> IndexKind;
}

/// Build the configured index over `vectors` (position = catalog position).
pub fn build(config: &IndexConfig, dimension: usize, vectors: Vec<Vec<f32>>) -> Box<dyn VectorIndex> {
    match config.kind {
        IndexKind::Flat => Box::new(FlatIndex::new(dimension, vectors)),
        IndexKind::Hnsw => Box::new(HnswIndex::new(config, dimension, vectors)),
    }
}

fn rank_hits(hits: &mut Vec<Hit>, top_n: usize) {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then(a.index.cmp(&b.index))
    });
    hits.truncate(top_n);
}

fn check_dimension(expected: usize, query: &[f32]) -> ServiceResult<()> {
    if query.len() != expected {
        return Err(ServiceError::malformed(
            "index",
            format!("query dimension {} does not match index dimension {expected}", query.len()),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Exact search
// ---------------------------------------------------------------------------

/// Brute-force cosine scan, parallelized with rayon.
#[derive(Debug)]
pub struct FlatIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dimension: usize, vectors: Vec<Vec<f32>>) -> Self {
        Self { dimension, vectors }
    }
}

impl VectorIndex for FlatIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn search(&self, query: &[f32], top_n: usize) -> ServiceResult<Vec<Hit>> {
        check_dimension(self.dimension, query)?;
        let mut hits: Vec<Hit> = self
            .vectors
            .par_iter()
            .enumerate()
            .map(|(index, v)| Hit {
                index,
                similarity: cosine(query, v),
            })
            .collect();
        rank_hits(&mut hits, top_n);
        Ok(hits)
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }
}

// ---------------------------------------------------------------------------
// Approximate search
// ---------------------------------------------------------------------------

pub struct HnswIndex {
    hnsw: RwLock<Hnsw<'static, f32, DistCosine>>,
    vectors: Vec<Vec<f32>>,
    dimension: usize,
    ef_search: usize,
}

// Safety: Hnsw uses internal synchronization via atomics/locks.
// The RwLock wrapper provides the outer synchronization needed.
unsafe impl Send for HnswIndex {}
unsafe impl Sync for HnswIndex {}

impl HnswIndex {
    pub fn new(config: &IndexConfig, dimension: usize, vectors: Vec<Vec<f32>>) -> Self {
        let max_elements = vectors.len().max(1);
        let max_layer = ((max_elements as f64).log2().ceil() as usize).clamp(4, 16);
        let hnsw = Hnsw::new(
            config.max_connections,
            max_elements,
            max_layer,
            config.ef_construction,
            DistCosine {},
        );

        // Zero vectors have no direction under cosine distance.
        let mut skipped = 0usize;
        for (id, v) in vectors.iter().enumerate() {
            if v.iter().all(|x| *x == 0.0) {
                skipped += 1;
                continue;
            }
            hnsw.insert((v.as_slice(), id));
        }
        tracing::info!(
            vectors = vectors.len(),
            skipped,
            max_layer,
            "hnsw index built"
        );

        Self {
            hnsw: RwLock::new(hnsw),
            vectors,
            dimension,
            ef_search: config.ef_search,
        }
    }
}

impl VectorIndex for HnswIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn search(&self, query: &[f32], top_n: usize) -> ServiceResult<Vec<Hit>> {
        check_dimension(self.dimension, query)?;
        if query.iter().all(|x| *x == 0.0) {
            return Ok(Vec::new());
        }

        let ef_search = self.ef_search.max(top_n * 2);
        let hnsw = self
            .hnsw
            .read()
            .map_err(|_| ServiceError::unavailable("index", "HNSW lock poisoned"))?;
        let neighbours = hnsw.search(query, top_n, ef_search);

        let mut hits: Vec<Hit> = neighbours
            .into_iter()
            .filter_map(|n| {
                let v = self.vectors.get(n.d_id)?;
                Some(Hit {
                    index: n.d_id,
                    similarity: cosine(query, v),
                })
            })
            .collect();
        rank_hits(&mut hits, top_n);
        Ok(hits)
    }

    fn kind(&self) -> IndexKind {
        IndexKind::Hnsw
    }
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dimension", &self.dimension)
            .field("len", &self.vectors.len())
            .field("ef_search", &self.ef_search)
            .finish()
    }
}
