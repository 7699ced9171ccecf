// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # medcode
//!
//! Diagnosis-code recommendation for free-text clinical notes.
//!
//! ## Architecture
//!
//! - **Catalog** (`catalog`): read-only code table, loaded once at startup
//! - **Retrieval** (`embed`, `index`, `retrieve`): embedding plus exact or HNSW cosine search
//! - **Reranking** (`rerank`): external relevance model with a lexical fallback
//! - **Classification** (`classify`): optional direct multi-label source
//! - **Consensus** (`consensus`): per-method ranking and the weighted ensemble vote
//! - **Evidence and guardrails** (`evidence`, `guardrails`): catalog join and policy rules
//! - **Grounding** (`grounding`): explanation and confidence, offline template fallback
//! - **Pipeline** (`pipeline`): admission gate through final response
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use medcode::catalog::{CatalogRow, CodeCatalog};
//! use medcode::config::PipelineConfig;
//! use medcode::consensus::Method;
//! use medcode::pipeline::CodingPipeline;
//!
//! let catalog = CodeCatalog::from_rows(vec![
//!     CatalogRow::new("I2101", "STEMI involving left main coronary artery", "", "Circulatory"),
//!     CatalogRow::new("R079", "Chest pain, unspecified", "", "Symptoms"),
//! ])
//! .unwrap();
//! let pipeline = CodingPipeline::from_config(&PipelineConfig::default(), Some(Arc::new(catalog))).unwrap();
//! let response = pipeline
//!     .predict("Crushing chest pain with ST elevation on the EKG", Some(5), Method::Ensemble)
//!     .unwrap();
//! println!("{:?} ({}%)", response.codes(), response.confidence);
//! ```

pub mod admission;
pub mod candidate;
pub mod catalog;
pub mod classify;
pub mod config;
pub mod consensus;
pub mod embed;
pub mod error;
pub mod eval;
pub mod evidence;
pub mod grounding;
pub mod guardrails;
pub mod index;
pub mod llm;
pub mod pipeline;
pub mod rerank;
pub mod retrieve;
pub mod text;
