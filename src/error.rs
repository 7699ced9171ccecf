//! Diagnostic error types for the medcode pipeline.
//!
//! Three classes of failure exist. Configuration errors are fatal at startup,
//! service errors are recoverable per request (the failing source is dropped
//! from the computation), and validation errors are surfaced to the caller.
//! Guardrail violations are never errors: they travel as data in the response.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the medcode pipeline.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum MedcodeError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("required file not found: {}", path.display())]
    #[diagnostic(
        code(medcode::config::missing_path),
        help(
            "The catalog and configuration files must exist before the pipeline starts. \
             Pass --catalog <file> or set `catalog.path` in the TOML config."
        )
    )]
    MissingPath { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    #[diagnostic(
        code(medcode::config::io),
        help("Check that the file is readable by the current user.")
    )]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", path.display())]
    #[diagnostic(
        code(medcode::config::parse),
        help(
            "Catalogs are JSON arrays or JSON Lines of rows with code, title, description \
             and category fields; configuration files are TOML."
        )
    )]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(medcode::config::invalid),
        help("Fix the named setting; weights must be non-negative and sizes at least 1.")
    )]
    Invalid { message: String },

    #[error("code catalog is empty")]
    #[diagnostic(
        code(medcode::config::empty_catalog),
        help("The catalog must contain at least one row with a non-empty code.")
    )]
    EmptyCatalog,

    #[error("failed to build the search index: {message}")]
    #[diagnostic(
        code(medcode::config::index),
        help(
            "The embedding service must be reachable while the catalog is indexed at startup. \
             Switch `embedding.backend` to \"hashing\" to index offline."
        )
    )]
    IndexBuild { message: String },
}

// ---------------------------------------------------------------------------
// Service errors
// ---------------------------------------------------------------------------

/// An external scoring or generation source could not produce a result.
///
/// Every variant belongs to the "service unavailable" class: callers exclude
/// the source for the current request instead of failing it.
#[derive(Debug, Error, Diagnostic)]
pub enum ServiceError {
    #[error("{service} unavailable: {reason}")]
    #[diagnostic(
        code(medcode::service::unavailable),
        help("The source is skipped for this request. Check that the service is running.")
    )]
    Unavailable { service: String, reason: String },

    #[error("{service} did not answer within {timeout_ms} ms")]
    #[diagnostic(
        code(medcode::service::timeout),
        help("Raise the matching `timeout_ms` setting or check the service's load.")
    )]
    Timeout { service: String, timeout_ms: u64 },

    #[error("{service} returned a malformed response: {message}")]
    #[diagnostic(
        code(medcode::service::malformed),
        help("The service answered but its payload could not be interpreted.")
    )]
    MalformedResponse { service: String, message: String },
}

impl ServiceError {
    pub fn unavailable(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Name of the service that failed.
    pub fn service(&self) -> &str {
        match self {
            Self::Unavailable { service, .. }
            | Self::Timeout { service, .. }
            | Self::MalformedResponse { service, .. } => service,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ValidationError {
    #[error("query is empty")]
    #[diagnostic(
        code(medcode::validation::empty_query),
        help("Provide the clinical note text to code.")
    )]
    EmptyQuery,

    #[error("{name} must be between 1 and {max}, got {value}")]
    #[diagnostic(
        code(medcode::validation::out_of_range),
        help("Ask for at least one result and stay within the configured maximum.")
    )]
    OutOfRange {
        name: &'static str,
        value: usize,
        max: usize,
    },

    #[error("unknown method: \"{method}\"")]
    #[diagnostic(
        code(medcode::validation::unknown_method),
        help("Valid methods: retrieval, classifier, rerank (alias: llm), ensemble.")
    )]
    UnknownMethod { method: String },

    #[error("malformed request: {message}")]
    #[diagnostic(
        code(medcode::validation::malformed_request),
        help("Send a JSON body with a string `query`, an optional positive `top_k` and an optional `method`.")
    )]
    MalformedRequest { message: String },
}

/// Convenience alias for pipeline-level operations.
pub type MedcodeResult<T> = std::result::Result<T, MedcodeError>;

/// Result of a call to an external scoring or generation source.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Result of loading catalogs and configuration.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_to_medcode_error() {
        let err = ConfigError::MissingPath {
            path: PathBuf::from("/nope/catalog.json"),
        };
        let top: MedcodeError = err.into();
        assert!(matches!(
            top,
            MedcodeError::Config(ConfigError::MissingPath { .. })
        ));
    }

    #[test]
    fn service_error_reports_its_service() {
        let err = ServiceError::Timeout {
            service: "classifier".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.service(), "classifier");
        let msg = format!("{err}");
        assert!(msg.contains("250"));
    }

    #[test]
    fn validation_display_is_descriptive() {
        let err = ValidationError::OutOfRange {
            name: "top_k",
            value: 0,
            max: 50,
        };
        let msg = format!("{err}");
        assert!(msg.contains("top_k"));
        assert!(msg.contains("50"));
    }
}
