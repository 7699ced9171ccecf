//! medcode HTTP server.
//!
//! - `GET  /health` : status and catalog size
//! - `POST /predict` : `{query, top_k?, method?}` → full coding response
//!
//! Configuration comes from the TOML file named by `MEDCODE_CONFIG` (an empty
//! default config otherwise) and `MEDCODE_CATALOG` overrides `catalog.path`.
//! Bind address from `MEDCODE_BIND` / `MEDCODE_PORT`.
//!
//! Build and run: `cargo run --features server --bin medcode-server`

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use medcode::config::PipelineConfig;
use medcode::consensus::Method;
use medcode::error::{MedcodeError, ValidationError};
use medcode::pipeline::CodingPipeline;

// ── Request/response types ────────────────────────────────────────────────

#[derive(Deserialize)]
struct PredictRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    catalog_size: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

fn error_response(status: StatusCode, err: &MedcodeError) -> Response {
    use miette::Diagnostic;
    let body = ErrorResponse {
        error: err.to_string(),
        code: err.code().map(|c| c.to_string()),
    };
    (status, Json(body)).into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(pipeline): State<Arc<CodingPipeline>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        catalog_size: pipeline.catalog().len(),
    })
}

async fn predict(
    State(pipeline): State<Arc<CodingPipeline>>,
    body: Result<Json<PredictRequest>, JsonRejection>,
) -> Response {
    // Missing fields and wrong types are client errors, reported as 400.
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => {
            let err = ValidationError::MalformedRequest {
                message: rejection.body_text(),
            };
            return error_response(StatusCode::BAD_REQUEST, &MedcodeError::from(err));
        }
    };
    let method = match req.method.as_deref() {
        None => Method::default(),
        Some(raw) => match raw.parse::<Method>() {
            Ok(m) => m,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, &MedcodeError::from(e)),
        },
    };

    // The pipeline blocks on embedding and model calls.
    let joined = tokio::task::spawn_blocking(move || pipeline.predict(&req.query, req.top_k, method)).await;
    match joined {
        Ok(Ok(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(Err(e @ MedcodeError::Validation(_))) => error_response(StatusCode::BAD_REQUEST, &e),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "prediction failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, &e)
        }
        Err(e) => {
            tracing::error!(error = %e, "prediction task panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "internal error".to_string(),
                    code: None,
                }),
            )
                .into_response()
        }
    }
}

// ── Main ──────────────────────────────────────────────────────────────────

fn load_pipeline() -> Result<CodingPipeline, MedcodeError> {
    let mut config = match std::env::var_os("MEDCODE_CONFIG") {
        Some(path) => PipelineConfig::load(&PathBuf::from(path))?,
        None => PipelineConfig::default(),
    };
    if let Some(path) = std::env::var_os("MEDCODE_CATALOG") {
        config.catalog.path = Some(PathBuf::from(path));
    }
    CodingPipeline::from_config(&config, None)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("medcode=info,hnsw_rs=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let bind = std::env::var("MEDCODE_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("MEDCODE_PORT").unwrap_or_else(|_| "8000".to_string());
    let addr = format!("{bind}:{port}");

    // Indexing the catalog is CPU-bound; keep it off the async workers.
    let pipeline = match tokio::task::spawn_blocking(load_pipeline).await {
        Ok(Ok(pipeline)) => Arc::new(pipeline),
        Ok(Err(e)) => {
            eprintln!("{:?}", miette::Report::new(e));
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("pipeline startup panicked: {e}");
            std::process::exit(1);
        }
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/predict", post(predict))
        .layer(CorsLayer::permissive())
        .with_state(pipeline);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!("medcode server listening on {addr}");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}
