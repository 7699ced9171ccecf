//! Catalog and configuration loading from disk.

use std::io::Write;
use std::path::Path;

use medcode::catalog::CodeCatalog;
use medcode::config::PipelineConfig;
use medcode::consensus::Method;
use medcode::error::{ConfigError, MedcodeError};
use medcode::pipeline::CodingPipeline;

const JSONL_CATALOG: &str = r#"{"code": "I21.01", "title": "STEMI involving left main coronary artery", "category": "Circulatory", "aliases": ["heart attack"]}
{"code": "R07.9", "title": "Chest pain, unspecified", "category": "Symptoms"}

{"code": "J18.9", "title": "Pneumonia, unspecified organism", "description": "Pneumonia without a named organism", "category": "Respiratory"}
{"code": "r079", "title": "Duplicate row, dropped", "category": "Symptoms"}
"#;

fn write_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn jsonl_catalog_loads_with_canonical_codes() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_file(dir.path(), "codes.jsonl", JSONL_CATALOG);

    let catalog = CodeCatalog::load(&path).unwrap();
    assert_eq!(catalog.len(), 3);

    let stemi = catalog.get("I2101").unwrap();
    assert_eq!(stemi.aliases.len(), 1);
    assert!(stemi.aliases.contains("heart attack"));
    assert_eq!(stemi.description, stemi.title);

    // First occurrence wins for duplicates.
    assert_eq!(catalog.get("R079").unwrap().title, "Chest pain, unspecified");
    assert_eq!(
        catalog.get("J189").unwrap().description,
        "Pneumonia without a named organism"
    );
    assert_eq!(catalog.stats().get("Symptoms"), Some(&1));
}

#[test]
fn json_array_catalog_loads() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_file(
        dir.path(),
        "codes.json",
        r#"[
            {"code": "A00.0", "title": "Cholera due to Vibrio cholerae 01", "category": "Infectious"},
            {"code": "I10", "title": "Essential (primary) hypertension", "category": "Circulatory"}
        ]"#,
    );
    let catalog = CodeCatalog::load(&path).unwrap();
    let codes: Vec<&str> = catalog.iter().map(|i| i.code.as_str()).collect();
    assert_eq!(codes, vec!["A000", "I10"]);
}

#[test]
fn malformed_jsonl_reports_the_line() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_file(
        dir.path(),
        "broken.jsonl",
        "{\"code\": \"I10\", \"title\": \"Hypertension\"}\n{\"code\": \n",
    );
    match CodeCatalog::load(&path).unwrap_err() {
        ConfigError::Parse { message, .. } => assert!(message.starts_with("line 2"), "{message}"),
        other => panic!("expected a parse error, got {other:?}"),
    }
}

#[test]
fn missing_and_empty_catalogs_are_config_errors() {
    let dir = tempfile::TempDir::new().unwrap();
    assert!(matches!(
        CodeCatalog::load(&dir.path().join("absent.jsonl")),
        Err(ConfigError::MissingPath { .. })
    ));

    let empty = write_file(dir.path(), "empty.jsonl", "\n\n");
    assert!(matches!(CodeCatalog::load(&empty), Err(ConfigError::EmptyCatalog)));
}

#[test]
fn pipeline_opens_from_a_config_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let catalog = write_file(dir.path(), "codes.jsonl", JSONL_CATALOG);
    let config = write_file(
        dir.path(),
        "medcode.toml",
        &format!(
            r#"
            [catalog]
            path = '{}'

            [funnel]
            default_top_k = 2

            [admission]
            min_words = 3
            "#,
            catalog.display()
        ),
    );

    let pipeline = CodingPipeline::open(&config).unwrap();
    assert_eq!(pipeline.catalog().len(), 3);
    assert_eq!(pipeline.funnel().default_top_k, 2);

    let response = pipeline
        .predict("acute STEMI heart attack", None, Method::Retrieval)
        .unwrap();
    assert!(response.safety.checks_passed);
    assert_eq!(response.predictions.len(), 2);
    assert_eq!(response.predictions[0].code, "I2101");
}

#[test]
fn invalid_config_values_are_rejected_on_load() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = write_file(
        dir.path(),
        "bad.toml",
        "[ensemble.weights]\nreranker = -0.5\n",
    );
    let err = PipelineConfig::load(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }));
    assert!(err.to_string().contains("ensemble.weights.reranker"));
}

#[test]
fn pipeline_without_a_catalog_path_fails_cleanly() {
    let err = CodingPipeline::from_config(&PipelineConfig::default(), None).unwrap_err();
    assert!(matches!(err, MedcodeError::Config(ConfigError::Invalid { .. })));
}
