//! medcode CLI: diagnosis-code recommendation for clinical notes.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use medcode::catalog::CodeCatalog;
use medcode::config::PipelineConfig;
use medcode::consensus::Method;
use medcode::eval;
use medcode::guardrails::GuardrailsEngine;
use medcode::pipeline::{CodingPipeline, FinalResponse};

#[derive(Parser)]
#[command(name = "medcode", version, about = "Diagnosis-code recommendation for clinical notes")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Code catalog (JSON array or JSON Lines); overrides `catalog.path`.
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recommend codes for a clinical note.
    Predict {
        /// Note text.
        note: String,

        /// retrieval, classifier, rerank (alias: llm) or ensemble.
        #[arg(long, default_value = "ensemble")]
        method: Method,

        /// Number of codes to return (defaults to `funnel.default_top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run the coding-policy guardrails over a code set.
    Check {
        /// Codes to check, e.g. I21.01 R07.9.
        #[arg(required = true)]
        codes: Vec<String>,
    },

    /// Score the pipeline against labeled notes.
    Evaluate {
        /// JSON Lines file of {"note", "codes"} cases.
        cases: PathBuf,

        #[arg(long, default_value = "ensemble")]
        method: Method,

        /// Cutoff for the @k metrics.
        #[arg(long, default_value = "5")]
        k: usize,
    },

    /// Inspect the code catalog.
    Catalog {
        #[command(subcommand)]
        action: CatalogAction,
    },
}

#[derive(Subcommand)]
enum CatalogAction {
    /// Entry counts per category.
    Stats,
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(path) = &cli.catalog {
        config.catalog.path = Some(path.clone());
    }
    Ok(config)
}

fn load_catalog(config: &PipelineConfig) -> Result<CodeCatalog> {
    let path = config.catalog.path.as_deref().ok_or_else(|| {
        miette::miette!(
            help = "Pass --catalog <file> or set `catalog.path` in the config file.",
            "no code catalog configured"
        )
    })?;
    Ok(CodeCatalog::load(path)?)
}

fn print_response(response: &FinalResponse) {
    if let Some(reason) = &response.safety.reason {
        println!("No predictions: {reason}");
        println!("\n{}", response.safety.disclaimer);
        return;
    }

    println!("Codes ({} via {}):", response.predictions.len(), response.method);
    for (i, p) in response.predictions.iter().enumerate() {
        let sources: Vec<&str> = p.sources.iter().map(|s| s.as_str()).collect();
        println!(
            "  {:>2}. {:<8} {:.3}  {}  [{}]",
            i + 1,
            p.code,
            p.score,
            p.title,
            sources.join("+")
        );
    }
    if !response.degraded.is_empty() {
        println!("\nDegraded sources:");
        for d in &response.degraded {
            println!("  {}: {}", d.source, d.reason);
        }
    }
    if !response.warnings.is_empty() {
        println!("\nWarnings:");
        for w in &response.warnings {
            println!("  {w}");
        }
    }
    println!("\nConfidence: {}%  (model: {})", response.confidence, response.model_used);
    println!("\n{}", response.explanation);
    println!("\n{}  [{} ms]", response.safety.disclaimer, response.latency_ms);
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("medcode=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Predict {
            ref note,
            method,
            top_k,
            json,
        } => {
            let catalog = load_catalog(&config)?;
            let pipeline = CodingPipeline::from_config(&config, Some(Arc::new(catalog)))?;
            let response = pipeline.predict(note, top_k, method)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response).into_diagnostic()?);
            } else {
                print_response(&response);
            }
        }

        Commands::Check { ref codes } => {
            let engine = GuardrailsEngine::new(&config.guardrails);
            // Titles feed the specificity rule; without a catalog it is skipped.
            let catalog = match config.catalog.path {
                Some(_) => Some(load_catalog(&config)?),
                None => None,
            };
            let titles: Vec<String> = codes
                .iter()
                .map(|code| {
                    catalog
                        .as_ref()
                        .and_then(|c| c.get(code))
                        .map(|item| item.title.clone())
                        .unwrap_or_default()
                })
                .collect();
            let result = engine.check("", codes, &titles);
            println!("{}", serde_json::to_string_pretty(&result).into_diagnostic()?);
            if !result.is_valid {
                std::process::exit(1);
            }
        }

        Commands::Evaluate {
            ref cases,
            method,
            k,
        } => {
            let catalog = load_catalog(&config)?;
            let pipeline = CodingPipeline::from_config(&config, Some(Arc::new(catalog)))?;
            let cases = eval::load_cases(cases)?;
            let report = eval::evaluate(&pipeline, &cases, method, k)?;
            println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);
        }

        Commands::Catalog {
            action: CatalogAction::Stats,
        } => {
            let catalog = load_catalog(&config)?;
            println!("Codes: {}", catalog.len());
            for (category, count) in catalog.stats() {
                println!("  {category:<40} {count}");
            }
        }
    }

    Ok(())
}
