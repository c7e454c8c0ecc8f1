//! casework - workload simulator for the legal assistant engine
//!
//! Runs a representative caseload twice against one engine instance: a
//! cold pass that exercises the worker pool, then a rephrased warm pass
//! in which most operations resolve from the result cache. Prints the
//! combined pool and cache statistics after each pass.
//!
//! ## Quick Start
//!
//! ```bash
//! # Default simulated caseload
//! casework
//!
//! # Larger pool, persisted cache
//! casework --workers 8 --snapshot /tmp/casework-cache.json
//!
//! # Start from a YAML configuration file
//! casework --config engine.yml
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use tracing::{info, warn};

use casework::{Engine, EngineConfig, Operation, TaskExecutor, logging};

/// CLI arguments for casework
#[derive(Parser, Debug)]
#[command(name = "casework")]
#[command(author, version, about = "Simulates a legal caseload against the engine", long_about = None)]
struct Args {
    /// Engine configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured number of workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Persist the cache to this snapshot path
    #[arg(short, long)]
    snapshot: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_logging(&args.log_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            if std::env::var("CASEWORK_VERBOSE").is_ok() {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.pool.num_workers = workers;
    }
    if let Some(snapshot) = args.snapshot {
        config.cache.snapshot_path = Some(snapshot);
    }

    let engine = Engine::new(SimulatedExecutor, config).await?;
    let caseload = sample_caseload();

    info!(operations = caseload.len(), "starting cold pass");
    run_pass(&engine, caseload.clone()).await;
    report(&engine, "after cold pass").await?;

    info!(operations = caseload.len(), "starting warm pass");
    run_pass(&engine, rephrased(caseload)).await;
    report(&engine, "after warm pass").await?;

    engine.shutdown().await;
    Ok(())
}

async fn run_pass(engine: &Engine<SimulatedExecutor>, operations: Vec<Operation>) {
    let results = engine
        .run_batch(operations, |completed, total| {
            if completed % 8 == 0 || completed == total {
                info!(completed, total, "caseload progress");
            }
        })
        .await;

    let failed = results.iter().filter(|result| result.is_err()).count();
    if failed > 0 {
        warn!(failed, "operations failed during the pass");
    }
}

async fn report(engine: &Engine<SimulatedExecutor>, label: &str) -> Result<()> {
    let stats = engine.statistics().await?;
    println!("--- {label} ---");
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Stand-in executor: sleeps roughly as long as each operation class
/// takes in production and fabricates a plausible result.
struct SimulatedExecutor;

#[async_trait]
impl TaskExecutor for SimulatedExecutor {
    type Payload = Operation;
    type Output = Value;

    async fn execute(&self, operation: Operation) -> Result<Value> {
        let busy = match &operation {
            Operation::ExtractDocument { pages, .. } => {
                Duration::from_millis(u64::from(*pages) * 4)
            }
            Operation::JurisprudenceSearch { .. } => Duration::from_millis(45),
            Operation::ModelCompletion { .. } => Duration::from_millis(70),
            Operation::ValidateFiling { .. } => Duration::from_millis(6),
        };
        tokio::time::sleep(busy).await;

        Ok(match operation {
            Operation::ExtractDocument { document_id, pages } => json!({
                "document_id": document_id,
                "pages": pages,
                "parties": ["arrendador", "arrendatario"],
                "amounts": [{ "concepto": "renta mensual", "importe": 950.0 }],
            }),
            Operation::JurisprudenceSearch { query, jurisdiction } => json!({
                "jurisdiction": jurisdiction,
                "matches": 3,
                "top_reference": format!("STS 423/2023 ({query})"),
            }),
            Operation::ModelCompletion { model, .. } => json!({
                "model": model,
                "analysis": "La clausula examinada es previsiblemente nula por falta de transparencia.",
            }),
            Operation::ValidateFiling { case_type, .. } => json!({
                "case_type": case_type,
                "valid": true,
                "warnings": [],
            }),
        })
    }
}

/// A deterministic mixed workload shaped like a morning at a small firm.
fn sample_caseload() -> Vec<Operation> {
    let mut operations = Vec::new();

    for document in 1u32..=6 {
        operations.push(Operation::ExtractDocument {
            document_id: format!("exp-2023-{document:04}"),
            pages: 8 + document * 3,
        });
    }

    let questions = [
        "nulidad clausula suelo hipoteca consumidor transparencia bancaria",
        "desahucio falta pago arrendamiento vivienda habitual prorroga",
        "despido improcedente indemnizacion antiguedad salario tramitacion",
        "custodia compartida menores convenio regulador modificacion medidas",
        "responsabilidad civil accidente trafico lesiones indemnizacion baremo",
    ];
    for question in questions {
        operations.push(Operation::JurisprudenceSearch {
            query: question.to_string(),
            jurisdiction: "civil".to_string(),
        });
    }

    for matter in ["clausula suelo", "aval solidario", "fianza arrendaticia"] {
        operations.push(Operation::ModelCompletion {
            prompt: format!("Redacta un analisis breve sobre {matter} para el cliente"),
            model: "juriste-1".to_string(),
        });
    }

    for city in ["madrid", "sevilla", "valencia", "bilbao"] {
        operations.push(Operation::ValidateFiling {
            case_type: "desahucio".to_string(),
            fields: json!({ "ciudad": city, "cuantia": 1200, "representacion": "procurador" }),
        });
    }

    operations
}

/// The warm pass: searches come back slightly reworded, everything else
/// repeats verbatim.
fn rephrased(operations: Vec<Operation>) -> Vec<Operation> {
    operations
        .into_iter()
        .map(|operation| match operation {
            Operation::JurisprudenceSearch { query, jurisdiction } => {
                Operation::JurisprudenceSearch {
                    query: format!("{query} reciente"),
                    jurisdiction,
                }
            }
            other => other,
        })
        .collect()
}
