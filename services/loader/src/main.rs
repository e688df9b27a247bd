//! Loader Service - Loads one indicator CSV into tb_chart
//!
//! Responsibilities:
//! - Read the file (UTF-8 or Windows-1252) and parse it with its family layout
//! - Resolve country names and state geocodes to canonical codes
//! - Insert new natural keys, update the value of known ones, in batches
//! - Report counts, unresolved names and a sample of the loaded rows
//!
//! Loading the same file twice leaves tb_chart unchanged apart from
//! `updated_at`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chart_core::config::{DbConfig, DEFAULT_BATCH_SIZE};
use chart_core::ingest::{ingest, IngestOptions};
use chart_core::normalize::{CountryTable, StateTable};
use chart_core::report::SAMPLE_SIZE;
use chart_core::source::Family;
use chart_core::store::{ChartStore, MemoryChartStore, PgChartStore};
use chart_core::telemetry::init_tracing;
use chart_core::{IngestError, Normalizer, RunSummary};
use clap::Parser;
use tokio::fs;
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads an indicator CSV into tb_chart")]
struct Args {
    /// CSV file to load
    file: PathBuf,

    /// Indicator family (gee-ocde, area-agricola-ocde, gee-agropecuaria,
    /// amonia-agro, npk-deposicao, npk-producao)
    #[arg(long, short)]
    family: Family,

    /// Provenance label stored in `source` (defaults per family)
    #[arg(long)]
    source: Option<String>,

    /// Analysis code stored in `analysis` (defaults per family)
    #[arg(long)]
    analysis: Option<String>,

    /// Field delimiter
    #[arg(long, default_value = ",", value_parser = parse_delimiter)]
    delimiter: u8,

    /// Records per committed batch
    #[arg(long, env = "BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Replacement country override table (`name,code` CSV with header)
    #[arg(long)]
    overrides: Option<PathBuf>,

    /// Replacement geocode table (`geocode,state` CSV with header)
    #[arg(long)]
    geocodes: Option<PathBuf>,

    /// Load into an in-memory table instead of the database
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Print the summary as JSON
    #[arg(long, default_value = "false")]
    json: bool,
}

fn parse_delimiter(s: &str) -> Result<u8, String> {
    match s.as_bytes() {
        [b] if b.is_ascii() => Ok(*b),
        _ if s == "\\t" || s == "tab" => Ok(b'\t'),
        _ => Err(format!("delimiter must be a single ASCII character, got '{}'", s)),
    }
}

fn build_normalizer(overrides: Option<&Path>, geocodes: Option<&Path>) -> Result<Normalizer> {
    let mut countries = CountryTable::bundled().context("Failed to load bundled country tables")?;
    if let Some(path) = overrides {
        countries = countries
            .with_overrides_file(path)
            .with_context(|| format!("Failed to load country overrides {}", path.display()))?;
    }

    let mut states = StateTable::bundled().context("Failed to load bundled state tables")?;
    if let Some(path) = geocodes {
        states = states
            .with_geocodes_file(path)
            .with_context(|| format!("Failed to load geocodes {}", path.display()))?;
    }

    Ok(Normalizer::new(countries, states))
}

/// Runs the load and prints what ended up in the table.
async fn load<S: ChartStore>(
    store: &mut S,
    normalizer: &Normalizer,
    file: &str,
    bytes: &[u8],
    options: &IngestOptions,
    json: bool,
) -> Result<RunSummary> {
    let summary = match ingest(store, normalizer, file, bytes, options).await {
        Ok(summary) => summary,
        Err(e) => {
            if let IngestError::BatchFailed {
                committed_batches, ..
            } = &e
            {
                error!(
                    committed_batches,
                    committed_records = e.committed_records(),
                    "load aborted"
                );
                println!(
                    "\nLoad aborted: {} batch(es), {} record(s) committed before the failure",
                    committed_batches,
                    e.committed_records()
                );
            }
            return Err(e).context("Failed to load file");
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(summary);
    }

    println!("\n{}", summary);

    let total = store.count().await.context("Failed to count tb_chart")?;
    println!("tb_chart rows: {}", total);

    if let Some(first) = summary.sample.first() {
        let rows = store
            .sample(&first.label, SAMPLE_SIZE as i64)
            .await
            .context("Failed to sample tb_chart")?;
        println!("\nStored rows labelled '{}':", first.label);
        for row in &rows {
            println!(
                "  #{} {} | {} | {} | {} | {} (updated {})",
                row.id,
                row.country,
                if row.state.is_empty() { "-" } else { row.state.as_str() },
                row.period,
                row.analysis,
                row.value,
                row.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    Ok(summary)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing("loader=info,chart_core=info").context("Failed to initialize tracing")?;

    let file = args.file.display().to_string();
    if !args.json {
        println!("=== tb_chart Loader ===");
        println!("File: {}", file);
        println!("Family: {}", args.family);
        println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });
    }

    let bytes = fs::read(&args.file)
        .await
        .with_context(|| format!("Failed to read {}", file))?;
    let normalizer = build_normalizer(args.overrides.as_deref(), args.geocodes.as_deref())?;

    let options = IngestOptions {
        family: args.family,
        source: args.source,
        analysis: args.analysis,
        delimiter: args.delimiter,
        batch_size: args.batch_size.max(1),
        dry_run: args.dry_run,
    };

    if args.dry_run {
        let mut store = MemoryChartStore::new();
        load(&mut store, &normalizer, &file, &bytes, &options, args.json).await?;
        return Ok(());
    }

    let config = DbConfig::from_env().context("Invalid database configuration")?;
    let mut store = PgChartStore::connect(&config)
        .await
        .context("Failed to connect to database")?;

    let result = load(&mut store, &normalizer, &file, &bytes, &options, args.json).await;
    store.close().await;
    result.map(|_| ())
}
