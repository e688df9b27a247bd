//! Normalizer Service - Cleans reference codes already stored in tb_chart
//!
//! Responsibilities:
//! - Rewrite country names and numeric placeholders to ISO alpha-2 codes
//! - Rewrite IBGE state geocodes to state abbreviations, then apply manual
//!   corrections to whatever is still numeric
//! - Report states that remain unresolved
//!
//! Every pass is safe to re-run.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chart_core::config::DbConfig;
use chart_core::normalize::{CountryTable, StateTable};
use chart_core::passes::{normalize_stored_countries, normalize_stored_states, validate_states};
use chart_core::store::PgChartStore;
use chart_core::telemetry::init_tracing;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "normalizer", about = "Normalizes country and state codes stored in tb_chart")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Print the report as JSON
    #[arg(long, global = true, default_value = "false")]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve country names and numeric placeholders
    Countries {
        /// Replacement country override table (`name,code` CSV with header)
        #[arg(long)]
        overrides: Option<PathBuf>,

        /// Replacement numeric placeholder table (`code,country` CSV with header)
        #[arg(long)]
        numeric: Option<PathBuf>,
    },
    /// Map state geocodes, apply corrections, then validate
    States {
        /// Replacement geocode table (`geocode,state` CSV with header)
        #[arg(long)]
        geocodes: Option<PathBuf>,

        /// Replacement corrections table (`value,state` CSV with header)
        #[arg(long)]
        corrections: Option<PathBuf>,
    },
    /// Only list states that are still numeric or missing
    Validate,
}

fn country_table(overrides: Option<PathBuf>, numeric: Option<PathBuf>) -> Result<CountryTable> {
    let mut table = CountryTable::bundled().context("Failed to load bundled country tables")?;
    if let Some(path) = overrides {
        table = table
            .with_overrides_file(&path)
            .with_context(|| format!("Failed to load country overrides {}", path.display()))?;
    }
    if let Some(path) = numeric {
        table = table
            .with_numeric_file(&path)
            .with_context(|| format!("Failed to load numeric country table {}", path.display()))?;
    }
    Ok(table)
}

fn state_table(geocodes: Option<PathBuf>, corrections: Option<PathBuf>) -> Result<StateTable> {
    let mut table = StateTable::bundled().context("Failed to load bundled state tables")?;
    if let Some(path) = geocodes {
        table = table
            .with_geocodes_file(&path)
            .with_context(|| format!("Failed to load geocodes {}", path.display()))?;
    }
    if let Some(path) = corrections {
        table = table
            .with_corrections_file(&path)
            .with_context(|| format!("Failed to load state corrections {}", path.display()))?;
    }
    Ok(table)
}

fn print_report<T: Serialize + std::fmt::Display>(report: &T, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("\n{}", report);
    }
    Ok(())
}

async fn run(store: &mut PgChartStore, command: Command, json: bool) -> Result<()> {
    match command {
        Command::Countries { overrides, numeric } => {
            let table = country_table(overrides, numeric)?;
            let report = normalize_stored_countries(store, &table, Utc::now())
                .await
                .context("Country pass failed")?;
            print_report(&report, json)
        }
        Command::States {
            geocodes,
            corrections,
        } => {
            let table = state_table(geocodes, corrections)?;
            let report = normalize_stored_states(store, &table)
                .await
                .context("State pass failed")?;
            print_report(&report, json)
        }
        Command::Validate => {
            let report = validate_states(store)
                .await
                .context("State validation failed")?;
            print_report(&report, json)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing("normalizer=info,chart_core=info").context("Failed to initialize tracing")?;

    let config = DbConfig::from_env().context("Invalid database configuration")?;

    if !args.json {
        println!("=== tb_chart Normalizer ===");
        println!("Database: {}", config.describe());
    }

    let mut store = PgChartStore::connect(&config)
        .await
        .context("Failed to connect to database")?;

    info!(command = ?args.command, "starting pass");
    let result = run(&mut store, args.command, args.json).await;
    store.close().await;
    result
}
