pub mod cli;
pub mod coerce;
pub mod columns;
pub mod config;
pub mod data;
pub mod error;
pub mod infer;
pub mod input;
pub mod io_utils;
pub mod jobs;
pub mod pipeline;
pub mod probe;
pub mod reconcile;
pub mod schema;
pub mod sql;
pub mod store;
pub mod table;
pub mod upsert;

use std::{env, sync::OnceLock};

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, info};

use crate::{
    cli::{Cli, Commands, IngestArgs},
    config::DbConfig,
    jobs::JobSpec,
    pipeline::RunReport,
    store::PgStore,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("site_ingest", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Sites(args) => ingest(&JobSpec::sites(), &args),
        Commands::Swo(args) => ingest(&JobSpec::swo(), &args),
        Commands::Trb(args) => ingest(&JobSpec::trb(), &args),
        Commands::Job(args) => {
            let job = JobSpec::load(&args.definition)?;
            ingest(&job, &args.ingest)
        }
        Commands::Probe(args) => {
            let job = args.job_spec()?;
            probe::execute(&job, &args.source.to_options(&args.input))
        }
    }
}

/// One job, one file, one transaction.
fn ingest(job: &JobSpec, args: &IngestArgs) -> Result<()> {
    let options = args.to_options();
    let config = DbConfig::from_env()?;
    let prepared = pipeline::prepare(job, &options)?;

    let mut client = config.connect()?;
    let tx = client
        .transaction()
        .context("Opening ingestion transaction")?;
    let mut store = PgStore::new(tx);
    let report = match pipeline::execute(&mut store, prepared, &options) {
        Ok(report) => report,
        Err(err) => {
            store.rollback()?;
            return Err(err);
        }
    };
    store.commit()?;
    log_summary(&report);
    Ok(())
}

fn log_summary(report: &RunReport) {
    let mut parts = vec![format!("{} row(s) upserted", report.upsert.rows)];
    if report.pruned > 0 {
        parts.push(format!("{} orphan row(s) skipped", report.pruned));
    }
    if report.upsert.duplicates > 0 {
        parts.push(format!("{} duplicate key(s) collapsed", report.upsert.duplicates));
    }
    if let Some(reconcile) = &report.reconcile {
        if reconcile.created {
            parts.push("table created".to_string());
        }
        if !reconcile.added_columns.is_empty() {
            parts.push(format!("{} column(s) added", reconcile.added_columns.len()));
        }
        if !reconcile.degraded.is_empty() {
            parts.push(format!("{} degraded feature(s)", reconcile.degraded.len()));
        }
    }
    info!(
        "Committed {} from {} source row(s): {}",
        report.table,
        report.source_rows,
        parts.join(", ")
    );
}
