use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{
    coerce::Strictness,
    input::SheetSelector,
    jobs::JobSpec,
    pipeline::RunOptions,
    upsert::DEFAULT_BATCH_SIZE,
};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Load telecom site spreadsheets into PostgreSQL, idempotently",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Ingest the sites export into the primary entity table
    Sites(IngestArgs),
    /// Ingest a service work order (SWO) export
    Swo(IngestArgs),
    /// Ingest a trouble ticket (TRB) export
    Trb(IngestArgs),
    /// Ingest a dependent table described by a YAML job definition
    Job(JobArgs),
    /// Load, normalize and coerce a file without touching the database
    Probe(ProbeArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BuiltinJob {
    Sites,
    Swo,
    Trb,
}

impl BuiltinJob {
    pub fn spec(self) -> JobSpec {
        match self {
            BuiltinJob::Sites => JobSpec::sites(),
            BuiltinJob::Swo => JobSpec::swo(),
            BuiltinJob::Trb => JobSpec::trb(),
        }
    }
}

/// Input and coercion flags shared by ingestion and probing.
#[derive(Debug, Clone, Args)]
pub struct SourceArgs {
    /// Destination schema (defaults to the job's schema, normally public)
    #[arg(long)]
    pub schema: Option<String>,
    /// Destination table (defaults to the job's table)
    #[arg(long)]
    pub table: Option<String>,
    /// Sheet name, or 0-based sheet index when numeric
    #[arg(long)]
    pub sheet: Option<SheetSelector>,
    /// JSON object mapping source headers to column names
    #[arg(long)]
    pub colmap: Option<PathBuf>,
    /// Override the job's coercion policy for columns without their own
    #[arg(long, value_enum)]
    pub strictness: Option<Strictness>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of CSV input (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

impl SourceArgs {
    pub fn to_options(&self, input: &Path) -> RunOptions {
        let mut options = RunOptions::new(input);
        options.schema = self.schema.clone();
        options.table = self.table.clone();
        options.sheet = self.sheet.clone();
        options.colmap = self.colmap.clone();
        options.strictness = self.strictness;
        options.delimiter = self.delimiter;
        options.encoding = self.input_encoding.clone();
        options
    }
}

#[derive(Debug, Clone, Args)]
pub struct IngestArgs {
    /// Spreadsheet (.xlsx/.xls/.ods) or CSV export to ingest
    pub input: PathBuf,
    #[command(flatten)]
    pub source: SourceArgs,
    /// Create the table or add missing columns and constraints
    #[arg(long = "ensure-schema")]
    pub ensure_schema: bool,
    /// Rows per upsert statement
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE, value_parser = parse_chunksize)]
    pub chunksize: usize,
    /// Drop rows whose site reference does not exist instead of failing
    #[arg(long = "skip-missing-sites")]
    pub skip_missing_sites: bool,
}

impl IngestArgs {
    pub fn to_options(&self) -> RunOptions {
        let mut options = self.source.to_options(&self.input);
        options.ensure_schema = self.ensure_schema;
        options.chunksize = self.chunksize;
        options.skip_missing_sites = self.skip_missing_sites;
        options
    }
}

#[derive(Debug, Clone, Args)]
pub struct JobArgs {
    /// YAML job definition
    #[arg(long)]
    pub definition: PathBuf,
    #[command(flatten)]
    pub ingest: IngestArgs,
}

#[derive(Debug, Clone, Args)]
pub struct ProbeArgs {
    /// Spreadsheet or CSV export to inspect
    pub input: PathBuf,
    /// Built-in job whose rules apply
    #[arg(long, value_enum, conflicts_with = "definition")]
    pub job: Option<BuiltinJob>,
    /// YAML job definition whose rules apply
    #[arg(long)]
    pub definition: Option<PathBuf>,
    #[command(flatten)]
    pub source: SourceArgs,
}

impl ProbeArgs {
    pub fn job_spec(&self) -> Result<JobSpec> {
        match (&self.job, &self.definition) {
            (Some(job), _) => Ok(job.spec()),
            (None, Some(path)) => JobSpec::load(path),
            (None, None) => Err(anyhow!(
                "Pass --job or --definition to choose the rules to probe with"
            )),
        }
    }
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\\t" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "pipe" | "|" => Ok(b'|'),
        "semicolon" | ";" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}

pub fn parse_chunksize(value: &str) -> Result<usize, String> {
    match value.trim().parse::<usize>() {
        Ok(0) => Err("Chunk size must be at least 1".to_string()),
        Ok(size) => Ok(size),
        Err(_) => Err(format!("'{value}' is not a row count")),
    }
}
