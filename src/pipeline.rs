//! Ingestion run orchestration.
//!
//! Load, normalize, validate required columns, profile and coerce, then
//! optionally prune orphan foreign keys, reconcile the destination table and
//! upsert. Everything up to coercion runs without a database ([`prepare`]);
//! [`run`] continues against a [`TargetStore`] whose transaction the caller
//! commits only when the whole run succeeded.

use std::{
    collections::{BTreeSet, HashSet},
    path::PathBuf,
};

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};

use crate::{
    coerce::{Coercion, Strictness, coerce_cell},
    columns::{self, ColumnMapping, HeaderDictionary},
    data::{Cell, CoercedTable, Value},
    error::IngestError,
    infer,
    input::{self, LoadOptions, SheetSelector, SourceTable},
    jobs::{ColumnSet, Derivation, JobSpec},
    reconcile::{self, ReconcileReport},
    schema::{ColumnDef, SchemaRegistry, SqlType, TableDef, TableName},
    store::TargetStore,
    upsert::{self, DEFAULT_BATCH_SIZE, UpsertReport},
};

/// Per-invocation settings shared by every ingestion job.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub input: PathBuf,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub sheet: Option<SheetSelector>,
    pub colmap: Option<PathBuf>,
    pub ensure_schema: bool,
    pub chunksize: usize,
    pub skip_missing_sites: bool,
    pub strictness: Option<Strictness>,
    pub delimiter: Option<u8>,
    pub encoding: Option<String>,
}

impl RunOptions {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            schema: None,
            table: None,
            sheet: None,
            colmap: None,
            ensure_schema: false,
            chunksize: DEFAULT_BATCH_SIZE,
            skip_missing_sites: false,
            strictness: None,
            delimiter: None,
            encoding: None,
        }
    }
}

/// How one written column is typed and coerced.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnProfile {
    /// Position in the source header row; `None` for derived columns.
    pub position: Option<usize>,
    pub source: String,
    pub canonical: String,
    pub sql_type: SqlType,
    pub coercion: Coercion,
    pub strictness: Strictness,
    /// Type pinned by the job rather than inferred.
    pub declared: bool,
    pub non_missing: usize,
    pub sample: Option<String>,
}

/// Result of the database-free half of a run.
#[derive(Debug, Clone)]
pub struct Prepared {
    /// Job with destination and sheet overrides applied.
    pub job: JobSpec,
    pub sheet: Option<String>,
    pub source_rows: usize,
    pub mapping: ColumnMapping,
    pub profiles: Vec<ColumnProfile>,
    pub data: CoercedTable,
    pub derived: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub table: TableName,
    pub source_rows: usize,
    pub pruned: usize,
    pub reconcile: Option<ReconcileReport>,
    pub upsert: UpsertReport,
}

/// Applies `--schema`, `--table` and `--sheet` overrides.
fn resolve_job(job: &JobSpec, options: &RunOptions) -> Result<JobSpec> {
    if options.chunksize == 0 {
        return Err(IngestError::InvalidOption("--chunksize must be at least 1".into()).into());
    }
    if options.skip_missing_sites && job.foreign_key.is_none() {
        return Err(IngestError::InvalidOption(format!(
            "--skip-missing-sites needs a job with a foreign key; '{}' has none",
            job.name
        ))
        .into());
    }
    let mut resolved = job.clone();
    if let Some(schema) = options.schema.as_deref().filter(|s| !s.trim().is_empty()) {
        resolved.table.schema = schema.to_string();
    }
    if let Some(table) = options.table.as_deref().filter(|t| !t.trim().is_empty()) {
        resolved.table.name = table.to_string();
    }
    if let Some(sheet) = &options.sheet {
        resolved.sheet = sheet.clone();
    }
    Ok(resolved)
}

fn dictionary(job: &JobSpec, options: &RunOptions) -> Result<HeaderDictionary> {
    match &options.colmap {
        Some(path) => {
            let overrides = HeaderDictionary::load(path)?;
            debug!("Loaded {} column map override(s) from {path:?}", overrides.len());
            Ok(job.dictionary.merged_with(&overrides))
        }
        None => Ok(job.dictionary.clone()),
    }
}

/// Fails with every absent required column at once.
pub fn validate_required(job: &JobSpec, mapping: &ColumnMapping) -> Result<(), IngestError> {
    let missing = job
        .required_columns()
        .into_iter()
        .filter(|column| !mapping.contains(column))
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(IngestError::MissingColumns { columns: missing })
    }
}

fn profile_columns(
    job: &JobSpec,
    options: &RunOptions,
    source: &SourceTable,
    mapping: &ColumnMapping,
) -> Vec<ColumnProfile> {
    let mut profiles = Vec::new();
    let mut dropped = Vec::new();
    for (position, entry) in mapping.entries().iter().enumerate() {
        let declared = job.declared(&entry.canonical);
        let keep = match job.column_set {
            ColumnSet::Declared => declared.is_some(),
            ColumnSet::Open => !entry.canonical.is_empty(),
        };
        if !keep {
            dropped.push(entry.source.clone());
            continue;
        }
        let profile = match declared {
            Some(column) => {
                infer::TypeProfile::new(column.sql_type.clone(), column.sql_type.coercion())
            }
            None => infer::infer(source.column(position)),
        };
        let mut present = source.column(position).filter(|cell| !cell.is_missing());
        let sample = present.next().map(|cell| cell.as_display());
        let non_missing = usize::from(sample.is_some()) + present.count();
        profiles.push(ColumnProfile {
            position: Some(position),
            source: entry.source.clone(),
            canonical: entry.canonical.clone(),
            sql_type: profile.sql_type,
            coercion: profile.coercion,
            strictness: job.strictness_for(&entry.canonical, options.strictness),
            declared: declared.is_some(),
            non_missing,
            sample,
        });
    }
    if !dropped.is_empty() {
        match job.column_set {
            ColumnSet::Declared => debug!(
                "Ignoring {} column(s) outside the declared set: {}",
                dropped.len(),
                dropped.join(", ")
            ),
            ColumnSet::Open => warn!(
                "Ignoring {} column(s) whose header normalizes to nothing: {}",
                dropped.len(),
                dropped.join(", ")
            ),
        }
    }
    for profile in &profiles {
        debug!(
            "Column {} <- {:?}: {} via {} ({})",
            profile.canonical, profile.source, profile.sql_type, profile.coercion, profile.strictness
        );
    }
    profiles
}

/// Coerces every kept column; a strict rejection aborts with its row number.
pub fn coerce_rows(source: &SourceTable, profiles: &[ColumnProfile]) -> Result<CoercedTable> {
    let mut rows = Vec::with_capacity(source.len());
    for row in &source.rows {
        let mut values = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let Some(position) = profile.position else {
                values.push(Value::Null);
                continue;
            };
            let cell = row.cells.get(position).cloned().unwrap_or(Cell::Missing);
            let value = coerce_cell(profile.coercion, profile.strictness, &cell).map_err(|err| {
                IngestError::Coercion {
                    column: profile.canonical.clone(),
                    row: row.number,
                    value: cell.as_display(),
                    reason: err.to_string(),
                }
            })?;
            values.push(value);
        }
        rows.push(values);
    }
    Ok(CoercedTable {
        columns: profiles.iter().map(|p| p.canonical.clone()).collect(),
        rows,
    })
}

/// Fills pipeline-computed columns; returns the names it wrote.
fn apply_derivations(
    job: &JobSpec,
    profiles: &mut Vec<ColumnProfile>,
    data: &mut CoercedTable,
) -> Vec<String> {
    let mut written = Vec::new();
    for derivation in &job.derived {
        match derivation {
            Derivation::SecondsOf { source, target } => {
                let Some(from) = data.column_index(source) else {
                    continue;
                };
                let to = match data.column_index(target) {
                    Some(idx) => idx,
                    None => {
                        data.columns.push(target.clone());
                        for row in &mut data.rows {
                            row.push(Value::Null);
                        }
                        let sql_type = job
                            .declared(target)
                            .map(|c| c.sql_type.clone())
                            .unwrap_or(SqlType::Integer);
                        profiles.push(ColumnProfile {
                            position: None,
                            source: format!("seconds of {source}"),
                            canonical: target.clone(),
                            coercion: sql_type.coercion(),
                            sql_type,
                            strictness: Strictness::Lenient,
                            declared: true,
                            non_missing: 0,
                            sample: None,
                        });
                        data.columns.len() - 1
                    }
                };
                let mut filled = 0usize;
                for row in &mut data.rows {
                    if let Some(&Value::Interval(seconds)) = row.get(from) {
                        row[to] = Value::Int(seconds);
                        filled += 1;
                    }
                }
                if let Some(profile) = profiles.iter_mut().find(|p| &p.canonical == target) {
                    profile.non_missing = filled;
                }
                written.push(target.clone());
            }
        }
    }
    written
}

/// Load through coercion; no database involved.
pub fn prepare(job: &JobSpec, options: &RunOptions) -> Result<Prepared> {
    let job = resolve_job(job, options)?;
    let load_options = LoadOptions {
        sheet: job.sheet.clone(),
        delimiter: options.delimiter,
        encoding: options.encoding.clone(),
    };
    let source = input::load(&options.input, &load_options)
        .with_context(|| format!("Loading {:?}", options.input))?;
    info!(
        "Loaded {} row(s) and {} column(s) from {:?}{}",
        source.len(),
        source.headers.len(),
        options.input,
        source
            .sheet
            .as_deref()
            .map(|s| format!(" (sheet '{s}')"))
            .unwrap_or_default()
    );

    let dictionary = dictionary(&job, options)?;
    let mapping = columns::normalize(&source.headers, &dictionary);
    debug!("Normalized headers: {}", mapping.canonical_names().join(", "));
    validate_required(&job, &mapping)?;

    let mut profiles = profile_columns(&job, options, &source, &mapping);
    let mut data = coerce_rows(&source, &profiles)?;
    let derived = apply_derivations(&job, &mut profiles, &mut data);

    Ok(Prepared {
        sheet: source.sheet.clone(),
        source_rows: source.len(),
        job,
        mapping,
        profiles,
        data,
        derived,
    })
}

/// Destination definition used when the table has to be created or
/// extended.
pub fn table_def(job: &JobSpec, profiles: &[ColumnProfile]) -> TableDef {
    let columns = match job.column_set {
        ColumnSet::Declared => job.columns.iter().map(|c| c.to_column_def()).collect(),
        ColumnSet::Open => {
            let mut columns = profiles
                .iter()
                .map(|profile| match job.declared(&profile.canonical) {
                    Some(declared) => declared.to_column_def(),
                    None => ColumnDef::new(profile.canonical.clone(), profile.sql_type.clone()),
                })
                .collect::<Vec<_>>();
            for declared in &job.columns {
                if !columns.iter().any(|c| c.name == declared.name) {
                    columns.push(declared.to_column_def());
                }
            }
            columns
        }
    };
    TableDef {
        table: job.table.clone(),
        columns,
        primary_key: job.conflict_column.clone(),
        foreign_key: job.foreign_key.clone(),
        checks: job.checks.clone(),
        fallback_checks: job
            .columns
            .iter()
            .filter_map(|c| c.fallback_check.clone())
            .collect(),
        indexes: job.index_defs(),
    }
}

/// Removes rows whose foreign key value is absent from the referenced table.
pub fn prune_orphans(
    store: &mut dyn TargetStore,
    registry: &mut SchemaRegistry,
    job: &JobSpec,
    data: &mut CoercedTable,
) -> Result<usize> {
    let fk = job
        .foreign_key
        .as_ref()
        .ok_or_else(|| anyhow!("Job '{}' has no foreign key to check", job.name))?;
    let position = data
        .column_index(&fk.column)
        .ok_or_else(|| anyhow!("Foreign key column {} is not part of the input", fk.column))?;
    let known: HashSet<String> = match registry.describe(store, &fk.references)? {
        Some(_) => store.fetch_keys(&fk.references, &fk.referenced_column)?,
        None => {
            warn!(
                "Referenced table {} does not exist; every row counts as orphaned",
                fk.references
            );
            HashSet::new()
        }
    };
    let before = data.rows.len();
    data.rows.retain(|row| {
        row.get(position)
            .and_then(Value::key_text)
            .is_some_and(|key| known.contains(&key))
    });
    let pruned = before - data.rows.len();
    if pruned > 0 {
        info!(
            "Dropped {pruned} row(s) whose {} has no match in {}({})",
            fk.column, fk.references, fk.referenced_column
        );
    }
    Ok(pruned)
}

/// Full run against `store`. Nothing is committed here.
pub fn run(store: &mut dyn TargetStore, job: &JobSpec, options: &RunOptions) -> Result<RunReport> {
    let prepared = prepare(job, options)?;
    execute(store, prepared, options)
}

/// Database half of a run: prune, reconcile, upsert.
pub fn execute(
    store: &mut dyn TargetStore,
    prepared: Prepared,
    options: &RunOptions,
) -> Result<RunReport> {
    let Prepared {
        job,
        source_rows,
        profiles,
        mut data,
        derived,
        ..
    } = prepared;
    let mut registry = SchemaRegistry::new();

    let pruned = if options.skip_missing_sites {
        prune_orphans(store, &mut registry, &job, &mut data)?
    } else {
        0
    };

    let def = table_def(&job, &profiles);
    let reconcile = if options.ensure_schema {
        let report = reconcile::ensure(store, &mut registry, &def, &data.columns)?;
        info!("Ensured schema of {}", def.table);
        Some(report)
    } else {
        let live = registry.describe(store, &def.table)?;
        if let Some(live) = &live {
            for column in &derived {
                if !live.has_column(column) && data.remove_column(column) {
                    debug!("{} has no {column} column; not writing it", def.table);
                }
            }
        }
        reconcile::verify(&def, &data.columns, live.as_ref())?;
        None
    };

    let live = registry
        .describe(store, &def.table)?
        .ok_or_else(|| anyhow!("Destination {} is missing after reconciliation", def.table))?;
    let upsert = upsert::upsert(
        store,
        &live,
        &job.conflict_column,
        &data,
        options.chunksize,
        &BTreeSet::new(),
    )?;

    Ok(RunReport {
        table: def.table,
        source_rows,
        pruned,
        reconcile,
        upsert,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::SourceRow;

    fn source(headers: &[&str], rows: Vec<Vec<Cell>>) -> SourceTable {
        SourceTable {
            sheet: None,
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .into_iter()
                .enumerate()
                .map(|(idx, cells)| SourceRow {
                    number: idx + 2,
                    cells,
                })
                .collect(),
        }
    }

    #[test]
    fn missing_required_columns_are_listed_together() {
        let job = JobSpec::swo();
        let mapping = columns::normalize(&["Status".to_string()], &job.dictionary);
        match validate_required(&job, &mapping) {
            Err(IngestError::MissingColumns { columns }) => {
                assert_eq!(columns, vec!["swo", "hts_sn_id"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn open_jobs_pin_key_types_and_infer_the_rest() {
        let job = JobSpec::swo();
        let table = source(
            &["SWO", "Site", "Qty"],
            vec![
                vec![Cell::text("W1"), Cell::text("S1"), Cell::text("3")],
                vec![Cell::text("W2"), Cell::text("S2"), Cell::text("4")],
            ],
        );
        let mapping = columns::normalize(&table.headers, &job.dictionary);
        let profiles = profile_columns(&job, &RunOptions::new("x.csv"), &table, &mapping);
        assert_eq!(profiles[1].sql_type, SqlType::Varchar(8));
        assert!(profiles[1].declared);
        assert_eq!(profiles[2].sql_type, SqlType::BigInt);
        assert_eq!(profiles[2].non_missing, 2);
        assert_eq!(profiles[2].sample.as_deref(), Some("3"));

        let def = table_def(&job, &profiles);
        assert_eq!(def.primary_key, "swo");
        assert_eq!(def.column("qty").unwrap().sql_type, SqlType::BigInt);
    }

    #[test]
    fn strict_rejections_carry_row_numbers() {
        let profiles = vec![ColumnProfile {
            position: Some(0),
            source: "Flag".into(),
            canonical: "flag".into(),
            sql_type: SqlType::Boolean,
            coercion: Coercion::Bool,
            strictness: Strictness::Strict,
            declared: true,
            non_missing: 2,
            sample: None,
        }];
        let table = source(&["Flag"], vec![vec![Cell::text("oui")], vec![Cell::text("maybe")]]);
        let err = coerce_rows(&table, &profiles).unwrap_err();
        match err.downcast_ref::<IngestError>() {
            Some(IngestError::Coercion { column, row, value, .. }) => {
                assert_eq!(column, "flag");
                assert_eq!(*row, 3);
                assert_eq!(value, "maybe");
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut lenient = profiles.clone();
        lenient[0].strictness = Strictness::Lenient;
        let coerced = coerce_rows(&table, &lenient).unwrap();
        assert_eq!(coerced.rows, vec![vec![Value::Bool(true)], vec![Value::Null]]);
    }

    #[test]
    fn seconds_derivation_appends_target() {
        let job = JobSpec::sites();
        let mut profiles = Vec::new();
        let mut data = CoercedTable {
            columns: vec!["ert".into()],
            rows: vec![vec![Value::Interval(5400)], vec![Value::Null]],
        };
        let written = apply_derivations(&job, &mut profiles, &mut data);
        assert_eq!(written, vec!["ert_seconds"]);
        assert_eq!(data.columns, vec!["ert", "ert_seconds"]);
        assert_eq!(data.rows[0][1], Value::Int(5400));
        assert_eq!(data.rows[1][1], Value::Null);
        assert_eq!(profiles[0].sql_type, SqlType::Integer);
    }

    #[test]
    fn skip_missing_sites_requires_a_foreign_key() {
        let mut options = RunOptions::new("sites.xlsx");
        options.skip_missing_sites = true;
        let err = resolve_job(&JobSpec::sites(), &options).unwrap_err();
        assert!(err.to_string().contains("--skip-missing-sites"));
    }

    #[test]
    fn destination_overrides_rename_indexes() {
        let mut options = RunOptions::new("sites.xlsx");
        options.schema = Some("staging".into());
        options.table = Some("sites_copy".into());
        let job = resolve_job(&JobSpec::sites(), &options).unwrap();
        let def = table_def(&job, &[]);
        assert_eq!(def.table.to_string(), "staging.sites_copy");
        assert!(def.indexes.iter().any(|idx| idx.name == "sites_copy_geom_gist"));
        assert_eq!(def.fallback_checks.len(), 1);
    }
}
