//! Destination table reconciliation.
//!
//! A table is `Absent`, `Incomplete` (exists but lacks written columns, the
//! primary key or the foreign key) or `Complete`. With `--ensure-schema` the
//! reconciler moves it to `Complete`; otherwise [`verify`] only checks that
//! the run can write into it. Optional features (PostGIS, pg_trgm, stored
//! generated columns) degrade with a warning instead of failing the run.

use anyhow::{Result, anyhow};
use log::{info, warn};

use crate::{
    error::IngestError,
    schema::{
        ColumnDef, Extension, GENERATED_COLUMNS_MIN_VERSION, IndexDef, IndexMethod, SchemaRegistry,
        SqlType, TableDef, TableDescriptor, index_name,
    },
    sql::Ddl,
    store::TargetStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableState {
    Absent,
    Incomplete(Gaps),
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gaps {
    pub missing_columns: Vec<String>,
    pub missing_primary_key: bool,
    pub missing_foreign_key: bool,
}

impl Gaps {
    fn is_empty(&self) -> bool {
        self.missing_columns.is_empty() && !self.missing_primary_key && !self.missing_foreign_key
    }
}

/// What the reconciler did, including every degraded fallback taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: bool,
    pub added_columns: Vec<String>,
    pub added_primary_key: bool,
    pub added_foreign_key: bool,
    pub degraded: Vec<String>,
}

impl ReconcileReport {
    fn degrade(&mut self, message: String) {
        warn!("{message}");
        self.degraded.push(message);
    }
}

/// Columns written by the run plus the conflict column.
fn expected_columns<'a>(def: &'a TableDef, written: &'a [String]) -> Vec<&'a str> {
    let mut expected = vec![def.primary_key.as_str()];
    for column in written {
        if !expected.contains(&column.as_str()) {
            expected.push(column.as_str());
        }
    }
    expected
}

pub fn assess(def: &TableDef, written: &[String], live: Option<&TableDescriptor>) -> TableState {
    let Some(live) = live else {
        return TableState::Absent;
    };
    let gaps = Gaps {
        missing_columns: expected_columns(def, written)
            .into_iter()
            .filter(|c| !live.has_column(c))
            .map(str::to_string)
            .collect(),
        missing_primary_key: !live.has_primary_key(),
        missing_foreign_key: def
            .foreign_key_name()
            .is_some_and(|name| !live.has_foreign_key(&name)),
    };
    if gaps.is_empty() {
        TableState::Complete
    } else {
        TableState::Incomplete(gaps)
    }
}

/// Read-only mode: the live table must already hold every written column.
pub fn verify(def: &TableDef, written: &[String], live: Option<&TableDescriptor>) -> Result<()> {
    let Some(live) = live else {
        return Err(IngestError::MissingTable {
            table: def.table.to_string(),
        }
        .into());
    };
    let missing = expected_columns(def, written)
        .into_iter()
        .filter(|c| !live.has_column(c))
        .map(str::to_string)
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(IngestError::TableIncomplete {
            table: def.table.to_string(),
            columns: missing,
        }
        .into());
    }
    Ok(())
}

/// Brings the destination table to the `Complete` state.
pub fn ensure(
    store: &mut dyn TargetStore,
    registry: &mut SchemaRegistry,
    def: &TableDef,
    written: &[String],
) -> Result<ReconcileReport> {
    let live = registry.describe(store, &def.table)?;
    let mut report = ReconcileReport::default();
    match assess(def, written, live.as_ref()) {
        TableState::Complete => {
            info!("Destination {} already satisfies this run", def.table);
            return Ok(report);
        }
        TableState::Absent => create_table(store, def, &mut report)?,
        TableState::Incomplete(gaps) => extend_table(store, def, &gaps, &mut report)?,
    }
    registry.invalidate(&def.table);
    Ok(report)
}

fn generated_supported(store: &mut dyn TargetStore) -> Result<bool> {
    Ok(store.server_version()? >= GENERATED_COLUMNS_MIN_VERSION)
}

fn enable_extension(
    store: &mut dyn TargetStore,
    extension: Extension,
    report: &mut ReconcileReport,
) -> Result<bool> {
    let enabled = store.apply_optional(&Ddl::CreateExtension(extension))?;
    if !enabled {
        report.degrade(format!("Extension {} unavailable", extension.name()));
    }
    Ok(enabled)
}

/// Rewrites `column` for a server lacking a feature it relies on.
fn degrade_column(
    column: &mut ColumnDef,
    postgis: bool,
    generated: bool,
    report: &mut ReconcileReport,
) {
    if column.sql_type == SqlType::Geography && !postgis {
        column.sql_type = SqlType::Text;
        report.degrade(format!("Column {} stored as text without PostGIS", column.name));
    }
    if column.generated.is_some() && !generated {
        column.generated = None;
        report.degrade(format!(
            "Column {} stored as a plain column; server lacks generated columns",
            column.name
        ));
    }
}

fn create_table(
    store: &mut dyn TargetStore,
    def: &TableDef,
    report: &mut ReconcileReport,
) -> Result<()> {
    let generated = generated_supported(store)?;
    let extensions = def.required_extensions();
    let postgis = extensions.contains(Extension::PostGis.name())
        && enable_extension(store, Extension::PostGis, report)?;
    let trigram = extensions.contains(Extension::Trigram.name())
        && enable_extension(store, Extension::Trigram, report)?;

    let mut table = def.clone();
    for column in &mut table.columns {
        degrade_column(column, postgis, generated, report);
    }
    if !generated && def.columns.iter().any(|c| c.generated.is_some()) {
        table.checks.extend(def.fallback_checks.iter().cloned());
    }
    store.apply(&Ddl::CreateTable(table.clone()))?;
    report.created = true;
    info!(
        "Created {} with {} column(s)",
        def.table,
        table.columns.len()
    );

    for index in &table.indexes {
        create_index(store, &table, index, postgis, trigram, report)?;
    }
    if let Some(fk) = &table.foreign_key {
        add_foreign_key(store, &table, fk.column.as_str(), report)?;
    }
    Ok(())
}

fn create_index(
    store: &mut dyn TargetStore,
    table: &TableDef,
    index: &IndexDef,
    postgis: bool,
    trigram: bool,
    report: &mut ReconcileReport,
) -> Result<()> {
    let index = match index.method {
        IndexMethod::Gist if !postgis => {
            report.degrade(format!("Spatial index {} skipped without PostGIS", index.name));
            return Ok(());
        }
        IndexMethod::Trigram if !trigram => {
            let fallback = IndexDef {
                name: index_name(&table.table.name, &index.column, IndexMethod::Lower),
                column: index.column.clone(),
                method: IndexMethod::Lower,
            };
            report.degrade(format!(
                "Fuzzy-text index {} replaced by {}",
                index.name, fallback.name
            ));
            fallback
        }
        _ => index.clone(),
    };
    let created = store.apply_optional(&Ddl::CreateIndex {
        table: table.table.clone(),
        index: index.clone(),
    })?;
    if !created {
        report.degrade(format!("Index {} could not be created", index.name));
    }
    Ok(())
}

fn add_foreign_key(
    store: &mut dyn TargetStore,
    table: &TableDef,
    column: &str,
    report: &mut ReconcileReport,
) -> Result<()> {
    let (Some(name), Some(index), Some(foreign_key)) = (
        table.foreign_key_name(),
        table.foreign_key_index(),
        table.foreign_key.clone(),
    ) else {
        return Err(anyhow!("{} declares no foreign key on {column}", table.table));
    };
    if !store.apply_optional(&Ddl::CreateIndex {
        table: table.table.clone(),
        index: index.clone(),
    })? {
        report.degrade(format!("Index {} could not be created", index.name));
    }
    store.apply(&Ddl::AddForeignKey {
        table: table.table.clone(),
        name: name.clone(),
        foreign_key,
    })?;
    report.added_foreign_key = true;
    info!("Added foreign key {name} on {}", table.table);
    Ok(())
}

fn extend_table(
    store: &mut dyn TargetStore,
    def: &TableDef,
    gaps: &Gaps,
    report: &mut ReconcileReport,
) -> Result<()> {
    if !gaps.missing_columns.is_empty() {
        let generated = generated_supported(store)?;
        let needs_postgis = gaps
            .missing_columns
            .iter()
            .filter_map(|name| def.column(name))
            .any(|c| c.sql_type == SqlType::Geography);
        let postgis = needs_postgis && enable_extension(store, Extension::PostGis, report)?;

        for name in &gaps.missing_columns {
            let mut column = def
                .column(name)
                .cloned()
                .ok_or_else(|| anyhow!("No column definition for {name} in {}", def.table))?;
            // Existing rows have no value for the new column.
            column.not_null = false;
            degrade_column(&mut column, postgis, generated, report);
            store.apply(&Ddl::AddColumn {
                table: def.table.clone(),
                column,
            })?;
            report.added_columns.push(name.clone());
        }
        info!(
            "Added {} column(s) to {}: {}",
            report.added_columns.len(),
            def.table,
            report.added_columns.join(", ")
        );
    }
    if gaps.missing_primary_key {
        store.apply(&Ddl::AddPrimaryKey {
            table: def.table.clone(),
            name: def.primary_key_name(),
            column: def.primary_key.clone(),
        })?;
        report.added_primary_key = true;
        info!("Added primary key on {}({})", def.table, def.primary_key);
    }
    if gaps.missing_foreign_key
        && let Some(fk) = &def.foreign_key
    {
        add_foreign_key(store, def, fk.column.as_str(), report)?;
    }
    Ok(())
}
