#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use rust_xlsxwriter::{Format, Workbook};
use site_ingest::{
    jobs::{JobSpec, SITES_REQUIRED},
    schema::{ColumnInfo, ForeignKeyDef, IndexMethod, SqlType, TableDescriptor, TableName},
    sql::{Ddl, UpsertStatement, bind_type},
    store::TargetStore,
};
use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }

    pub fn write_csv(&self, name: &str, headers: &[&str], rows: &[Vec<String>]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut writer = csv::Writer::from_path(&path).expect("create csv");
        writer.write_record(headers).expect("write headers");
        for row in rows {
            writer.write_record(row).expect("write row");
        }
        writer.flush().expect("flush csv");
        path
    }

    /// Writes a workbook with one worksheet per `(name, rows)` entry; the
    /// first row of each sheet is its header row.
    pub fn write_workbook(&self, name: &str, sheets: &[(&str, Vec<Vec<XlsxCell>>)]) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        let mut workbook = Workbook::new();
        let clock = Format::new().set_num_format("hh:mm:ss");
        let date = Format::new().set_num_format("yyyy-mm-dd hh:mm");
        for (sheet_name, rows) in sheets {
            let sheet = workbook.add_worksheet();
            sheet.set_name(*sheet_name).expect("sheet name");
            for (r, row) in rows.iter().enumerate() {
                for (c, cell) in row.iter().enumerate() {
                    let (r, c) = (r as u32, c as u16);
                    match cell {
                        XlsxCell::Text(text) => {
                            sheet.write_string(r, c, text.as_str()).expect("write string");
                        }
                        XlsxCell::Number(value) => {
                            sheet.write_number(r, c, *value).expect("write number");
                        }
                        XlsxCell::Bool(value) => {
                            sheet.write_boolean(r, c, *value).expect("write bool");
                        }
                        XlsxCell::Clock(fraction) => {
                            sheet
                                .write_number_with_format(r, c, *fraction, &clock)
                                .expect("write clock");
                        }
                        XlsxCell::Serial(serial) => {
                            sheet
                                .write_number_with_format(r, c, *serial, &date)
                                .expect("write date");
                        }
                        XlsxCell::Blank => {}
                    }
                }
            }
        }
        workbook.save(&path).expect("save workbook");
        path
    }
}

#[derive(Debug, Clone)]
pub enum XlsxCell {
    Text(String),
    Number(f64),
    Bool(bool),
    /// Fraction of a day shown as `hh:mm:ss`.
    Clock(f64),
    /// Excel date serial shown as a date.
    Serial(f64),
    Blank,
}

pub fn text(value: &str) -> XlsxCell {
    XlsxCell::Text(value.to_string())
}

pub fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Header row covering every required sites column plus `extra`.
pub fn sites_headers(extra: &[&str]) -> Vec<String> {
    SITES_REQUIRED
        .iter()
        .chain(extra.iter())
        .map(|c| c.to_string())
        .collect()
}

/// One valid sites record for `headers`, keyed on `hts_site_id`.
pub fn sites_row(hts_site_id: &str, headers: &[String]) -> Vec<String> {
    let job = JobSpec::sites();
    headers
        .iter()
        .map(|header| {
            if header == "hts_site_id" {
                return hts_site_id.to_string();
            }
            match header.as_str() {
                "ert" => "01:30:00".to_string(),
                "latitude" => "4,5".to_string(),
                "longitude" => "-3.25".to_string(),
                "site_id" => "S1".to_string(),
                _ => match job.declared(header).map(|c| &c.sql_type) {
                    Some(SqlType::Boolean) => "oui".to_string(),
                    Some(SqlType::Integer) | Some(SqlType::BigInt) => "3".to_string(),
                    Some(SqlType::DoublePrecision) => "1.5".to_string(),
                    Some(SqlType::Interval) => "90m".to_string(),
                    _ => "x".to_string(),
                },
            }
        })
        .collect()
}

/// Live type rendering as `format_type` reports it.
fn live_type(sql_type: &SqlType) -> String {
    match sql_type {
        SqlType::Varchar(len) => format!("character varying({len})"),
        other => other.render(),
    }
}

#[derive(Debug, Clone)]
pub struct MemoryColumn {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub generated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub columns: Vec<MemoryColumn>,
    pub primary_key: Option<String>,
    pub foreign_keys: Vec<(String, ForeignKeyDef)>,
    pub indexes: Vec<String>,
    pub checks: Vec<String>,
    pub rows: Vec<BTreeMap<String, Option<String>>>,
}

impl MemoryTable {
    pub fn column(&self, name: &str) -> Option<&MemoryColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn value(&self, key_column: &str, key: &str, column: &str) -> Option<String> {
        self.rows
            .iter()
            .find(|row| row.get(key_column).cloned().flatten().as_deref() == Some(key))
            .and_then(|row| row.get(column).cloned().flatten())
    }
}

/// In-memory destination enforcing primary key, foreign key, NOT NULL and
/// generated-column rules the way PostgreSQL would.
#[derive(Debug)]
pub struct MemoryStore {
    pub version: u32,
    pub available_extensions: BTreeSet<String>,
    pub extensions: BTreeSet<String>,
    pub tables: BTreeMap<TableName, MemoryTable>,
    pub ddl: Vec<String>,
    pub failed_ddl: Vec<String>,
    pub batches: Vec<usize>,
    pub statements: Vec<UpsertStatement>,
}

impl MemoryStore {
    /// Modern server with PostGIS and pg_trgm installable.
    pub fn new() -> Self {
        Self::with_features(150_000, &["postgis", "pg_trgm"])
    }

    pub fn with_features(version: u32, extensions: &[&str]) -> Self {
        Self {
            version,
            available_extensions: extensions.iter().map(|e| e.to_string()).collect(),
            extensions: BTreeSet::new(),
            tables: BTreeMap::new(),
            ddl: Vec::new(),
            failed_ddl: Vec::new(),
            batches: Vec::new(),
            statements: Vec::new(),
        }
    }

    pub fn table(&self, schema: &str, name: &str) -> &MemoryTable {
        self.tables
            .get(&TableName::new(schema, name))
            .expect("table exists")
    }

    /// Creates a table whose columns are all text, keyed on `key`.
    pub fn seed_table(&mut self, schema: &str, name: &str, key: &str, rows: &[&[(&str, &str)]]) {
        let mut table = MemoryTable {
            primary_key: Some(key.to_string()),
            ..MemoryTable::default()
        };
        let mut names = vec![key.to_string()];
        for row in rows {
            for (column, _) in row.iter() {
                if !names.iter().any(|n| n == column) {
                    names.push(column.to_string());
                }
            }
        }
        table.columns = names
            .into_iter()
            .map(|name| MemoryColumn {
                not_null: name == key,
                name,
                data_type: "text".to_string(),
                generated: false,
            })
            .collect();
        table.rows = rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|(k, v)| (k.to_string(), Some(v.to_string())))
                    .collect()
            })
            .collect();
        self.tables.insert(TableName::new(schema, name), table);
    }

    fn table_mut(&mut self, table: &TableName) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("relation {table} does not exist"))
    }

    fn check_type(&self, sql_type: &SqlType) -> Result<()> {
        if *sql_type == SqlType::Geography && !self.extensions.contains("postgis") {
            bail!("type \"geography\" does not exist");
        }
        Ok(())
    }

    fn referenced_keys(&self, fk: &ForeignKeyDef) -> Result<HashSet<String>> {
        let table = self
            .tables
            .get(&fk.references)
            .ok_or_else(|| anyhow!("relation {} does not exist", fk.references))?;
        if table.column(&fk.referenced_column).is_none() {
            bail!("column {} does not exist", fk.referenced_column);
        }
        Ok(table
            .rows
            .iter()
            .filter_map(|row| row.get(&fk.referenced_column).cloned().flatten())
            .collect())
    }

    fn run_ddl(&mut self, ddl: &Ddl) -> Result<()> {
        match ddl {
            Ddl::CreateExtension(ext) => {
                if !self.available_extensions.contains(ext.name()) {
                    bail!("extension \"{}\" is not available", ext.name());
                }
                self.extensions.insert(ext.name().to_string());
            }
            Ddl::CreateTable(def) => {
                if self.tables.contains_key(&def.table) {
                    bail!("relation {} already exists", def.table);
                }
                let mut columns = Vec::new();
                for column in &def.columns {
                    self.check_type(&column.sql_type)?;
                    if column.generated.is_some() && self.version < 120_000 {
                        bail!("syntax error at or near \"GENERATED\"");
                    }
                    columns.push(MemoryColumn {
                        name: column.name.clone(),
                        data_type: live_type(&column.sql_type),
                        not_null: column.not_null || column.name == def.primary_key,
                        generated: column.generated.is_some(),
                    });
                }
                self.tables.insert(
                    def.table.clone(),
                    MemoryTable {
                        columns,
                        primary_key: Some(def.primary_key.clone()),
                        checks: def.checks.iter().map(|c| c.name.clone()).collect(),
                        ..MemoryTable::default()
                    },
                );
            }
            Ddl::AddColumn { table, column } => {
                self.check_type(&column.sql_type)?;
                if column.generated.is_some() && self.version < 120_000 {
                    bail!("syntax error at or near \"GENERATED\"");
                }
                let target = self.table_mut(table)?;
                if column.not_null && !target.rows.is_empty() {
                    bail!("column {} contains null values", column.name);
                }
                if target.column(&column.name).is_none() {
                    target.columns.push(MemoryColumn {
                        name: column.name.clone(),
                        data_type: live_type(&column.sql_type),
                        not_null: column.not_null,
                        generated: column.generated.is_some(),
                    });
                }
            }
            Ddl::AddPrimaryKey { table, column, .. } => {
                let target = self.table_mut(table)?;
                if target.primary_key.is_some() {
                    bail!("multiple primary keys for table {table} are not allowed");
                }
                let mut seen = HashSet::new();
                for row in &target.rows {
                    match row.get(column).cloned().flatten() {
                        Some(key) if seen.insert(key.clone()) => {}
                        Some(key) => bail!("could not create unique index: duplicate {key}"),
                        None => bail!("column {column} contains null values"),
                    }
                }
                target.primary_key = Some(column.clone());
            }
            Ddl::AddForeignKey {
                table,
                name,
                foreign_key,
            } => {
                let known = self.referenced_keys(foreign_key)?;
                let target = self.table_mut(table)?;
                for row in &target.rows {
                    if let Some(value) = row.get(&foreign_key.column).cloned().flatten()
                        && !known.contains(&value)
                    {
                        bail!("insert or update on table {table} violates foreign key constraint {name}");
                    }
                }
                target.foreign_keys.push((name.clone(), foreign_key.clone()));
            }
            Ddl::CreateIndex { table, index } => {
                match index.method {
                    IndexMethod::Gist if !self.extensions.contains("postgis") => {
                        bail!("data type text has no default operator class for access method \"gist\"");
                    }
                    IndexMethod::Trigram if !self.extensions.contains("pg_trgm") => {
                        bail!("operator class \"gin_trgm_ops\" does not exist");
                    }
                    _ => {}
                }
                let target = self.table_mut(table)?;
                if !target.indexes.contains(&index.name) {
                    target.indexes.push(index.name.clone());
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// What `CAST(text AS cast_type)` yields on the server: an explicit cast to
/// a bounded character type truncates instead of failing.
fn explicit_cast(cast_type: &str, value: &str) -> String {
    let bound = cast_type
        .strip_prefix("character varying(")
        .or_else(|| cast_type.strip_prefix("varchar("))
        .and_then(|rest| rest.strip_suffix(')'))
        .and_then(|len| len.parse::<usize>().ok());
    match bound {
        Some(len) => value.chars().take(len).collect(),
        None => value.to_string(),
    }
}

fn check_value(column: &MemoryColumn, value: &str) -> Result<()> {
    let ok = match column.data_type.as_str() {
        "integer" | "bigint" => value.parse::<i64>().is_ok(),
        "double precision" => value.parse::<f64>().is_ok() || value.ends_with("Infinity"),
        "boolean" => value == "true" || value == "false",
        "interval" => value.ends_with(" seconds"),
        other => match other
            .strip_prefix("character varying(")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|len| len.parse::<usize>().ok())
        {
            Some(len) if value.chars().count() > len => {
                bail!("value too long for type {other}")
            }
            _ => true,
        },
    };
    if ok {
        Ok(())
    } else {
        bail!("invalid input syntax for type {}: {value:?}", column.data_type)
    }
}

impl TargetStore for MemoryStore {
    fn server_version(&mut self) -> Result<u32> {
        Ok(self.version)
    }

    fn describe_table(&mut self, table: &TableName) -> Result<Option<TableDescriptor>> {
        Ok(self.tables.get(table).map(|t| TableDescriptor {
            table: table.clone(),
            columns: t
                .columns
                .iter()
                .map(|c| ColumnInfo {
                    name: c.name.clone(),
                    data_type: c.data_type.clone(),
                    not_null: c.not_null,
                    generated: c.generated,
                })
                .collect(),
            primary_key: t.primary_key.iter().cloned().collect(),
            foreign_keys: t.foreign_keys.iter().map(|(name, _)| name.clone()).collect(),
            indexes: t.indexes.clone(),
        }))
    }

    fn apply(&mut self, ddl: &Ddl) -> Result<()> {
        let sql = ddl.to_sql();
        self.run_ddl(ddl)?;
        self.ddl.push(sql);
        Ok(())
    }

    fn apply_optional(&mut self, ddl: &Ddl) -> Result<bool> {
        match self.apply(ddl) {
            Ok(()) => Ok(true),
            Err(_) => {
                self.failed_ddl.push(ddl.to_sql());
                Ok(false)
            }
        }
    }

    fn fetch_keys(&mut self, table: &TableName, column: &str) -> Result<HashSet<String>> {
        let target = self
            .tables
            .get(table)
            .ok_or_else(|| anyhow!("relation {table} does not exist"))?;
        Ok(target
            .rows
            .iter()
            .filter_map(|row| row.get(column).cloned().flatten())
            .collect())
    }

    fn upsert(&mut self, statement: &UpsertStatement, rows: &[Vec<Option<String>>]) -> Result<u64> {
        let foreign_keys = self
            .tables
            .get(&statement.table)
            .ok_or_else(|| anyhow!("relation {} does not exist", statement.table))?
            .foreign_keys
            .clone();
        let mut known = Vec::new();
        for (name, fk) in &foreign_keys {
            known.push((name.clone(), fk.column.clone(), self.referenced_keys(fk)?));
        }

        let target = self.table_mut(&statement.table)?;
        for name in &statement.columns {
            let column = target
                .column(name)
                .ok_or_else(|| anyhow!("column {name} does not exist"))?;
            if column.generated {
                bail!("cannot insert a non-DEFAULT value into column \"{name}\"");
            }
        }
        let key_column = target
            .primary_key
            .clone()
            .ok_or_else(|| anyhow!("there is no unique constraint matching the ON CONFLICT specification"))?;
        if key_column != statement.conflict {
            bail!("there is no unique constraint matching the ON CONFLICT specification");
        }

        let mut touched = HashSet::new();
        for row in rows {
            if row.len() != statement.columns.len() {
                bail!("bind parameter count mismatch");
            }
            let incoming = statement
                .columns
                .iter()
                .cloned()
                .zip(statement.column_types.iter().zip(row))
                .map(|(name, (ty, value))| {
                    (name, value.as_deref().map(|v| explicit_cast(bind_type(ty), v)))
                })
                .collect::<BTreeMap<_, _>>();
            for (name, value) in &incoming {
                if let (Some(value), Some(column)) = (value, target.column(name)) {
                    check_value(column, value)?;
                }
            }
            for (name, column, keys) in &known {
                if let Some(Some(value)) = incoming.get(column)
                    && !keys.contains(value)
                {
                    bail!(
                        "insert or update on table {} violates foreign key constraint \"{name}\"",
                        statement.table
                    );
                }
            }
            let key = incoming
                .get(&key_column)
                .cloned()
                .flatten()
                .ok_or_else(|| anyhow!("null value in column \"{key_column}\" violates not-null constraint"))?;
            if !touched.insert(key.clone()) {
                bail!("ON CONFLICT DO UPDATE command cannot affect row a second time");
            }

            let position = target
                .rows
                .iter()
                .position(|r| r.get(&key_column).cloned().flatten().as_deref() == Some(key.as_str()));
            let merged = match position {
                Some(idx) => {
                    let mut existing = target.rows[idx].clone();
                    existing.extend(incoming);
                    existing
                }
                None => incoming,
            };
            for column in &target.columns {
                if column.not_null
                    && !column.generated
                    && merged.get(&column.name).cloned().flatten().is_none()
                {
                    bail!(
                        "null value in column \"{}\" violates not-null constraint",
                        column.name
                    );
                }
            }
            match position {
                Some(idx) => target.rows[idx] = merged,
                None => target.rows.push(merged),
            }
        }
        self.batches.push(rows.len());
        self.statements.push(statement.clone());
        Ok(rows.len() as u64)
    }
}
