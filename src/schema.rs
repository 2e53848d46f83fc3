//! Table model shared by the reconciler, the upsert engine and job
//! definitions.
//!
//! [`TableDef`] is what a run *wants* the destination table to look like;
//! [`TableDescriptor`] is what the live database reports. The
//! [`SchemaRegistry`] caches descriptors for the duration of one run.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    str::FromStr,
};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::{coerce::Coercion, store::TargetStore};

/// Server versions from this number on support stored generated columns.
pub const GENERATED_COLUMNS_MIN_VERSION: u32 = 120_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SqlType {
    Boolean,
    Integer,
    BigInt,
    DoublePrecision,
    Timestamp,
    Interval,
    Text,
    Varchar(u32),
    Geography,
}

impl SqlType {
    pub fn render(&self) -> String {
        match self {
            SqlType::Boolean => "boolean".to_string(),
            SqlType::Integer => "integer".to_string(),
            SqlType::BigInt => "bigint".to_string(),
            SqlType::DoublePrecision => "double precision".to_string(),
            SqlType::Timestamp => "timestamp without time zone".to_string(),
            SqlType::Interval => "interval".to_string(),
            SqlType::Text => "text".to_string(),
            SqlType::Varchar(len) => format!("varchar({len})"),
            SqlType::Geography => "geography".to_string(),
        }
    }

    /// Coercion applied to source cells destined for a column of this type.
    pub fn coercion(&self) -> Coercion {
        match self {
            SqlType::Boolean => Coercion::Bool,
            SqlType::Integer | SqlType::BigInt => Coercion::Int,
            SqlType::DoublePrecision => Coercion::Float,
            SqlType::Timestamp => Coercion::Timestamp,
            SqlType::Interval => Coercion::Duration,
            SqlType::Text | SqlType::Varchar(_) | SqlType::Geography => Coercion::Text,
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &[
            "boolean",
            "integer",
            "bigint",
            "double precision",
            "timestamp",
            "interval",
            "text",
            "varchar(n)",
            "geography",
        ]
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl FromStr for SqlType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        let collapsed = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
        match collapsed.as_str() {
            "boolean" | "bool" => Ok(SqlType::Boolean),
            "integer" | "int" | "int4" => Ok(SqlType::Integer),
            "bigint" | "int8" => Ok(SqlType::BigInt),
            "double precision" | "float8" | "double" | "float" => Ok(SqlType::DoublePrecision),
            "timestamp" | "timestamp without time zone" | "datetime" => Ok(SqlType::Timestamp),
            "interval" | "duration" => Ok(SqlType::Interval),
            "text" | "string" => Ok(SqlType::Text),
            "geography" => Ok(SqlType::Geography),
            other => parse_varchar(other).ok_or_else(|| {
                anyhow!(
                    "Unknown column type '{value}'. Supported types: {}",
                    SqlType::variants().join(", ")
                )
            }),
        }
    }
}

fn parse_varchar(value: &str) -> Option<SqlType> {
    let inner = value
        .strip_prefix("varchar")
        .or_else(|| value.strip_prefix("character varying"))?
        .trim()
        .strip_prefix('(')?
        .strip_suffix(')')?;
    inner
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|len| *len > 0)
        .map(SqlType::Varchar)
}

impl Serialize for SqlType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.render())
    }
}

impl<'de> Deserialize<'de> for SqlType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        SqlType::from_str(&token).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: SqlType,
    pub not_null: bool,
    /// Expression of a stored generated column.
    pub generated: Option<String>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            not_null: false,
            generated: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }
}

/// Foreign key with update-cascade / delete-restrict semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub column: String,
    pub references: TableName,
    pub referenced_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckDef {
    pub name: String,
    pub expression: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    PostGis,
    Trigram,
}

impl Extension {
    pub fn name(&self) -> &'static str {
        match self {
            Extension::PostGis => "postgis",
            Extension::Trigram => "pg_trgm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexMethod {
    Btree,
    /// Spatial index over a geography column.
    Gist,
    /// Fuzzy-text index; degrades to [`IndexMethod::Lower`].
    Trigram,
    Lower,
}

impl IndexMethod {
    pub fn requires(&self) -> Option<Extension> {
        match self {
            IndexMethod::Gist => Some(Extension::PostGis),
            IndexMethod::Trigram => Some(Extension::Trigram),
            IndexMethod::Btree | IndexMethod::Lower => None,
        }
    }
}

pub fn index_name(table: &str, column: &str, method: IndexMethod) -> String {
    match method {
        IndexMethod::Btree => format!("{table}_{column}_idx"),
        IndexMethod::Gist => format!("{table}_{column}_gist"),
        IndexMethod::Trigram => format!("{table}_{column}_trgm_idx"),
        IndexMethod::Lower => format!("{table}_{column}_lower_idx"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub column: String,
    pub method: IndexMethod,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub table: TableName,
    pub columns: Vec<ColumnDef>,
    pub primary_key: String,
    pub foreign_key: Option<ForeignKeyDef>,
    pub checks: Vec<CheckDef>,
    /// Checks attached when generated columns have to be stored plainly.
    pub fallback_checks: Vec<CheckDef>,
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_name(&self) -> String {
        format!("{}_pkey", self.table.name)
    }

    pub fn foreign_key_name(&self) -> Option<String> {
        self.foreign_key
            .as_ref()
            .map(|fk| format!("{}_{}_fkey", self.table.name, fk.column))
    }

    pub fn foreign_key_index(&self) -> Option<IndexDef> {
        self.foreign_key.as_ref().map(|fk| IndexDef {
            name: index_name(&self.table.name, &fk.column, IndexMethod::Btree),
            column: fk.column.clone(),
            method: IndexMethod::Btree,
        })
    }

    pub fn required_extensions(&self) -> BTreeSet<&'static str> {
        let mut names = BTreeSet::new();
        if self
            .columns
            .iter()
            .any(|c| c.sql_type == SqlType::Geography)
        {
            names.insert(Extension::PostGis.name());
        }
        for index in &self.indexes {
            if let Some(ext) = index.method.requires() {
                names.insert(ext.name());
            }
        }
        names
    }
}

/// One live column as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Rendered type, e.g. `character varying(8)`.
    pub data_type: String,
    pub not_null: bool,
    pub generated: bool,
}

/// Live shape of a destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub table: TableName,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<String>,
    pub indexes: Vec<String>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Columns the database computes; never written by the pipeline.
    pub fn generated_columns(&self) -> BTreeSet<String> {
        self.columns
            .iter()
            .filter(|c| c.generated)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }

    pub fn has_foreign_key(&self, name: &str) -> bool {
        self.foreign_keys.iter().any(|fk| fk == name)
    }
}

/// Per-run cache of live table descriptors.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    tables: HashMap<TableName, Option<TableDescriptor>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn describe(
        &mut self,
        store: &mut dyn TargetStore,
        table: &TableName,
    ) -> Result<Option<TableDescriptor>> {
        if let Some(cached) = self.tables.get(table) {
            return Ok(cached.clone());
        }
        let described = store.describe_table(table)?;
        self.tables.insert(table.clone(), described.clone());
        Ok(described)
    }

    /// Drops the cached descriptor after DDL touched `table`.
    pub fn invalidate(&mut self, table: &TableName) {
        self.tables.remove(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_type_parses_live_renderings() {
        assert_eq!(
            "character varying(8)".parse::<SqlType>().unwrap(),
            SqlType::Varchar(8)
        );
        assert_eq!("VARCHAR(64)".parse::<SqlType>().unwrap(), SqlType::Varchar(64));
        assert_eq!(
            "timestamp  without time zone".parse::<SqlType>().unwrap(),
            SqlType::Timestamp
        );
        assert_eq!("int4".parse::<SqlType>().unwrap(), SqlType::Integer);
        assert!("varchar(0)".parse::<SqlType>().is_err());
        assert!("money".parse::<SqlType>().is_err());
    }

    #[test]
    fn sql_type_round_trips_through_yaml() {
        let yaml = serde_yaml::to_string(&SqlType::Varchar(32)).unwrap();
        let parsed: SqlType = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, SqlType::Varchar(32));
    }

    #[test]
    fn declared_types_drive_coercion() {
        assert_eq!(SqlType::Interval.coercion(), Coercion::Duration);
        assert_eq!(SqlType::Integer.coercion(), Coercion::Int);
        assert_eq!(SqlType::Varchar(8).coercion(), Coercion::Text);
        assert_eq!(SqlType::Geography.coercion(), Coercion::Text);
    }

    #[test]
    fn constraint_names_follow_table_name() {
        let def = TableDef {
            table: TableName::new("public", "swo"),
            columns: vec![ColumnDef::new("swo", SqlType::Text).not_null()],
            primary_key: "swo".into(),
            foreign_key: Some(ForeignKeyDef {
                column: "hts_sn_id".into(),
                references: TableName::new("public", "sites"),
                referenced_column: "hts_site_id".into(),
            }),
            checks: Vec::new(),
            fallback_checks: Vec::new(),
            indexes: Vec::new(),
        };
        assert_eq!(def.primary_key_name(), "swo_pkey");
        assert_eq!(def.foreign_key_name().as_deref(), Some("swo_hts_sn_id_fkey"));
        assert_eq!(def.foreign_key_index().unwrap().name, "swo_hts_sn_id_idx");
        assert!(def.required_extensions().is_empty());
    }
}
