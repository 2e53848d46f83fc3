//! Database seam.
//!
//! The pipeline only talks to a [`TargetStore`]. [`PgStore`] implements it
//! over a single PostgreSQL transaction so that schema and data changes of
//! one run commit or roll back together.

use std::collections::HashSet;

use anyhow::{Context, Result};
use log::{debug, warn};
use postgres::{Transaction, types::ToSql};

use crate::{
    schema::{ColumnInfo, GENERATED_COLUMNS_MIN_VERSION, TableDescriptor, TableName},
    sql::{Ddl, UpsertStatement, qualify, quote_ident},
};

pub trait TargetStore {
    /// `server_version_num` of the connected server.
    fn server_version(&mut self) -> Result<u32>;

    fn describe_table(&mut self, table: &TableName) -> Result<Option<TableDescriptor>>;

    fn apply(&mut self, ddl: &Ddl) -> Result<()>;

    /// Best-effort DDL: failure is logged and reported as `false` without
    /// poisoning the surrounding transaction.
    fn apply_optional(&mut self, ddl: &Ddl) -> Result<bool>;

    /// Distinct non-null values of `column`, rendered as text.
    fn fetch_keys(&mut self, table: &TableName, column: &str) -> Result<HashSet<String>>;

    /// Executes `statement` for one batch; `None` cells are NULL.
    fn upsert(&mut self, statement: &UpsertStatement, rows: &[Vec<Option<String>>]) -> Result<u64>;
}

pub struct PgStore<'a> {
    tx: Transaction<'a>,
    version: Option<u32>,
}

impl<'a> PgStore<'a> {
    pub fn new(tx: Transaction<'a>) -> Self {
        Self { tx, version: None }
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit().context("Committing ingestion transaction")
    }

    pub fn rollback(self) -> Result<()> {
        self.tx.rollback().context("Rolling back ingestion transaction")
    }

    fn table_exists(&mut self, table: &TableName) -> Result<bool> {
        let row = self
            .tx
            .query_one(
                "SELECT EXISTS (
                    SELECT 1 FROM pg_class c
                    JOIN pg_namespace n ON n.oid = c.relnamespace
                    WHERE n.nspname = $1::text AND c.relname = $2::text
                      AND c.relkind IN ('r', 'p')
                )",
                &[&table.schema, &table.name],
            )
            .with_context(|| format!("Checking whether {table} exists"))?;
        Ok(row.get(0))
    }

    fn constraint_names(&mut self, table: &TableName, kind: &str) -> Result<Vec<String>> {
        let rows = self
            .tx
            .query(
                "SELECT constraint_name::text FROM information_schema.table_constraints
                 WHERE table_schema::text = $1::text AND table_name::text = $2::text
                   AND constraint_type::text = $3::text
                 ORDER BY constraint_name",
                &[&table.schema, &table.name, &kind],
            )
            .with_context(|| format!("Reading {kind} constraints of {table}"))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }
}

impl TargetStore for PgStore<'_> {
    fn server_version(&mut self) -> Result<u32> {
        if let Some(version) = self.version {
            return Ok(version);
        }
        let row = self
            .tx
            .query_one("SELECT current_setting('server_version_num')::int4", &[])
            .context("Reading server version")?;
        let version: i32 = row.get(0);
        let version = u32::try_from(version).unwrap_or_default();
        self.version = Some(version);
        Ok(version)
    }

    fn describe_table(&mut self, table: &TableName) -> Result<Option<TableDescriptor>> {
        if !self.table_exists(table)? {
            return Ok(None);
        }
        let generated = if self.server_version()? >= GENERATED_COLUMNS_MIN_VERSION {
            "a.attgenerated = 's'"
        } else {
            "false"
        };
        let query = format!(
            "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod), a.attnotnull, {generated}
             FROM pg_attribute a
             JOIN pg_class c ON c.oid = a.attrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1::text AND c.relname = $2::text
               AND a.attnum > 0 AND NOT a.attisdropped
             ORDER BY a.attnum"
        );
        let columns = self
            .tx
            .query(&query, &[&table.schema, &table.name])
            .with_context(|| format!("Reading columns of {table}"))?
            .iter()
            .map(|row| ColumnInfo {
                name: row.get(0),
                data_type: row.get(1),
                not_null: row.get(2),
                generated: row.get(3),
            })
            .collect::<Vec<_>>();

        let primary_key: Vec<String> = self
            .tx
            .query(
                "SELECT kcu.column_name::text
                 FROM information_schema.table_constraints tc
                 JOIN information_schema.key_column_usage kcu
                   ON kcu.constraint_name = tc.constraint_name
                  AND kcu.table_schema = tc.table_schema
                  AND kcu.table_name = tc.table_name
                 WHERE tc.table_schema::text = $1::text AND tc.table_name::text = $2::text
                   AND tc.constraint_type = 'PRIMARY KEY'
                 ORDER BY kcu.ordinal_position",
                &[&table.schema, &table.name],
            )
            .with_context(|| format!("Reading primary key of {table}"))?
            .iter()
            .map(|row| row.get(0))
            .collect();

        let foreign_keys = self.constraint_names(table, "FOREIGN KEY")?;

        let indexes: Vec<String> = self
            .tx
            .query(
                "SELECT indexname::text FROM pg_indexes
                 WHERE schemaname = $1::text AND tablename = $2::text
                 ORDER BY indexname",
                &[&table.schema, &table.name],
            )
            .with_context(|| format!("Reading indexes of {table}"))?
            .iter()
            .map(|row| row.get(0))
            .collect();

        Ok(Some(TableDescriptor {
            table: table.clone(),
            columns,
            primary_key,
            foreign_keys,
            indexes,
        }))
    }

    fn apply(&mut self, ddl: &Ddl) -> Result<()> {
        let sql = ddl.to_sql();
        debug!("DDL: {sql}");
        self.tx
            .batch_execute(&sql)
            .with_context(|| format!("Executing DDL: {sql}"))
    }

    fn apply_optional(&mut self, ddl: &Ddl) -> Result<bool> {
        let sql = ddl.to_sql();
        debug!("Optional DDL: {sql}");
        let mut savepoint = self
            .tx
            .transaction()
            .context("Opening savepoint for optional DDL")?;
        match savepoint.batch_execute(&sql) {
            Ok(()) => {
                savepoint.commit().context("Releasing savepoint")?;
                Ok(true)
            }
            Err(err) => {
                warn!("Optional DDL failed ({err}); continuing without it: {sql}");
                savepoint
                    .rollback()
                    .context("Rolling back savepoint after optional DDL failure")?;
                Ok(false)
            }
        }
    }

    fn fetch_keys(&mut self, table: &TableName, column: &str) -> Result<HashSet<String>> {
        let column = quote_ident(column);
        let sql = format!(
            "SELECT DISTINCT {column}::text FROM {} WHERE {column} IS NOT NULL",
            qualify(table)
        );
        let rows = self
            .tx
            .query(&sql, &[])
            .with_context(|| format!("Reading {column} values from {table}"))?;
        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    fn upsert(&mut self, statement: &UpsertStatement, rows: &[Vec<Option<String>>]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = statement.sql_for(rows.len());
        let params = rows
            .iter()
            .flatten()
            .map(|value| value as &(dyn ToSql + Sync))
            .collect::<Vec<_>>();
        self.tx
            .execute(&sql, &params)
            .with_context(|| format!("Upserting {} row(s) into {}", rows.len(), statement.table))
    }
}
