//! SQL text construction.
//!
//! Every identifier that reaches a statement goes through [`quote_ident`].

use std::fmt;

use itertools::Itertools;

use crate::schema::{ColumnDef, Extension, ForeignKeyDef, IndexDef, IndexMethod, TableDef, TableName};

/// Protocol limit on bind parameters in one statement.
pub const MAX_BIND_PARAMETERS: usize = 65_535;

const RESERVED_WORDS: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric", "both", "case",
    "cast", "check", "collate", "column", "constraint", "create", "current_catalog",
    "current_date", "current_role", "current_time", "current_timestamp", "current_user",
    "default", "deferrable", "desc", "distinct", "do", "else", "end", "except", "false", "fetch",
    "for", "foreign", "from", "grant", "group", "having", "in", "initially", "intersect", "into",
    "lateral", "leading", "limit", "localtime", "localtimestamp", "not", "null", "offset", "on",
    "only", "or", "order", "placing", "primary", "references", "returning", "select",
    "session_user", "some", "symmetric", "table", "then", "to", "trailing", "true", "union",
    "unique", "user", "using", "variadic", "when", "where", "window", "with",
];

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !RESERVED_WORDS.contains(&name)
}

/// Leaves canonical identifiers bare and double-quotes everything else.
pub fn quote_ident(name: &str) -> String {
    if is_plain_identifier(name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

pub fn qualify(table: &TableName) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}

fn render_column(column: &ColumnDef) -> String {
    let mut rendered = format!("{} {}", quote_ident(&column.name), column.sql_type.render());
    if let Some(expression) = &column.generated {
        rendered.push_str(&format!(" GENERATED ALWAYS AS ({expression}) STORED"));
    }
    if column.not_null {
        rendered.push_str(" NOT NULL");
    }
    rendered
}

/// A schema change the reconciler may issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ddl {
    CreateExtension(Extension),
    CreateTable(TableDef),
    AddColumn {
        table: TableName,
        column: ColumnDef,
    },
    AddPrimaryKey {
        table: TableName,
        name: String,
        column: String,
    },
    AddForeignKey {
        table: TableName,
        name: String,
        foreign_key: ForeignKeyDef,
    },
    CreateIndex {
        table: TableName,
        index: IndexDef,
    },
}

impl Ddl {
    pub fn to_sql(&self) -> String {
        match self {
            Ddl::CreateExtension(ext) => {
                format!("CREATE EXTENSION IF NOT EXISTS {}", quote_ident(ext.name()))
            }
            Ddl::CreateTable(def) => {
                let mut parts = def.columns.iter().map(render_column).collect::<Vec<_>>();
                parts.push(format!(
                    "CONSTRAINT {} PRIMARY KEY ({})",
                    quote_ident(&def.primary_key_name()),
                    quote_ident(&def.primary_key)
                ));
                parts.extend(def.checks.iter().map(|check| {
                    format!(
                        "CONSTRAINT {} CHECK ({})",
                        quote_ident(&check.name),
                        check.expression
                    )
                }));
                format!(
                    "CREATE TABLE {} (\n    {}\n)",
                    qualify(&def.table),
                    parts.join(",\n    ")
                )
            }
            Ddl::AddColumn { table, column } => format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
                qualify(table),
                render_column(column)
            ),
            Ddl::AddPrimaryKey {
                table,
                name,
                column,
            } => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
                qualify(table),
                quote_ident(name),
                quote_ident(column)
            ),
            Ddl::AddForeignKey {
                table,
                name,
                foreign_key,
            } => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) \
                 ON UPDATE CASCADE ON DELETE RESTRICT",
                qualify(table),
                quote_ident(name),
                quote_ident(&foreign_key.column),
                qualify(&foreign_key.references),
                quote_ident(&foreign_key.referenced_column)
            ),
            Ddl::CreateIndex { table, index } => {
                let column = quote_ident(&index.column);
                let target = match index.method {
                    IndexMethod::Btree => format!("({column})"),
                    IndexMethod::Gist => format!("USING gist ({column})"),
                    IndexMethod::Trigram => format!("USING gin ({column} gin_trgm_ops)"),
                    IndexMethod::Lower => format!("(lower({column}))"),
                };
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} {target}",
                    quote_ident(&index.name),
                    qualify(table)
                )
            }
        }
    }
}

impl fmt::Display for Ddl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

/// Type a text parameter is cast to before it is assigned to a column of
/// `live_type`. An explicit cast to `varchar(n)` or `char(n)` truncates
/// silently, so length-bounded character types are cast to their unbounded
/// base and the column assignment enforces the length.
pub fn bind_type(live_type: &str) -> &str {
    let lowered = live_type.trim().to_ascii_lowercase();
    let Some(base) = lowered.strip_suffix(')').and_then(|t| t.split_once('(')).map(|(b, _)| b.trim())
    else {
        return live_type;
    };
    match base {
        "character varying" | "varchar" => "varchar",
        "character" | "char" | "bpchar" => "text",
        _ => live_type,
    }
}

/// Multi-row insert-or-update keyed on one conflict column.
///
/// Parameters travel as text and are cast server-side to each column's live
/// type (see [`bind_type`]), so one textual rendering covers every coerced
/// value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertStatement {
    pub table: TableName,
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub conflict: String,
}

impl UpsertStatement {
    pub fn new(table: TableName, typed_columns: Vec<(String, String)>, conflict: impl Into<String>) -> Self {
        let (columns, column_types) = typed_columns.into_iter().unzip();
        Self {
            table,
            columns,
            column_types,
            conflict: conflict.into(),
        }
    }

    /// Largest row count whose parameters fit in one statement.
    pub fn max_rows_per_statement(&self) -> usize {
        (MAX_BIND_PARAMETERS / self.columns.len().max(1)).max(1)
    }

    pub fn sql_for(&self, rows: usize) -> String {
        let width = self.columns.len();
        let values = (0..rows)
            .map(|row| {
                let cells = self
                    .column_types
                    .iter()
                    .enumerate()
                    .map(|(col, ty)| {
                        format!("CAST(${}::text AS {})", row * width + col + 1, bind_type(ty))
                    })
                    .join(", ");
                format!("({cells})")
            })
            .join(", ");
        let updates = self
            .columns
            .iter()
            .filter(|c| **c != self.conflict)
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
            .join(", ");
        let action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {updates}")
        };
        format!(
            "INSERT INTO {} ({}) VALUES {values} ON CONFLICT ({}) {action}",
            qualify(&self.table),
            self.columns.iter().map(|c| quote_ident(c)).join(", "),
            quote_ident(&self.conflict)
        )
    }
}
