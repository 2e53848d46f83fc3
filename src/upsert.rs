//! Batched idempotent upsert.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Result, anyhow};
use log::{debug, info, warn};

use crate::{
    data::{CoercedTable, Value},
    schema::TableDescriptor,
    sql::UpsertStatement,
    store::TargetStore,
};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    /// Rows sent after duplicate conflict keys collapsed.
    pub rows: usize,
    /// Rows reported affected by the server.
    pub affected: u64,
    pub statements: usize,
    pub duplicates: usize,
    /// Input columns left out of the statement because the database computes
    /// them.
    pub excluded: Vec<String>,
}

/// Statement shape for one run plus the input positions feeding it.
#[derive(Debug, Clone)]
pub struct UpsertPlan {
    pub statement: UpsertStatement,
    positions: Vec<usize>,
    conflict_position: usize,
    pub excluded: Vec<String>,
}

impl UpsertPlan {
    /// Keeps every input column the live table holds, minus generated and
    /// explicitly excluded ones. Values are cast to the live column types.
    pub fn new(
        live: &TableDescriptor,
        conflict: &str,
        data: &CoercedTable,
        excluded: &BTreeSet<String>,
    ) -> Result<Self> {
        let generated = live.generated_columns();
        let mut typed = Vec::with_capacity(data.columns.len());
        let mut positions = Vec::with_capacity(data.columns.len());
        let mut skipped = Vec::new();
        for (position, name) in data.columns.iter().enumerate() {
            if generated.contains(name) || excluded.contains(name) {
                skipped.push(name.clone());
                continue;
            }
            let column = live
                .column(name)
                .ok_or_else(|| anyhow!("Column {name} does not exist in {}", live.table))?;
            typed.push((name.clone(), column.data_type.clone()));
            positions.push(position);
        }
        if generated.contains(conflict) || excluded.contains(conflict) {
            return Err(anyhow!(
                "Conflict column {conflict} of {} cannot be written",
                live.table
            ));
        }
        let conflict_position = data
            .column_index(conflict)
            .ok_or_else(|| anyhow!("Conflict column {conflict} is not part of the input"))?;
        Ok(Self {
            statement: UpsertStatement::new(live.table.clone(), typed, conflict),
            positions,
            conflict_position,
            excluded: skipped,
        })
    }

    fn render(&self, row: &[Value]) -> Vec<Option<String>> {
        self.positions
            .iter()
            .map(|&idx| row.get(idx).and_then(Value::to_sql_text))
            .collect()
    }
}

/// Later rows replace earlier rows with the same conflict key. Rows with no
/// key are kept as-is for the database to reject.
fn collapse_duplicates<'a>(rows: &'a [Vec<Value>], key: usize) -> (Vec<&'a [Value]>, usize) {
    let mut kept: Vec<&[Value]> = Vec::with_capacity(rows.len());
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut duplicates = 0usize;
    for row in rows.iter().map(Vec::as_slice) {
        match row.get(key).and_then(Value::key_text) {
            Some(text) => match slots.get(&text) {
                Some(&slot) => {
                    kept[slot] = row;
                    duplicates += 1;
                }
                None => {
                    slots.insert(text, kept.len());
                    kept.push(row);
                }
            },
            None => kept.push(row),
        }
    }
    (kept, duplicates)
}

pub fn upsert(
    store: &mut dyn TargetStore,
    live: &TableDescriptor,
    conflict: &str,
    data: &CoercedTable,
    batch_size: usize,
    excluded: &BTreeSet<String>,
) -> Result<UpsertReport> {
    if batch_size == 0 {
        return Err(anyhow!("Batch size must be at least 1"));
    }
    let plan = UpsertPlan::new(live, conflict, data, excluded)?;
    if !plan.excluded.is_empty() {
        info!(
            "Skipping database-computed column(s) of {}: {}",
            live.table,
            plan.excluded.join(", ")
        );
    }

    let (rows, duplicates) = collapse_duplicates(&data.rows, plan.conflict_position);
    if duplicates > 0 {
        warn!(
            "{duplicates} row(s) repeat an earlier {conflict} value; the last occurrence wins"
        );
    }

    let per_statement = batch_size.min(plan.statement.max_rows_per_statement());
    debug!("Upsert statement template: {}", plan.statement.sql_for(1));

    let mut report = UpsertReport {
        rows: rows.len(),
        duplicates,
        excluded: plan.excluded.clone(),
        ..UpsertReport::default()
    };
    for batch in rows.chunks(per_statement) {
        let rendered = batch.iter().map(|row| plan.render(row)).collect::<Vec<_>>();
        report.affected += store.upsert(&plan.statement, &rendered)?;
        report.statements += 1;
    }
    info!(
        "Upserted {} row(s) into {} in {} statement(s)",
        report.rows, live.table, report.statements
    );
    Ok(report)
}
