//! Database-free dry run.

use anyhow::Result;
use log::info;

use crate::{
    jobs::JobSpec,
    pipeline::{self, Prepared, RunOptions},
    table::{Align, render_table},
};

const SAMPLE_WIDTH: usize = 32;

const HEADERS: &[&str] = &[
    "#",
    "source",
    "column",
    "type",
    "coercion",
    "strictness",
    "values",
    "sample",
];

const ALIGN: &[Align] = &[
    Align::Right,
    Align::Left,
    Align::Left,
    Align::Left,
    Align::Left,
    Align::Left,
    Align::Right,
    Align::Left,
];

fn truncate(value: &str) -> String {
    if value.chars().count() <= SAMPLE_WIDTH {
        value.to_string()
    } else {
        let mut cut = value.chars().take(SAMPLE_WIDTH - 3).collect::<String>();
        cut.push_str("...");
        cut
    }
}

/// Column profile of a prepared run as an aligned text table.
pub fn render(prepared: &Prepared) -> String {
    let headers = HEADERS.iter().map(|h| h.to_string()).collect::<Vec<_>>();
    let rows = prepared
        .profiles
        .iter()
        .map(|profile| {
            vec![
                profile
                    .position
                    .map(|p| (p + 1).to_string())
                    .unwrap_or_else(|| "-".to_string()),
                profile.source.clone(),
                profile.canonical.clone(),
                profile.sql_type.to_string(),
                profile.coercion.to_string(),
                profile.strictness.to_string(),
                profile.non_missing.to_string(),
                profile.sample.as_deref().map(truncate).unwrap_or_default(),
            ]
        })
        .collect::<Vec<_>>();
    let mut output = format!(
        "{} -> {} ({} row(s){})\n",
        prepared.job.name,
        prepared.job.table,
        prepared.data.len(),
        prepared
            .sheet
            .as_deref()
            .map(|s| format!(", sheet '{s}'"))
            .unwrap_or_default()
    );
    output.push_str(&render_table(&headers, &rows, ALIGN));
    output
}

pub fn execute(job: &JobSpec, options: &RunOptions) -> Result<()> {
    let prepared = pipeline::prepare(job, options)?;
    print!("{}", render(&prepared));
    info!(
        "Probe of {:?} passed: {} column(s) would be written",
        options.input,
        prepared.data.columns.len()
    );
    Ok(())
}
