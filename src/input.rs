//! Source loading: workbooks through calamine, CSV/TSV through `io_utils`.

use std::{fmt, path::Path, str::FromStr};

use anyhow::{Context, Result, anyhow};
use calamine::{Data, ExcelDateTime, Reader, open_workbook_auto};
use chrono::TimeDelta;
use log::debug;

use crate::{
    coerce::coerce_duration,
    data::{Cell, parse_timestamp_text},
    error::IngestError,
    io_utils,
};

const WORKBOOK_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xlsb", "xls", "ods"];
const DELIMITED_EXTENSIONS: &[&str] = &["csv", "tsv", "txt"];

const MILLIS_PER_DAY: f64 = 86_400_000.0;

static MISSING: Cell = Cell::Missing;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetSelector {
    /// 0-based position in the workbook.
    Index(usize),
    Name(String),
}

impl FromStr for SheetSelector {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        Ok(match trimmed.parse::<usize>() {
            Ok(index) => SheetSelector::Index(index),
            Err(_) => SheetSelector::Name(value.to_string()),
        })
    }
}

impl fmt::Display for SheetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SheetSelector::Index(index) => write!(f, "#{index}"),
            SheetSelector::Name(name) => write!(f, "'{name}'"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub sheet: SheetSelector,
    pub delimiter: Option<u8>,
    pub encoding: Option<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            sheet: SheetSelector::Index(0),
            delimiter: None,
            encoding: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// 1-based spreadsheet row number, header row included.
    pub number: usize,
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceTable {
    pub sheet: Option<String>,
    pub headers: Vec<String>,
    pub rows: Vec<SourceRow>,
}

impl SourceTable {
    pub fn column(&self, index: usize) -> impl Iterator<Item = &Cell> + Clone + '_ {
        self.rows.iter().map(move |row| row.cells.get(index).unwrap_or(&MISSING))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub fn load(path: &Path, options: &LoadOptions) -> Result<SourceTable> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if WORKBOOK_EXTENSIONS.contains(&extension.as_str()) {
        load_workbook(path, &options.sheet)
    } else if io_utils::is_dash(path) || DELIMITED_EXTENSIONS.contains(&extension.as_str()) {
        load_delimited(path, options)
    } else {
        Err(anyhow!(
            "Unsupported input {path:?}; expected one of {} or {}",
            WORKBOOK_EXTENSIONS.join("/"),
            DELIMITED_EXTENSIONS.join("/")
        ))
    }
}

fn load_workbook(path: &Path, sheet: &SheetSelector) -> Result<SourceTable> {
    let mut workbook =
        open_workbook_auto(path).with_context(|| format!("Opening workbook {path:?}"))?;
    let available = workbook.sheet_names();
    let name = match sheet {
        SheetSelector::Index(index) => available.get(*index).cloned(),
        SheetSelector::Name(name) => available.iter().find(|s| *s == name).cloned(),
    }
    .ok_or_else(|| IngestError::SheetNotFound {
        requested: sheet.to_string(),
        available: available.clone(),
    })?;
    let range = workbook
        .worksheet_range(&name)
        .with_context(|| format!("Reading sheet '{name}' of {path:?}"))?;
    let first_row = range.start().map(|(row, _)| row as usize).unwrap_or_default();

    let mut rows_iter = range.rows();
    let headers = rows_iter
        .next()
        .map(|row| header_labels(row.iter().map(header_text)))
        .unwrap_or_default();
    let width = headers.len();

    let mut rows = Vec::new();
    for (offset, raw) in rows_iter.enumerate() {
        let mut cells = raw.iter().take(width).map(cell_from_data).collect::<Vec<_>>();
        cells.resize(width, Cell::Missing);
        if cells.iter().all(Cell::is_missing) {
            continue;
        }
        rows.push(SourceRow {
            number: first_row + offset + 2,
            cells,
        });
    }
    debug!(
        "Sheet '{name}': {} column(s), {} data row(s)",
        headers.len(),
        rows.len()
    );
    Ok(SourceTable {
        sheet: Some(name),
        headers,
        rows,
    })
}

fn load_delimited(path: &Path, options: &LoadOptions) -> Result<SourceTable> {
    let delimiter = io_utils::resolve_input_delimiter(path, options.delimiter);
    let encoding = io_utils::resolve_encoding(options.encoding.as_deref())?;
    let mut reader = io_utils::open_csv_reader_from_path(path, delimiter)?;
    let raw_headers = io_utils::reader_headers(&mut reader, encoding)
        .with_context(|| format!("Reading headers of {path:?}"))?;
    let headers = header_labels(raw_headers.into_iter().map(|h| {
        if h.trim().is_empty() { None } else { Some(h) }
    }));
    let width = headers.len();

    let mut rows = Vec::new();
    for (offset, record) in reader.byte_records().enumerate() {
        let number = offset + 2;
        let record = record.with_context(|| format!("Reading row {number} of {path:?}"))?;
        let fields = io_utils::decode_record(&record, encoding)
            .with_context(|| format!("Decoding row {number} of {path:?}"))?;
        let mut cells = fields
            .into_iter()
            .take(width)
            .map(|field| {
                if field.trim().is_empty() {
                    Cell::Missing
                } else {
                    Cell::Text(field)
                }
            })
            .collect::<Vec<_>>();
        cells.resize(width, Cell::Missing);
        if cells.iter().all(Cell::is_missing) {
            continue;
        }
        rows.push(SourceRow { number, cells });
    }
    Ok(SourceTable {
        sheet: None,
        headers,
        rows,
    })
}

/// Missing header cells become `column_<n>` (1-based).
fn header_labels<I>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = Option<String>>,
{
    raw.into_iter()
        .enumerate()
        .map(|(idx, label)| label.unwrap_or_else(|| format!("column_{}", idx + 1)))
        .collect()
}

fn header_text(data: &Data) -> Option<String> {
    match data {
        Data::String(s) if s.trim().is_empty() => None,
        Data::String(s) => Some(s.clone()),
        other => {
            let cell = cell_from_data(other);
            if cell.is_missing() {
                None
            } else {
                Some(cell.as_display())
            }
        }
    }
}

fn cell_from_data(data: &Data) -> Cell {
    match data {
        Data::Empty | Data::Error(_) => Cell::Missing,
        Data::Bool(b) => Cell::Bool(*b),
        Data::Int(i) => Cell::Int(*i),
        Data::Float(f) => number_cell(*f),
        Data::String(s) => Cell::Text(s.clone()),
        Data::DateTime(dt) => excel_datetime_cell(dt),
        Data::DateTimeIso(s) => parse_timestamp_text(s)
            .map(Cell::DateTime)
            .unwrap_or_else(|| Cell::Text(s.clone())),
        Data::DurationIso(s) => match coerce_duration(&Cell::text(s.as_str())) {
            Ok(Some(seconds)) => Cell::Duration(TimeDelta::seconds(seconds)),
            _ => Cell::Text(s.clone()),
        },
    }
}

/// Workbooks store every number as a float; whole values read as integers.
fn number_cell(value: f64) -> Cell {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        Cell::Int(value as i64)
    } else {
        Cell::Float(value)
    }
}

/// Time-only serials (below one day) are durations, everything else is a
/// calendar timestamp.
fn excel_datetime_cell(value: &ExcelDateTime) -> Cell {
    let serial = value.as_f64();
    if value.is_duration() || (0.0..1.0).contains(&serial) {
        return Cell::Duration(TimeDelta::milliseconds((serial * MILLIS_PER_DAY).round() as i64));
    }
    value
        .as_datetime()
        .map(Cell::DateTime)
        .unwrap_or(Cell::Float(serial))
}
