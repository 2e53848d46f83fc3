//! Value coercers.
//!
//! Each coercer converts one loosely-typed [`Cell`] into a target
//! representation. `Ok(None)` means "no value" (the input was recognizably
//! missing); `Err` means the input was present but not understood. Whether a
//! rejection aborts the run or silently becomes "no value" is decided by the
//! column's [`Strictness`], never by the coercer.

use std::{fmt, str::FromStr, sync::LazyLock};

use anyhow::anyhow;
use chrono::NaiveDateTime;
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::{Cell, Value, parse_timestamp_text};

pub const TRUTHY: &[&str] = &["true", "t", "1", "yes", "y", "oui", "o", "vrai"];
pub const FALSY: &[&str] = &["false", "f", "0", "no", "n", "non", "faux"];

const TIME_SENTINELS: &[&str] = &["nat", "nan", "none", "null"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct Rejected(pub String);

pub type Coerced<T> = Result<Option<T>, Rejected>;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lowercase")]
pub enum Strictness {
    /// Unrecognized values abort the run.
    Strict,
    /// Unrecognized values become "no value".
    #[default]
    Lenient,
}

impl fmt::Display for Strictness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strictness::Strict => write!(f, "strict"),
            Strictness::Lenient => write!(f, "lenient"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coercion {
    Bool,
    Int,
    Float,
    Timestamp,
    Duration,
    Text,
}

impl Coercion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Coercion::Bool => "bool",
            Coercion::Int => "int",
            Coercion::Float => "float",
            Coercion::Timestamp => "timestamp",
            Coercion::Duration => "duration",
            Coercion::Text => "text",
        }
    }

    pub fn apply(&self, cell: &Cell) -> Result<Value, Rejected> {
        let value = match self {
            Coercion::Bool => coerce_bool(cell)?.map(Value::Bool),
            Coercion::Int => coerce_int(cell)?.map(Value::Int),
            Coercion::Float => coerce_float(cell)?.map(Value::Float),
            Coercion::Timestamp => coerce_timestamp(cell)?.map(Value::Timestamp),
            Coercion::Duration => coerce_duration(cell)?.map(Value::Interval),
            Coercion::Text => coerce_text(cell).map(Value::Text),
        };
        Ok(value.unwrap_or(Value::Null))
    }

    /// True when the cell converts to an actual value under this coercion.
    pub fn accepts(&self, cell: &Cell) -> bool {
        matches!(self.apply(cell), Ok(value) if !value.is_null())
    }
}

impl fmt::Display for Coercion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Coercion {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(Coercion::Bool),
            "int" | "integer" => Ok(Coercion::Int),
            "float" | "double" => Ok(Coercion::Float),
            "timestamp" | "datetime" => Ok(Coercion::Timestamp),
            "duration" | "interval" => Ok(Coercion::Duration),
            "text" | "string" => Ok(Coercion::Text),
            other => Err(anyhow!("Unknown coercion '{other}'")),
        }
    }
}

/// Applies `coercion` under `strictness`: lenient columns turn rejections
/// into `Value::Null`, strict columns surface them.
pub fn coerce_cell(
    coercion: Coercion,
    strictness: Strictness,
    cell: &Cell,
) -> Result<Value, Rejected> {
    match coercion.apply(cell) {
        Ok(value) => Ok(value),
        Err(_) if strictness == Strictness::Lenient => Ok(Value::Null),
        Err(err) => Err(err),
    }
}

fn token(cell: &Cell) -> String {
    cell.as_display().trim().to_lowercase()
}

fn bool_token(lowered: &str) -> Option<bool> {
    if TRUTHY.contains(&lowered) {
        Some(true)
    } else if FALSY.contains(&lowered) {
        Some(false)
    } else {
        None
    }
}

pub fn coerce_bool(cell: &Cell) -> Coerced<bool> {
    if cell.is_missing() {
        return Ok(None);
    }
    if let Cell::Bool(b) = cell {
        return Ok(Some(*b));
    }
    let lowered = token(cell);
    bool_token(&lowered)
        .map(Some)
        .ok_or_else(|| Rejected(format!("'{lowered}' is not a recognized boolean")))
}

/// Parses decimal-comma or decimal-point text.
fn parse_decimal_text(lowered: &str) -> Result<f64, Rejected> {
    lowered
        .replace(',', ".")
        .parse::<f64>()
        .map_err(|_| Rejected(format!("'{lowered}' is not a number")))
}

pub fn coerce_float(cell: &Cell) -> Coerced<f64> {
    if cell.is_missing() {
        return Ok(None);
    }
    let parsed = match cell {
        Cell::Bool(b) => f64::from(u8::from(*b)),
        Cell::Int(i) => *i as f64,
        Cell::Float(f) => *f,
        Cell::DateTime(_) | Cell::Duration(_) => {
            return Err(Rejected(format!("{cell} is not a number")));
        }
        _ => {
            let lowered = token(cell);
            match bool_token(&lowered) {
                Some(b) => f64::from(u8::from(b)),
                None => parse_decimal_text(&lowered)?,
            }
        }
    };
    if parsed.is_nan() {
        return Ok(None);
    }
    Ok(Some(parsed))
}

/// Integer coercion goes through the float parse and truncates toward zero.
pub fn coerce_int(cell: &Cell) -> Coerced<i64> {
    if cell.is_missing() {
        return Ok(None);
    }
    if let Cell::Int(i) = cell {
        return Ok(Some(*i));
    }
    let Some(parsed) = coerce_float(cell)? else {
        return Err(Rejected(format!("{cell} is not an integer")));
    };
    truncate_to_i64(parsed).map(Some)
}

fn truncate_to_i64(value: f64) -> Result<i64, Rejected> {
    const LIMIT: f64 = 9_223_372_036_854_775_807.0;
    let truncated = value.trunc();
    if !truncated.is_finite() || truncated.abs() >= LIMIT {
        return Err(Rejected(format!("{value} is outside the integer range")));
    }
    Ok(truncated as i64)
}

pub fn coerce_timestamp(cell: &Cell) -> Coerced<NaiveDateTime> {
    if cell.is_missing() {
        return Ok(None);
    }
    match cell {
        Cell::DateTime(dt) => Ok(Some(*dt)),
        Cell::Text(text) => {
            let trimmed = text.trim();
            if TIME_SENTINELS.contains(&trimmed.to_lowercase().as_str()) {
                return Ok(None);
            }
            parse_timestamp_text(trimmed)
                .map(Some)
                .ok_or_else(|| Rejected(format!("'{trimmed}' is not a recognized date/time")))
        }
        other => Err(Rejected(format!("{other} is not a date/time"))),
    }
}

static ISO_COMPONENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:[.,]\d+)?)([hms])").expect("valid regex"));
static UNIT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:[.,]\d+)?)([hms])$").expect("valid regex"));
static CLOCK_HMS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2}):(\d{2}):(\d{2})$").expect("valid regex"));
static CLOCK_MS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2}):(\d{2})$").expect("valid regex"));
static BARE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:[.,]\d+)?$").expect("valid regex"));

fn unit_seconds(unit: &str) -> f64 {
    match unit {
        "h" => 3600.0,
        "m" => 60.0,
        _ => 1.0,
    }
}

fn decimal(text: &str) -> f64 {
    text.replace(',', ".").parse::<f64>().unwrap_or(0.0)
}

fn whole(text: &str) -> i64 {
    text.parse::<i64>().unwrap_or(0)
}

/// Canonical duration in whole seconds.
///
/// Recognized forms, in order: native durations, `PT..H..M..S`, a number
/// with an `h`/`m`/`s` unit, `HH:MM:SS`, `MM:SS`, and a bare number of
/// seconds.
pub fn coerce_duration(cell: &Cell) -> Coerced<i64> {
    if cell.is_missing() {
        return Ok(None);
    }
    match cell {
        Cell::Duration(d) => return Ok(Some(d.num_seconds())),
        Cell::Int(i) if *i >= 0 => return Ok(Some(*i)),
        Cell::Float(f) if *f >= 0.0 => return truncate_to_i64(*f).map(Some),
        Cell::Text(_) => {}
        other => return Err(Rejected(format!("{other} is not a duration"))),
    }

    let lowered = token(cell);
    if let Some(rest) = lowered.strip_prefix("pt") {
        let mut total = 0.0;
        let mut matched = false;
        for caps in ISO_COMPONENT.captures_iter(rest) {
            total += decimal(&caps[1]) * unit_seconds(&caps[2]);
            matched = true;
        }
        if matched {
            return truncate_to_i64(total).map(Some);
        }
    }
    if let Some(caps) = UNIT_TOKEN.captures(&lowered) {
        return truncate_to_i64(decimal(&caps[1]) * unit_seconds(&caps[2])).map(Some);
    }
    if let Some(caps) = CLOCK_HMS.captures(&lowered) {
        return Ok(Some(
            whole(&caps[1]) * 3600 + whole(&caps[2]) * 60 + whole(&caps[3]),
        ));
    }
    if let Some(caps) = CLOCK_MS.captures(&lowered) {
        return Ok(Some(whole(&caps[1]) * 60 + whole(&caps[2])));
    }
    if BARE_NUMBER.is_match(&lowered) {
        return truncate_to_i64(decimal(&lowered)).map(Some);
    }
    Err(Rejected(format!("'{lowered}' is not a recognized duration")))
}

pub fn coerce_text(cell: &Cell) -> Option<String> {
    if cell.is_missing() {
        return None;
    }
    Some(cell.as_display().trim().to_string())
}
