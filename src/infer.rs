//! Per-column type inference.
//!
//! Columns whose non-missing cells are uniformly of one native kind keep that
//! kind. Otherwise the first [`SAMPLE_SIZE`] non-missing cells are scored
//! against each coercer in a fixed priority order and the first coercer
//! whose acceptance rate clears its threshold wins.

use serde::Serialize;

use crate::{
    coerce::{Coercion, coerce_float, coerce_int},
    data::Cell,
    schema::SqlType,
};

pub const SAMPLE_SIZE: usize = 50;

const BOOL_THRESHOLD: f64 = 0.9;
const INT_THRESHOLD: f64 = 0.9;
const FLOAT_THRESHOLD: f64 = 0.9;
const TIMESTAMP_THRESHOLD: f64 = 0.8;
const DURATION_THRESHOLD: f64 = 0.8;

/// Storage type and coercion chosen for one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeProfile {
    pub sql_type: SqlType,
    pub coercion: Coercion,
}

impl TypeProfile {
    pub fn new(sql_type: SqlType, coercion: Coercion) -> Self {
        Self { sql_type, coercion }
    }

    pub fn text() -> Self {
        Self::new(SqlType::Text, Coercion::Text)
    }
}

#[derive(Debug, Default, Clone)]
struct SampleTally {
    sampled: usize,
    boolean: usize,
    integer: usize,
    float: usize,
    timestamp: usize,
    duration: usize,
}

impl SampleTally {
    fn update(&mut self, cell: &Cell) {
        self.sampled += 1;
        if Coercion::Bool.accepts(cell) {
            self.boolean += 1;
        }
        if is_exact_integer(cell) {
            self.integer += 1;
        }
        if Coercion::Float.accepts(cell) {
            self.float += 1;
        }
        if Coercion::Timestamp.accepts(cell) {
            self.timestamp += 1;
        }
        if Coercion::Duration.accepts(cell) {
            self.duration += 1;
        }
    }

    fn exceeds(&self, count: usize, threshold: f64) -> bool {
        self.sampled > 0 && (count as f64 / self.sampled as f64) > threshold
    }

    fn decide(&self) -> TypeProfile {
        if self.sampled == 0 {
            TypeProfile::text()
        } else if self.exceeds(self.boolean, BOOL_THRESHOLD) {
            TypeProfile::new(SqlType::Boolean, Coercion::Bool)
        } else if self.exceeds(self.integer, INT_THRESHOLD) {
            TypeProfile::new(SqlType::BigInt, Coercion::Int)
        } else if self.exceeds(self.float, FLOAT_THRESHOLD) {
            TypeProfile::new(SqlType::DoublePrecision, Coercion::Float)
        } else if self.exceeds(self.timestamp, TIMESTAMP_THRESHOLD) {
            TypeProfile::new(SqlType::Timestamp, Coercion::Timestamp)
        } else if self.exceeds(self.duration, DURATION_THRESHOLD) {
            TypeProfile::new(SqlType::Interval, Coercion::Duration)
        } else {
            TypeProfile::text()
        }
    }
}

/// Accepted as integer only when the integer and float readings agree.
fn is_exact_integer(cell: &Cell) -> bool {
    match (coerce_int(cell), coerce_float(cell)) {
        (Ok(Some(int)), Ok(Some(float))) => int as f64 == float,
        _ => false,
    }
}

fn native_profile<'a, I>(cells: I) -> Option<TypeProfile>
where
    I: IntoIterator<Item = &'a Cell>,
{
    let mut iter = cells.into_iter().filter(|c| !c.is_missing()).peekable();
    let first = iter.peek()?;
    let profile = match first {
        Cell::Bool(_) => TypeProfile::new(SqlType::Boolean, Coercion::Bool),
        Cell::Int(_) => TypeProfile::new(SqlType::BigInt, Coercion::Int),
        Cell::Float(_) => TypeProfile::new(SqlType::DoublePrecision, Coercion::Float),
        Cell::DateTime(_) => TypeProfile::new(SqlType::Timestamp, Coercion::Timestamp),
        Cell::Duration(_) => TypeProfile::new(SqlType::Interval, Coercion::Duration),
        Cell::Missing | Cell::Text(_) => return None,
    };
    let mut saw_float = false;
    for cell in iter {
        let same = match (&profile.sql_type, cell) {
            (SqlType::Boolean, Cell::Bool(_)) => true,
            (SqlType::BigInt | SqlType::DoublePrecision, Cell::Int(_)) => true,
            (SqlType::BigInt | SqlType::DoublePrecision, Cell::Float(_)) => {
                saw_float = true;
                true
            }
            (SqlType::Timestamp, Cell::DateTime(_)) => true,
            (SqlType::Interval, Cell::Duration(_)) => true,
            _ => false,
        };
        if !same {
            return None;
        }
    }
    if saw_float && profile.sql_type == SqlType::BigInt {
        return Some(TypeProfile::new(SqlType::DoublePrecision, Coercion::Float));
    }
    Some(profile)
}

/// Picks the narrowest storage type for a column of source cells.
pub fn infer<'a, I>(cells: I) -> TypeProfile
where
    I: IntoIterator<Item = &'a Cell>,
    I::IntoIter: Clone,
{
    let cells = cells.into_iter();
    if let Some(profile) = native_profile(cells.clone()) {
        return profile;
    }
    let mut tally = SampleTally::default();
    for cell in cells.filter(|c| !c.is_missing()).take(SAMPLE_SIZE) {
        tally.update(cell);
    }
    tally.decide()
}
