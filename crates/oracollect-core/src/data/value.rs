//! Raw result-set cells and their coercion into typed metric values.
//!
//! A [`Cell`] is whatever the driver scanned out of a column. Each configured
//! metric column declares a [`MetricKind`]; [`coerce`] turns the cell into a
//! [`FieldValue`] of that kind. Coercion is lenient at the table level: a cell
//! that cannot be parsed degrades to [`MetricKind::zero`] instead of failing
//! the row (see `DataTable::get_metrics`).

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// One untyped value as scanned from a database row.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    /// SQL NULL, or a cell the driver never wrote.
    #[default]
    Null,
    /// Native integer column.
    Int(i64),
    /// Native binary floating point column.
    Float(f64),
    /// Native boolean column.
    Bool(bool),
    /// Character data (also dates/timestamps rendered by the driver).
    Text(String),
    /// High-precision decimal in its canonical text form (Oracle `NUMBER`).
    Decimal(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Renders the cell as text, the way tag values and pivot names are built.
    ///
    /// NULL renders as an empty string.
    pub fn render(&self) -> String {
        match coerce(self, MetricKind::String) {
            Ok(FieldValue::Str(s)) => s,
            _ => String::new(),
        }
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self {
        Cell::Int(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Self {
        Cell::Float(v)
    }
}

impl From<bool> for Cell {
    fn from(v: bool) -> Self {
        Cell::Bool(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self {
        Cell::Text(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Self {
        Cell::Text(v)
    }
}

/// Declared type of a metric column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum MetricKind {
    Integer,
    /// Monotonic integer; encoded exactly like `Integer`.
    Counter,
    Float,
    Bool,
    String,
}

impl MetricKind {
    /// Value a cell degrades to when it cannot be coerced.
    pub fn zero(self) -> FieldValue {
        match self {
            MetricKind::Integer | MetricKind::Counter => FieldValue::Int(0),
            MetricKind::Float => FieldValue::Float(0.0),
            MetricKind::Bool => FieldValue::Bool(false),
            MetricKind::String => FieldValue::Str(String::new()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Integer => "integer",
            MetricKind::Counter => "counter",
            MetricKind::Float => "float",
            MetricKind::Bool => "bool",
            MetricKind::String => "string",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "integer" | "int" => Ok(MetricKind::Integer),
            "counter" => Ok(MetricKind::Counter),
            "float" => Ok(MetricKind::Float),
            "bool" | "boolean" => Ok(MetricKind::Bool),
            "string" => Ok(MetricKind::String),
            other => Err(format!("unknown metric type '{other}'")),
        }
    }
}

impl TryFrom<String> for MetricKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A typed metric field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

/// Error returned when a cell cannot be coerced into its declared kind.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoerceError {
    #[error("null value")]
    Null,
    #[error("cannot parse {value:?} as {kind}")]
    Unparseable { value: String, kind: MetricKind },
}

/// Coerces a raw cell into the requested kind.
///
/// Numeric sources convert with `as` semantics (truncation toward zero,
/// saturating at the target range). Text and decimal sources are trimmed and
/// parsed with the target kind's grammar.
pub fn coerce(cell: &Cell, kind: MetricKind) -> Result<FieldValue, CoerceError> {
    match kind {
        MetricKind::Integer | MetricKind::Counter => to_int(cell).map(FieldValue::Int),
        MetricKind::Float => to_float(cell).map(FieldValue::Float),
        MetricKind::Bool => to_bool(cell).map(FieldValue::Bool),
        MetricKind::String => to_text(cell).map(FieldValue::Str),
    }
}

fn unparseable(value: &str, kind: MetricKind) -> CoerceError {
    CoerceError::Unparseable {
        value: value.to_string(),
        kind,
    }
}

fn to_int(cell: &Cell) -> Result<i64, CoerceError> {
    match cell {
        Cell::Null => Err(CoerceError::Null),
        Cell::Int(v) => Ok(*v),
        Cell::Float(v) => Ok(*v as i64),
        Cell::Bool(v) => Ok(i64::from(*v)),
        Cell::Text(s) | Cell::Decimal(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| unparseable(s, MetricKind::Integer)),
    }
}

fn to_float(cell: &Cell) -> Result<f64, CoerceError> {
    match cell {
        Cell::Null => Err(CoerceError::Null),
        Cell::Int(v) => Ok(*v as f64),
        Cell::Float(v) => Ok(*v),
        Cell::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
        Cell::Text(s) | Cell::Decimal(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| unparseable(s, MetricKind::Float)),
    }
}

fn to_bool(cell: &Cell) -> Result<bool, CoerceError> {
    match cell {
        Cell::Null => Err(CoerceError::Null),
        Cell::Int(v) => Ok(*v > 0),
        Cell::Float(v) => Ok(*v != 0.0),
        Cell::Bool(v) => Ok(*v),
        Cell::Text(s) | Cell::Decimal(s) => {
            parse_bool(s.trim()).ok_or_else(|| unparseable(s, MetricKind::Bool))
        }
    }
}

fn to_text(cell: &Cell) -> Result<String, CoerceError> {
    match cell {
        Cell::Null => Err(CoerceError::Null),
        Cell::Int(v) => Ok(v.to_string()),
        Cell::Float(v) => Ok(v.to_string()),
        Cell::Bool(v) => Ok(v.to_string()),
        Cell::Text(s) | Cell::Decimal(s) => Ok(s.trim().to_string()),
    }
}

/// Boolean grammar shared with most config/driver tooling:
/// `1 t T TRUE true True` and `0 f F FALSE false False`.
fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
