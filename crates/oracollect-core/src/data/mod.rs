//! Result sets, typed values and metric points.

pub mod metric;
pub mod table;
pub mod value;

pub use metric::{Fields, MetricPoint, Tags};
pub use table::{DataTable, TableError, TableMetrics};
pub use value::{Cell, CoerceError, FieldValue, MetricKind, coerce};
