//! In-memory result set and its conversion into metric points.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use super::metric::{Fields, MetricPoint, Tags};
use super::value::{Cell, MetricKind, coerce};
use crate::config::QueryConfig;

/// Name of the column holding the values of a pivoted result.
pub const VALUE_COLUMN: &str = "value";

/// Shape mismatches between a query's configuration and its actual result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TableError {
    #[error("table is not bound to a query definition")]
    Unbound,

    #[error("header must be set before rows are appended")]
    HeaderNotSet,

    #[error("row has {got} cells, header has {expected}")]
    RowWidth { expected: usize, got: usize },

    #[error("transpose requested but field_to_append is not configured")]
    TransposeUnconfigured,

    #[error("column '{0}' not found in result header")]
    MissingColumn(String),

    #[error("label columns not found in result header: {}", .0.join(", "))]
    MissingLabels(Vec<String>),

    #[error("none of the configured metric columns is present in the result")]
    NoFields,

    #[error("metrics_type has no entry for the 'value' column")]
    MissingValueType,
}

/// Output of [`DataTable::get_metrics`].
#[derive(Debug, Default)]
pub struct TableMetrics {
    pub points: Vec<MetricPoint>,
    /// Cells that could not be coerced and were replaced by a zero value.
    pub coerce_errors: u64,
}

/// Result of one query execution.
///
/// Column names are lower-cased on [`set_header`](Self::set_header). Every
/// row holds exactly one cell per header column.
#[derive(Debug, Default, Clone)]
pub struct DataTable {
    header: Vec<String>,
    rows: Vec<Vec<Cell>>,
    query: Option<Arc<QueryConfig>>,
}

impl DataTable {
    /// A table with no query bound. Enough for scanning metadata rows.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_query(query: Arc<QueryConfig>) -> Self {
        Self {
            query: Some(query),
            ..Self::default()
        }
    }

    pub fn query(&self) -> Option<&QueryConfig> {
        self.query.as_deref()
    }

    /// Stores lower-cased column names and drops any existing rows.
    pub fn set_header<I, S>(&mut self, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.header = columns
            .into_iter()
            .map(|c| c.as_ref().trim().to_lowercase())
            .collect();
        self.rows.clear();
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    /// Appends a row of NULL cells and hands it back for the driver to fill.
    pub fn append_empty_row(&mut self) -> Result<&mut [Cell], TableError> {
        if self.header.is_empty() {
            return Err(TableError::HeaderNotSet);
        }
        self.rows.push(vec![Cell::Null; self.header.len()]);
        let idx = self.rows.len() - 1;
        Ok(&mut self.rows[idx])
    }

    /// Appends a fully built row.
    pub fn push_row(&mut self, row: Vec<Cell>) -> Result<(), TableError> {
        if self.header.is_empty() {
            return Err(TableError::HeaderNotSet);
        }
        if row.len() != self.header.len() {
            return Err(TableError::RowWidth {
                expected: self.header.len(),
                got: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    /// Cell of `row` under column `name`.
    pub fn cell(&self, row: usize, name: &str) -> Option<&Cell> {
        let col = self.column_index(name)?;
        self.rows.get(row).map(|r| &r[col])
    }

    /// Pivots a long result (one row per metric name) into one wide row.
    ///
    /// Each row contributes a field named after its `pivot` cell (lower-cased,
    /// spaces replaced by `_`) with the cell of the `value` column as its raw
    /// value. Label columns must all be present and are carried over from the
    /// first row. The returned table is bound to a copy of the query whose
    /// `metrics_type` maps every pivoted name to the kind declared for
    /// `value`. Later rows with the same name replace earlier ones.
    pub fn transpose(&self, pivot: &str) -> Result<DataTable, TableError> {
        let query = self.query.as_deref().ok_or(TableError::Unbound)?;
        if query.pivot_column().is_none() {
            return Err(TableError::TransposeUnconfigured);
        }
        let pivot = pivot.to_lowercase();
        let pivot_idx = self
            .column_index(&pivot)
            .ok_or_else(|| TableError::MissingColumn(pivot.clone()))?;
        let value_idx = self
            .column_index(VALUE_COLUMN)
            .ok_or_else(|| TableError::MissingColumn(VALUE_COLUMN.to_string()))?;
        let value_kind = *query
            .metrics_type
            .get(VALUE_COLUMN)
            .ok_or(TableError::MissingValueType)?;

        let label_cols = self.label_columns(query)?;

        let mut values: BTreeMap<String, Cell> = BTreeMap::new();
        for row in &self.rows {
            let name = row[pivot_idx].render().to_lowercase().replace(' ', "_");
            if name.is_empty() {
                continue;
            }
            values.insert(name, row[value_idx].clone());
        }

        let pivoted = QueryConfig {
            metrics_type: values.keys().map(|k| (k.clone(), value_kind)).collect(),
            field_to_append: String::new(),
            ..query.clone()
        };

        let mut out = DataTable::for_query(Arc::new(pivoted));
        out.set_header(
            label_cols
                .iter()
                .map(|(l, _)| *l)
                .chain(values.keys().map(String::as_str)),
        );
        if let Some(first) = self.rows.first() {
            let row = label_cols
                .iter()
                .map(|(_, i)| first[*i].clone())
                .chain(values.into_values())
                .collect();
            out.push_row(row)?;
        }
        Ok(out)
    }

    /// Header position of every declared label column. Any missing one is
    /// an error.
    fn label_columns<'q>(&self, query: &'q QueryConfig) -> Result<Vec<(&'q str, usize)>, TableError> {
        let mut found = Vec::with_capacity(query.labels.len());
        let mut missing = Vec::new();
        for label in &query.labels {
            match self.column_index(label) {
                Some(i) => found.push((label.as_str(), i)),
                None => missing.push(label.clone()),
            }
        }
        if missing.is_empty() {
            Ok(found)
        } else {
            Err(TableError::MissingLabels(missing))
        }
    }

    /// Converts the table into metric points named after the query context.
    ///
    /// Tags are `extra_labels` plus the rendered label columns; fields are the
    /// configured metric columns coerced to their declared kinds. NULL cells
    /// are left out. A cell that fails to coerce becomes its kind's zero value
    /// and is counted in [`TableMetrics::coerce_errors`]. All points share one
    /// timestamp.
    pub fn get_metrics(&self, extra_labels: &Tags) -> Result<TableMetrics, TableError> {
        let query = self.query.as_deref().ok_or(TableError::Unbound)?;
        if let Some(pivot) = query.pivot_column() {
            return self.transpose(pivot)?.get_metrics(extra_labels);
        }

        let label_cols = self.label_columns(query)?;

        let metric_cols: Vec<(&str, usize, MetricKind)> = query
            .metrics_type
            .iter()
            .filter_map(|(name, kind)| self.column_index(name).map(|i| (name.as_str(), i, *kind)))
            .collect();
        if metric_cols.is_empty() && !self.rows.is_empty() {
            return Err(TableError::NoFields);
        }

        let ts = Utc::now();
        let mut result = TableMetrics::default();
        for row in &self.rows {
            let mut fields = Fields::new();
            for &(name, idx, kind) in &metric_cols {
                let cell = &row[idx];
                if cell.is_null() {
                    continue;
                }
                let value = match coerce(cell, kind) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            context = %query.context,
                            column = name,
                            error = %e,
                            "cell coercion failed, using zero value"
                        );
                        result.coerce_errors += 1;
                        kind.zero()
                    }
                };
                fields.insert(name.to_string(), value);
            }
            if fields.is_empty() {
                continue;
            }

            let mut tags = extra_labels.clone();
            for &(label, idx) in &label_cols {
                tags.insert(label.to_string(), row[idx].render());
            }
            result
                .points
                .push(MetricPoint::new(&query.context, tags, fields, ts));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::FieldValue;

    fn query(labels: &[&str], types: &[(&str, MetricKind)], pivot: &str) -> Arc<QueryConfig> {
        Arc::new(QueryConfig {
            id: "q".into(),
            context: "oracle_test".into(),
            request: "select 1 from dual".into(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            metrics_type: types.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            field_to_append: pivot.into(),
            ..QueryConfig::default()
        })
    }

    fn table(q: Arc<QueryConfig>, header: &[&str], rows: Vec<Vec<Cell>>) -> DataTable {
        let mut t = DataTable::for_query(q);
        t.set_header(header);
        for r in rows {
            t.push_row(r).unwrap();
        }
        t
    }

    #[test]
    fn test_header_is_lowercased_and_resets_rows() {
        let mut t = DataTable::new();
        t.set_header(["INST_ID", "Value"]);
        assert_eq!(t.header(), ["inst_id", "value"]);

        t.append_empty_row().unwrap()[0] = Cell::Int(1);
        assert_eq!(t.len(), 1);
        assert_eq!(t.cell(0, "inst_id"), Some(&Cell::Int(1)));
        assert_eq!(t.cell(0, "value"), Some(&Cell::Null));

        t.set_header(["a"]);
        assert!(t.is_empty());
    }

    #[test]
    fn test_rows_require_header_and_matching_width() {
        let mut t = DataTable::new();
        assert_eq!(t.append_empty_row().unwrap_err(), TableError::HeaderNotSet);
        t.set_header(["a", "b"]);
        assert_eq!(
            t.push_row(vec![Cell::Int(1)]).unwrap_err(),
            TableError::RowWidth {
                expected: 2,
                got: 1
            }
        );
    }

    #[test]
    fn test_transpose_builds_single_wide_row() {
        let q = query(&[], &[("value", MetricKind::Integer)], "metric_name");
        let t = table(
            q,
            &["METRIC_NAME", "VALUE"],
            vec![
                vec!["cpu".into(), Cell::Int(10)],
                vec!["mem".into(), Cell::Int(20)],
            ],
        );

        let wide = t.transpose("metric_name").unwrap();
        assert_eq!(wide.len(), 1);
        assert_eq!(wide.cell(0, "cpu"), Some(&Cell::Int(10)));
        assert_eq!(wide.cell(0, "mem"), Some(&Cell::Int(20)));

        let m = t.get_metrics(&Tags::new()).unwrap();
        assert_eq!(m.points.len(), 1);
        let p = &m.points[0];
        assert_eq!(p.fields().len(), 2);
        assert_eq!(p.field("cpu"), Some(&FieldValue::Int(10)));
        assert_eq!(p.field("mem"), Some(&FieldValue::Int(20)));
    }

    #[test]
    fn test_transpose_normalizes_names_and_carries_labels() {
        let q = query(&["instance"], &[("value", MetricKind::Float)], "metric_name");
        let t = table(
            q,
            &["instance", "metric_name", "value"],
            vec![
                vec!["ORCL1".into(), "Buffer Cache Hit Ratio".into(), Cell::Decimal("99.5".into())],
                vec!["ORCL1".into(), "".into(), Cell::Int(1)],
            ],
        );

        let m = t.get_metrics(&Tags::new()).unwrap();
        assert_eq!(m.points.len(), 1);
        let p = &m.points[0];
        assert_eq!(p.tag("instance"), Some("ORCL1"));
        assert_eq!(
            p.field("buffer_cache_hit_ratio"),
            Some(&FieldValue::Float(99.5))
        );
        assert_eq!(p.fields().len(), 1);
    }

    #[test]
    fn test_transpose_errors() {
        let unpivoted = query(&[], &[("value", MetricKind::Integer)], "");
        let t = table(unpivoted, &["metric_name", "value"], vec![]);
        assert_eq!(
            t.transpose("metric_name").unwrap_err(),
            TableError::TransposeUnconfigured
        );

        let q = query(&[], &[("value", MetricKind::Integer)], "metric_name");
        let t = table(q.clone(), &["name", "value"], vec![]);
        assert_eq!(
            t.transpose("metric_name").unwrap_err(),
            TableError::MissingColumn("metric_name".into())
        );

        let t = table(q, &["metric_name", "val"], vec![]);
        assert_eq!(
            t.transpose("metric_name").unwrap_err(),
            TableError::MissingColumn("value".into())
        );

        assert_eq!(
            DataTable::new().transpose("x").unwrap_err(),
            TableError::Unbound
        );
    }

    #[test]
    fn test_transpose_rejects_missing_label_column() {
        let q = query(&["host"], &[("value", MetricKind::Integer)], "metric_name");
        let t = table(q, &["metric_name", "value"], vec![vec!["cpu".into(), Cell::Int(10)]]);
        assert_eq!(
            t.transpose("metric_name").unwrap_err(),
            TableError::MissingLabels(vec!["host".into()])
        );
        assert_eq!(
            t.get_metrics(&Tags::new()).unwrap_err(),
            TableError::MissingLabels(vec!["host".into()])
        );
    }

    #[test]
    fn test_transpose_of_empty_result_has_no_rows() {
        let q = query(&[], &[("value", MetricKind::Integer)], "metric_name");
        let t = table(q, &["metric_name", "value"], vec![]);
        assert!(t.transpose("metric_name").unwrap().is_empty());
        assert!(t.get_metrics(&Tags::new()).unwrap().points.is_empty());
    }

    #[test]
    fn test_metrics_carry_labels_and_share_timestamp() {
        let q = query(&["instance"], &[("sessions", MetricKind::Integer)], "");
        let t = table(
            q,
            &["INSTANCE", "SESSIONS"],
            vec![
                vec!["ORCL1".into(), Cell::Decimal("12".into())],
                vec!["ORCL2".into(), Cell::Decimal("7".into())],
            ],
        );
        let mut extra = Tags::new();
        extra.insert("env".into(), "prod".into());
        extra.insert("instance".into(), "overridden".into());

        let m = t.get_metrics(&extra).unwrap();
        assert_eq!(m.points.len(), 2);
        assert_eq!(m.points[0].name(), "oracle_test");
        assert_eq!(m.points[0].tag("instance"), Some("ORCL1"));
        assert_eq!(m.points[0].tag("env"), Some("prod"));
        assert_eq!(m.points[1].field("sessions"), Some(&FieldValue::Int(7)));
        assert_eq!(m.points[0].timestamp(), m.points[1].timestamp());
    }

    #[test]
    fn test_missing_label_column_is_an_error() {
        let q = query(&["instance", "host"], &[("sessions", MetricKind::Integer)], "");
        let t = table(q, &["instance", "sessions"], vec![vec!["a".into(), Cell::Int(1)]]);
        assert_eq!(
            t.get_metrics(&Tags::new()).unwrap_err(),
            TableError::MissingLabels(vec!["host".into()])
        );
    }

    #[test]
    fn test_no_metric_columns_is_an_error() {
        let q = query(&[], &[("sessions", MetricKind::Integer)], "");
        let t = table(q, &["other"], vec![vec![Cell::Int(1)]]);
        assert_eq!(t.get_metrics(&Tags::new()).unwrap_err(), TableError::NoFields);
    }

    #[test]
    fn test_bad_cells_degrade_to_zero_and_are_counted() {
        let q = query(
            &[],
            &[("a", MetricKind::Integer), ("b", MetricKind::Float)],
            "",
        );
        let t = table(
            q,
            &["a", "b"],
            vec![
                vec!["n/a".into(), Cell::Float(1.5)],
                vec![Cell::Null, Cell::Null],
            ],
        );
        let m = t.get_metrics(&Tags::new()).unwrap();
        assert_eq!(m.coerce_errors, 1);
        // The all-NULL row yields no fields and is skipped.
        assert_eq!(m.points.len(), 1);
        assert_eq!(m.points[0].field("a"), Some(&FieldValue::Int(0)));
        assert_eq!(m.points[0].field("b"), Some(&FieldValue::Float(1.5)));
    }
}
