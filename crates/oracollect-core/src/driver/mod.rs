//! Database connection seam.
//!
//! The instance layer only talks to [`Connector`] and [`Session`]. The Oracle
//! adapter lives behind the `oracle` feature; [`mock`] provides a scriptable
//! in-memory database for tests.

pub mod mock;
#[cfg(feature = "oracle")]
pub mod oracle;

use std::time::Duration;

use thiserror::Error;

use crate::config::Secret;
use crate::data::{DataTable, TableError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("session is closed")]
    Closed,
}

impl DriverError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::Timeout(_))
    }
}

impl From<TableError> for DriverError {
    fn from(e: TableError) -> Self {
        DriverError::Query(e.to_string())
    }
}

/// Everything needed to open a session against one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectParams {
    pub dsn: String,
    pub user: String,
    pub password: Secret,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

/// Connection pool counters, published as `sql_driver_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub open: u32,
    pub busy: u32,
    pub max_open: u32,
}

/// One open (pooled) connection to an instance.
///
/// Calls block the current thread. Callers run them on the blocking pool.
pub trait Session: Send {
    fn ping(&mut self, timeout: Duration) -> Result<(), DriverError>;

    /// Runs `sql` and scans the result into `table`: header first, then one
    /// appended row per result row. Returns the row count.
    fn query(
        &mut self,
        sql: &str,
        timeout: Duration,
        table: &mut DataTable,
    ) -> Result<usize, DriverError>;

    fn pool_stats(&self) -> PoolStats;

    fn close(&mut self) -> Result<(), DriverError>;
}

pub trait Connector: Send + Sync {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Session>, DriverError>;
}
