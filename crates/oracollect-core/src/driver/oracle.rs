//! Oracle adapter built on ODPI-C via the `oracle` crate.

use std::time::Duration;

use oracle::pool::{CloseMode, GetMode, Pool, PoolBuilder};
use oracle::sql_type::OracleType;
use oracle::{Connection, SqlValue};
use tracing::debug;

use super::{ConnectParams, Connector, DriverError, PoolStats, Session};
use crate::data::{Cell, DataTable};

/// ODPI-C raises these when a call exceeds `set_call_timeout`.
const TIMEOUT_CODES: [&str; 3] = ["DPI-1067", "ORA-03156", "ORA-01013"];

#[derive(Debug, Default, Clone, Copy)]
pub struct OracleConnector;

impl Connector for OracleConnector {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Session>, DriverError> {
        let mut builder = PoolBuilder::new(
            params.user.as_str(),
            params.password.expose(),
            params.dsn.as_str(),
        );
        builder
            .min_connections(0)
            .max_connections(params.max_connections)
            .get_mode(GetMode::TimedWait(params.connect_timeout));
        let pool = builder
            .build()
            .map_err(|e| DriverError::Connect(e.to_string()))?;
        debug!(dsn = %params.dsn, max = params.max_connections, "session pool created");
        Ok(Box::new(OracleSession {
            pool: Some(pool),
            max_open: params.max_connections,
        }))
    }
}

pub struct OracleSession {
    pool: Option<Pool>,
    max_open: u32,
}

impl OracleSession {
    fn acquire(&self, timeout: Duration) -> Result<Connection, DriverError> {
        let pool = self.pool.as_ref().ok_or(DriverError::Closed)?;
        let conn = pool.get().map_err(|e| map_error(e, timeout))?;
        conn.set_call_timeout(Some(timeout))
            .map_err(|e| map_error(e, timeout))?;
        Ok(conn)
    }
}

impl Session for OracleSession {
    fn ping(&mut self, timeout: Duration) -> Result<(), DriverError> {
        let conn = self.acquire(timeout)?;
        conn.ping().map_err(|e| map_error(e, timeout))
    }

    fn query(
        &mut self,
        sql: &str,
        timeout: Duration,
        table: &mut DataTable,
    ) -> Result<usize, DriverError> {
        let conn = self.acquire(timeout)?;
        let rows = conn.query(sql, &[]).map_err(|e| map_error(e, timeout))?;

        let columns = rows.column_info();
        table.set_header(columns.iter().map(|c| c.name()));
        let types: Vec<OracleType> = columns.iter().map(|c| c.oracle_type().clone()).collect();

        for row in rows {
            let row = row.map_err(|e| map_error(e, timeout))?;
            let cells = table.append_empty_row()?;
            for ((slot, value), ty) in cells.iter_mut().zip(row.sql_values()).zip(&types) {
                *slot = to_cell(value, ty).map_err(|e| map_error(e, timeout))?;
            }
        }
        Ok(table.len())
    }

    fn pool_stats(&self) -> PoolStats {
        let Some(pool) = self.pool.as_ref() else {
            return PoolStats::default();
        };
        PoolStats {
            open: pool.open_count().unwrap_or(0),
            busy: pool.busy_count().unwrap_or(0),
            max_open: self.max_open,
        }
    }

    fn close(&mut self) -> Result<(), DriverError> {
        let pool = self.pool.take().ok_or(DriverError::Closed)?;
        pool.close(&CloseMode::Force)
            .map_err(|e| DriverError::Query(e.to_string()))
    }
}

fn to_cell(value: &SqlValue, ty: &OracleType) -> oracle::Result<Cell> {
    if value.is_null()? {
        return Ok(Cell::Null);
    }
    Ok(match ty {
        OracleType::Number(_, _) | OracleType::Float(_) => Cell::Decimal(value.get::<String>()?),
        OracleType::BinaryFloat | OracleType::BinaryDouble => Cell::Float(value.get::<f64>()?),
        OracleType::Int64 | OracleType::UInt64 => Cell::Int(value.get::<i64>()?),
        OracleType::Boolean => Cell::Bool(value.get::<bool>()?),
        _ => Cell::Text(value.get::<String>()?),
    })
}

fn map_error(err: oracle::Error, timeout: Duration) -> DriverError {
    let msg = err.to_string();
    if TIMEOUT_CODES.iter().any(|code| msg.contains(code)) {
        DriverError::Timeout(timeout)
    } else {
        DriverError::Query(msg)
    }
}
