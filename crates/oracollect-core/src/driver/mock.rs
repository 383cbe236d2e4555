//! Scriptable in-memory database for tests.
//!
//! A [`MockConnector`] holds one [`MockDatabase`] per DSN. Each database maps
//! SQL fragments to canned results; the most recently registered fragment
//! contained in a statement (case-insensitively) answers it. Databases can be
//! replaced while sessions are open, which is how tests move an instance
//! between states across cycles.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{ConnectParams, Connector, DriverError, PoolStats, Session};
use crate::data::{Cell, DataTable};

#[derive(Debug, Clone)]
enum Outcome {
    Rows {
        header: Vec<String>,
        rows: Vec<Vec<Cell>>,
    },
    Error(String),
}

#[derive(Debug, Clone)]
struct Response {
    fragment: String,
    delay: Duration,
    outcome: Outcome,
}

/// Canned behaviour of one database.
#[derive(Debug, Clone, Default)]
pub struct MockDatabase {
    refuse_connections: bool,
    responses: Vec<Response>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers statements containing `fragment` with the given rows.
    pub fn on(mut self, fragment: &str, header: &[&str], rows: Vec<Vec<Cell>>) -> Self {
        self.responses.push(Response {
            fragment: fragment.to_lowercase(),
            delay: Duration::ZERO,
            outcome: Outcome::Rows {
                header: header.iter().map(|s| s.to_string()).collect(),
                rows,
            },
        });
        self
    }

    pub fn on_error(mut self, fragment: &str, message: &str) -> Self {
        self.responses.push(Response {
            fragment: fragment.to_lowercase(),
            delay: Duration::ZERO,
            outcome: Outcome::Error(message.to_string()),
        });
        self
    }

    /// Makes the latest response for `fragment` take `delay` to arrive.
    pub fn slow(mut self, fragment: &str, delay: Duration) -> Self {
        let fragment = fragment.to_lowercase();
        if let Some(r) = self.responses.iter_mut().rev().find(|r| r.fragment == fragment) {
            r.delay = delay;
        }
        self
    }

    pub fn refuse_connections(mut self) -> Self {
        self.refuse_connections = true;
        self
    }

    fn respond(&self, sql: &str) -> Option<&Response> {
        let sql = sql.to_lowercase();
        self.responses
            .iter()
            .rev()
            .find(|r| sql.contains(&r.fragment))
    }
}

#[derive(Debug, Default)]
struct Shared {
    databases: HashMap<String, MockDatabase>,
    connects: Vec<String>,
    closes: Vec<String>,
    statements: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    shared: Arc<Mutex<Shared>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs or replaces the database reachable at `dsn`.
    pub fn set_database(&self, dsn: &str, db: MockDatabase) {
        self.shared.lock().databases.insert(dsn.to_string(), db);
    }

    pub fn remove_database(&self, dsn: &str) {
        self.shared.lock().databases.remove(dsn);
    }

    /// DSNs of every successful connect, in order.
    pub fn connects(&self) -> Vec<String> {
        self.shared.lock().connects.clone()
    }

    /// DSNs of every session closed, in order.
    pub fn closes(&self) -> Vec<String> {
        self.shared.lock().closes.clone()
    }

    /// `(dsn, sql)` of every statement executed.
    pub fn statements(&self) -> Vec<(String, String)> {
        self.shared.lock().statements.clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Session>, DriverError> {
        let mut shared = self.shared.lock();
        match shared.databases.get(&params.dsn) {
            None => Err(DriverError::Connect(format!(
                "ORA-12514: listener does not know of service {}",
                params.dsn
            ))),
            Some(db) if db.refuse_connections => Err(DriverError::Connect(
                "ORA-01017: invalid username/password; logon denied".to_string(),
            )),
            Some(_) => {
                shared.connects.push(params.dsn.clone());
                Ok(Box::new(MockSession {
                    dsn: params.dsn.clone(),
                    max_open: params.max_connections,
                    shared: Arc::clone(&self.shared),
                    busy: Arc::new(AtomicBool::new(false)),
                    closed: false,
                }))
            }
        }
    }
}

pub struct MockSession {
    dsn: String,
    max_open: u32,
    shared: Arc<Mutex<Shared>>,
    busy: Arc<AtomicBool>,
    closed: bool,
}

impl MockSession {
    fn lookup(&self, sql: &str) -> Result<Response, DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        let mut shared = self.shared.lock();
        shared.statements.push((self.dsn.clone(), sql.to_string()));
        let db = shared
            .databases
            .get(&self.dsn)
            .ok_or_else(|| DriverError::Query("ORA-03113: end-of-file on communication channel".into()))?;
        db.respond(sql)
            .cloned()
            .ok_or_else(|| DriverError::Query(format!("ORA-00942: table or view does not exist: {sql}")))
    }
}

impl Session for MockSession {
    fn ping(&mut self, _timeout: Duration) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        if self.shared.lock().databases.contains_key(&self.dsn) {
            Ok(())
        } else {
            Err(DriverError::Query("ORA-03113: end-of-file on communication channel".into()))
        }
    }

    fn query(
        &mut self,
        sql: &str,
        timeout: Duration,
        table: &mut DataTable,
    ) -> Result<usize, DriverError> {
        let response = self.lookup(sql)?;
        self.busy.store(true, Ordering::SeqCst);
        let waited = response.delay.min(timeout);
        if !waited.is_zero() {
            std::thread::sleep(waited);
        }
        self.busy.store(false, Ordering::SeqCst);
        if response.delay >= timeout && !response.delay.is_zero() {
            return Err(DriverError::Timeout(timeout));
        }

        match response.outcome {
            Outcome::Error(msg) => Err(DriverError::Query(msg)),
            Outcome::Rows { header, rows } => {
                table.set_header(&header);
                for row in rows {
                    table.push_row(row)?;
                }
                Ok(table.len())
            }
        }
    }

    fn pool_stats(&self) -> PoolStats {
        PoolStats {
            open: u32::from(!self.closed),
            busy: u32::from(self.busy.load(Ordering::SeqCst)),
            max_open: self.max_open,
        }
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        self.closed = true;
        self.shared.lock().closes.push(self.dsn.clone());
        Ok(())
    }
}
