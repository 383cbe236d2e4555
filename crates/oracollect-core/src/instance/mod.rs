//! Monitored database instances.
//!
//! An [`Instance`] owns its session behind a `parking_lot::Mutex`; every
//! operation that touches the session (connect, metadata refresh, query,
//! close) runs on the blocking pool while holding that lock, so calls against
//! one instance are serialized and calls against different instances are not.
//! After each refresh the derived metadata is published as an immutable
//! [`InstanceView`] that readers can take without waiting on a slow query.

pub mod health;
pub mod labels;
pub mod queries;
pub mod registry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{Span, debug, info, info_span, warn};

use crate::data::{DataTable, MetricPoint, Tags};
use crate::driver::{Connector, DriverError, PoolStats, Session};
use labels::DynamicRules;
use queries::{DatabaseInfo, InstanceInfo, PdbInfo, ProductVersion};

pub use registry::{InstanceRegistry, Reconciliation, reconcile};

/// Connect, ping, version probe and the first refresh share this many
/// connect timeouts.
const INIT_BUDGETS: u32 = 2;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InstanceError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("instance busy: lock not acquired within {0:?}")]
    LockTimeout(Duration),

    #[error("instance is closed")]
    Closed,

    #[error("instance has no open session")]
    NotReady,

    #[error("unexpected metadata: {0}")]
    Metadata(String),

    #[error("blocking task failed: {0}")]
    Task(String),
}

impl InstanceError {
    /// Timeouts are retried next cycle; everything else means the call failed.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            InstanceError::LockTimeout(_) | InstanceError::Driver(DriverError::Timeout(_))
        )
    }
}

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Discovered,
    Connecting,
    VersionProbe,
    MetadataRefresh,
    Active,
    Closed,
}

/// Settings shared by every instance.
pub struct InstanceContext {
    pub connector: Arc<dyn Connector>,
    pub rules: DynamicRules,
    pub clusterware: bool,
    pub connect_timeout: Duration,
}

/// Snapshot of an instance's metadata as of its last refresh.
#[derive(Debug, Clone, Default)]
pub struct InstanceView {
    pub sid: String,
    pub pid: u32,
    pub phase: Phase,
    pub version: ProductVersion,
    pub info: InstanceInfo,
    /// `None` while the instance is only STARTED.
    pub db: Option<DatabaseInfo>,
    pub pdbs: Vec<PdbInfo>,
    pub labels: Tags,
    pub valid_for_db_query: bool,
}

impl InstanceView {
    /// Instance name, or the SID before the first refresh.
    pub fn name(&self) -> &str {
        if self.info.name.is_empty() {
            &self.sid
        } else {
            &self.info.name
        }
    }
}

/// Result of [`Instance::query`].
#[derive(Debug)]
pub struct QueryOutput {
    pub table: DataTable,
    pub rows: usize,
    pub elapsed: Duration,
}

struct SessionState {
    session: Option<Box<dyn Session>>,
    version: ProductVersion,
    closed: bool,
}

pub struct Instance {
    sid: String,
    ctx: Arc<InstanceContext>,
    span: Span,
    /// Set once `end` starts; no new session work begins after that.
    closing: AtomicBool,
    state: Mutex<SessionState>,
    view: RwLock<Arc<InstanceView>>,
}

impl Instance {
    pub fn new(sid: impl Into<String>, pid: u32, ctx: Arc<InstanceContext>) -> Arc<Self> {
        let sid = sid.into();
        let span = info_span!("instance", sid = %sid);
        let view = InstanceView {
            sid: sid.clone(),
            pid,
            valid_for_db_query: !ctx.clusterware,
            ..InstanceView::default()
        };
        Arc::new(Self {
            sid,
            ctx,
            span,
            closing: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                session: None,
                version: ProductVersion::default(),
                closed: false,
            }),
            view: RwLock::new(Arc::new(view)),
        })
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Metadata as of the last successful refresh.
    pub fn view(&self) -> Arc<InstanceView> {
        Arc::clone(&self.view.read())
    }

    pub fn set_pid(&self, pid: u32) {
        self.update_view(|v| v.pid = pid);
    }

    fn update_view(&self, f: impl FnOnce(&mut InstanceView)) {
        let mut guard = self.view.write();
        let mut next = InstanceView::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Runs `f` on the blocking pool with the session lock held. The whole
    /// call, lock wait included, is bounded by `budget`.
    async fn with_session<T, F>(self: &Arc<Self>, budget: Duration, f: F) -> Result<T, InstanceError>
    where
        T: Send + 'static,
        F: FnOnce(&Instance, &mut SessionState, Instant) -> Result<T, InstanceError> + Send + 'static,
    {
        if self.is_closing() {
            return Err(InstanceError::Closed);
        }
        let this = Arc::clone(self);
        let deadline = Instant::now() + budget;
        let handle = tokio::task::spawn_blocking(move || {
            let _enter = this.span.enter();
            let mut state = this
                .state
                .try_lock_for(budget)
                .ok_or(InstanceError::LockTimeout(budget))?;
            if state.closed || this.is_closing() {
                return Err(InstanceError::Closed);
            }
            f(&this, &mut *state, deadline)
        });
        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(InstanceError::Task(join.to_string())),
            Err(_) => Err(DriverError::Timeout(budget).into()),
        }
    }

    /// Connects, probes the version and runs the first metadata refresh.
    ///
    /// On failure the session is closed again and the instance must not be
    /// registered.
    pub async fn init(self: &Arc<Self>) -> Result<(), InstanceError> {
        let budget = self.ctx.connect_timeout * INIT_BUDGETS;
        self.with_session(budget, |inst, state, deadline| {
            let result = inst.connect(state, deadline);
            if result.is_err()
                && let Some(mut session) = state.session.take()
            {
                let _ = session.close();
            }
            result
        })
        .await
    }

    fn connect(&self, state: &mut SessionState, deadline: Instant) -> Result<(), InstanceError> {
        let timeout = self.ctx.connect_timeout;
        self.update_view(|v| v.phase = Phase::Connecting);
        let params = self.ctx.rules.connect_params(&self.sid);
        debug!(dsn = %params.dsn, user = %params.user, "connecting");
        let session = state.session.insert(self.ctx.connector.connect(&params)?);
        session.ping(remaining(deadline)?.min(timeout))?;

        self.update_view(|v| v.phase = Phase::VersionProbe);
        let mut t = DataTable::new();
        session.query(queries::VERSION_PROBE, remaining(deadline)?.min(timeout), &mut t)?;
        let raw = queries::text(&t, 0, "version");
        state.version = raw.parse().map_err(InstanceError::Metadata)?;
        info!(version = %state.version, "connected");

        self.refresh(state, deadline)
    }

    /// Re-reads instance, database and contained-database metadata.
    pub async fn update_info(self: &Arc<Self>) -> Result<(), InstanceError> {
        self.with_session(self.ctx.connect_timeout, |inst, state, deadline| {
            inst.refresh(state, deadline)
        })
        .await
    }

    fn refresh(&self, state: &mut SessionState, deadline: Instant) -> Result<(), InstanceError> {
        self.update_view(|v| v.phase = Phase::MetadataRefresh);
        let version = state.version;
        let session = state.session.as_mut().ok_or(InstanceError::NotReady)?;

        let mut t = DataTable::new();
        let sql = queries::select(queries::INSTANCE_INFO, version)
            .ok_or_else(|| InstanceError::Metadata(format!("no instance query for {version}")))?;
        session.query(sql, remaining(deadline)?, &mut t)?;
        let info = InstanceInfo::from_table(&t)
            .ok_or_else(|| InstanceError::Metadata("v$instance returned no rows".into()))?;

        let mut db = None;
        let mut pdbs = Vec::new();
        let mut valid = !self.ctx.clusterware;
        // A STARTED (NOMOUNT) instance has no database to describe yet.
        if info.status != "STARTED" {
            if let Some(sql) = queries::select(queries::DATABASE_INFO, version) {
                session.query(sql, remaining(deadline)?, &mut t)?;
                db = DatabaseInfo::from_table(&t);
            }
            if self.ctx.clusterware {
                session.query(queries::CLUSTER_MIN_INSTANCE, remaining(deadline)?, &mut t)?;
                let min = queries::int(&t, 0, "min_instance");
                valid = info.number == min;
                debug!(number = info.number, min, valid, "cluster db-query election");
            }
            if db.as_ref().is_some_and(|d| d.cdb)
                && let Some(sql) = queries::select(queries::PDB_INFO, version)
            {
                session.query(sql, remaining(deadline)?, &mut t)?;
                pdbs = PdbInfo::all_from_table(&t);
            }
        }

        let db_name = db.as_ref().map(|d| d.name.as_str()).unwrap_or("");
        let name = if info.name.is_empty() { &self.sid } else { &info.name };
        let labels = self.ctx.rules.labels(name, &info.role, db_name);
        debug!(
            status = %info.status,
            pdbs = pdbs.len(),
            valid_for_db_query = valid,
            "metadata refreshed"
        );

        self.update_view(|v| {
            v.phase = Phase::Active;
            v.version = version;
            v.info = info;
            v.db = db;
            v.pdbs = pdbs;
            v.labels = labels;
            v.valid_for_db_query = valid;
        });
        Ok(())
    }

    /// Runs one statement into `table` under `timeout`.
    pub async fn query(
        self: &Arc<Self>,
        timeout: Duration,
        sql: impl Into<String>,
        mut table: DataTable,
    ) -> Result<QueryOutput, InstanceError> {
        let sql = sql.into();
        self.with_session(timeout, move |_, state, deadline| {
            let session = state.session.as_mut().ok_or(InstanceError::NotReady)?;
            let start = Instant::now();
            let rows = session.query(&sql, remaining(deadline)?, &mut table)?;
            Ok(QueryOutput {
                table,
                rows,
                elapsed: start.elapsed(),
            })
        })
        .await
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Closes the session. A second call reports [`InstanceError::Closed`].
    ///
    /// No new call starts once this begins. A call already running keeps the
    /// session until it returns; if that takes longer than the connect
    /// timeout this reports [`InstanceError::LockTimeout`] and the session is
    /// closed in the background as soon as the call is done.
    pub async fn end(self: &Arc<Self>) -> Result<(), InstanceError> {
        let budget = self.ctx.connect_timeout;
        let result = if self.closing.swap(true, Ordering::AcqRel) {
            Err(InstanceError::Closed)
        } else {
            let this = Arc::clone(self);
            let handle = tokio::task::spawn_blocking(move || {
                let _enter = this.span.enter();
                let mut state = this.state.lock();
                state.closed = true;
                let closed = match state.session.take() {
                    Some(mut session) => session.close().map_err(InstanceError::from),
                    None => Ok(()),
                };
                debug!("session closed");
                closed
            });
            match tokio::time::timeout(budget, handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(InstanceError::Task(join.to_string())),
                Err(_) => Err(InstanceError::LockTimeout(budget)),
            }
        };
        self.update_view(|v| v.phase = Phase::Closed);
        if let Err(e) = &result {
            let _enter = self.span.enter();
            warn!(error = %e, "closing instance");
        }
        result
    }

    pub async fn pool_stats(self: &Arc<Self>, timeout: Duration) -> Result<PoolStats, InstanceError> {
        self.with_session(timeout, |_, state, _| {
            state
                .session
                .as_ref()
                .map(|s| s.pool_stats())
                .ok_or(InstanceError::NotReady)
        })
        .await
    }

    /// `oracle_status` for this instance, plus `oracle_pdb_status` per
    /// contained database when it is the one answering db-level queries.
    pub fn status_metrics(&self, proc_ok: bool) -> Vec<MetricPoint> {
        let view = self.view();
        let ts = Utc::now();
        let mut points = vec![health::status_point(&view, proc_ok, ts)];
        if proc_ok && view.valid_for_db_query {
            points.extend(health::pdb_points(&view, ts));
        }
        points
    }
}

fn remaining(deadline: Instant) -> Result<Duration, InstanceError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(DriverError::Timeout(Duration::ZERO).into())
    } else {
        Ok(left)
    }
}
