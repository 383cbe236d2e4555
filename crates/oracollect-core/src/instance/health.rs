//! Health code and status metrics derived from instance metadata.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::InstanceView;
use crate::data::{Fields, FieldValue, MetricPoint};

pub const STATUS_MEASUREMENT: &str = "oracle_status";
pub const PDB_MEASUREMENT: &str = "oracle_pdb_status";

/// Ordered health of an instance, published as `instance_ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i64)]
pub enum HealthCode {
    NotRunning = 0,
    Started = 1,
    Mounted = 2,
    OpenReadOnly = 3,
    Migrate = 4,
    OpenReadWrite = 5,
}

impl HealthCode {
    /// Maps a `(v$instance.status, v$database.open_mode)` pair.
    pub fn classify(status: &str, open_mode: &str) -> Option<Self> {
        match (status, open_mode) {
            ("STARTED", _) => Some(Self::Started),
            ("MOUNTED", _) => Some(Self::Mounted),
            ("OPEN MIGRATE", _) => Some(Self::Migrate),
            ("OPEN", "READ WRITE") => Some(Self::OpenReadWrite),
            ("OPEN", "MOUNTED" | "READ ONLY" | "READ ONLY WITH APPLY") => {
                Some(Self::OpenReadOnly)
            }
            _ => None,
        }
    }
}

fn health(view: &InstanceView, proc_ok: bool) -> HealthCode {
    if !proc_ok {
        return HealthCode::NotRunning;
    }
    let open_mode = view.db.as_ref().map(|d| d.open_mode.as_str()).unwrap_or("");
    HealthCode::classify(&view.info.status, open_mode).unwrap_or_else(|| {
        warn!(
            sid = %view.sid,
            status = %view.info.status,
            open_mode,
            "unrecognized status/open mode combination"
        );
        HealthCode::NotRunning
    })
}

/// One `oracle_status` point for the instance.
pub fn status_point(view: &InstanceView, proc_ok: bool, ts: DateTime<Utc>) -> MetricPoint {
    let info = &view.info;
    let mut f = Fields::new();
    f.insert("proc_ok".into(), FieldValue::Bool(proc_ok));
    f.insert("proc_pid".into(), FieldValue::Int(i64::from(view.pid)));
    f.insert("inst_active_state".into(), info.active_state.as_str().into());
    f.insert("inst_blocked".into(), info.blocked.as_str().into());
    f.insert("inst_db_status".into(), info.db_status.as_str().into());
    f.insert("inst_number".into(), FieldValue::Int(info.number));
    f.insert("inst_status".into(), info.status.as_str().into());
    f.insert("inst_startup_time".into(), info.startup_time.as_str().into());
    f.insert("inst_uptime".into(), FieldValue::Int(info.uptime));
    f.insert("inst_version".into(), info.version.as_str().into());
    f.insert("inst_role".into(), info.role.as_str().into());
    f.insert("inst_shutdown_pending".into(), info.shutdown_pending.as_str().into());
    f.insert("inst_archiver".into(), info.archiver.as_str().into());
    if let Some(db) = &view.db {
        f.insert("db_open_mode".into(), db.open_mode.as_str().into());
        f.insert("db_created".into(), db.created.as_str().into());
        f.insert("db_role".into(), db.role.as_str().into());
        f.insert("db_log_mode".into(), db.log_mode.as_str().into());
        f.insert("db_force_logging".into(), db.force_logging.as_str().into());
    }
    let active = view.pdbs.iter().filter(|p| p.is_active()).count();
    f.insert("pdbs_total".into(), FieldValue::Int(view.pdbs.len() as i64));
    f.insert("pdbs_active".into(), FieldValue::Int(active as i64));
    f.insert(
        "instance_ok".into(),
        FieldValue::Int(health(view, proc_ok) as i64),
    );

    MetricPoint::new(STATUS_MEASUREMENT, view.labels.clone(), f, ts)
}

/// One `oracle_pdb_status` point per contained database.
pub fn pdb_points(view: &InstanceView, ts: DateTime<Utc>) -> Vec<MetricPoint> {
    view.pdbs
        .iter()
        .map(|pdb| {
            let mut tags = view.labels.clone();
            tags.insert("pdb".into(), pdb.name.clone());
            let mut f = Fields::new();
            f.insert("con_id".into(), FieldValue::Int(pdb.con_id));
            f.insert("open_mode".into(), pdb.open_mode.as_str().into());
            f.insert("restricted".into(), pdb.restricted.as_str().into());
            f.insert("pdb_ok".into(), FieldValue::Int(i64::from(pdb.is_active())));
            MetricPoint::new(PDB_MEASUREMENT, tags, f, ts)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::queries::{DatabaseInfo, InstanceInfo, PdbInfo};

    fn view(status: &str, open_mode: Option<&str>) -> InstanceView {
        InstanceView {
            sid: "ORCL1".into(),
            pid: 3100,
            info: InstanceInfo {
                number: 1,
                name: "ORCL1".into(),
                status: status.into(),
                ..InstanceInfo::default()
            },
            db: open_mode.map(|m| DatabaseInfo {
                name: "ORCL".into(),
                open_mode: m.into(),
                ..DatabaseInfo::default()
            }),
            ..InstanceView::default()
        }
    }

    fn code(v: &InstanceView, proc_ok: bool) -> FieldValue {
        status_point(v, proc_ok, Utc::now())
            .field("instance_ok")
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_health_codes_are_ordered() {
        assert_eq!(code(&view("OPEN", Some("READ WRITE")), false), FieldValue::Int(0));
        assert_eq!(code(&view("STARTED", None), true), FieldValue::Int(1));
        assert_eq!(code(&view("MOUNTED", Some("MOUNTED")), true), FieldValue::Int(2));
        assert_eq!(code(&view("OPEN", Some("READ ONLY")), true), FieldValue::Int(3));
        assert_eq!(code(&view("OPEN MIGRATE", Some("READ WRITE")), true), FieldValue::Int(4));
        assert_eq!(code(&view("OPEN", Some("READ WRITE")), true), FieldValue::Int(5));
        assert!(HealthCode::OpenReadWrite > HealthCode::Migrate);
    }

    #[test]
    fn test_unknown_combination_stays_at_default() {
        assert_eq!(code(&view("OPEN", Some("SOMETHING")), true), FieldValue::Int(0));
        assert_eq!(code(&view("", None), true), FieldValue::Int(0));
    }

    #[test]
    fn test_started_instance_has_no_db_fields() {
        let p = status_point(&view("STARTED", None), true, Utc::now());
        assert!(p.field("db_open_mode").is_none());
        assert_eq!(p.field("inst_status"), Some(&FieldValue::Str("STARTED".into())));
        assert_eq!(p.field("proc_pid"), Some(&FieldValue::Int(3100)));
    }

    #[test]
    fn test_pdb_points_carry_pdb_tag() {
        let mut v = view("OPEN", Some("READ WRITE"));
        v.labels.insert("instance".into(), "ORCL1".into());
        v.pdbs = vec![
            PdbInfo {
                con_id: 2,
                name: "PDB$SEED".into(),
                open_mode: "READ ONLY".into(),
                restricted: "NO".into(),
            },
            PdbInfo {
                con_id: 3,
                name: "APP".into(),
                open_mode: "READ WRITE".into(),
                restricted: "NO".into(),
            },
        ];
        let pts = pdb_points(&v, Utc::now());
        assert_eq!(pts.len(), 2);
        assert_eq!(pts[1].tag("pdb"), Some("APP"));
        assert_eq!(pts[1].tag("instance"), Some("ORCL1"));
        assert_eq!(pts[1].field("pdb_ok"), Some(&FieldValue::Int(1)));
        assert_eq!(pts[0].field("pdb_ok"), Some(&FieldValue::Int(0)));

        let status = status_point(&v, true, Utc::now());
        assert_eq!(status.field("pdbs_total"), Some(&FieldValue::Int(2)));
        assert_eq!(status.field("pdbs_active"), Some(&FieldValue::Int(1)));
    }
}
