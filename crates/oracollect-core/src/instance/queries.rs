//! Metadata statements, selected by product version.
//!
//! Each dialect table lists `(minimum version, statement)` pairs in ascending
//! order. [`select`] picks the last entry whose minimum is not above the
//! probed version, so supporting a new release means adding a row.

use std::fmt;
use std::str::FromStr;

use crate::data::{Cell, DataTable, FieldValue, MetricKind, coerce};

/// `major.minor` of the database release, e.g. `19.7.0.0.0` → `19.7`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProductVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProductVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProductVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| format!("invalid product version '{s}'"))?;
        let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Ok(Self { major, minor })
    }
}

pub struct VersionedQuery {
    pub min_version: ProductVersion,
    pub sql: &'static str,
}

/// Highest-versioned statement usable on `version`, if any.
pub fn select(table: &[VersionedQuery], version: ProductVersion) -> Option<&'static str> {
    table
        .iter()
        .rev()
        .find(|q| q.min_version <= version)
        .map(|q| q.sql)
}

pub const VERSION_PROBE: &str = "SELECT version FROM product_component_version \
     WHERE product LIKE 'Oracle%' AND ROWNUM = 1";

pub const INSTANCE_INFO: &[VersionedQuery] = &[
    VersionedQuery {
        min_version: ProductVersion::new(0, 0),
        sql: "SELECT instance_number, instance_name, host_name, version, \
              TO_CHAR(startup_time, 'YYYY-MM-DD HH24:MI:SS') AS startup_time, \
              FLOOR((SYSDATE - startup_time) * 86400) AS uptime, \
              status, database_status, instance_role, active_state, \
              blocked, shutdown_pending, archiver \
              FROM v$instance",
    },
    VersionedQuery {
        min_version: ProductVersion::new(18, 0),
        sql: "SELECT instance_number, instance_name, host_name, version_full AS version, \
              TO_CHAR(startup_time, 'YYYY-MM-DD HH24:MI:SS') AS startup_time, \
              FLOOR((SYSDATE - startup_time) * 86400) AS uptime, \
              status, database_status, instance_role, active_state, \
              blocked, shutdown_pending, archiver \
              FROM v$instance",
    },
];

pub const DATABASE_INFO: &[VersionedQuery] = &[
    VersionedQuery {
        min_version: ProductVersion::new(0, 0),
        sql: "SELECT dbid, name, TO_CHAR(created, 'YYYY-MM-DD HH24:MI:SS') AS created, \
              db_unique_name, 'NO' AS cdb, open_mode, database_role, force_logging, log_mode \
              FROM v$database",
    },
    VersionedQuery {
        min_version: ProductVersion::new(12, 1),
        sql: "SELECT dbid, name, TO_CHAR(created, 'YYYY-MM-DD HH24:MI:SS') AS created, \
              db_unique_name, cdb, open_mode, database_role, force_logging, log_mode \
              FROM v$database",
    },
];

/// Contained databases only exist from 12.1 on.
pub const PDB_INFO: &[VersionedQuery] = &[VersionedQuery {
    min_version: ProductVersion::new(12, 1),
    sql: "SELECT con_id, name, open_mode, restricted FROM v$pdbs ORDER BY con_id",
}];

pub const CLUSTER_MIN_INSTANCE: &str =
    "SELECT MIN(instance_number) AS min_instance FROM gv$instance";

/// Row of `v$instance`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstanceInfo {
    pub number: i64,
    pub name: String,
    pub host: String,
    pub version: String,
    pub startup_time: String,
    pub uptime: i64,
    pub status: String,
    pub db_status: String,
    pub role: String,
    pub active_state: String,
    pub blocked: String,
    pub shutdown_pending: String,
    pub archiver: String,
}

impl InstanceInfo {
    pub fn from_table(t: &DataTable) -> Option<Self> {
        if t.is_empty() {
            return None;
        }
        Some(Self {
            number: int(t, 0, "instance_number"),
            name: text(t, 0, "instance_name"),
            host: text(t, 0, "host_name"),
            version: text(t, 0, "version"),
            startup_time: text(t, 0, "startup_time"),
            uptime: int(t, 0, "uptime"),
            status: text(t, 0, "status"),
            db_status: text(t, 0, "database_status"),
            role: text(t, 0, "instance_role"),
            active_state: text(t, 0, "active_state"),
            blocked: text(t, 0, "blocked"),
            shutdown_pending: text(t, 0, "shutdown_pending"),
            archiver: text(t, 0, "archiver"),
        })
    }
}

/// Row of `v$database`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseInfo {
    pub dbid: String,
    pub name: String,
    pub created: String,
    pub unique_name: String,
    pub cdb: bool,
    pub open_mode: String,
    pub role: String,
    pub force_logging: String,
    pub log_mode: String,
}

impl DatabaseInfo {
    pub fn from_table(t: &DataTable) -> Option<Self> {
        if t.is_empty() {
            return None;
        }
        Some(Self {
            dbid: text(t, 0, "dbid"),
            name: text(t, 0, "name"),
            created: text(t, 0, "created"),
            unique_name: text(t, 0, "db_unique_name"),
            cdb: text(t, 0, "cdb") == "YES",
            open_mode: text(t, 0, "open_mode"),
            role: text(t, 0, "database_role"),
            force_logging: text(t, 0, "force_logging"),
            log_mode: text(t, 0, "log_mode"),
        })
    }
}

/// Row of `v$pdbs`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PdbInfo {
    pub con_id: i64,
    pub name: String,
    pub open_mode: String,
    pub restricted: String,
}

impl PdbInfo {
    pub fn is_active(&self) -> bool {
        self.open_mode == "READ WRITE"
    }

    pub fn all_from_table(t: &DataTable) -> Vec<Self> {
        (0..t.len())
            .map(|row| Self {
                con_id: int(t, row, "con_id"),
                name: text(t, row, "name"),
                open_mode: text(t, row, "open_mode"),
                restricted: text(t, row, "restricted"),
            })
            .collect()
    }
}

pub(crate) fn text(t: &DataTable, row: usize, col: &str) -> String {
    t.cell(row, col).map(Cell::render).unwrap_or_default()
}

pub(crate) fn int(t: &DataTable, row: usize, col: &str) -> i64 {
    match t.cell(row, col).map(|c| coerce(c, MetricKind::Integer)) {
        Some(Ok(FieldValue::Int(v))) => v,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_versions() {
        assert_eq!("19.7.0.0.0".parse(), Ok(ProductVersion::new(19, 7)));
        assert_eq!("11.2.0.4.0".parse(), Ok(ProductVersion::new(11, 2)));
        assert_eq!("23".parse(), Ok(ProductVersion::new(23, 0)));
        assert!("".parse::<ProductVersion>().is_err());
        assert!(ProductVersion::new(12, 1) > ProductVersion::new(11, 2));
    }

    #[test]
    fn test_selects_highest_matching_dialect() {
        let v11 = ProductVersion::new(11, 2);
        let v12 = ProductVersion::new(12, 1);
        let v19 = ProductVersion::new(19, 7);

        assert!(!select(INSTANCE_INFO, v12).unwrap().contains("version_full"));
        assert!(select(INSTANCE_INFO, v19).unwrap().contains("version_full"));

        assert!(select(DATABASE_INFO, v11).unwrap().contains("'NO' AS cdb"));
        assert!(select(DATABASE_INFO, v12).unwrap().contains(" cdb,"));

        assert_eq!(select(PDB_INFO, v11), None);
        assert!(select(PDB_INFO, v19).is_some());
    }

    #[test]
    fn test_reads_instance_row() {
        let mut t = DataTable::new();
        t.set_header(["INSTANCE_NUMBER", "INSTANCE_NAME", "STATUS", "UPTIME"]);
        t.push_row(vec![
            Cell::Decimal("2".into()),
            "ORCL2".into(),
            "OPEN".into(),
            Cell::Decimal("3600".into()),
        ])
        .unwrap();

        let info = InstanceInfo::from_table(&t).unwrap();
        assert_eq!(info.number, 2);
        assert_eq!(info.name, "ORCL2");
        assert_eq!(info.status, "OPEN");
        assert_eq!(info.uptime, 3600);
        assert_eq!(info.host, "");

        assert_eq!(InstanceInfo::from_table(&DataTable::new()), None);
    }
}
