//! Metrics about the collector itself.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::collector::FileSystem;
use crate::config::SelfMonConfig;
use crate::data::{FieldValue, Fields, MetricPoint, Tags};
use crate::driver::PoolStats;
use crate::instance::InstanceRegistry;
use crate::output::OutputBuffer;
use crate::task::Periodic;

/// Outcome of one query against one instance.
#[derive(Debug, Clone, Default)]
pub struct CollectStats {
    pub group: String,
    pub context: String,
    pub id: String,
    pub instance: String,
    pub num_metrics: usize,
    pub num_rows: usize,
    pub duration: Duration,
    pub success: bool,
    pub timed_out: bool,
    pub coerce_errors: u64,
}

/// Outcome of one discovery cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoverStats {
    /// SIDs found on the host.
    pub all: usize,
    /// Registry size after the cycle.
    pub current: usize,
    pub connected: Vec<String>,
    pub disconnected: Vec<String>,
    pub connect_errors: Vec<String>,
    pub refresh_errors: usize,
}

/// Builds self-monitoring points. Every builder returns `None` when
/// self-monitoring is disabled.
#[derive(Debug, Clone)]
pub struct SelfMon {
    enabled: bool,
    prefix: String,
    tags: Tags,
}

impl SelfMon {
    pub fn new(cfg: &SelfMonConfig, agent: &str) -> Self {
        let mut tags: Tags = cfg.extra_labels.clone().into_iter().collect();
        if !agent.is_empty() {
            tags.insert("agent".into(), agent.to_string());
        }
        Self {
            enabled: cfg.enabled,
            prefix: cfg.prefix.clone(),
            tags,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            prefix: String::new(),
            tags: Tags::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn point(&self, name: &str, extra: &[(&str, &str)], fields: Fields) -> Option<MetricPoint> {
        if !self.enabled {
            return None;
        }
        let mut tags = self.tags.clone();
        for (k, v) in extra {
            tags.insert(k.to_string(), v.to_string());
        }
        Some(MetricPoint::new(
            format!("{}{}", self.prefix, name),
            tags,
            fields,
            Utc::now(),
        ))
    }

    pub fn collect_stats(&self, s: &CollectStats) -> Option<MetricPoint> {
        let mut f = Fields::new();
        f.insert("num_metrics".into(), FieldValue::Int(s.num_metrics as i64));
        f.insert("num_rows".into(), FieldValue::Int(s.num_rows as i64));
        f.insert(
            "duration_us".into(),
            FieldValue::Int(i64::try_from(s.duration.as_micros()).unwrap_or(i64::MAX)),
        );
        f.insert("success".into(), FieldValue::Bool(s.success));
        f.insert("timed_out".into(), FieldValue::Bool(s.timed_out));
        f.insert(
            "coerce_errors".into(),
            FieldValue::Int(i64::try_from(s.coerce_errors).unwrap_or(i64::MAX)),
        );
        self.point(
            "collect_stats",
            &[
                ("metric_group", s.group.as_str()),
                ("metric_context", s.context.as_str()),
                ("metric_id", s.id.as_str()),
                ("instance", s.instance.as_str()),
            ],
            f,
        )
    }

    pub fn discover_stats(&self, s: &DiscoverStats) -> Option<MetricPoint> {
        let mut f = Fields::new();
        f.insert("all".into(), FieldValue::Int(s.all as i64));
        f.insert("new".into(), FieldValue::Int(s.connected.len() as i64));
        f.insert("current".into(), FieldValue::Int(s.current as i64));
        f.insert("disconnected".into(), FieldValue::Int(s.disconnected.len() as i64));
        f.insert("connect_errors".into(), FieldValue::Int(s.connect_errors.len() as i64));
        f.insert("refresh_errors".into(), FieldValue::Int(s.refresh_errors as i64));
        f.insert("connected_sid_names".into(), join_sorted(&s.connected).into());
        f.insert("disconnected_sid_names".into(), join_sorted(&s.disconnected).into());
        f.insert("errconnect_sid_names".into(), join_sorted(&s.connect_errors).into());
        self.point("discover_stats", &[], f)
    }

    pub fn driver_stats(&self, instance: &str, s: &PoolStats) -> Option<MetricPoint> {
        let mut f = Fields::new();
        f.insert("open_connections".into(), FieldValue::Int(i64::from(s.open)));
        f.insert("busy_connections".into(), FieldValue::Int(i64::from(s.busy)));
        f.insert("max_open_connections".into(), FieldValue::Int(i64::from(s.max_open)));
        self.point("sql_driver_stats", &[("instance", instance)], f)
    }

    /// Process counters from `status` (a `/proc/self/status` file) plus
    /// buffer occupancy. Missing counters are left out.
    pub fn runtime_stats(&self, status: Option<&str>, buffer: &OutputBuffer) -> Option<MetricPoint> {
        let mut f = Fields::new();
        if let Some(status) = status {
            for (key, field) in [
                ("VmRSS", "vm_rss_kb"),
                ("VmSize", "vm_size_kb"),
                ("Threads", "threads"),
            ] {
                if let Some(v) = status_value(status, key) {
                    f.insert(field.into(), FieldValue::Int(v));
                }
            }
        }
        f.insert("buffer_len".into(), FieldValue::Int(buffer.len() as i64));
        f.insert(
            "buffer_dropped_total".into(),
            FieldValue::Int(i64::try_from(buffer.dropped_total()).unwrap_or(i64::MAX)),
        );
        self.point("runtime_stats", &[], f)
    }
}

fn join_sorted(sids: &[String]) -> String {
    let mut sorted: Vec<&str> = sids.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.join(":")
}

/// `VmRSS:\t   24576 kB` -> 24576
fn status_value(status: &str, key: &str) -> Option<i64> {
    status.lines().find_map(|line| {
        let (k, rest) = line.split_once(':')?;
        if k != key {
            return None;
        }
        rest.split_whitespace().next()?.parse().ok()
    })
}

/// Periodic driver and runtime statistics.
pub struct SelfMonTask {
    selfmon: Arc<SelfMon>,
    registry: Arc<InstanceRegistry>,
    buffer: Arc<OutputBuffer>,
    fs: Arc<dyn FileSystem>,
    status_path: PathBuf,
    timeout: Duration,
}

impl SelfMonTask {
    pub fn new(
        selfmon: Arc<SelfMon>,
        registry: Arc<InstanceRegistry>,
        buffer: Arc<OutputBuffer>,
        fs: Arc<dyn FileSystem>,
        proc_path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            selfmon,
            registry,
            buffer,
            fs,
            status_path: proc_path.into().join("self").join("status"),
            timeout,
        }
    }

    pub async fn collect(&self) -> Vec<MetricPoint> {
        let mut points = Vec::new();
        for instance in self.registry.snapshot() {
            match instance.pool_stats(self.timeout).await {
                Ok(stats) => points.extend(self.selfmon.driver_stats(instance.sid(), &stats)),
                Err(e) => debug!(sid = %instance.sid(), error = %e, "pool stats unavailable"),
            }
        }
        let status = match self.fs.read_to_string(&self.status_path) {
            Ok(s) => Some(s),
            Err(e) => {
                debug!(path = %self.status_path.display(), error = %e, "cannot read process status");
                None
            }
        };
        points.extend(self.selfmon.runtime_stats(status.as_deref(), &self.buffer));
        points
    }
}

impl Periodic for SelfMonTask {
    fn name(&self) -> &str {
        "self_monitor"
    }

    async fn run_cycle(&mut self) {
        let points = self.collect().await;
        self.buffer.add(points);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MockFs;
    use crate::driver::mock::MockConnector;
    use crate::instance::Instance;
    use crate::instance::testutil::{context, open_database};
    use crate::output::OverflowPolicy;
    use std::collections::BTreeMap;

    fn selfmon() -> SelfMon {
        let cfg = SelfMonConfig {
            enabled: true,
            prefix: "oracle_collector_".into(),
            extra_labels: BTreeMap::from([("dc".to_string(), "east".to_string())]),
            ..SelfMonConfig::default()
        };
        SelfMon::new(&cfg, "agent-01")
    }

    #[test]
    fn test_collect_stats_carries_query_identity() {
        let p = selfmon()
            .collect_stats(&CollectStats {
                group: "basic".into(),
                context: "oracle_sessions".into(),
                id: "sessions".into(),
                instance: "ORCL1".into(),
                num_metrics: 1,
                num_rows: 1,
                duration: Duration::from_millis(3),
                success: true,
                coerce_errors: 2,
                ..CollectStats::default()
            })
            .unwrap();
        assert_eq!(p.name(), "oracle_collector_collect_stats");
        assert_eq!(p.tag("agent"), Some("agent-01"));
        assert_eq!(p.tag("dc"), Some("east"));
        assert_eq!(p.tag("metric_group"), Some("basic"));
        assert_eq!(p.tag("instance"), Some("ORCL1"));
        assert_eq!(p.field("duration_us"), Some(&FieldValue::Int(3000)));
        assert_eq!(p.field("coerce_errors"), Some(&FieldValue::Int(2)));
        assert_eq!(p.field("timed_out"), Some(&FieldValue::Bool(false)));
    }

    #[test]
    fn test_discover_stats_joins_sorted_sids() {
        let p = selfmon()
            .discover_stats(&DiscoverStats {
                all: 3,
                current: 2,
                connected: vec!["ORCL2".into(), "ORCL1".into()],
                connect_errors: vec!["BAD".into()],
                ..DiscoverStats::default()
            })
            .unwrap();
        assert_eq!(p.field("new"), Some(&FieldValue::Int(2)));
        assert_eq!(p.field("connected_sid_names"), Some(&FieldValue::Str("ORCL1:ORCL2".into())));
        assert_eq!(p.field("errconnect_sid_names"), Some(&FieldValue::Str("BAD".into())));
        assert_eq!(p.field("disconnected_sid_names"), Some(&FieldValue::Str(String::new())));
    }

    #[test]
    fn test_disabled_emits_nothing() {
        let off = SelfMon::disabled();
        assert!(off.discover_stats(&DiscoverStats::default()).is_none());
        assert!(off.driver_stats("X", &PoolStats::default()).is_none());
    }

    #[tokio::test]
    async fn test_task_reports_driver_and_runtime() {
        let mock = MockConnector::new();
        mock.set_database("db:1521/ORCL1", open_database("ORCL1"));
        let registry = Arc::new(InstanceRegistry::new());
        let inst = Instance::new("ORCL1", 3100, context(&mock, false));
        inst.init().await.unwrap();
        registry.add(inst);

        let buffer = Arc::new(OutputBuffer::new(16, OverflowPolicy::DropOldest));
        let task = SelfMonTask::new(
            Arc::new(selfmon()),
            registry,
            Arc::clone(&buffer),
            Arc::new(MockFs::single_instance()),
            "/proc",
            Duration::from_secs(1),
        );
        let points = task.collect().await;
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].name(), "oracle_collector_sql_driver_stats");
        assert_eq!(points[0].tag("instance"), Some("ORCL1"));
        let rt = &points[1];
        assert_eq!(rt.name(), "oracle_collector_runtime_stats");
        assert_eq!(rt.field("vm_rss_kb"), Some(&FieldValue::Int(24576)));
        assert_eq!(rt.field("vm_size_kb"), Some(&FieldValue::Int(812340)));
        assert_eq!(rt.field("threads"), Some(&FieldValue::Int(9)));
        assert_eq!(rt.field("buffer_len"), Some(&FieldValue::Int(0)));
    }
}
