//! Periodic host scan that keeps the instance registry in step with the
//! PMON processes running on the host.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::collector::{FileSystem, ProcError, ProcessFinder};
use crate::config::DiscoveryConfig;
use crate::data::{FieldValue, Fields, MetricPoint};
use crate::instance::{Instance, InstanceContext, InstanceError, InstanceRegistry, reconcile};
use crate::output::OutputBuffer;
use crate::selfmon::{DiscoverStats, SelfMon};
use crate::task::Periodic;

pub const EVENT_MEASUREMENT: &str = "oracle_discovery_event";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Appeared,
    Disappeared,
}

impl DiscoveryEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscoveryEvent::Appeared => "appeared",
            DiscoveryEvent::Disappeared => "disappeared",
        }
    }
}

fn event_point(instance: &Instance, event: DiscoveryEvent) -> MetricPoint {
    let view = instance.view();
    let mut tags = view.labels.clone();
    tags.insert("sid".into(), view.sid.clone());
    let mut f = Fields::new();
    f.insert("event".into(), event.as_str().into());
    f.insert("pid".into(), FieldValue::Int(i64::from(view.pid)));
    MetricPoint::new(EVENT_MEASUREMENT, tags, f, Utc::now())
}

pub struct Discovery {
    finder: Arc<ProcessFinder>,
    ctx: Arc<InstanceContext>,
    registry: Arc<InstanceRegistry>,
    buffer: Arc<OutputBuffer>,
    selfmon: Arc<SelfMon>,
}

impl Discovery {
    pub fn new(
        cfg: &DiscoveryConfig,
        fs: Arc<dyn FileSystem>,
        ctx: Arc<InstanceContext>,
        registry: Arc<InstanceRegistry>,
        buffer: Arc<OutputBuffer>,
        selfmon: Arc<SelfMon>,
    ) -> Result<Self, ProcError> {
        let finder = ProcessFinder::new(fs, &cfg.proc_path, &cfg.pmon_regex)?;
        Ok(Self {
            finder: Arc::new(finder),
            ctx,
            registry,
            buffer,
            selfmon,
        })
    }

    async fn scan(&self) -> Result<BTreeMap<String, u32>, ProcError> {
        let finder = Arc::clone(&self.finder);
        match tokio::task::spawn_blocking(move || finder.find()).await {
            Ok(result) => result,
            Err(e) => Err(ProcError::List {
                path: "/proc".into(),
                source: std::io::Error::other(e.to_string()),
            }),
        }
    }

    /// One discovery cycle. Returns `None` when the host scan itself failed,
    /// in which case the registry is left untouched.
    pub async fn run_once(&self) -> Option<DiscoverStats> {
        let t0 = Instant::now();
        let found = match self.scan().await {
            Ok(found) => found,
            Err(e) => {
                error!(error = %e, "process scan failed, keeping current instances");
                return None;
            }
        };

        let current = self.registry.sids();
        let diff = reconcile(
            found.keys().map(String::as_str),
            current.iter().map(String::as_str),
        );
        let mut stats = DiscoverStats {
            all: found.len(),
            ..DiscoverStats::default()
        };
        let mut points = Vec::new();

        for (instance, result) in self.connect_new(&diff.new, &found).await {
            match result {
                Ok(()) => {
                    info!(sid = %instance.sid(), pid = instance.view().pid, "instance appeared");
                    points.extend(instance.status_metrics(true));
                    points.push(event_point(&instance, DiscoveryEvent::Appeared));
                    stats.connected.push(instance.sid().to_string());
                    self.registry.add(instance);
                }
                Err(e) => {
                    warn!(sid = %instance.sid(), error = %e, "cannot connect to instance");
                    stats.connect_errors.push(instance.sid().to_string());
                }
            }
        }

        for sid in &diff.gone {
            let Some(instance) = self.registry.remove(sid) else {
                continue;
            };
            // end() logs its own failure; a gone instance is dropped regardless.
            let _ = instance.end().await;
            info!(sid = %sid, "instance disappeared");
            points.extend(instance.status_metrics(false));
            points.push(event_point(&instance, DiscoveryEvent::Disappeared));
            stats.disconnected.push(sid.clone());
        }

        for (instance, result) in self.refresh_same(&diff.same, &found).await {
            if let Err(e) = result {
                warn!(sid = %instance.sid(), error = %e, "metadata refresh failed");
                stats.refresh_errors += 1;
            }
            points.extend(instance.status_metrics(true));
        }

        stats.current = self.registry.len();
        debug!(
            all = stats.all,
            new = stats.connected.len(),
            gone = stats.disconnected.len(),
            connect_errors = stats.connect_errors.len(),
            refresh_errors = stats.refresh_errors,
            duration_ms = t0.elapsed().as_millis() as u64,
            "discovery cycle done"
        );
        points.extend(self.selfmon.discover_stats(&stats));
        self.buffer.add(points);
        Some(stats)
    }

    async fn connect_new(
        &self,
        sids: &[String],
        found: &BTreeMap<String, u32>,
    ) -> Vec<(Arc<Instance>, Result<(), InstanceError>)> {
        let mut set = JoinSet::new();
        for sid in sids {
            let pid = found.get(sid).copied().unwrap_or_default();
            let instance = Instance::new(sid.as_str(), pid, Arc::clone(&self.ctx));
            set.spawn(async move {
                let result = instance.init().await;
                (instance, result)
            });
        }
        collect_sorted(set).await
    }

    async fn refresh_same(
        &self,
        sids: &[String],
        found: &BTreeMap<String, u32>,
    ) -> Vec<(Arc<Instance>, Result<(), InstanceError>)> {
        let mut set = JoinSet::new();
        for sid in sids {
            let Some(instance) = self.registry.get(sid) else {
                continue;
            };
            if let Some(pid) = found.get(sid) {
                instance.set_pid(*pid);
            }
            set.spawn(async move {
                let result = instance.update_info().await;
                (instance, result)
            });
        }
        collect_sorted(set).await
    }
}

async fn collect_sorted(
    mut set: JoinSet<(Arc<Instance>, Result<(), InstanceError>)>,
) -> Vec<(Arc<Instance>, Result<(), InstanceError>)> {
    let mut out = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(pair) => out.push(pair),
            Err(e) => error!(error = %e, "instance task panicked"),
        }
    }
    out.sort_by(|a, b| a.0.sid().cmp(b.0.sid()));
    out
}

impl Periodic for Discovery {
    fn name(&self) -> &str {
        "discovery"
    }

    async fn run_cycle(&mut self) {
        self.run_once().await;
    }
}
