//! One periodic task per metric group: query every selected instance and
//! turn the results into metric points.

use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::task::JoinSet;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::config::{MetricGroupConfig, QueryConfig, QueryLevel};
use crate::data::{DataTable, MetricPoint};
use crate::instance::{Instance, InstanceRegistry};
use crate::output::OutputBuffer;
use crate::selfmon::{CollectStats, SelfMon};
use crate::task::Periodic;

/// Totals of one group cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub instances: usize,
    pub queries: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub points: usize,
}

struct GroupSpec {
    name: String,
    timeout: Duration,
    level: QueryLevel,
    filter: Option<Regex>,
    queries: Vec<Arc<QueryConfig>>,
}

pub struct GroupScheduler {
    group: Arc<GroupSpec>,
    period: Duration,
    registry: Arc<InstanceRegistry>,
    buffer: Arc<OutputBuffer>,
    selfmon: Arc<SelfMon>,
}

impl GroupScheduler {
    pub fn new(
        cfg: &MetricGroupConfig,
        registry: Arc<InstanceRegistry>,
        buffer: Arc<OutputBuffer>,
        selfmon: Arc<SelfMon>,
    ) -> Result<Self, regex::Error> {
        let filter = match cfg.instance_filter.trim() {
            "" => None,
            pattern => Some(Regex::new(pattern)?),
        };
        Ok(Self {
            group: Arc::new(GroupSpec {
                name: cfg.name.clone(),
                timeout: cfg.query_timeout,
                level: cfg.query_level,
                filter,
                queries: cfg.queries.iter().cloned().map(Arc::new).collect(),
            }),
            period: cfg.query_period,
            registry,
            buffer,
            selfmon,
        })
    }

    pub fn name(&self) -> &str {
        &self.group.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Registry members this group applies to right now, in SID order.
    pub fn select(&self) -> Vec<Arc<Instance>> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|instance| {
                let view = instance.view();
                if let Some(filter) = &self.group.filter
                    && !filter.is_match(view.name())
                {
                    return false;
                }
                self.group.level != QueryLevel::Db || view.valid_for_db_query
            })
            .collect()
    }

    /// One cycle. Instances are queried concurrently; each instance runs the
    /// group's queries in order. Output is pushed in SID order.
    pub async fn run_once(&self) -> CycleStats {
        let instances = self.select();
        let mut stats = CycleStats {
            instances: instances.len(),
            ..CycleStats::default()
        };

        let mut set = JoinSet::new();
        for instance in instances {
            let group = Arc::clone(&self.group);
            let span = info_span!("instance", sid = %instance.sid());
            set.spawn(collect_instance(group, instance).instrument(span));
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(r) => results.push(r),
                Err(e) => error!(group = %self.group.name, error = %e, "collection task panicked"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, outcomes) in results {
            for (points, collect) in outcomes {
                stats.queries += 1;
                if !collect.success {
                    stats.failed += 1;
                }
                if collect.timed_out {
                    stats.timed_out += 1;
                }
                stats.points += points.len();
                self.buffer.add(points);
                self.buffer.add(self.selfmon.collect_stats(&collect));
            }
        }
        debug!(
            group = %self.group.name,
            instances = stats.instances,
            queries = stats.queries,
            failed = stats.failed,
            points = stats.points,
            "group cycle done"
        );
        stats
    }
}

type QueryOutcome = (Vec<MetricPoint>, CollectStats);

async fn collect_instance(group: Arc<GroupSpec>, instance: Arc<Instance>) -> (String, Vec<QueryOutcome>) {
    let mut outcomes = Vec::with_capacity(group.queries.len());
    for query in &group.queries {
        outcomes.push(run_query(&group, &instance, query).await);
    }
    (instance.sid().to_string(), outcomes)
}

async fn run_query(group: &GroupSpec, instance: &Arc<Instance>, query: &Arc<QueryConfig>) -> QueryOutcome {
    let view = instance.view();
    let mut stats = CollectStats {
        group: group.name.clone(),
        context: query.context.clone(),
        id: query.id.clone(),
        instance: view.name().to_string(),
        ..CollectStats::default()
    };
    let mut points = Vec::new();
    let t0 = Instant::now();

    let table = DataTable::for_query(Arc::clone(query));
    match instance.query(group.timeout, query.request.as_str(), table).await {
        Ok(out) => {
            stats.num_rows = out.rows;
            if out.rows == 0 {
                if !query.ignore_zero_result {
                    warn!(group = %group.name, query = %query.id, "query returned no rows");
                }
                stats.success = true;
            } else {
                match out.table.get_metrics(&view.labels) {
                    Ok(metrics) => {
                        stats.num_metrics = metrics.points.len();
                        stats.coerce_errors = metrics.coerce_errors;
                        stats.success = true;
                        points = metrics.points;
                    }
                    Err(e) => {
                        warn!(group = %group.name, query = %query.id, error = %e, "metric transformation failed");
                    }
                }
            }
        }
        Err(e) => {
            stats.timed_out = e.is_timeout();
            warn!(
                group = %group.name,
                query = %query.id,
                timed_out = stats.timed_out,
                duration_ms = t0.elapsed().as_millis() as u64,
                error = %e,
                "query failed"
            );
        }
    }
    stats.duration = t0.elapsed();
    debug!(
        group = %group.name,
        query = %query.id,
        rows = stats.num_rows,
        metrics = stats.num_metrics,
        duration_ms = stats.duration.as_millis() as u64,
        "query done"
    );
    (points, stats)
}

impl Periodic for GroupScheduler {
    fn name(&self) -> &str {
        &self.group.name
    }

    async fn run_cycle(&mut self) {
        self.run_once().await;
    }
}
