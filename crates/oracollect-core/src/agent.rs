//! Wires discovery, metric groups, self-monitoring and output together and
//! runs them until shutdown.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::collector::{FileSystem, ProcError};
use crate::config::Config;
use crate::discovery::Discovery;
use crate::driver::Connector;
use crate::instance::labels::DynamicRules;
use crate::instance::{InstanceContext, InstanceRegistry};
use crate::output::{Flusher, MetricSink, OutputBuffer};
use crate::scheduler::GroupScheduler;
use crate::selfmon::{SelfMon, SelfMonTask};
use crate::task::{Periodic, run_periodic};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("discovery: {0}")]
    Discovery(#[from] ProcError),

    #[error("invalid dynamic parameter rule: {0}")]
    Rules(#[source] regex::Error),

    #[error("metric group '{group}': {source}")]
    Group {
        group: String,
        #[source]
        source: regex::Error,
    },
}

/// Shared state built once at startup.
pub struct Agent {
    config: Config,
    connector: Arc<dyn Connector>,
    fs: Arc<dyn FileSystem>,
    registry: Arc<InstanceRegistry>,
    buffer: Arc<OutputBuffer>,
    selfmon: Arc<SelfMon>,
}

impl Agent {
    pub fn new(config: Config, connector: Arc<dyn Connector>, fs: Arc<dyn FileSystem>) -> Self {
        let buffer = OutputBuffer::new(config.output.buffer_size, config.output.overflow);
        let selfmon = SelfMon::new(&config.self_monitor, &config.general.instance_id);
        Self {
            config,
            connector,
            fs,
            registry: Arc::new(InstanceRegistry::new()),
            buffer: Arc::new(buffer),
            selfmon: Arc::new(selfmon),
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn buffer(&self) -> &Arc<OutputBuffer> {
        &self.buffer
    }

    /// Runs every periodic task until `shutdown` flips to `true`.
    ///
    /// Producers stop first; the flush task then drains what they left in
    /// the buffer, and finally every instance session is closed.
    pub async fn run(
        &self,
        sink: Box<dyn MetricSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), AgentError> {
        let disc = &self.config.discovery;
        let ctx = Arc::new(InstanceContext {
            connector: Arc::clone(&self.connector),
            rules: DynamicRules::new(disc).map_err(AgentError::Rules)?,
            clusterware: disc.clusterware_enabled,
            connect_timeout: disc.connect_timeout,
        });

        let discovery = Discovery::new(
            disc,
            Arc::clone(&self.fs),
            ctx,
            Arc::clone(&self.registry),
            Arc::clone(&self.buffer),
            Arc::clone(&self.selfmon),
        )?;
        let mut groups = Vec::with_capacity(self.config.metric_groups.len());
        for cfg in &self.config.metric_groups {
            let sched = GroupScheduler::new(
                cfg,
                Arc::clone(&self.registry),
                Arc::clone(&self.buffer),
                Arc::clone(&self.selfmon),
            )
            .map_err(|source| AgentError::Group {
                group: cfg.name.clone(),
                source,
            })?;
            groups.push(sched);
        }

        let mut producers = JoinSet::new();
        spawn(&mut producers, discovery, disc.interval, &shutdown);
        for sched in groups {
            let period = sched.period();
            spawn(&mut producers, sched, period, &shutdown);
        }
        if self.selfmon.is_enabled() {
            let task = SelfMonTask::new(
                Arc::clone(&self.selfmon),
                Arc::clone(&self.registry),
                Arc::clone(&self.buffer),
                Arc::clone(&self.fs),
                &disc.proc_path,
                disc.connect_timeout,
            );
            spawn(&mut producers, task, self.config.self_monitor.period, &shutdown);
        }

        let (flush_tx, flush_rx) = watch::channel(false);
        let out = &self.config.output;
        let mut flusher = Flusher::new(Arc::clone(&self.buffer), sink, out.precision, out.batch_size);
        let flush_period = out.flush_period;
        let flush = tokio::spawn(async move { run_periodic(&mut flusher, flush_period, flush_rx).await });

        info!(
            groups = self.config.metric_groups.len(),
            tasks = producers.len(),
            "agent started"
        );

        while let Some(joined) = producers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task panicked");
            }
        }
        let _ = flush_tx.send(true);
        if let Err(e) = flush.await {
            error!(error = %e, "flush task panicked");
        }

        self.close_instances().await;
        info!("agent stopped");
        Ok(())
    }

    async fn close_instances(&self) {
        for instance in self.registry.snapshot() {
            if let Err(e) = instance.end().await {
                warn!(sid = %instance.sid(), error = %e, "close on shutdown failed");
            }
            self.registry.remove(instance.sid());
        }
    }
}

fn spawn<T: Periodic + 'static>(
    set: &mut JoinSet<()>,
    mut task: T,
    period: Duration,
    shutdown: &watch::Receiver<bool>,
) {
    let rx = shutdown.clone();
    set.spawn(async move { run_periodic(&mut task, period, rx).await });
}
