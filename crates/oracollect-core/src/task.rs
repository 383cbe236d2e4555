//! Periodic task loop shared by discovery, metric groups, flush and
//! self-monitoring.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Work run on every tick of [`run_periodic`].
pub trait Periodic: Send {
    fn name(&self) -> &str;

    fn run_cycle(&mut self) -> impl Future<Output = ()> + Send;

    /// Called once after the stop signal, before the loop returns.
    fn on_stop(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Runs `task` immediately and then every `period` until `shutdown` turns
/// `true` or its sender is dropped.
///
/// Cycles never overlap: a cycle that overruns delays the next tick instead
/// of causing a burst. A stop signal that arrives together with a tick wins.
pub async fn run_periodic<T: Periodic>(
    task: &mut T,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles: u64 = 0;

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = tick.tick() => {}
        }

        let t0 = Instant::now();
        task.run_cycle().await;
        cycles += 1;
        let elapsed = t0.elapsed();
        if elapsed > period {
            warn!(
                task = task.name(),
                duration_ms = elapsed.as_millis() as u64,
                period_ms = period.as_millis() as u64,
                "cycle exceeded its period"
            );
        }
    }

    debug!(task = task.name(), cycles, "stopping");
    task.on_stop().await;
}
