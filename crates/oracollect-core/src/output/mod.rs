//! Bounded metric buffer shared by all producers, and the task that flushes
//! it to a sink.

pub mod line_protocol;
pub mod sink;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::{OutputConfig, SinkKind};
use crate::data::MetricPoint;
use crate::task::Periodic;

pub use line_protocol::{LineProtocol, Precision};
pub use sink::{FileSink, MemorySink, MetricSink, StdoutSink};

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("cannot open sink {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sink write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("file sink selected but no file_path configured")]
    NoFilePath,
}

/// What to do with a point that does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict from the front to make room.
    #[default]
    DropOldest,
    /// Keep the queue as is and discard the incoming point.
    DropNewest,
}

/// Fixed-capacity FIFO of metric points.
pub struct OutputBuffer {
    queue: Mutex<VecDeque<MetricPoint>>,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl OutputBuffer {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends points. Returns how many points were dropped by this call.
    pub fn add(&self, points: impl IntoIterator<Item = MetricPoint>) -> u64 {
        let mut dropped = 0u64;
        {
            let mut queue = self.queue.lock();
            for point in points {
                if queue.len() >= self.capacity {
                    dropped += 1;
                    match self.policy {
                        OverflowPolicy::DropOldest => {
                            queue.pop_front();
                        }
                        OverflowPolicy::DropNewest => continue,
                    }
                }
                queue.push_back(point);
            }
        }
        if dropped > 0 {
            let total = self.dropped.fetch_add(dropped, Ordering::Relaxed) + dropped;
            warn!(
                dropped,
                total,
                capacity = self.capacity,
                policy = ?self.policy,
                "output buffer full, metrics dropped"
            );
        }
        dropped
    }

    /// Takes every buffered point, oldest first.
    pub fn drain(&self) -> Vec<MetricPoint> {
        let mut queue = self.queue.lock();
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Builds the sink named in the output configuration.
pub fn open_sink(cfg: &OutputConfig) -> Result<Box<dyn MetricSink>, OutputError> {
    match cfg.sink {
        SinkKind::Stdout => Ok(Box::new(StdoutSink)),
        SinkKind::File => {
            let path = cfg.file_path.as_ref().ok_or(OutputError::NoFilePath)?;
            Ok(Box::new(FileSink::open(path)?))
        }
    }
}

/// Summary of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub points: usize,
    pub lines: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

/// Drains the buffer into a sink, `batch_size` points per write.
pub struct Flusher {
    buffer: Arc<OutputBuffer>,
    sink: Box<dyn MetricSink>,
    encoder: LineProtocol,
    batch_size: usize,
}

impl Flusher {
    pub fn new(
        buffer: Arc<OutputBuffer>,
        sink: Box<dyn MetricSink>,
        precision: Precision,
        batch_size: usize,
    ) -> Self {
        Self {
            buffer,
            sink,
            encoder: LineProtocol::new(precision),
            batch_size: batch_size.max(1),
        }
    }

    /// One drain. A failed write loses that batch; later batches are still
    /// attempted.
    pub fn flush(&mut self) -> FlushStats {
        let points = self.buffer.drain();
        let mut stats = FlushStats {
            points: points.len(),
            ..FlushStats::default()
        };
        let mut payload = String::new();
        for chunk in points.chunks(self.batch_size) {
            payload.clear();
            let lines = self.encoder.encode_into(chunk, &mut payload);
            if lines == 0 {
                continue;
            }
            stats.batches += 1;
            match self.sink.write(payload.as_bytes()) {
                Ok(()) => stats.lines += lines,
                Err(e) => {
                    stats.failed_batches += 1;
                    error!(sink = self.sink.name(), lines, error = %e, "metric write failed");
                }
            }
        }
        if stats.points > 0 {
            debug!(
                points = stats.points,
                lines = stats.lines,
                batches = stats.batches,
                "flushed"
            );
        }
        stats
    }
}

impl Periodic for Flusher {
    fn name(&self) -> &str {
        "flush"
    }

    async fn run_cycle(&mut self) {
        self.flush();
    }

    async fn on_stop(&mut self) {
        let stats = self.flush();
        debug!(points = stats.points, "final flush");
    }
}
