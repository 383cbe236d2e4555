//! oracollect-core: Oracle instance discovery and metrics collection.
//!
//! Provides:
//! - `collector`: filesystem abstraction and PMON process finder
//! - `driver`: database session seam, in-memory mock
//! - `data`: result tables, value coercion, metric points
//! - `instance`: per-instance lifecycle, metadata and registry
//! - `discovery`: periodic host scan keeping the registry current
//! - `scheduler`: per-metric-group query loops
//! - `output`: bounded buffer, line protocol, sinks
//! - `selfmon`: metrics about the collector itself
//! - `agent`: wires everything together
//!
//! With `oracle` feature (default):
//! - `driver::oracle`: Oracle client adapter

pub mod agent;
pub mod collector;
pub mod config;
pub mod data;
pub mod discovery;
pub mod driver;
pub mod instance;
pub mod output;
pub mod scheduler;
pub mod selfmon;
pub mod task;

pub use agent::{Agent, AgentError};
pub use config::{Config, ConfigError};
