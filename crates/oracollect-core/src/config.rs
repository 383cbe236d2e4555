//! Agent configuration.
//!
//! Loaded once at startup from a TOML file. Every section falls back to its
//! `Default` when omitted. Durations accept `"500ms"`, `"10s"`, `"5m"`, `"1h"`
//! or a bare number of seconds.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::info;

use crate::data::MetricKind;
use crate::output::{OverflowPolicy, Precision};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub output: OutputConfig,
    pub self_monitor: SelfMonConfig,
    pub discovery: DiscoveryConfig,
    #[serde(rename = "metric_group")]
    pub metric_groups: Vec<MetricGroupConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Identifier of this agent, added as tag `agent` to self-monitoring metrics.
    pub instance_id: String,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            log_dir: None,
            log_level: "info".to_string(),
        }
    }
}

/// Where serialized metrics are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    Stdout,
    File,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub buffer_size: usize,
    pub batch_size: usize,
    #[serde(deserialize_with = "deserialize_duration")]
    pub flush_period: Duration,
    pub overflow: OverflowPolicy,
    pub sink: SinkKind,
    pub file_path: Option<PathBuf>,
    pub precision: Precision,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            buffer_size: 65535,
            batch_size: 5000,
            flush_period: Duration::from_secs(10),
            overflow: OverflowPolicy::default(),
            sink: SinkKind::default(),
            file_path: None,
            precision: Precision::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelfMonConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "deserialize_duration")]
    pub period: Duration,
    /// Prefix prepended to every self-monitoring measurement name.
    pub prefix: String,
    pub extra_labels: BTreeMap<String, String>,
}

impl Default for SelfMonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: Duration::from_secs(60),
            prefix: "oracle_collector_".to_string(),
            extra_labels: BTreeMap::new(),
        }
    }
}

/// A password or other credential. Never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("\"***\"")
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Regex matched against process command lines. Must contain `(?P<SID>...)`.
    pub pmon_regex: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    pub proc_path: String,
    /// Clustered deployment: only the lowest instance number runs `db` queries.
    pub clusterware_enabled: bool,
    /// Bound for connect, ping and metadata refresh.
    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
    pub max_open_connections: u32,
    /// Connect string; every literal `SID` is replaced by the discovered SID.
    pub connect_dsn: String,
    pub connect_user: String,
    pub connect_pass: Secret,
    pub extra_labels: BTreeMap<String, String>,
    pub dynamic_params: Vec<DynamicParams>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            pmon_regex: "ora_pmon_(?P<SID>[A-Za-z0-9_]+)".to_string(),
            interval: Duration::from_secs(60),
            proc_path: "/proc".to_string(),
            clusterware_enabled: false,
            connect_timeout: Duration::from_secs(10),
            max_open_connections: 3,
            connect_dsn: "localhost:1521/SID".to_string(),
            connect_user: String::new(),
            connect_pass: Secret::default(),
            extra_labels: BTreeMap::new(),
            dynamic_params: Vec::new(),
        }
    }
}

/// Per-SID overrides selected by regex.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DynamicParams {
    pub sid_regex: String,
    pub connect_dsn: String,
    pub connect_user: String,
    pub connect_pass: Secret,
    pub extra_labels: BTreeMap<String, String>,
}

/// Which instances a metric group runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryLevel {
    /// Every matching instance.
    #[default]
    Instance,
    /// Only the instance currently valid for database-wide queries.
    #[serde(alias = "database")]
    Db,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricGroupConfig {
    pub name: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub query_period: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub query_timeout: Duration,
    /// Regex over the instance name. Empty selects every instance.
    pub instance_filter: String,
    pub query_level: QueryLevel,
    #[serde(rename = "query")]
    pub queries: Vec<QueryConfig>,
}

impl Default for MetricGroupConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            query_period: Duration::from_secs(60),
            query_timeout: Duration::from_secs(10),
            instance_filter: String::new(),
            query_level: QueryLevel::default(),
            queries: Vec::new(),
        }
    }
}

/// One monitoring statement and how to turn its rows into metrics.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    pub id: String,
    /// Measurement name of the produced metrics.
    pub context: String,
    pub request: String,
    /// Result columns emitted as tags.
    pub labels: Vec<String>,
    /// Result columns emitted as fields, with their declared kinds.
    pub metrics_type: BTreeMap<String, MetricKind>,
    pub metrics_desc: BTreeMap<String, String>,
    /// When set, rows are pivoted on this column (see `DataTable::transpose`).
    pub field_to_append: String,
    pub ignore_zero_result: bool,
}

impl QueryConfig {
    /// Pivot column, if the query is configured for long-to-wide transposition.
    pub fn pivot_column(&self) -> Option<&str> {
        let col = self.field_to_append.trim();
        (!col.is_empty()).then_some(col)
    }

    fn normalize(&mut self) {
        // Result headers are lower-cased, so every column reference is too.
        for label in &mut self.labels {
            *label = label.trim().to_lowercase();
        }
        self.metrics_type = std::mem::take(&mut self.metrics_type)
            .into_iter()
            .map(|(k, v)| (k.trim().to_lowercase(), v))
            .collect();
        self.field_to_append = self.field_to_append.trim().to_lowercase();
        if self.id.is_empty() {
            self.id = self.context.clone();
        }
    }
}

impl Config {
    /// Reads, normalizes and validates a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(
            path = %path.display(),
            groups = config.metric_groups.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        for group in &mut self.metric_groups {
            for query in &mut group.queries {
                query.normalize();
            }
        }
    }

    /// Rejects configurations the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        let out = &self.output;
        if out.buffer_size == 0 {
            return invalid("output.buffer_size must be greater than 0".into());
        }
        if out.batch_size == 0 {
            return invalid("output.batch_size must be greater than 0".into());
        }
        if out.flush_period.is_zero() {
            return invalid("output.flush_period must be greater than 0".into());
        }
        if out.sink == SinkKind::File && out.file_path.is_none() {
            return invalid("output.file_path is required when output.sink = \"file\"".into());
        }
        if self.self_monitor.enabled && self.self_monitor.period.is_zero() {
            return invalid("self_monitor.period must be greater than 0".into());
        }

        let disc = &self.discovery;
        if disc.interval.is_zero() {
            return invalid("discovery.interval must be greater than 0".into());
        }
        if disc.connect_timeout.is_zero() {
            return invalid("discovery.connect_timeout must be greater than 0".into());
        }
        if disc.max_open_connections == 0 {
            return invalid("discovery.max_open_connections must be greater than 0".into());
        }
        match Regex::new(&disc.pmon_regex) {
            Ok(re) if re.capture_names().flatten().any(|n| n == "SID") => {}
            Ok(_) => {
                return invalid(format!(
                    "discovery.pmon_regex '{}' has no (?P<SID>...) group",
                    disc.pmon_regex
                ));
            }
            Err(e) => return invalid(format!("discovery.pmon_regex: {e}")),
        }
        for (n, rule) in disc.dynamic_params.iter().enumerate() {
            if let Err(e) = Regex::new(&rule.sid_regex) {
                return invalid(format!("discovery.dynamic_params[{n}].sid_regex: {e}"));
            }
        }

        let mut names = HashSet::new();
        for group in &self.metric_groups {
            if group.name.is_empty() {
                return invalid("metric_group.name must not be empty".into());
            }
            if !names.insert(group.name.as_str()) {
                return invalid(format!("duplicate metric_group name '{}'", group.name));
            }
            if group.query_period.is_zero() || group.query_timeout.is_zero() {
                return invalid(format!(
                    "metric_group '{}': query_period and query_timeout must be greater than 0",
                    group.name
                ));
            }
            if !group.instance_filter.is_empty()
                && let Err(e) = Regex::new(&group.instance_filter)
            {
                return invalid(format!(
                    "metric_group '{}'.instance_filter: {e}",
                    group.name
                ));
            }
            for query in &group.queries {
                if query.context.is_empty() || query.request.trim().is_empty() {
                    return invalid(format!(
                        "metric_group '{}': every query needs a context and a request",
                        group.name
                    ));
                }
                if query.pivot_column().is_some() && !query.metrics_type.contains_key("value") {
                    return invalid(format!(
                        "metric_group '{}' query '{}': field_to_append requires a metrics_type entry for \"value\"",
                        group.name, query.id
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Parses a duration such as `"500ms"`, `"10s"`, `"5m"`, `"1h"` or `"30"` (seconds).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num_str, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1000)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60 * 1000)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 60 * 60 * 1000)
    } else {
        (s, 1000)
    };

    num_str
        .trim()
        .parse::<u64>()
        .map(|n| Duration::from_millis(n * unit_ms))
        .map_err(|e| format!("invalid duration '{}': {}", s, e))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[general]
instance_id = "agent-01"
log_level = "debug"

[output]
buffer_size = 100
flush_period = "5s"
overflow = "drop_newest"
precision = "ms"

[discovery]
interval = 30
connect_dsn = "db-host:1521/SID"
connect_user = "monitor"
connect_pass = "s3cret"
extra_labels = { env = "prod" }

[[discovery.dynamic_params]]
sid_regex = "^TEST"
extra_labels = { env = "test" }

[[metric_group]]
name = "basic"
query_period = "1m"
query_level = "db"

[[metric_group.query]]
context = "oracle_sessions"
request = "select inst_id, count(*) sessions from gv$session group by inst_id"
labels = ["INSTANCE"]
metrics_type = { SESSIONS = "INTEGER" }

[[metric_group.query]]
id = "sysmetric"
context = "oracle_sysmetric"
request = "select metric_name, value from v$sysmetric"
field_to_append = "METRIC_NAME"
metrics_type = { value = "float" }
"#;

    #[test]
    fn test_parses_and_normalizes_sample() {
        let cfg = Config::from_toml_str(SAMPLE).unwrap();

        assert_eq!(cfg.general.instance_id, "agent-01");
        assert_eq!(cfg.output.buffer_size, 100);
        assert_eq!(cfg.output.batch_size, 5000);
        assert_eq!(cfg.output.flush_period, Duration::from_secs(5));
        assert_eq!(cfg.output.overflow, OverflowPolicy::DropNewest);
        assert_eq!(cfg.output.precision, Precision::Milliseconds);
        assert_eq!(cfg.discovery.interval, Duration::from_secs(30));
        assert_eq!(cfg.discovery.connect_pass.expose(), "s3cret");
        assert_eq!(cfg.discovery.dynamic_params.len(), 1);

        let group = &cfg.metric_groups[0];
        assert_eq!(group.query_period, Duration::from_secs(60));
        assert_eq!(group.query_timeout, Duration::from_secs(10));
        assert_eq!(group.query_level, QueryLevel::Db);

        let q = &group.queries[0];
        assert_eq!(q.id, "oracle_sessions");
        assert_eq!(q.labels, vec!["instance".to_string()]);
        assert_eq!(q.metrics_type.get("sessions"), Some(&MetricKind::Integer));
        assert_eq!(q.pivot_column(), None);

        let q = &group.queries[1];
        assert_eq!(q.pivot_column(), Some("metric_name"));
    }

    #[test]
    fn test_secret_is_not_printed() {
        let cfg = Config::from_toml_str(SAMPLE).unwrap();
        let dump = format!("{:?}", cfg.discovery);
        assert!(!dump.contains("s3cret"));
        assert!(dump.contains("***"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = Config::from_toml_str("").unwrap();
        assert_eq!(cfg.output.buffer_size, 65535);
        assert_eq!(cfg.discovery.interval, Duration::from_secs(60));
        assert!(cfg.self_monitor.enabled);
        assert!(cfg.metric_groups.is_empty());
    }

    #[test]
    fn test_rejects_pmon_regex_without_sid_group() {
        let err = Config::from_toml_str("[discovery]\npmon_regex = \"ora_pmon_(\\\\w+)\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("SID"), "{err}");
    }

    #[test]
    fn test_rejects_pivot_without_value_type() {
        let toml = r#"
[[metric_group]]
name = "g"
[[metric_group.query]]
context = "c"
request = "select 1 from dual"
field_to_append = "name"
metrics_type = { other = "float" }
"#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("value"), "{err}");
    }

    #[test]
    fn test_rejects_duplicate_groups_and_zero_buffer() {
        let toml = "[[metric_group]]\nname = \"a\"\n[[metric_group]]\nname = \"a\"\n";
        assert!(Config::from_toml_str(toml).is_err());
        assert!(Config::from_toml_str("[output]\nbuffer_size = 0\n").is_err());
        assert!(Config::from_toml_str("[output]\nsink = \"file\"\n").is_err());
    }

    #[test]
    fn test_rejects_unknown_metric_kind() {
        let toml = r#"
[[metric_group]]
name = "g"
[[metric_group.query]]
context = "c"
request = "select 1 from dual"
metrics_type = { x = "gauge" }
"#;
        assert!(matches!(
            Config::from_toml_str(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("42"), Ok(Duration::from_secs(42)));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ten").is_err());
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.metric_groups.len(), 1);

        assert!(matches!(
            Config::load(dir.path().join("missing.toml")),
            Err(ConfigError::Read(_))
        ));
    }
}
