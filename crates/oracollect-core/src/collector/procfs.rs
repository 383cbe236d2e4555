//! Locates database instances by scanning process command lines.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tracing::trace;

use super::traits::FileSystem;

/// Name of the capture group holding the instance identifier.
pub const SID_GROUP: &str = "SID";

#[derive(Error, Debug)]
pub enum ProcError {
    #[error("cannot list {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid process pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("process pattern has no (?P<SID>...) group")]
    NoSidGroup,
}

/// Maps SIDs to the pid of the process whose command line matched.
pub struct ProcessFinder {
    fs: Arc<dyn FileSystem>,
    proc_path: PathBuf,
    pattern: Regex,
}

impl ProcessFinder {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        proc_path: impl Into<PathBuf>,
        pattern: &str,
    ) -> Result<Self, ProcError> {
        let pattern = Regex::new(pattern)?;
        if !pattern.capture_names().flatten().any(|n| n == SID_GROUP) {
            return Err(ProcError::NoSidGroup);
        }
        Ok(Self {
            fs,
            proc_path: proc_path.into(),
            pattern,
        })
    }

    /// Scans the process table once.
    ///
    /// Processes that exit mid-scan or whose command line is unreadable are
    /// skipped. When two processes yield the same SID the lowest pid wins.
    pub fn find(&self) -> Result<BTreeMap<String, u32>, ProcError> {
        let entries = self
            .fs
            .read_dir(&self.proc_path)
            .map_err(|source| ProcError::List {
                path: self.proc_path.clone(),
                source,
            })?;

        let mut pids: Vec<u32> = entries.iter().filter_map(|p| pid_of(p)).collect();
        pids.sort_unstable();

        let mut found = BTreeMap::new();
        for pid in pids {
            let Some(cmdline) = self.cmdline(pid) else {
                continue;
            };
            if let Some(sid) = self
                .pattern
                .captures(&cmdline)
                .and_then(|c| c.name(SID_GROUP))
                .map(|m| m.as_str().to_string())
                .filter(|s| !s.is_empty())
            {
                trace!(pid, sid = %sid, "matched process");
                found.entry(sid).or_insert(pid);
            }
        }
        Ok(found)
    }

    fn cmdline(&self, pid: u32) -> Option<String> {
        let path = self.proc_path.join(pid.to_string()).join("cmdline");
        let raw = self.fs.read(&path).ok()?;
        let joined = String::from_utf8_lossy(&raw).replace('\0', " ");
        let trimmed = joined.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

fn pid_of(path: &Path) -> Option<u32> {
    path.file_name()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::MockFs;

    const PMON: &str = "ora_pmon_(?P<SID>[A-Za-z0-9_]+)";

    fn finder(fs: MockFs, pattern: &str) -> ProcessFinder {
        ProcessFinder::new(Arc::new(fs), "/proc", pattern).unwrap()
    }

    #[test]
    fn test_finds_pmon_processes() {
        let found = finder(MockFs::cluster_node(), PMON).find().unwrap();
        assert_eq!(
            found,
            BTreeMap::from([("DWH1".to_string(), 4200), ("PROD1".to_string(), 4100)])
        );
    }

    #[test]
    fn test_custom_pattern_matches_asm() {
        let found = finder(MockFs::cluster_node(), r"(?:asm|ora)_pmon_(?P<SID>\+?\w+)")
            .find()
            .unwrap();
        assert_eq!(found.get("+ASM1"), Some(&4000));
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn test_skips_processes_without_cmdline_and_keeps_lowest_pid() {
        let mut fs = MockFs::single_instance();
        fs.add_dir("/proc/77");
        fs.add_file("/proc/78/cmdline", "");
        fs.add_process(9000, &["ora_pmon_ORCL1"]);
        let found = finder(fs, PMON).find().unwrap();
        assert_eq!(found, BTreeMap::from([("ORCL1".to_string(), 3100)]));
    }

    #[test]
    fn test_rejects_pattern_without_sid_group() {
        let err = ProcessFinder::new(Arc::new(MockFs::new()), "/proc", "ora_pmon_(\\w+)")
            .err()
            .unwrap();
        assert!(matches!(err, ProcError::NoSidGroup));
    }

    #[test]
    fn test_missing_proc_dir_is_an_error() {
        let err = finder(MockFs::new(), PMON).find().unwrap_err();
        assert!(matches!(err, ProcError::List { .. }));
    }
}
