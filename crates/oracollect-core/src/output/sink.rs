//! Destinations for encoded metrics.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::OutputError;

pub trait MetricSink: Send {
    fn name(&self) -> &str;

    fn write(&mut self, payload: &[u8]) -> Result<(), OutputError>;
}

/// Writes to the process's standard output.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl MetricSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    fn write(&mut self, payload: &[u8]) -> Result<(), OutputError> {
        let mut out = io::stdout().lock();
        out.write_all(payload)?;
        out.flush()?;
        Ok(())
    }
}

/// Appends to a file, creating it if needed.
pub struct FileSink {
    path: PathBuf,
    file: BufWriter<File>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OutputError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| OutputError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn write(&mut self, payload: &[u8]) -> Result<(), OutputError> {
        self.file.write_all(payload)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Collects payloads in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    data: Arc<Mutex<Vec<u8>>>,
    writes: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.data.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }

    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }
}

impl MetricSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn write(&mut self, payload: &[u8]) -> Result<(), OutputError> {
        self.data.lock().extend_from_slice(payload);
        *self.writes.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.lp");
        std::fs::write(&path, "old\n").unwrap();

        let mut sink = FileSink::open(&path).unwrap();
        sink.write(b"a 1i 1\n").unwrap();
        sink.write(b"b 2i 1\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old\na 1i 1\nb 2i 1\n");
    }

    #[test]
    fn test_file_sink_reports_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileSink::open(dir.path().join("no/such/dir/m.lp")).err().unwrap();
        assert!(matches!(err, OutputError::Open { .. }));
    }
}
