//! Filesystem access behind a trait so process scanning can run against `/proc`
//! or an in-memory fixture.

use std::io;
use std::path::{Path, PathBuf};

/// Read-only filesystem operations used by the process finder and self-monitoring.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Reads a file as raw bytes. `/proc/[pid]/cmdline` is NUL-separated and
    /// not guaranteed to be UTF-8.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.read_to_string(path).map(String::into_bytes)
    }

    /// Lists the entries of a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// The host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_fs_reads_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cmdline"), b"ora_pmon_ORCL\0").unwrap();
        std::fs::create_dir(dir.path().join("42")).unwrap();

        let fs = RealFs::new();
        assert_eq!(
            fs.read(&dir.path().join("cmdline")).unwrap(),
            b"ora_pmon_ORCL\0"
        );
        let mut entries = fs.read_dir(dir.path()).unwrap();
        entries.sort();
        assert_eq!(entries.len(), 2);
        assert!(fs.read_to_string(&dir.path().join("missing")).is_err());
    }
}
