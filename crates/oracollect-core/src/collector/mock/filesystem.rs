//! In-memory filesystem for tests that need a fake `/proc`.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use crate::collector::traits::FileSystem;

/// Files and directories held in memory. Parent directories are created
/// implicitly when a file is added.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    files: BTreeMap<PathBuf, Vec<u8>>,
    directories: BTreeSet<PathBuf>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            self.add_dir(parent);
        }
        self.files.insert(path, content.into());
    }

    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        for dir in path.as_ref().ancestors() {
            if !dir.as_os_str().is_empty() {
                self.directories.insert(dir.to_path_buf());
            }
        }
    }

    /// Adds `/proc/<pid>/cmdline` with `argv` joined by NUL, as the kernel does.
    pub fn add_process(&mut self, pid: u32, argv: &[&str]) {
        let mut cmdline = argv.join("\0").into_bytes();
        cmdline.push(0);
        self.add_file(format!("/proc/{pid}/cmdline"), cmdline);
    }

    /// Removes a process directory, simulating exit between scans.
    pub fn remove_process(&mut self, pid: u32) {
        let base = PathBuf::from(format!("/proc/{pid}"));
        self.files.retain(|p, _| !p.starts_with(&base));
        self.directories.retain(|p| !p.starts_with(&base));
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("not found: {}", path.display()))
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files.get(path).cloned().ok_or_else(|| not_found(path))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        if !self.directories.contains(path) {
            return Err(not_found(path));
        }
        let children: BTreeSet<PathBuf> = self
            .files
            .keys()
            .chain(self.directories.iter())
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect();
        Ok(children.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_create_parent_dirs() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/self/status", "Threads: 4\n");
        assert_eq!(
            fs.read_dir(Path::new("/proc")).unwrap(),
            vec![PathBuf::from("/proc/self")]
        );
        assert_eq!(
            fs.read_to_string(Path::new("/proc/self/status")).unwrap(),
            "Threads: 4\n"
        );
    }

    #[test]
    fn test_processes_can_come_and_go() {
        let mut fs = MockFs::new();
        fs.add_process(10, &["ora_pmon_A"]);
        fs.add_process(11, &["bash", "-l"]);
        assert_eq!(fs.read(Path::new("/proc/11/cmdline")).unwrap(), b"bash\0-l\0");
        assert_eq!(fs.read_dir(Path::new("/proc")).unwrap().len(), 2);

        fs.remove_process(10);
        assert_eq!(fs.read_dir(Path::new("/proc")).unwrap().len(), 1);
        assert!(fs.read(Path::new("/proc/10/cmdline")).is_err());
    }
}
