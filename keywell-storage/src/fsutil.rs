//! Filesystem status helpers
//!
//! Thin wrappers over `std::fs` used by the engine (WAL discovery,
//! repair) and exposed for callers that manage database files.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use keywell_core::Result;

/// Basic status of a filesystem path
#[derive(Debug, Clone)]
pub struct FileStatus {
    pub is_dir: bool,
    pub size: u64,
    pub mtime: SystemTime,
}

/// Returns the status of `path`, or `None` when it does not exist
pub fn status(path: impl AsRef<Path>) -> Result<Option<FileStatus>> {
    match fs::metadata(path.as_ref()) {
        Ok(meta) => Ok(Some(FileStatus {
            is_dir: meta.is_dir(),
            size: meta.len(),
            mtime: meta.modified()?,
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Resolves `path` to an absolute, symlink-free form
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    Ok(fs::canonicalize(path.as_ref())?)
}

pub fn remove_file(path: impl AsRef<Path>) -> Result<()> {
    Ok(fs::remove_file(path.as_ref())?)
}

pub fn create_dir(path: impl AsRef<Path>) -> Result<()> {
    Ok(fs::create_dir_all(path.as_ref())?)
}

pub fn remove_dir(path: impl AsRef<Path>) -> Result<()> {
    Ok(fs::remove_dir_all(path.as_ref())?)
}

/// Lists the entries of a directory as path bufs
pub fn list_dir(path: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path.as_ref())? {
        entries.push(entry?.path());
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn status_reports_files_and_directories() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"abc").unwrap();

        let st = status(&file).unwrap().unwrap();
        assert!(!st.is_dir);
        assert_eq!(st.size, 3);

        let st = status(dir.path()).unwrap().unwrap();
        assert!(st.is_dir);
    }

    #[test]
    fn status_of_missing_path_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(status(dir.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn directory_create_list_remove() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("a/b");
        create_dir(&sub).unwrap();
        fs::write(sub.join("x"), b"1").unwrap();

        let listed = list_dir(&sub).unwrap();
        assert_eq!(listed.len(), 1);

        remove_dir(dir.path().join("a")).unwrap();
        assert!(status(&sub).unwrap().is_none());
    }
}
