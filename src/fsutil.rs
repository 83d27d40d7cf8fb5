//! Filesystem helpers shared by the token factory, the cache and the log tree.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Datelike, Utc};
use tracing::debug;

use crate::error::{Error, Result};

/// Absolute, lexically normalized path with `.` and `..` folded away.
///
/// Symlinks are resolved when the file exists; missing files are still
/// normalized so tokens can be issued for outputs that do not exist yet.
pub fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(real) = std::fs::canonicalize(path) {
        return real;
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonical path rendered with forward slashes.
pub fn portable_path(path: &Path) -> String {
    canonical_path(path).to_string_lossy().replace('\\', "/")
}

/// `<base>/YYYY/MM/DD`, created if missing.
pub fn date_based_folder(base: &Path, date: DateTime<Utc>) -> Result<PathBuf> {
    let folder = base
        .join(format!("{:04}", date.year()))
        .join(format!("{:02}", date.month()))
        .join(format!("{:02}", date.day()));
    std::fs::create_dir_all(&folder)?;
    Ok(folder)
}

/// Modification time, or `None` when the file cannot be inspected.
pub fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Remove a file or a whole folder; a missing target is not an error.
pub fn delete_now(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Outcome of [`wait_for_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileWait {
    Ready,
    /// Files still missing when the timeout expired.
    TimedOut(Vec<PathBuf>),
}

impl FileWait {
    pub fn into_result(self) -> Result<()> {
        match self {
            FileWait::Ready => Ok(()),
            FileWait::TimedOut(files) => Err(Error::Timeout { files }),
        }
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Wait until all files exist or the timeout expires.
///
/// Shared filesystems (NFS in particular) can publish a file to other hosts
/// well after the writer has closed it, hence the wait.
pub async fn wait_for_files(files: &[PathBuf], timeout: Duration) -> FileWait {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let missing: Vec<PathBuf> = files.iter().filter(|f| !f.exists()).cloned().collect();
        if missing.is_empty() {
            return FileWait::Ready;
        }
        if tokio::time::Instant::now() >= deadline {
            debug!(missing = missing.len(), "gave up waiting for files");
            return FileWait::TimedOut(missing);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Like [`wait_for_files`], but hands the outcome to a listener instead of
/// returning it. The listener gets the files in question and a timeout flag.
pub async fn wait_for_files_then<F>(files: Vec<PathBuf>, timeout: Duration, listener: F)
where
    F: FnOnce(&[PathBuf], bool),
{
    match wait_for_files(&files, timeout).await {
        FileWait::Ready => listener(&files, false),
        FileWait::TimedOut(missing) => listener(&missing, true),
    }
}
