//! Nested log files for running work.
//!
//! Each request owns a parent log. Anything that runs on its behalf can open a
//! [`ChildLog`]: a pair of files (`o<n>.log` for output, `e<n>.log` for
//! errors) under a date-based folder, announced to the request's progress
//! reporter as soon as they exist. Child logs can have children of their own.
//!
//! Tracing events land in a child log when they are emitted inside the span
//! returned by [`LoggingGuard::span`]; see [`LogRouter`].

mod router;

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{Span, debug};
use uuid::Uuid;

pub use router::LogRouter;

use crate::error::{Error, Result};
use crate::fsutil;
use crate::progress::{ProgressInfo, ProgressReporter};

/// Identifier of a log in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(pub Uuid);

impl LogId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LogId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Something child logs can hang off.
pub trait ParentLog: Send + Sync {
    fn log_id(&self) -> LogId;
    fn create_child_log(&self) -> Result<ChildLog>;
}

// Seeded with the start time so numbers stay unique across restarts.
static NEXT_LOG_NUMBER: LazyLock<AtomicU64> =
    LazyLock::new(|| AtomicU64::new(Utc::now().timestamp_millis().unsigned_abs()));

/// Where child logs are written and which router delivers events to them.
#[derive(Clone)]
pub struct LoggerFactory {
    log_folder: PathBuf,
    router: LogRouter,
}

impl LoggerFactory {
    pub fn new(log_folder: impl Into<PathBuf>, router: LogRouter) -> Self {
        Self {
            log_folder: log_folder.into(),
            router,
        }
    }

    pub fn log_folder(&self) -> &Path {
        &self.log_folder
    }

    pub fn router(&self) -> &LogRouter {
        &self.router
    }

    /// Root log of a request. Child log announcements go to `reporter`.
    pub fn request_log(&self, reporter: Arc<dyn ProgressReporter>) -> RequestParentLog {
        RequestParentLog {
            id: LogId::new(),
            factory: self.clone(),
            reporter,
        }
    }

    fn next_paths(&self) -> Result<(PathBuf, PathBuf)> {
        let folder = fsutil::date_based_folder(&self.log_folder, Utc::now())?;
        let n = NEXT_LOG_NUMBER.fetch_add(1, Ordering::Relaxed);
        Ok((folder.join(format!("o{n}.log")), folder.join(format!("e{n}.log"))))
    }
}

/// The log a request starts with.
pub struct RequestParentLog {
    id: LogId,
    factory: LoggerFactory,
    reporter: Arc<dyn ProgressReporter>,
}

impl ParentLog for RequestParentLog {
    fn log_id(&self) -> LogId {
        self.id
    }

    fn create_child_log(&self) -> Result<ChildLog> {
        ChildLog::create(&self.factory, self.id, Arc::clone(&self.reporter))
    }
}

/// One node of the log tree, backed by an output file and an error file.
pub struct ChildLog {
    id: LogId,
    parent_id: LogId,
    output_path: PathBuf,
    error_path: PathBuf,
    factory: LoggerFactory,
    reporter: Arc<dyn ProgressReporter>,
}

impl ChildLog {
    fn create(
        factory: &LoggerFactory,
        parent_id: LogId,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Result<Self> {
        let (output_path, error_path) = factory.next_paths()?;
        for path in [&output_path, &error_path] {
            File::create(path).map_err(|source| Error::Log {
                path: path.clone(),
                source,
            })?;
        }

        let log = Self {
            id: LogId::new(),
            parent_id,
            output_path,
            error_path,
            factory: factory.clone(),
            reporter,
        };
        debug!(log_id = %log.id, parent_id = %parent_id, output = %log.output_path.display(), "child log created");
        log.reporter.report_progress(ProgressInfo::NewLogFiles {
            parent_id,
            log_id: log.id,
            output_path: log.output_path.clone(),
            error_path: log.error_path.clone(),
        });
        Ok(log)
    }

    pub fn id(&self) -> LogId {
        self.id
    }

    pub fn parent_id(&self) -> LogId {
        self.parent_id
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn error_path(&self) -> &Path {
        &self.error_path
    }

    /// Route tracing events emitted inside [`LoggingGuard::span`] to this log.
    pub fn start_logging(&self) -> Result<LoggingGuard> {
        let tag = self.id.to_string();
        self.factory
            .router
            .register(&tag, open_append(&self.output_path)?, open_append(&self.error_path)?);
        // ERROR level so no console filter can keep the tag from being created.
        let span = tracing::error_span!("child_log", log.tag = %tag);
        Ok(LoggingGuard {
            router: self.factory.router.clone(),
            tag,
            span,
        })
    }

    /// Write to the log files directly, bypassing tracing.
    pub fn open_handle(&self) -> Result<LogHandle> {
        Ok(LogHandle {
            output: Some(open_append(&self.output_path)?),
            error: Some(open_append(&self.error_path)?),
        })
    }
}

impl ParentLog for ChildLog {
    fn log_id(&self) -> LogId {
        self.id
    }

    fn create_child_log(&self) -> Result<ChildLog> {
        ChildLog::create(&self.factory, self.id, Arc::clone(&self.reporter))
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| Error::Log {
            path: path.to_path_buf(),
            source,
        })
}

/// Keeps a child log registered with the router. Dropping it stops logging.
pub struct LoggingGuard {
    router: LogRouter,
    tag: String,
    span: Span,
}

impl LoggingGuard {
    /// Events emitted inside this span go to the child log.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn stop_logging(self) {}
}

impl Drop for LoggingGuard {
    fn drop(&mut self) {
        self.router.unregister(&self.tag);
    }
}

/// Direct writer for a child log's files.
pub struct LogHandle {
    output: Option<File>,
    error: Option<File>,
}

impl LogHandle {
    pub fn write_output(&mut self, line: &str) -> Result<()> {
        write_line(&mut self.output, line)
    }

    pub fn write_error(&mut self, line: &str) -> Result<()> {
        write_line(&mut self.error, line)
    }

    /// Separate file handles suitable for a child process's stdout and stderr.
    pub fn stdio(&self) -> Result<(std::process::Stdio, std::process::Stdio)> {
        match (&self.output, &self.error) {
            (Some(out), Some(err)) => Ok((out.try_clone()?.into(), err.try_clone()?.into())),
            _ => Err(Error::Other("log handle is closed".to_string())),
        }
    }

    /// Flush and close both files. Later writes are ignored.
    pub fn close(&mut self) -> Result<()> {
        for file in [self.output.take(), self.error.take()].into_iter().flatten() {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for LogHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn write_line(file: &mut Option<File>, line: &str) -> Result<()> {
    if let Some(file) = file {
        writeln!(file, "{line}")?;
    }
    Ok(())
}
