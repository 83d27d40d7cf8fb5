//! Grid engine job descriptions.
//!
//! A [`GridJob`] collects what the scheduler needs to know about one job and
//! renders the `qsub` line that submits it.

mod service;

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

pub use service::{GridService, GridServiceRegistry};

// Seeded with the start time so log names stay unique across restarts.
static NEXT_JOB_ID: LazyLock<AtomicU64> =
    LazyLock::new(|| AtomicU64::new(Utc::now().timestamp_millis().unsigned_abs()));

#[derive(Debug, Clone, PartialEq)]
pub struct GridJob {
    id: u64,
    application: String,
    args: Vec<String>,
    priority: i32,
    queue: String,
    memory_mb: String,
    native_spec: String,
    working_folder: PathBuf,
    log_folder: Option<PathBuf>,
}

impl GridJob {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            application: application.into(),
            args: Vec::new(),
            priority: 0,
            queue: "all.q".to_string(),
            memory_mb: "0".to_string(),
            native_spec: String::new(),
            working_folder: PathBuf::from("."),
            log_folder: None,
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn memory_mb(mut self, memory: impl Into<String>) -> Self {
        self.memory_mb = memory.into();
        self
    }

    pub fn native_spec(mut self, native_spec: impl Into<String>) -> Self {
        self.native_spec = native_spec.into();
        self
    }

    pub fn working_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.working_folder = folder.into();
        self
    }

    pub fn log_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.log_folder = Some(folder.into());
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn working_folder_path(&self) -> &Path {
        &self.working_folder
    }

    /// `o<id>.sge.log` in the log folder, if one is set.
    pub fn output_log_file(&self) -> Option<PathBuf> {
        self.log_folder
            .as_ref()
            .map(|f| f.join(format!("o{}.sge.log", self.id)))
    }

    /// `e<id>.sge.log` in the log folder, if one is set.
    pub fn error_log_file(&self) -> Option<PathBuf> {
        self.log_folder
            .as_ref()
            .map(|f| f.join(format!("e{}.sge.log", self.id)))
    }

    /// The submission line. The working folder is single-quoted with inner
    /// quotes escaped as `\'`; an empty native specification is omitted.
    pub fn qsub_command(&self) -> String {
        let folder = self.working_folder.to_string_lossy().replace('\'', "\\'");
        let mut parts = vec![
            "qsub".to_string(),
            "-q".to_string(),
            self.queue.clone(),
            "-wd".to_string(),
            format!("'{folder}'"),
            "-l".to_string(),
            format!("s_vmem={}M", self.memory_mb),
            "-p".to_string(),
            self.priority.to_string(),
        ];
        if !self.native_spec.is_empty() {
            parts.push(self.native_spec.clone());
        }
        parts.push(self.application.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

impl std::fmt::Display for GridJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.qsub_command())
    }
}
