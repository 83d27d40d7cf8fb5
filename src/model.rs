//! Core data model.
//!
//! A work packet names one unit of expensive work: an input file, where the
//! result should go, and the parameters that shape it. Cache identity is the
//! business content only. The task id and priority are bookkeeping.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::files::{FileCarrier, FileRef, FileWalk, Param};
use crate::fsutil;
use crate::progress::{ProgressInfo, ProgressReporter};

/// Deterministic digest of a packet's business content.
///
/// Only built by [`Fingerprint::of`], so it is always 64 hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// SHA-256 of the task description, hex encoded.
    pub fn of(description: &str) -> Self {
        Self(hex::encode(Sha256::digest(description.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Anything a daemon can receive and hand to a worker.
pub trait Work: FileCarrier + Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    fn work_type(&self) -> &str;
    fn task_id(&self) -> &str;
}

/// Work the cache knows how to store and reuse.
pub trait Cacheable: Work {
    /// Human readable account of everything that determines the result.
    fn task_description(&self) -> String;

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(&self.task_description())
    }

    /// Names of the files a successful run leaves in its output folder.
    fn output_files(&self) -> Vec<String>;

    fn is_from_scratch(&self) -> bool;

    /// Same work, but writing into `slot` instead of the requested location.
    fn translate_to_cache_packet(&self, slot: &Path) -> Self;

    /// Whether a finished slot can no longer be trusted. Anything that cannot
    /// be checked counts as stale.
    fn cache_is_stale(&self, slot: &Path) -> bool;

    /// Copy results out of `slot` to wherever the caller asked for them.
    fn publish_result_files(&self, slot: &Path) -> Result<()>;

    fn report_cached_result(&self, slot: &Path, reporter: &dyn ProgressReporter) {
        let output_path = match self.output_files().first() {
            Some(name) => slot.join(name),
            None => slot.to_path_buf(),
        };
        reporter.report_progress(ProgressInfo::CachedResult { output_path });
    }
}

/// The standard packet: one input, one output, optional database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPacket {
    pub task_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub from_scratch: bool,
    pub work_type: String,
    pub input: FileRef,
    pub output: FileRef,
    #[serde(default)]
    pub database: Option<FileRef>,
    /// Full parameter text, as the tool reads it.
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub publish_results: bool,
    /// Further named inputs and settings.
    #[serde(default)]
    pub extra: BTreeMap<String, Param>,
}

impl WorkPacket {
    pub fn new(
        task_id: impl Into<String>,
        work_type: impl Into<String>,
        input: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            priority: 0,
            from_scratch: false,
            work_type: work_type.into(),
            input: FileRef::new(input),
            output: FileRef::new(output),
            database: None,
            params: String::new(),
            publish_results: false,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<PathBuf>) -> Self {
        self.database = Some(FileRef::new(database));
        self
    }

    pub fn with_publish(mut self, publish: bool) -> Self {
        self.publish_results = publish;
        self
    }

    pub fn with_from_scratch(mut self, from_scratch: bool) -> Self {
        self.from_scratch = from_scratch;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Param) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    fn output_name(&self) -> String {
        self.output
            .file_name()
            .unwrap_or_else(|| "output".to_string())
    }

    /// Files whose modification invalidates a cached result.
    fn source_files(&self) -> Vec<&FileRef> {
        let mut sources = vec![&self.input];
        sources.extend(self.database.iter());
        sources.extend(self.extra.values().filter_map(|p| match p {
            Param::File(f) => Some(f),
            Param::Json(_) => None,
        }));
        sources
    }
}

fn describe(file: &FileRef) -> String {
    match (file.path(), file.token()) {
        (Some(path), _) => fsutil::portable_path(path),
        (None, Some(token)) => token.to_wire(),
        (None, None) => "-".to_string(),
    }
}

impl FileCarrier for WorkPacket {
    fn visit_files(&mut self, walk: &mut FileWalk<'_>) -> Result<()> {
        walk.file(&mut self.input)?;
        walk.file(&mut self.output)?;
        walk.opt_file(&mut self.database)?;
        walk.params(self.extra.values_mut())
    }
}

impl Work for WorkPacket {
    fn work_type(&self) -> &str {
        &self.work_type
    }

    fn task_id(&self) -> &str {
        &self.task_id
    }
}

impl Cacheable for WorkPacket {
    fn task_description(&self) -> String {
        let mut description = format!(
            "work_type={}\ninput={}\noutput={}\ndatabase={}\npublish={}\nparams={}\n",
            self.work_type,
            describe(&self.input),
            self.output_name(),
            self.database.as_ref().map(describe).unwrap_or_else(|| "-".to_string()),
            self.publish_results,
            self.params,
        );
        for (key, value) in &self.extra {
            let value = match value {
                Param::File(f) => describe(f),
                Param::Json(v) => v.to_string(),
            };
            description.push_str(&format!("extra.{key}={value}\n"));
        }
        description
    }

    fn output_files(&self) -> Vec<String> {
        vec![self.output_name()]
    }

    fn is_from_scratch(&self) -> bool {
        self.from_scratch
    }

    fn translate_to_cache_packet(&self, slot: &Path) -> Self {
        let mut packet = self.clone();
        packet.output = FileRef::new(slot.join(self.output_name()));
        packet.publish_results = false;
        packet
    }

    fn cache_is_stale(&self, slot: &Path) -> bool {
        let mut output_times = Vec::new();
        for name in self.output_files() {
            match fsutil::modified(&slot.join(name)) {
                Some(t) => output_times.push(t),
                None => return true,
            }
        }
        let Some(oldest_output) = output_times.into_iter().min() else {
            return true;
        };
        self.source_files().into_iter().any(|source| {
            match source.path().and_then(fsutil::modified) {
                Some(t) => t > oldest_output,
                None => true,
            }
        })
    }

    fn publish_result_files(&self, slot: &Path) -> Result<()> {
        if !self.publish_results {
            return Ok(());
        }
        let target = self.output.require_path()?;
        let source = slot.join(self.output_name());
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&source, target).map_err(|e| {
            Error::Cache(format!(
                "cannot publish {} to {}: {e}",
                source.display(),
                target.display()
            ))
        })?;
        Ok(())
    }
}
