//! On-disk layout of the work cache.
//!
//! Every fingerprint owns one slot, `<root>/<h0h1>/<h2h3>/<rest>`, holding the
//! output files and a `_task_description` file. While a slot is being filled
//! the description is named `_task_description~`; it is renamed once the
//! outputs are complete, so a slot without the final name is never served.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::fsutil;
use crate::model::{Cacheable, Fingerprint};

const DESCRIPTION_FILE: &str = "_task_description";
const IN_PROGRESS_FILE: &str = "_task_description~";

#[derive(Debug, Clone)]
pub struct CacheFolder {
    root: PathBuf,
}

impl CacheFolder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.as_str();
        self.root.join(&hex[..2]).join(&hex[2..4]).join(&hex[4..])
    }

    /// A finished, fresh slot for `work`, if there is one.
    ///
    /// Slots the request asks to ignore (`from_scratch`) or that are stale
    /// are deleted on the way.
    pub fn lookup<W: Cacheable>(&self, work: &W) -> Result<Option<PathBuf>> {
        let slot = self.slot_for(&work.fingerprint());
        if !slot.join(DESCRIPTION_FILE).exists() {
            return Ok(None);
        }
        if work.is_from_scratch() {
            info!(slot = %slot.display(), "from-scratch request, dropping cached result");
            fsutil::delete_now(&slot)?;
            return Ok(None);
        }
        if work.cache_is_stale(&slot) {
            info!(slot = %slot.display(), "cached result is stale");
            fsutil::delete_now(&slot)?;
            return Ok(None);
        }
        Ok(Some(slot))
    }

    /// Prepare an empty slot for a new computation.
    pub fn begin<W: Cacheable>(&self, work: &W) -> Result<PathBuf> {
        let slot = self.slot_for(&work.fingerprint());
        fsutil::delete_now(&slot)?;
        std::fs::create_dir_all(&slot)?;
        std::fs::write(slot.join(IN_PROGRESS_FILE), work.task_description())?;
        debug!(slot = %slot.display(), "cache slot reserved");
        Ok(slot)
    }

    /// Mark a slot as complete.
    pub fn commit(&self, slot: &Path) -> Result<()> {
        std::fs::rename(slot.join(IN_PROGRESS_FILE), slot.join(DESCRIPTION_FILE)).map_err(|e| {
            Error::Cache(format!("cannot finish cache slot {}: {e}", slot.display()))
        })
    }

    /// Remove a slot and everything in it.
    pub fn abandon(&self, slot: &Path) -> Result<()> {
        fsutil::delete_now(slot)
    }

    pub fn is_in_progress(&self, slot: &Path) -> bool {
        slot.join(IN_PROGRESS_FILE).exists()
    }

    pub fn task_description(&self, slot: &Path) -> Option<String> {
        std::fs::read_to_string(slot.join(DESCRIPTION_FILE)).ok()
    }

    /// Delete every data folder under the root. Other files are left alone.
    pub fn cleanup(&self) -> Result<usize> {
        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if entry.file_type()?.is_dir()
                && name.len() == 2
                && name.chars().all(|c| c.is_ascii_hexdigit())
            {
                fsutil::delete_now(&entry.path())?;
                removed += 1;
            }
        }
        info!(root = %self.root.display(), removed, "cache cleaned");
        Ok(removed)
    }
}
