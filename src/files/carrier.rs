//! Walking the file references inside a work packet.
//!
//! A type that carries files implements [`FileCarrier::visit_files`] and names
//! each of its file-bearing fields on the [`FileWalk`]. The walk applies one
//! action to every reachable [`FileRef`] exactly once: nested carriers are
//! tracked by identity so shared nodes are not visited twice and cyclic
//! graphs terminate. Fields that are not named are not translated.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::FileRef;
use super::token::{FileTokenFactory, ReceiverTranslator, SenderTranslator};
use crate::error::{Error, Result};

/// A parameter value that may itself be a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Param {
    File(FileRef),
    Json(serde_json::Value),
}

type Action<'a> = dyn FnMut(&mut FileRef) -> Result<()> + 'a;

/// One traversal over a carrier graph.
pub struct FileWalk<'a> {
    visited: HashSet<(usize, &'static str)>,
    action: &'a mut Action<'a>,
}

impl<'a> FileWalk<'a> {
    pub fn new(action: &'a mut Action<'a>) -> Self {
        Self {
            visited: HashSet::new(),
            action,
        }
    }

    pub fn file(&mut self, file: &mut FileRef) -> Result<()> {
        (self.action)(file)
    }

    pub fn opt_file(&mut self, file: &mut Option<FileRef>) -> Result<()> {
        match file {
            Some(file) => self.file(file),
            None => Ok(()),
        }
    }

    pub fn files<'f>(&mut self, files: impl IntoIterator<Item = &'f mut FileRef>) -> Result<()> {
        for file in files {
            self.file(file)?;
        }
        Ok(())
    }

    /// Descend into a nested carrier, unless this walk has already been there.
    pub fn carrier<C: FileCarrier + ?Sized>(&mut self, carrier: &mut C) -> Result<()> {
        let id = ((carrier as *mut C).cast::<()>() as usize, std::any::type_name::<C>());
        if !self.visited.insert(id) {
            return Ok(());
        }
        carrier.visit_files(self)
    }

    pub fn carriers<'c, C: FileCarrier + 'c>(
        &mut self,
        carriers: impl IntoIterator<Item = &'c mut C>,
    ) -> Result<()> {
        for carrier in carriers {
            self.carrier(carrier)?;
        }
        Ok(())
    }

    /// Descend into a node that may be referenced from several places.
    ///
    /// Identity is checked before locking, so a cycle back to a node that is
    /// currently locked higher up the walk is skipped rather than deadlocking.
    pub fn shared<C: FileCarrier>(&mut self, node: &Arc<Mutex<C>>) -> Result<()> {
        let id = (Arc::as_ptr(node).cast::<()>() as usize, std::any::type_name::<C>());
        if !self.visited.insert(id) {
            return Ok(());
        }
        let mut guard = node
            .lock()
            .map_err(|_| Error::Other("file carrier lock poisoned".to_string()))?;
        guard.visit_files(self)
    }

    /// File-valued entries of a parameter map.
    pub fn params<'p>(&mut self, params: impl IntoIterator<Item = &'p mut Param>) -> Result<()> {
        for param in params {
            if let Param::File(file) = param {
                self.file(file)?;
            }
        }
        Ok(())
    }
}

/// Something that holds files which must survive a trip between daemons.
pub trait FileCarrier {
    fn visit_files(&mut self, walk: &mut FileWalk<'_>) -> Result<()>;

    /// Issue tokens for every file that does not have one yet.
    ///
    /// Returns how many files were translated. Running it again is a no-op.
    fn translate_on_sender(&mut self, translator: &dyn SenderTranslator) -> Result<usize>
    where
        Self: Sized,
    {
        let mut calls = 0;
        let mut action = |file: &mut FileRef| -> Result<()> {
            if file.token.is_some() {
                return Ok(());
            }
            let Some(path) = file.path.as_deref() else {
                return Ok(());
            };
            file.token = Some(translator.translate_before_transfer(path)?);
            calls += 1;
            Ok(())
        };
        FileWalk::new(&mut action).carrier(self)?;
        Ok(calls)
    }

    /// Resolve every received token into a path on this daemon.
    ///
    /// Any resolved path listed in `must_exist` has to be present on disk.
    /// Returns how many files were resolved. Running it again is a no-op.
    fn translate_on_receiver(
        &mut self,
        translator: &dyn ReceiverTranslator,
        must_exist: Option<&HashSet<PathBuf>>,
    ) -> Result<usize>
    where
        Self: Sized,
    {
        let mut calls = 0;
        let mut action = |file: &mut FileRef| -> Result<()> {
            if file.resolved {
                return Ok(());
            }
            let Some(token) = &file.token else {
                return Ok(());
            };
            let path = translator.resolve(token)?;
            if must_exist.is_some_and(|set| set.contains(&path)) && !path.exists() {
                return Err(Error::MissingFile(path));
            }
            file.path = Some(path);
            file.resolved = true;
            calls += 1;
            Ok(())
        };
        FileWalk::new(&mut action).carrier(self)?;
        Ok(calls)
    }

    /// Send and receive within this process, as if crossing a daemon boundary.
    fn simulate_transfer(&mut self) -> Result<usize>
    where
        Self: Sized,
    {
        let factory = FileTokenFactory::loopback();
        let sent = self.translate_on_sender(&factory)?;
        let received = self.translate_on_receiver(&factory, None)?;
        Ok(sent + received)
    }
}

impl FileCarrier for FileRef {
    fn visit_files(&mut self, walk: &mut FileWalk<'_>) -> Result<()> {
        walk.file(self)
    }
}

impl FileCarrier for BTreeMap<String, Param> {
    fn visit_files(&mut self, walk: &mut FileWalk<'_>) -> Result<()> {
        walk.params(self.values_mut())
    }
}

impl<C: FileCarrier> FileCarrier for Vec<C> {
    fn visit_files(&mut self, walk: &mut FileWalk<'_>) -> Result<()> {
        walk.carriers(self.iter_mut())
    }
}
