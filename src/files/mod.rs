//! Portable file references.
//!
//! Work packets name files by [`FileRef`]. Before a packet leaves a daemon
//! every reference gets a [`FileToken`]; after it arrives the token is
//! resolved back into a path that makes sense on the receiving daemon.

mod carrier;
mod token;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use carrier::{FileCarrier, FileWalk, Param};
pub use token::{
    DaemonInfo, FileDownloader, FileToken, FileTokenFactory, LOCAL_PREFIX, ReceiverTranslator,
    SHARED_PREFIX, SenderTranslator,
};

use crate::error::{Error, Result};

/// A file named by a work packet.
///
/// Only the token goes over the wire. The path is local to whichever daemon
/// currently holds the packet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRef {
    #[serde(skip)]
    path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<FileToken>,
    #[serde(skip)]
    resolved: bool,
}

impl FileRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            token: None,
            resolved: false,
        }
    }

    /// A reference that arrived as a token and still needs resolving.
    pub fn from_token(token: FileToken) -> Self {
        Self {
            path: None,
            token: Some(token),
            resolved: false,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The local path, or an error if this reference was never resolved.
    pub fn require_path(&self) -> Result<&Path> {
        self.path.as_deref().ok_or_else(|| {
            Error::InvalidToken(match &self.token {
                Some(token) => format!("file token {token} was not resolved on this daemon"),
                None => "empty file reference".to_string(),
            })
        })
    }

    pub fn token(&self) -> Option<&FileToken> {
        self.token.as_ref()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// File name component, which survives translation unchanged.
    pub fn file_name(&self) -> Option<String> {
        if let Some(path) = &self.path {
            return path.file_name().map(|n| n.to_string_lossy().into_owned());
        }
        self.token
            .as_ref()
            .and_then(|t| t.token_path.rsplit('/').next())
            .filter(|n| !n.is_empty())
            .map(str::to_string)
    }
}

impl PartialEq for FileRef {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.token == other.token
    }
}

impl From<PathBuf> for FileRef {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl From<&Path> for FileRef {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}
