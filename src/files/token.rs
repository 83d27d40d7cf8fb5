//! File tokens and the factory that issues and resolves them.
//!
//! A token is a path plus the identity of the daemon that issued it. Paths
//! under the issuing daemon's shared space travel as `shared:` tokens and are
//! re-rooted under the receiver's shared space. Everything else travels as a
//! `local:` token, which only means something on the issuing daemon (or on a
//! receiver that can fetch the file through a [`FileDownloader`]).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::fsutil;

pub const SHARED_PREFIX: &str = "shared:";
pub const LOCAL_PREFIX: &str = "local:";

/// Which daemon a factory speaks for, and how its filesystem is laid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub daemon_id: String,
    pub shared_space: Option<PathBuf>,
    pub temp_folder: PathBuf,
}

/// Portable stand-in for a file path. Meaningless until resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileToken {
    /// Daemon that issued the token; `None` for anonymous tokens.
    pub source_daemon: Option<String>,
    /// `shared:<relative path>` or `local:<absolute path>`.
    pub token_path: String,
    pub exists_on_source: bool,
}

impl FileToken {
    /// A token not yet bound to any daemon. The sending daemon re-issues it.
    pub fn anonymous(path: &Path) -> Self {
        Self {
            source_daemon: None,
            token_path: with_prefix(LOCAL_PREFIX, &fsutil::portable_path(path)),
            exists_on_source: path.exists(),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.token_path.starts_with(SHARED_PREFIX)
    }

    /// Opaque one-line form: `<daemon or '-'>|<e|n>|<token path>`.
    pub fn to_wire(&self) -> String {
        format!(
            "{}|{}|{}",
            self.source_daemon.as_deref().unwrap_or("-"),
            if self.exists_on_source { 'e' } else { 'n' },
            self.token_path
        )
    }

    pub fn parse_wire(wire: &str) -> Result<Self> {
        let mut parts = wire.splitn(3, '|');
        let (Some(daemon), Some(exists), Some(token_path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidToken(wire.to_string()));
        };
        let exists_on_source = match exists {
            "e" => true,
            "n" => false,
            _ => return Err(Error::InvalidToken(wire.to_string())),
        };
        if !token_path.starts_with(SHARED_PREFIX) && !token_path.starts_with(LOCAL_PREFIX) {
            return Err(Error::InvalidToken(wire.to_string()));
        }
        Ok(Self {
            source_daemon: (daemon != "-").then(|| daemon.to_string()),
            token_path: token_path.to_string(),
            exists_on_source,
        })
    }
}

impl std::fmt::Display for FileToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Sender side: turn a local path into something another daemon can use.
pub trait SenderTranslator {
    /// Must fail rather than hand out a token the receiver cannot use.
    fn translate_before_transfer(&self, path: &Path) -> Result<FileToken>;
}

/// Receiver side: turn a token back into a path on this daemon.
pub trait ReceiverTranslator {
    fn resolve(&self, token: &FileToken) -> Result<PathBuf>;
}

/// Fetches a file that lives only on the daemon that issued the token.
pub trait FileDownloader: Send + Sync {
    fn download(&self, token: &FileToken, target: &Path) -> Result<PathBuf>;
}

/// Issues and resolves tokens on behalf of one daemon.
#[derive(Clone)]
pub struct FileTokenFactory {
    daemon: DaemonInfo,
    allow_local: bool,
    downloader: Option<Arc<dyn FileDownloader>>,
}

impl std::fmt::Debug for FileTokenFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTokenFactory")
            .field("daemon", &self.daemon)
            .field("allow_local", &self.allow_local)
            .field("downloader", &self.downloader.is_some())
            .finish()
    }
}

impl FileTokenFactory {
    /// Local tokens are allowed by default only for daemons without a shared
    /// space, which are assumed to run everything on one host.
    pub fn new(daemon: DaemonInfo) -> Self {
        let allow_local = daemon.shared_space.is_none();
        Self {
            daemon,
            allow_local,
            downloader: None,
        }
    }

    /// A factory that shares everything with itself. Used to simulate a
    /// transfer within one process.
    pub fn loopback() -> Self {
        Self::new(DaemonInfo {
            daemon_id: "loopback".to_string(),
            shared_space: None,
            temp_folder: std::env::temp_dir(),
        })
    }

    pub fn allow_local_files(mut self, allow: bool) -> Self {
        self.allow_local = allow;
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn FileDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn daemon(&self) -> &DaemonInfo {
        &self.daemon
    }

    /// Re-issue an anonymous token as ours; tokens from other daemons are
    /// passed along untouched.
    pub fn translate_token(&self, token: &FileToken) -> Result<FileToken> {
        if token.source_daemon.is_some() {
            return Ok(token.clone());
        }
        let path = strip_prefix(&token.token_path, LOCAL_PREFIX)?;
        self.translate_before_transfer(Path::new(path))
    }

    fn is_own(&self, token: &FileToken) -> bool {
        token.source_daemon.as_deref() == Some(self.daemon.daemon_id.as_str())
    }

    /// Where a foreign file gets mirrored when we have to fetch it.
    fn mirror_path(&self, token: &FileToken) -> Result<PathBuf> {
        if token.is_shared() {
            let rel = strip_prefix(&token.token_path, SHARED_PREFIX)?;
            Ok(self.daemon.temp_folder.join("__shared__").join(rel.trim_start_matches('/')))
        } else {
            let abs = strip_prefix(&token.token_path, LOCAL_PREFIX)?;
            Ok(self.daemon.temp_folder.join(abs.trim_start_matches('/')))
        }
    }

    fn fetch(&self, token: &FileToken) -> Result<PathBuf> {
        let target = self.mirror_path(token)?;
        if !token.exists_on_source {
            // Nothing to fetch yet, e.g. an output the worker is about to write.
            return Ok(target);
        }
        match &self.downloader {
            Some(downloader) => {
                debug!(token = %token, target = %target.display(), "downloading foreign file");
                downloader.download(token, &target)
            }
            None => Err(Error::Untranslatable {
                path: PathBuf::from(&token.token_path),
                reason: format!(
                    "file is local to daemon {} and daemon {} cannot fetch it",
                    token.source_daemon.as_deref().unwrap_or("?"),
                    self.daemon.daemon_id
                ),
            }),
        }
    }
}

impl SenderTranslator for FileTokenFactory {
    fn translate_before_transfer(&self, path: &Path) -> Result<FileToken> {
        let canonical = fsutil::portable_path(path);
        let exists_on_source = path.exists();

        if let Some(shared) = &self.daemon.shared_space {
            let shared = fsutil::portable_path(shared);
            let rel = canonical.strip_prefix(shared.trim_end_matches('/'));
            if let Some(rel) = rel.filter(|r| r.is_empty() || r.starts_with('/')) {
                return Ok(FileToken {
                    source_daemon: Some(self.daemon.daemon_id.clone()),
                    token_path: with_prefix(SHARED_PREFIX, rel),
                    exists_on_source,
                });
            }
        }

        if !self.allow_local {
            return Err(Error::Untranslatable {
                path: path.to_path_buf(),
                reason: format!(
                    "not under the shared space of daemon {} and local transfer is disabled",
                    self.daemon.daemon_id
                ),
            });
        }

        Ok(FileToken {
            source_daemon: Some(self.daemon.daemon_id.clone()),
            token_path: with_prefix(LOCAL_PREFIX, &canonical),
            exists_on_source,
        })
    }
}

impl ReceiverTranslator for FileTokenFactory {
    fn resolve(&self, token: &FileToken) -> Result<PathBuf> {
        if token.source_daemon.is_none() {
            return Ok(PathBuf::from(strip_prefix(&token.token_path, LOCAL_PREFIX)?));
        }
        if token.is_shared() {
            return match &self.daemon.shared_space {
                Some(shared) => {
                    let rel = strip_prefix(&token.token_path, SHARED_PREFIX)?;
                    Ok(shared.join(rel.trim_start_matches('/')))
                }
                None => self.fetch(token),
            };
        }
        if self.is_own(token) {
            return Ok(PathBuf::from(strip_prefix(&token.token_path, LOCAL_PREFIX)?));
        }
        self.fetch(token)
    }
}

fn with_prefix(prefix: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{prefix}{path}")
    } else {
        format!("{prefix}/{path}")
    }
}

fn strip_prefix<'a>(token_path: &'a str, prefix: &str) -> Result<&'a str> {
    token_path.strip_prefix(prefix).ok_or_else(|| {
        Error::InvalidToken(format!("token '{token_path}' does not start with {prefix}"))
    })
}
