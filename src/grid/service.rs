//! Grid service configuration and registry.
//!
//! Each `.toml` file in a services directory describes one program that is
//! submitted to the grid, and how.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::GridJob;
use crate::error::{Error, Result};

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct ServiceConfig {
    service: GridService,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridService {
    pub name: String,
    pub application: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_memory")]
    pub memory_mb: String,
    #[serde(default)]
    pub native_spec: String,
    #[serde(default)]
    pub priority: i32,
    pub working_folder: PathBuf,
    #[serde(default)]
    pub log_folder: Option<PathBuf>,
}

fn default_queue() -> String {
    "all.q".to_string()
}

fn default_memory() -> String {
    "1024".to_string()
}

impl GridService {
    /// A job running this service's application with `args`.
    pub fn job(&self, args: impl IntoIterator<Item = impl Into<String>>) -> GridJob {
        let job = GridJob::new(&self.application)
            .args(args)
            .priority(self.priority)
            .queue(&self.queue)
            .memory_mb(&self.memory_mb)
            .native_spec(&self.native_spec)
            .working_folder(&self.working_folder);
        match &self.log_folder {
            Some(folder) => job.log_folder(folder),
            None => job,
        }
    }
}

/// Registry of loaded grid services, indexed by name.
pub struct GridServiceRegistry {
    services: HashMap<String, GridService>,
}

impl GridServiceRegistry {
    pub fn empty() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Load all `.toml` files from a directory and build the registry.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut services = HashMap::new();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read services dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let config: ServiceConfig = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad service config {}: {e}", path.display()))
                })?;
                services.insert(config.service.name.clone(), config.service);
            }
        }

        Ok(Self { services })
    }

    pub fn get(&self, name: &str) -> Option<&GridService> {
        self.services.get(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
