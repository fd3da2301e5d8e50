//! Runtime state store
//!
//! Persists which pid is believed to run each instance. The file lives in
//! the configured run directory, is created on first save, and is rejected
//! outright when it does not match the expected layout.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};

/// Persisted runtime facts about one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeRecord {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl RuntimeRecord {
    pub fn new(name: impl Into<String>, pid: u32) -> Self {
        Self {
            name: name.into(),
            pid: Some(pid),
        }
    }
}

/// On-disk layout of the state file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StateFile {
    instances: Vec<RuntimeRecord>,
}

impl StateFile {
    fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = HashSet::new();
        for record in &self.instances {
            if record.name.is_empty() {
                return Err("record with empty name".to_string());
            }
            if record.pid == Some(0) {
                return Err(format!("record '{}' has pid 0", record.name));
            }
            if !seen.insert(record.name.as_str()) {
                return Err(format!("record '{}' appears more than once", record.name));
            }
        }
        Ok(())
    }
}

/// In-memory view of the state file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateStore {
    records: Vec<RuntimeRecord>,
}

impl StateStore {
    /// Load the state file from `config.paths.run`; absent means empty
    pub fn load(config: &Config) -> Result<Self> {
        Self::load_from(&config.paths.state_file())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "StateStore::load_from: called");
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("StateStore::load_from: no state file, starting empty");
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::io(path, e)),
        };

        let corrupt = |reason: String| Error::CorruptState {
            path: path.to_path_buf(),
            reason,
        };

        let file: StateFile = serde_yaml::from_str(&content).map_err(|e| corrupt(e.to_string()))?;
        file.validate().map_err(corrupt)?;

        debug!(records = file.instances.len(), "StateStore::load_from: loaded");
        Ok(Self {
            records: file.instances,
        })
    }

    /// Write the store to `config.paths.run`, creating the directory
    pub fn save(&self, config: &Config) -> Result<()> {
        self.save_to(&config.paths.state_file())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        debug!(path = %path.display(), records = self.records.len(), "StateStore::save_to: called");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let file = StateFile {
            instances: self.records.clone(),
        };
        let content = serde_yaml::to_string(&file).map_err(|e| Error::CorruptState {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::write(path, content).map_err(|e| Error::io(path, e))?;

        info!(path = %path.display(), "Saved instance state");
        Ok(())
    }

    pub fn record_for(&self, name: &str) -> Option<&RuntimeRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    /// Insert `record`, replacing the existing record of the same name in place
    pub fn upsert(&mut self, record: RuntimeRecord) {
        match self.records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    /// Drop the record for `name`; returns whether one existed
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.name != name);
        before != self.records.len()
    }

    pub fn records(&self) -> &[RuntimeRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
