//! Error taxonomy for instance lifecycle operations

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the supervisor and its collaborators
#[derive(Debug, Error)]
pub enum Error {
    #[error("Instance '{name}' does not exist")]
    NotFound { name: String },

    #[error("Instance '{name}' already exists")]
    AlreadyExists { name: String },

    #[error("Instance '{name}' is still running (PID: {pid}); stop it first")]
    StillRunning { name: String, pid: u32 },

    #[error("Invalid instance name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Another invocation holds the lock {path}")]
    Locked { path: PathBuf },

    #[error("Corrupt state file {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("Corrupt config file {path}: {reason}")]
    CorruptConfig { path: PathBuf, reason: String },

    #[error("Failed to signal process {pid}: {reason}")]
    ProcessLookupFailure { pid: u32, reason: String },

    #[error("Failed to launch {command}: {reason}")]
    SpawnFailure { command: String, reason: String },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Precondition failures are reported to the operator, not treated as crashes
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::AlreadyExists { .. }
                | Self::StillRunning { .. }
                | Self::InvalidName { .. }
                | Self::Locked { .. }
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_classification() {
        assert!(Error::NotFound { name: "web1".into() }.is_precondition());
        assert!(Error::AlreadyExists { name: "web1".into() }.is_precondition());
        assert!(
            Error::StillRunning {
                name: "web1".into(),
                pid: 7
            }
            .is_precondition()
        );
        assert!(
            !Error::CorruptState {
                path: PathBuf::from("/run/x.yaml"),
                reason: "bad".into()
            }
            .is_precondition()
        );
    }

    #[test]
    fn test_still_running_message() {
        let err = Error::StillRunning {
            name: "web1".into(),
            pid: 4242,
        };

        let msg = err.to_string();
        assert!(msg.contains("web1"));
        assert!(msg.contains("4242"));
    }

    #[test]
    fn test_corrupt_state_message_names_path() {
        let err = Error::CorruptState {
            path: PathBuf::from("/var/run/jboss/instance-states.yaml"),
            reason: "unknown field `port`".into(),
        };

        let msg = err.to_string();
        assert!(msg.contains("instance-states.yaml"));
        assert!(msg.contains("port"));
    }
}
