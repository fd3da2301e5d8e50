//! instancectl - lifecycle supervisor for named application-server instances
//!
//! Each instance is a server base directory under `paths.instances` plus an
//! entry in the configuration. The supervisor decides what state an instance
//! is in, which transitions are legal, and records running workers in a small
//! YAML state file that is always checked against the live process table.
//!
//! # Modules
//!
//! - [`config`] - Configuration types, resolution and loading
//! - [`properties`] - Launch property composition
//! - [`identity`] - Deciding whether a pid is really a server worker
//! - [`state`] - Runtime state file
//! - [`supervisor`] - Lifecycle operations
//! - [`provision`] - Building new instance directories
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod lock;
pub mod process;
pub mod properties;
pub mod provision;
pub mod state;
pub mod supervisor;

// Re-export commonly used types
pub use config::{Config, InstanceConfig, PathsConfig, RuntimeConfig};
pub use error::{Error, Result};
pub use identity::{IdentityVerifier, ProcessSignature, Verification};
pub use lock::OperationLock;
pub use process::{LaunchCommand, ProcessInfo, ProcessOps, SignalOutcome, SystemProcesses};
pub use properties::{ComposeForm, LaunchProperties, PropertyMap};
pub use state::{RuntimeRecord, StateStore};
pub use supervisor::{
    AddOutcome, InstanceState, InstanceStatus, RemoveOutcome, StartOutcome, StopOutcome, Supervisor,
};
