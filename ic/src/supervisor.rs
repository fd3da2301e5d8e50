//! Instance lifecycle supervisor
//!
//! Reconciles the configuration (which instances should exist) with the
//! runtime state file (which pids are believed to be running) and the real
//! process table. Every decision about whether an instance is running goes
//! through [`IdentityVerifier`], so a stale or recycled pid is never reported
//! as a live instance. Stale records are cleaned up as a side effect of
//! `start`, `stop`, `kill` and `status`.
//!
//! ```text
//!            add                start
//! Unmanaged ─────▶ Stopped ───────────▶ Running
//!     ▲               ▲  │                │
//!     └───────────────┘  └───── stop/kill ◀┘
//!          remove
//! ```

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{Config, MAX_STOP_TIMEOUT_SECS, validate_instance_name};
use crate::error::{Error, Result};
use crate::identity::{IdentityVerifier, ProcessSignature, Verification};
use crate::lock::OperationLock;
use crate::process::{LaunchCommand, ProcessOps, SignalOutcome};
use crate::properties::LaunchProperties;
use crate::provision;
use crate::state::{RuntimeRecord, StateStore};

/// Environment variable the launch script reads JVM options from
pub const JAVA_OPTS_ENV: &str = "JAVA_OPTS";

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Unmanaged,
    Stopped,
    Running,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unmanaged => write!(f, "unmanaged"),
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// One row of `status`/`list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Result of `start`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Already running; nothing was spawned
    AlreadyRunning { pid: u32 },
    /// Worker detached and recorded
    Started { pid: u32 },
    /// Foreground run finished
    Exited { code: i32 },
}

/// Result of `stop` and `kill`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running; `stale` tells whether a leftover record was cleared
    NotRunning { stale: bool },
    /// The worker is gone; `forced` when SIGKILL was delivered
    Stopped { pid: u32, forced: bool },
}

/// Result of `remove`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub directory: PathBuf,
}

/// Result of `add`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    pub directory: PathBuf,
    /// Whether the directory was provisioned by this call
    pub provisioned: bool,
    /// Whether the configuration entry was created by this call
    pub configured: bool,
}

/// Observed runtime condition of an existing instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observed {
    Running { pid: u32 },
    Stopped { stale: bool },
}

/// Drives instance lifecycle transitions
pub struct Supervisor<P: ProcessOps> {
    config: Config,
    config_path: PathBuf,
    processes: P,
}

impl<P: ProcessOps> Supervisor<P> {
    pub fn new(config: Config, config_path: impl Into<PathBuf>, processes: P) -> Self {
        Self {
            config,
            config_path: config_path.into(),
            processes,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    fn verifier(&self) -> IdentityVerifier<'_, P> {
        IdentityVerifier::new(&self.processes, ProcessSignature::from_config(&self.config.runtime))
    }

    fn lock(&self) -> Result<OperationLock> {
        OperationLock::acquire(&self.config.paths.lock_file())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.runtime.poll_interval_ms)
    }

    /// An instance exists only when both its config entry and its directory do
    pub fn exists(&self, name: &str) -> bool {
        self.config.has_instance(name) && self.config.paths.instance_dir(name).is_dir()
    }

    fn ensure_exists(&self, name: &str) -> Result<()> {
        if self.exists(name) {
            Ok(())
        } else {
            debug!(%name, "Supervisor::ensure_exists: instance not found");
            Err(Error::NotFound { name: name.to_string() })
        }
    }

    fn observe(&self, store: &StateStore, name: &str) -> Observed {
        let Some(record) = store.record_for(name) else {
            return Observed::Stopped { stale: false };
        };

        match record.pid.map(|pid| (pid, self.verifier().verify(pid))) {
            Some((pid, Verification::Confirmed)) => Observed::Running { pid },
            Some((pid, verification)) => {
                warn!(%name, pid, ?verification, "Recorded pid is not a running instance");
                Observed::Stopped { stale: true }
            }
            None => Observed::Stopped { stale: true },
        }
    }

    /// Current state without reconciling anything
    pub fn state(&self, name: &str) -> Result<InstanceState> {
        if !self.exists(name) {
            return Ok(InstanceState::Unmanaged);
        }
        let store = StateStore::load(&self.config)?;
        Ok(match self.observe(&store, name) {
            Observed::Running { .. } => InstanceState::Running,
            Observed::Stopped { .. } => InstanceState::Stopped,
        })
    }

    /// Provision the instance directory and append the config entry
    ///
    /// Whichever half already exists is left alone; only when both exist is
    /// the instance considered present.
    pub fn add(&mut self, name: &str) -> Result<AddOutcome> {
        debug!(%name, "Supervisor::add: called");
        validate_instance_name(name).map_err(|reason| Error::InvalidName {
            name: name.to_string(),
            reason,
        })?;
        let _lock = self.lock()?;

        if self.exists(name) {
            return Err(Error::AlreadyExists { name: name.to_string() });
        }

        let directory = self.config.paths.instance_dir(name);
        let provisioned = !directory.is_dir();
        if provisioned {
            let fresh = !directory.exists();
            let copied = provision::provision(
                &self.config.provisioning_source(),
                &directory,
                &self.config.provisioning.include,
            );
            if let Err(e) = copied {
                // A partial copy must not pass for a provisioned instance
                if fresh && directory.exists() {
                    warn!(%name, directory = %directory.display(), "Removing partially provisioned directory");
                    if let Err(cleanup) = fs::remove_dir_all(&directory) {
                        warn!(%name, error = %cleanup, "Failed to remove partially provisioned directory");
                    }
                }
                return Err(e);
            }
        }

        let configured = self.config.add_instance(name);
        if configured {
            self.config.save(&self.config_path)?;
        }

        info!(%name, provisioned, configured, "Instance added");
        Ok(AddOutcome {
            directory,
            provisioned,
            configured,
        })
    }

    /// Delete the instance directory and config entry; refuses while running
    pub fn remove(&mut self, name: &str) -> Result<RemoveOutcome> {
        debug!(%name, "Supervisor::remove: called");
        let _lock = self.lock()?;
        self.ensure_exists(name)?;

        let mut store = StateStore::load(&self.config)?;
        if let Observed::Running { pid } = self.observe(&store, name) {
            return Err(Error::StillRunning {
                name: name.to_string(),
                pid,
            });
        }

        let directory = self.config.paths.instance_dir(name);
        fs::remove_dir_all(&directory).map_err(|e| Error::io(&directory, e))?;

        self.config.remove_instance(name);
        self.config.save(&self.config_path)?;

        if store.remove(name) {
            store.save(&self.config)?;
        }

        info!(%name, "Instance removed");
        Ok(RemoveOutcome { directory })
    }

    /// Command that boots `name`
    pub fn launch_command(&self, name: &str) -> LaunchCommand {
        let launch = LaunchProperties::compose(&self.config, name);
        let mut command = LaunchCommand::new(self.config.paths.standalone_script())
            .args(launch.property_args())
            .current_dir(self.config.paths.instance_dir(name));
        if let Some(opts) = launch.java_opts() {
            command = command.env(JAVA_OPTS_ENV, opts);
        }
        command
    }

    /// Start `name`; a running instance is left alone
    pub fn start(&self, name: &str, background: bool) -> Result<StartOutcome> {
        debug!(%name, background, "Supervisor::start: called");
        let lock = self.lock()?;
        self.start_locked(lock, name, background)
    }

    fn start_locked(&self, lock: OperationLock, name: &str, background: bool) -> Result<StartOutcome> {
        self.ensure_exists(name)?;

        let mut store = StateStore::load(&self.config)?;
        match self.observe(&store, name) {
            Observed::Running { pid } => {
                info!(%name, pid, "Instance already running");
                return Ok(StartOutcome::AlreadyRunning { pid });
            }
            Observed::Stopped { stale: true } => {
                store.remove(name);
                store.save(&self.config)?;
            }
            Observed::Stopped { stale: false } => {}
        }

        let command = self.launch_command(name);
        info!(%name, command = %command.display(), "Starting instance");

        if !background {
            // A foreground server runs until it exits; other invocations
            // must be able to stop it meanwhile.
            drop(lock);
            let code = self.processes.run(&command)?;
            info!(%name, code, "Foreground instance exited");
            return Ok(StartOutcome::Exited { code });
        }

        let wrapper = self.processes.spawn_detached(&command)?;

        let pid = match self.await_worker(wrapper) {
            Some(pid) => pid,
            None => {
                self.abandon_launch(wrapper);
                return Err(Error::SpawnFailure {
                    command: command.display(),
                    reason: format!("no server worker appeared under launcher pid {}", wrapper),
                });
            }
        };

        // The poll above blocked; work from a fresh copy of the file
        let mut store = StateStore::load(&self.config)?;
        store.upsert(RuntimeRecord::new(name, pid));
        store.save(&self.config)?;

        info!(%name, pid, wrapper, "Instance started");
        Ok(StartOutcome::Started { pid })
    }

    /// Poll the launch script until its server worker child shows up
    fn await_worker(&self, wrapper: u32) -> Option<u32> {
        debug!(wrapper, "Supervisor::await_worker: called");
        let verifier = self.verifier();
        for attempt in 0..self.config.runtime.spawn_attempts {
            if let Some(pid) = verifier.confirmed_child(wrapper) {
                debug!(wrapper, pid, attempt, "Supervisor::await_worker: worker found");
                return Some(pid);
            }
            if self.processes.lookup(wrapper).is_none() {
                warn!(wrapper, "Launch script exited before its worker appeared");
                return None;
            }
            thread::sleep(self.poll_interval());
        }
        warn!(wrapper, attempts = self.config.runtime.spawn_attempts, "Timed out waiting for worker");
        None
    }

    /// Kill a launch script that is still around after its worker never showed up.
    /// It leads its own session, so the group kill also takes anything it started.
    fn abandon_launch(&self, wrapper: u32) {
        if self.processes.lookup(wrapper).is_none() {
            return;
        }
        warn!(wrapper, "Killing launch script process group");
        match self.processes.kill_group(wrapper) {
            Ok(outcome) => debug!(wrapper, ?outcome, "Supervisor::abandon_launch: group signalled"),
            Err(e) => warn!(wrapper, error = %e, "Failed to kill launch script process group"),
        }
    }

    /// Gracefully stop `name`, escalating to SIGKILL after the timeout
    pub fn stop(&self, name: &str) -> Result<StopOutcome> {
        debug!(%name, "Supervisor::stop: called");
        let _lock = self.lock()?;
        self.stop_locked(name, true)
    }

    /// Forcefully stop `name` without a graceful phase
    pub fn kill(&self, name: &str) -> Result<StopOutcome> {
        debug!(%name, "Supervisor::kill: called");
        let _lock = self.lock()?;
        self.stop_locked(name, false)
    }

    fn stop_locked(&self, name: &str, graceful: bool) -> Result<StopOutcome> {
        self.ensure_exists(name)?;

        let store = StateStore::load(&self.config)?;
        let outcome = match self.observe(&store, name) {
            Observed::Stopped { stale } => {
                info!(%name, stale, "Instance is not running");
                StopOutcome::NotRunning { stale }
            }
            Observed::Running { pid } => {
                let forced = if graceful {
                    self.terminate_gracefully(pid)?
                } else {
                    info!(%name, pid, "Killing instance");
                    self.processes.kill(pid)? == SignalOutcome::Delivered
                };
                info!(%name, pid, forced, "Instance stopped");
                StopOutcome::Stopped { pid, forced }
            }
        };

        let mut store = StateStore::load(&self.config)?;
        if store.remove(name) {
            store.save(&self.config)?;
        }
        Ok(outcome)
    }

    /// SIGTERM, wait for the worker to go away, SIGKILL once on timeout.
    /// Returns whether SIGKILL was delivered.
    fn terminate_gracefully(&self, pid: u32) -> Result<bool> {
        info!(pid, "Sending SIGTERM");
        if self.processes.terminate(pid)? == SignalOutcome::NoSuchProcess {
            return Ok(false);
        }

        let verifier = self.verifier();
        let timeout = self.config.runtime.stop_timeout_secs.min(MAX_STOP_TIMEOUT_SECS);
        let deadline = Instant::now() + Duration::from_secs(timeout);
        while Instant::now() < deadline {
            if !verifier.verify(pid).is_confirmed() {
                debug!(pid, "Supervisor::terminate_gracefully: exited after SIGTERM");
                return Ok(false);
            }
            thread::sleep(self.poll_interval());
        }

        if !verifier.verify(pid).is_confirmed() {
            return Ok(false);
        }

        warn!(
            pid,
            timeout_secs = self.config.runtime.stop_timeout_secs,
            "Instance did not stop gracefully, sending SIGKILL"
        );
        Ok(self.processes.kill(pid)? == SignalOutcome::Delivered)
    }

    /// Stop then start in the background under one lock
    pub fn restart(&self, name: &str) -> Result<(StopOutcome, StartOutcome)> {
        debug!(%name, "Supervisor::restart: called");
        let lock = self.lock()?;
        let stopped = self.stop_locked(name, true)?;
        let started = self.start_locked(lock, name, true)?;
        Ok((stopped, started))
    }

    /// Report the state of `name`, clearing a stale record if there is one
    pub fn status(&self, name: &str) -> Result<InstanceStatus> {
        debug!(%name, "Supervisor::status: called");
        let _lock = self.lock()?;
        self.ensure_exists(name)?;

        let mut store = StateStore::load(&self.config)?;
        let (state, pid) = match self.observe(&store, name) {
            Observed::Running { pid } => (InstanceState::Running, Some(pid)),
            Observed::Stopped { stale } => {
                if stale {
                    info!(%name, "Clearing stale runtime record");
                    store.remove(name);
                    store.save(&self.config)?;
                }
                (InstanceState::Stopped, None)
            }
        };

        Ok(InstanceStatus {
            name: name.to_string(),
            state,
            pid,
        })
    }

    /// Every configured instance with its observed state
    pub fn list(&self) -> Result<Vec<InstanceStatus>> {
        debug!("Supervisor::list: called");
        let store = StateStore::load(&self.config)?;
        let entries = self
            .config
            .instances
            .iter()
            .map(|instance| {
                let (state, pid) = match self.observe(&store, &instance.name) {
                    Observed::Running { pid } => (InstanceState::Running, Some(pid)),
                    Observed::Stopped { .. } => (InstanceState::Stopped, None),
                };
                InstanceStatus {
                    name: instance.name.clone(),
                    state,
                    pid,
                }
            })
            .collect();
        Ok(entries)
    }

    /// Run the management CLI against `name`
    ///
    /// The inline command runs before the command file; with neither an
    /// interactive session is started. Returns one exit code per invocation.
    pub fn cli(&self, name: &str, command: Option<&str>, file: Option<&Path>) -> Result<Vec<i32>> {
        debug!(%name, ?command, ?file, "Supervisor::cli: called");
        self.ensure_exists(name)?;

        let launch = LaunchProperties::compose(&self.config, name);
        let properties_path = self.config.paths.cli_properties_file(name);
        if let Some(parent) = properties_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        fs::write(&properties_path, launch.properties_file()).map_err(|e| Error::io(&properties_path, e))?;

        let base = LaunchCommand::new(self.config.paths.cli_script())
            .arg("--connect")
            .arg(format!("--properties={}", properties_path.display()))
            .current_dir(self.config.paths.instance_dir(name));

        let mut invocations = Vec::new();
        if let Some(command) = command {
            invocations.push(base.clone().arg(format!("--command={}", command)));
        }
        if let Some(file) = file {
            invocations.push(base.clone().arg(format!("--file={}", file.display())));
        }
        if invocations.is_empty() {
            info!(%name, "Starting interactive management session");
            invocations.push(base);
        }

        let mut codes = Vec::with_capacity(invocations.len());
        for invocation in &invocations {
            let code = self.processes.run(invocation)?;
            debug!(code, command = %invocation.display(), "Supervisor::cli: invocation finished");
            codes.push(code);
        }
        Ok(codes)
    }
}
