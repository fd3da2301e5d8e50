//! Operating-system process primitives
//!
//! The supervisor never touches the process table directly. Everything it
//! needs (spawn, signal, lookup) goes through [`ProcessOps`], with
//! [`SystemProcesses`] as the real implementation.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Snapshot of one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Executable name as reported by the OS
    pub name: String,
    /// Full argument vector, executable first
    pub cmd: Vec<String>,
    /// Direct children
    pub children: Vec<u32>,
}

/// A command to launch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Human-readable command line for logs and errors
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Result of delivering a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    NoSuchProcess,
}

/// Process primitives consumed by the supervisor
pub trait ProcessOps {
    /// Look up a live process by pid
    fn lookup(&self, pid: u32) -> Option<ProcessInfo>;

    /// Run `command` in the foreground with our streams and return its exit code
    fn run(&self, command: &LaunchCommand) -> Result<i32>;

    /// Launch `command` detached from the terminal and our streams; returns its pid
    fn spawn_detached(&self, command: &LaunchCommand) -> Result<u32>;

    /// Ask the process to exit (SIGTERM)
    fn terminate(&self, pid: u32) -> Result<SignalOutcome>;

    /// Force the process to exit (SIGKILL)
    fn kill(&self, pid: u32) -> Result<SignalOutcome>;

    /// Force every process in the group led by `pid` to exit (SIGKILL)
    fn kill_group(&self, pid: u32) -> Result<SignalOutcome>;
}

impl<P: ProcessOps + ?Sized> ProcessOps for &P {
    fn lookup(&self, pid: u32) -> Option<ProcessInfo> {
        (**self).lookup(pid)
    }

    fn run(&self, command: &LaunchCommand) -> Result<i32> {
        (**self).run(command)
    }

    fn spawn_detached(&self, command: &LaunchCommand) -> Result<u32> {
        (**self).spawn_detached(command)
    }

    fn terminate(&self, pid: u32) -> Result<SignalOutcome> {
        (**self).terminate(pid)
    }

    fn kill(&self, pid: u32) -> Result<SignalOutcome> {
        (**self).kill(pid)
    }

    fn kill_group(&self, pid: u32) -> Result<SignalOutcome> {
        (**self).kill_group(pid)
    }
}

/// [`ProcessOps`] backed by the real process table
#[derive(Debug, Default)]
pub struct SystemProcesses;

impl SystemProcesses {
    pub fn new() -> Self {
        Self
    }

    /// Deliver `signal` to `pid`, or to its whole process group when `group` is set
    #[cfg(unix)]
    fn signal(&self, pid: u32, signal: nix::sys::signal::Signal, group: bool) -> Result<SignalOutcome> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid as NixPid;

        debug!(pid, ?signal, group, "SystemProcesses::signal: called");
        let raw = i32::try_from(pid).map_err(|_| Error::ProcessLookupFailure {
            pid,
            reason: "pid out of range".to_string(),
        })?;
        let target = if group { -raw } else { raw };

        match kill(NixPid::from_raw(target), signal) {
            Ok(()) => Ok(SignalOutcome::Delivered),
            Err(Errno::ESRCH) => {
                debug!(pid, "SystemProcesses::signal: no such process");
                Ok(SignalOutcome::NoSuchProcess)
            }
            Err(e) => Err(Error::ProcessLookupFailure {
                pid,
                reason: e.to_string(),
            }),
        }
    }
}

impl ProcessOps for SystemProcesses {
    fn lookup(&self, pid: u32) -> Option<ProcessInfo> {
        debug!(pid, "SystemProcesses::lookup: called");
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::everything());

        let target = Pid::from_u32(pid);
        // An unreaped child that already exited is gone as far as we care
        let process = system.process(target).filter(|p| p.status() != ProcessStatus::Zombie)?;

        let children = system
            .processes()
            .iter()
            .filter(|(_, p)| p.parent() == Some(target) && p.status() != ProcessStatus::Zombie)
            .map(|(child, _)| child.as_u32())
            .collect();

        let info = ProcessInfo {
            pid,
            name: process.name().to_string_lossy().into_owned(),
            cmd: process.cmd().iter().map(|a| a.to_string_lossy().into_owned()).collect(),
            children,
        };
        debug!(?info, "SystemProcesses::lookup: returning");
        Some(info)
    }

    fn run(&self, command: &LaunchCommand) -> Result<i32> {
        debug!(command = %command.display(), "SystemProcesses::run: called");
        let status = build_command(command).status().map_err(|e| spawn_failure(command, e))?;
        let code = exit_code(status);
        info!(code, "Foreground command exited");
        Ok(code)
    }

    fn spawn_detached(&self, command: &LaunchCommand) -> Result<u32> {
        debug!(command = %command.display(), "SystemProcesses::spawn_detached: called");
        let mut cmd = build_command(command);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: setsid is async-signal-safe and the closure neither
            // allocates nor takes locks.
            unsafe {
                cmd.pre_exec(|| nix::unistd::setsid().map(|_| ()).map_err(std::io::Error::from));
            }
        }

        let child = cmd.spawn().map_err(|e| spawn_failure(command, e))?;
        let pid = child.id();
        info!(pid, "Background command detached");
        Ok(pid)
    }

    fn terminate(&self, pid: u32) -> Result<SignalOutcome> {
        #[cfg(unix)]
        {
            self.signal(pid, nix::sys::signal::Signal::SIGTERM, false)
        }

        #[cfg(not(unix))]
        {
            Err(Error::ProcessLookupFailure {
                pid,
                reason: "signals are only supported on unix".to_string(),
            })
        }
    }

    fn kill(&self, pid: u32) -> Result<SignalOutcome> {
        #[cfg(unix)]
        {
            self.signal(pid, nix::sys::signal::Signal::SIGKILL, false)
        }

        #[cfg(not(unix))]
        {
            Err(Error::ProcessLookupFailure {
                pid,
                reason: "signals are only supported on unix".to_string(),
            })
        }
    }

    fn kill_group(&self, pid: u32) -> Result<SignalOutcome> {
        #[cfg(unix)]
        {
            self.signal(pid, nix::sys::signal::Signal::SIGKILL, true)
        }

        #[cfg(not(unix))]
        {
            Err(Error::ProcessLookupFailure {
                pid,
                reason: "signals are only supported on unix".to_string(),
            })
        }
    }
}

fn build_command(command: &LaunchCommand) -> Command {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args);
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &command.current_dir {
        cmd.current_dir(dir);
    }
    cmd
}

fn spawn_failure(command: &LaunchCommand, e: std::io::Error) -> Error {
    Error::SpawnFailure {
        command: command.display(),
        reason: e.to_string(),
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}
