//! Process identity verification
//!
//! Pids get reused. A recorded pid only counts as a running instance when the
//! process behind it still looks like a standalone server worker.

use serde::Serialize;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::process::{ProcessInfo, ProcessOps};

/// Outcome of verifying a pid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verification {
    /// No process with this pid
    NotFound,
    /// A process exists but it is not a server worker
    WrongIdentity,
    /// The pid belongs to a server worker
    Confirmed,
}

impl Verification {
    pub fn is_confirmed(self) -> bool {
        self == Self::Confirmed
    }
}

/// Expected executable name and leading argument of a server worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSignature {
    pub binary: String,
    pub marker: String,
}

impl ProcessSignature {
    pub fn new(binary: impl Into<String>, marker: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            marker: marker.into(),
        }
    }

    pub fn from_config(runtime: &RuntimeConfig) -> Self {
        Self::new(runtime.binary.clone(), runtime.marker.clone())
    }

    /// Executable name equals the binary and the first argument after the
    /// executable equals the marker
    pub fn matches(&self, info: &ProcessInfo) -> bool {
        info.name == self.binary && info.cmd.get(1).is_some_and(|arg| *arg == self.marker)
    }
}

/// Verifies pids against a [`ProcessSignature`]
#[derive(Debug)]
pub struct IdentityVerifier<'a, P: ProcessOps> {
    processes: &'a P,
    signature: ProcessSignature,
}

impl<'a, P: ProcessOps> IdentityVerifier<'a, P> {
    pub fn new(processes: &'a P, signature: ProcessSignature) -> Self {
        Self { processes, signature }
    }

    pub fn verify(&self, pid: u32) -> Verification {
        let result = match self.processes.lookup(pid) {
            None => Verification::NotFound,
            Some(info) if self.signature.matches(&info) => Verification::Confirmed,
            Some(info) => {
                debug!(pid, name = %info.name, "IdentityVerifier::verify: signature mismatch");
                Verification::WrongIdentity
            }
        };
        debug!(pid, ?result, "IdentityVerifier::verify: returning");
        result
    }

    /// First direct child of `pid` that verifies as a server worker
    pub fn confirmed_child(&self, pid: u32) -> Option<u32> {
        let info = self.processes.lookup(pid)?;
        info.children.into_iter().find(|&child| self.verify(child).is_confirmed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::process::{LaunchCommand, SignalOutcome};
    use std::collections::HashMap;

    struct Table(HashMap<u32, ProcessInfo>);

    impl ProcessOps for Table {
        fn lookup(&self, pid: u32) -> Option<ProcessInfo> {
            self.0.get(&pid).cloned()
        }

        fn run(&self, _command: &LaunchCommand) -> Result<i32> {
            unimplemented!()
        }

        fn spawn_detached(&self, _command: &LaunchCommand) -> Result<u32> {
            unimplemented!()
        }

        fn terminate(&self, _pid: u32) -> Result<SignalOutcome> {
            unimplemented!()
        }

        fn kill(&self, _pid: u32) -> Result<SignalOutcome> {
            unimplemented!()
        }

        fn kill_group(&self, _pid: u32) -> Result<SignalOutcome> {
            unimplemented!()
        }
    }

    fn info(pid: u32, name: &str, cmd: &[&str], children: &[u32]) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: name.to_string(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            children: children.to_vec(),
        }
    }

    fn table() -> Table {
        Table(HashMap::from([
            (10, info(10, "standalone.sh", &["/bin/sh", "standalone.sh"], &[11, 12])),
            (11, info(11, "sleep", &["sleep", "1"], &[])),
            (12, info(12, "java", &["java", "-D[Standalone]", "-server"], &[])),
            (20, info(20, "java", &["java", "-jar", "other.jar"], &[])),
            (30, info(30, "python3", &["python3", "-D[Standalone]"], &[])),
        ]))
    }

    fn verifier(table: &Table) -> IdentityVerifier<'_, Table> {
        IdentityVerifier::new(table, ProcessSignature::from_config(&RuntimeConfig::default()))
    }

    #[test]
    fn test_confirmed() {
        let table = table();
        assert_eq!(verifier(&table).verify(12), Verification::Confirmed);
    }

    #[test]
    fn test_not_found() {
        let table = table();
        assert_eq!(verifier(&table).verify(99), Verification::NotFound);
    }

    #[test]
    fn test_wrong_marker() {
        let table = table();
        assert_eq!(verifier(&table).verify(20), Verification::WrongIdentity);
    }

    #[test]
    fn test_wrong_executable() {
        let table = table();
        assert_eq!(verifier(&table).verify(30), Verification::WrongIdentity);
    }

    #[test]
    fn test_empty_argument_vector_is_wrong_identity() {
        let table = Table(HashMap::from([(40, info(40, "java", &[], &[]))]));
        assert_eq!(verifier(&table).verify(40), Verification::WrongIdentity);
    }

    #[test]
    fn test_confirmed_child_skips_unrelated_children() {
        let table = table();
        assert_eq!(verifier(&table).confirmed_child(10), Some(12));
        assert_eq!(verifier(&table).confirmed_child(20), None);
        assert_eq!(verifier(&table).confirmed_child(99), None);
    }
}
