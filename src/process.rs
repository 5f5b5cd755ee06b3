//! OS process inspection used by the stuck-scan monitor to find and stop
//! orphaned scanner processes.

use std::ffi::OsStr;

use async_trait::async_trait;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, Signal, System, UpdateKind};
use tracing::debug;

use crate::error::ProcessError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command_line: String,
}

/// Selects processes by executable name and a substring of the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFilter {
    pub program: String,
    pub needle: String,
}

impl ProcessFilter {
    pub fn new(program: impl Into<String>, needle: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            needle: needle.into(),
        }
    }

    pub fn matches(&self, name: &str, command_line: &str) -> bool {
        let program_ok = self.program.is_empty()
            || name.contains(&self.program)
            || command_line
                .split_whitespace()
                .next()
                .is_some_and(|argv0| argv0.ends_with(&self.program));
        program_ok && command_line.contains(&self.needle)
    }
}

#[async_trait]
pub trait ProcessInspector: Send + Sync {
    async fn list_processes(&self, filter: &ProcessFilter) -> Result<Vec<ProcessInfo>, ProcessError>;

    /// `forceful = false` asks the process to exit; `true` kills it outright.
    async fn terminate(&self, pid: u32, forceful: bool) -> Result<(), ProcessError>;
}

/// Live process table via `sysinfo`. SIGTERM for graceful, SIGKILL for forced.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessInspector;

fn command_line(cmd: &[std::ffi::OsString]) -> String {
    cmd.iter()
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

fn refreshed(pid: Option<Pid>) -> System {
    let mut sys = System::new();
    let one = pid.map(|p| [p]);
    let which = match &one {
        Some(pids) => ProcessesToUpdate::Some(pids),
        None => ProcessesToUpdate::All,
    };
    sys.refresh_processes_specifics(
        which,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    sys
}

fn name_of(name: &OsStr) -> String {
    name.to_string_lossy().into_owned()
}

#[async_trait]
impl ProcessInspector for SystemProcessInspector {
    async fn list_processes(&self, filter: &ProcessFilter) -> Result<Vec<ProcessInfo>, ProcessError> {
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || {
            let sys = refreshed(None);
            let mut found: Vec<ProcessInfo> = sys
                .processes()
                .iter()
                .filter_map(|(pid, p)| {
                    let cmd = command_line(p.cmd());
                    filter
                        .matches(&name_of(p.name()), &cmd)
                        .then(|| ProcessInfo {
                            pid: pid.as_u32(),
                            command_line: cmd,
                        })
                })
                .collect();
            found.sort_by_key(|p| p.pid);
            found
        })
        .await
        .map_err(|e| ProcessError::Unavailable(e.to_string()))
    }

    async fn terminate(&self, pid: u32, forceful: bool) -> Result<(), ProcessError> {
        tokio::task::spawn_blocking(move || {
            let sys_pid = Pid::from_u32(pid);
            let sys = refreshed(Some(sys_pid));
            let process = sys.process(sys_pid).ok_or(ProcessError::NotFound(pid))?;
            let sent = if forceful {
                process.kill_with(Signal::Kill).unwrap_or_else(|| process.kill())
            } else {
                process.kill_with(Signal::Term).ok_or_else(|| ProcessError::Signal {
                    pid,
                    reason: "SIGTERM not supported on this platform".into(),
                })?
            };
            debug!(pid, forceful, sent, "signalled process");
            if sent {
                Ok(())
            } else {
                Err(ProcessError::Signal {
                    pid,
                    reason: "signal was not delivered".into(),
                })
            }
        })
        .await
        .map_err(|e| ProcessError::Unavailable(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_needs_program_and_needle() {
        let f = ProcessFilter::new("nmap", "scan_4_");
        assert!(f.matches("nmap", "nmap -sV -oX out/scan_4_10_0_0_2.xml 10.0.0.2"));
        assert!(f.matches("", "/usr/bin/nmap -oX scan_4_discovery.xml 10.0.0.0/24"));
        assert!(!f.matches("nmap", "nmap -oX scan_42_discovery.xml 10.0.0.0/24"));
        assert!(!f.matches("vim", "vim scan_4_notes.txt"));
    }

    #[tokio::test]
    async fn missing_pid_is_not_found() {
        let err = SystemProcessInspector
            .terminate(u32::MAX - 1, false)
            .await
            .unwrap_err();
        assert_eq!(err, ProcessError::NotFound(u32::MAX - 1));
    }
}
