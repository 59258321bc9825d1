//! Host-side handles to the container's child processes.
//!
//! A container is entered through a stub: a re-exec of the runtime
//! binary that receives a bootstrap message, installs namespaces and id
//! mappings, and finally executes user code. The parent keeps one of
//! two handle shapes for it: [`InitParent`] for the container's pid-1,
//! [`SetnsParent`] for a secondary process joining existing namespaces.
//! A third, reduced shape is created when an init is re-bound after a
//! checkpoint restore.

pub(crate) mod command;
mod init;
mod log_forward;
mod setns;

pub(crate) use command::StubCommand;
pub(crate) use init::InitParent;
pub(crate) use setns::SetnsParent;

use std::os::fd::OwnedFd;
use std::thread::JoinHandle;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::Deserialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::managers::{CgroupManager, IntelRdtManager};
use crate::sys;

/// Stdio descriptors occupy fds 0-2; inherited extras start at 3.
pub(crate) const STDIO_FD_COUNT: i32 = 3;

/// Which flavor of stub is being launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitType {
    /// Creates namespaces and becomes the container's init.
    Standard,
    /// Joins the namespaces of an existing container.
    Setns,
}

impl InitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitType::Standard => "standard",
            InitType::Setns => "setns",
        }
    }
}

/// Pid report the stub sends over the init pipe once the final process
/// exists: the init pid and the intermediate clone to reap.
#[derive(Debug, Deserialize)]
pub(crate) struct PidReport {
    pub pid: i32,
    #[serde(default)]
    pub pid_first: i32,
}

/// Whether bind-mount sources must be opened in the host mount
/// namespace and passed to the stub. Needed when both a new user and a
/// new mount namespace hide the host view; rootless stubs lack the
/// setns capabilities to use them.
pub(crate) fn should_send_mount_sources(config: &Config) -> bool {
    use crate::config::NamespaceType;
    if !config.namespaces.contains(NamespaceType::User)
        || !config.namespaces.contains(NamespaceType::Mount)
    {
        return false;
    }
    if config.rootless_euid {
        return false;
    }
    config.mounts.iter().any(|m| m.is_bind())
}

/// Host-side parent handle for a container process.
pub(crate) enum ParentProcess {
    Init(InitParent),
    Setns(SetnsParent),
    /// An init re-bound after a checkpoint restore; the runtime never
    /// spawned it, so only pid-based operations are available.
    Restored(RestoredParent),
}

impl ParentProcess {
    pub(crate) fn pid(&self) -> Pid {
        match self {
            ParentProcess::Init(p) => p.pid(),
            ParentProcess::Setns(p) => p.pid(),
            ParentProcess::Restored(p) => p.pid,
        }
    }

    pub(crate) fn start_time(&self) -> u64 {
        match self {
            ParentProcess::Init(p) => p.start_time(),
            ParentProcess::Setns(p) => p.start_time(),
            ParentProcess::Restored(p) => p.start_time,
        }
    }

    pub(crate) fn signal(&self, sig: Signal) -> Result<()> {
        signal::kill(self.pid(), sig).map_err(|e| Error::syscall("kill", e))
    }

    pub(crate) fn external_descriptors(&self) -> &[String] {
        match self {
            ParentProcess::Init(p) => p.external_descriptors(),
            ParentProcess::Setns(p) => p.external_descriptors(),
            ParentProcess::Restored(p) => &p.external_descriptors,
        }
    }

    /// Spawn the log forwarder for the stub's log pipe. Returns None
    /// once the pipe has been taken (e.g. for a restored handle).
    pub(crate) fn forward_child_logs(&mut self) -> Option<JoinHandle<Result<()>>> {
        match self {
            ParentProcess::Init(p) => p.take_log_pipe().map(log_forward::forward),
            ParentProcess::Setns(p) => p.take_log_pipe().map(log_forward::forward),
            ParentProcess::Restored(_) => None,
        }
    }

    pub(crate) fn start(
        &mut self,
        cgroup: &dyn CgroupManager,
        intel_rdt: Option<&dyn IntelRdtManager>,
    ) -> Result<()> {
        match self {
            ParentProcess::Init(p) => p.start(cgroup, intel_rdt),
            ParentProcess::Setns(p) => p.start(),
            ParentProcess::Restored(_) => Err(Error::ChildFailure(
                "restored process cannot be started".into(),
            )),
        }
    }

    /// Kill the process and reap it.
    pub(crate) fn terminate(&mut self) -> Result<()> {
        let pid = self.pid();
        signal::kill(pid, Signal::SIGKILL).map_err(|e| Error::syscall("kill", e))?;
        self.wait()?;
        Ok(())
    }

    /// Reap the process, returning its wait status.
    pub(crate) fn wait(&mut self) -> Result<WaitStatus> {
        waitpid(self.pid(), None).map_err(|e| Error::syscall("waitpid", e))
    }
}

/// Handle for an init the checkpoint/restore helper brought back.
pub(crate) struct RestoredParent {
    pub(crate) pid: Pid,
    pub(crate) start_time: u64,
    pub(crate) external_descriptors: Vec<String>,
}

impl RestoredParent {
    pub(crate) fn new(pid: Pid, external_descriptors: Vec<String>) -> Result<Self> {
        let start_time = sys::proc_stat(pid)?.start_time;
        Ok(Self {
            pid,
            start_time,
            external_descriptors,
        })
    }
}

/// Read one datagram from the init pipe and decode the stub's pid
/// report. An early EOF means the stub died during bootstrap.
pub(crate) fn read_pid_report(init_pipe: &OwnedFd) -> Result<PidReport> {
    use std::os::fd::AsRawFd;

    let mut buf = [0u8; 512];
    let n = nix::unistd::read(init_pipe.as_raw_fd(), &mut buf)
        .map_err(|e| Error::syscall("read init pipe", e))?;
    if n == 0 {
        return Err(Error::ChildFailure(
            "init pipe closed before pid report".into(),
        ));
    }
    serde_json::from_slice(&buf[..n])
        .map_err(|e| Error::ChildFailure(format!("malformed pid report: {e}")))
}

/// Ack the pid report so the stub proceeds to its final stage.
pub(crate) fn ack_pid_report(init_pipe: &OwnedFd) -> Result<()> {
    nix::unistd::write(init_pipe, &[0u8])
        .map_err(|e| Error::syscall("write init pipe", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mount, Namespace, Namespaces, NamespaceType};

    fn config_with(user: bool, mnt: bool, rootless: bool, bind: bool) -> Config {
        let mut namespaces = Vec::new();
        if user {
            namespaces.push(Namespace {
                ns_type: NamespaceType::User,
                path: None,
            });
        }
        if mnt {
            namespaces.push(Namespace {
                ns_type: NamespaceType::Mount,
                path: None,
            });
        }
        let mounts = if bind {
            vec![Mount {
                device: "bind".into(),
                source: "/src".into(),
                destination: "/dst".into(),
                flags: libc::MS_BIND as u64,
                data: String::new(),
            }]
        } else {
            Vec::new()
        };
        Config {
            namespaces: Namespaces(namespaces),
            rootless_euid: rootless,
            mounts,
            ..Default::default()
        }
    }

    #[test]
    fn test_should_send_mount_sources() {
        assert!(should_send_mount_sources(&config_with(true, true, false, true)));
        // Any missing precondition disables the transfer.
        assert!(!should_send_mount_sources(&config_with(false, true, false, true)));
        assert!(!should_send_mount_sources(&config_with(true, false, false, true)));
        assert!(!should_send_mount_sources(&config_with(true, true, true, true)));
        assert!(!should_send_mount_sources(&config_with(true, true, false, false)));
    }

    #[test]
    fn test_pid_report_decoding() {
        let report: PidReport = serde_json::from_str(r#"{"pid": 42, "pid_first": 41}"#).unwrap();
        assert_eq!(report.pid, 42);
        assert_eq!(report.pid_first, 41);

        // The intermediate pid is optional for single-stage stubs.
        let report: PidReport = serde_json::from_str(r#"{"pid": 7}"#).unwrap();
        assert_eq!(report.pid_first, 0);
    }
}
