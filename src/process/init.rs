//! Parent handle for the container's init stub.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::Child;

use nix::sys::signal::{self, Signal};
use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::managers::{CgroupManager, IntelRdtManager};
use crate::sys;

use super::{StubCommand, ack_pid_report, read_pid_report};

/// Host-side parent of the container's pid-1.
///
/// The spawned stub is a short-lived bootstrap stage; the pid tracked
/// here becomes the final init reported over the init pipe.
pub(crate) struct InitParent {
    command: Option<StubCommand>,
    child: Option<Child>,
    init_pipe: OwnedFd,
    log_pipe: Option<OwnedFd>,
    bootstrap_data: Vec<u8>,
    /// Bind-mount sources to open in the host mount namespace and pass
    /// over the init pipe. Empty when the transfer does not apply.
    mount_sources: Vec<PathBuf>,
    /// True when the container joins an existing pid namespace, which
    /// changes how hard teardown must be.
    share_pidns: bool,
    pid: Pid,
    start_time: u64,
    external_descriptors: Vec<String>,
}

impl InitParent {
    pub(crate) fn new(
        command: StubCommand,
        init_pipe: OwnedFd,
        log_pipe: OwnedFd,
        bootstrap_data: Vec<u8>,
        mount_sources: Vec<PathBuf>,
        share_pidns: bool,
    ) -> Self {
        Self {
            command: Some(command),
            child: None,
            init_pipe,
            log_pipe: Some(log_pipe),
            bootstrap_data,
            mount_sources,
            share_pidns,
            pid: Pid::from_raw(0),
            start_time: 0,
            external_descriptors: Vec::new(),
        }
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn start_time(&self) -> u64 {
        self.start_time
    }

    pub(crate) fn share_pidns(&self) -> bool {
        self.share_pidns
    }

    pub(crate) fn external_descriptors(&self) -> &[String] {
        &self.external_descriptors
    }

    pub(crate) fn take_log_pipe(&mut self) -> Option<OwnedFd> {
        self.log_pipe.take()
    }

    /// Run the bootstrap handshake: spawn the stub, feed it the
    /// bootstrap message (and mount-source fds), learn the final init
    /// pid, put it into its cgroup, and release the stub towards the
    /// exec fifo.
    pub(crate) fn start(
        &mut self,
        cgroup: &dyn CgroupManager,
        intel_rdt: Option<&dyn IntelRdtManager>,
    ) -> Result<()> {
        let result = self.bootstrap(cgroup, intel_rdt);
        if result.is_err() {
            self.abort();
        }
        result
    }

    fn bootstrap(
        &mut self,
        cgroup: &dyn CgroupManager,
        intel_rdt: Option<&dyn IntelRdtManager>,
    ) -> Result<()> {
        let command = self
            .command
            .take()
            .ok_or_else(|| Error::ChildFailure("init already started".into()))?;
        let child = command.spawn()?;
        let stage0 = Pid::from_raw(child.id() as i32);
        self.child = Some(child);
        self.external_descriptors = sys::pipe_fds(stage0)?;

        nix::unistd::write(&self.init_pipe, &self.bootstrap_data)
            .map_err(|e| Error::syscall("write bootstrap", e))?;

        if !self.mount_sources.is_empty() {
            self.send_mount_sources()?;
        }

        let report = read_pid_report(&self.init_pipe)?;
        self.pid = Pid::from_raw(report.pid);

        cgroup.apply(self.pid)?;
        if let Some(rdt) = intel_rdt {
            rdt.apply(self.pid)?;
        }

        ack_pid_report(&self.init_pipe)?;

        // The intermediate clone and the stage-0 stub both exit once
        // the handshake completes.
        if report.pid_first > 0 {
            let _ = waitpid(Pid::from_raw(report.pid_first), None);
        }
        if let Some(mut child) = self.child.take() {
            let status = child
                .wait()
                .map_err(|e| Error::ChildFailure(format!("wait on init stub: {e}")))?;
            if !status.success() {
                return Err(Error::ChildFailure(format!(
                    "init stub exited with {status}"
                )));
            }
        }

        self.start_time = sys::proc_stat(self.pid)?.start_time;
        tracing::debug!(pid = self.pid.as_raw(), "container init bootstrapped");
        Ok(())
    }

    /// Open each bind source in the host mount namespace and transfer
    /// the descriptors in a single SCM_RIGHTS message. The stub uses
    /// them as pre-opened sources so it never walks host paths from
    /// inside the new namespaces.
    fn send_mount_sources(&self) -> Result<()> {
        let mut opened = Vec::with_capacity(self.mount_sources.len());
        for source in &self.mount_sources {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_PATH | libc::O_CLOEXEC)
                .open(source)
                .map_err(|e| {
                    Error::InvalidConfig(format!(
                        "cannot open mount source {}: {e}",
                        source.display()
                    ))
                })?;
            opened.push(OwnedFd::from(file));
        }
        let raw: Vec<_> = opened.iter().map(AsRawFd::as_raw_fd).collect();
        let iov = [std::io::IoSlice::new(b"M")];
        let cmsg = [ControlMessage::ScmRights(&raw)];
        sendmsg::<()>(
            self.init_pipe.as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::empty(),
            None,
        )
        .map_err(|e| Error::syscall("sendmsg mount sources", e))?;
        // `opened` stays alive until the message is sent.
        Ok(())
    }

    /// Best-effort teardown after a failed bootstrap.
    fn abort(&mut self) {
        if self.pid.as_raw() > 0 {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
