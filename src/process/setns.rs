//! Parent handle for a process joining an existing container.
//!
//! No new namespaces are created; the stub enters the namespaces
//! captured in the persisted state via setns, and the parent places the
//! process into the container's cgroups (or a sub-cgroup of them).

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Child;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::sys;

use super::{StubCommand, ack_pid_report, read_pid_report};

pub(crate) struct SetnsParent {
    command: Option<StubCommand>,
    child: Option<Child>,
    init_pipe: OwnedFd,
    log_pipe: Option<OwnedFd>,
    bootstrap_data: Vec<u8>,
    /// Controller paths the joined process is placed into, already
    /// extended with any requested sub-cgroup.
    cgroup_paths: HashMap<String, PathBuf>,
    rootless_cgroups: bool,
    intel_rdt_path: Option<PathBuf>,
    /// Fallback when no explicit paths are known: join the cgroup of
    /// this pid. Zero disables the fallback.
    init_process_pid: i32,
    pid: Pid,
    start_time: u64,
    external_descriptors: Vec<String>,
}

impl SetnsParent {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        command: StubCommand,
        init_pipe: OwnedFd,
        log_pipe: OwnedFd,
        bootstrap_data: Vec<u8>,
        cgroup_paths: HashMap<String, PathBuf>,
        rootless_cgroups: bool,
        intel_rdt_path: Option<PathBuf>,
        init_process_pid: i32,
    ) -> Self {
        Self {
            command: Some(command),
            child: None,
            init_pipe,
            log_pipe: Some(log_pipe),
            bootstrap_data,
            cgroup_paths,
            rootless_cgroups,
            intel_rdt_path,
            init_process_pid,
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

    pub(crate) fn external_descriptors(&self) -> &[String] {
        &self.external_descriptors
    }

    pub(crate) fn take_log_pipe(&mut self) -> Option<OwnedFd> {
        self.log_pipe.take()
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        let result = self.bootstrap();
        if result.is_err() {
            self.abort();
        }
        result
    }

    fn bootstrap(&mut self) -> Result<()> {
        let command = self
            .command
            .take()
            .ok_or_else(|| Error::ChildFailure("setns process already started".into()))?;
        let child = command.spawn()?;
        let stage0 = Pid::from_raw(child.id() as i32);
        self.child = Some(child);
        self.external_descriptors = sys::pipe_fds(stage0)?;

        nix::unistd::write(&self.init_pipe, &self.bootstrap_data)
            .map_err(|e| Error::syscall("write bootstrap", e))?;

        let report = read_pid_report(&self.init_pipe)?;
        self.pid = Pid::from_raw(report.pid);

        self.join_cgroups()?;

        ack_pid_report(&self.init_pipe)?;

        if report.pid_first > 0 {
            let _ = waitpid(Pid::from_raw(report.pid_first), None);
        }
        if let Some(mut child) = self.child.take() {
            let status = child
                .wait()
                .map_err(|e| Error::ChildFailure(format!("wait on setns stub: {e}")))?;
            if !status.success() {
                return Err(Error::ChildFailure(format!(
                    "setns stub exited with {status}"
                )));
            }
        }

        self.start_time = sys::proc_stat(self.pid)?.start_time;
        tracing::debug!(pid = self.pid.as_raw(), "joined container namespaces");
        Ok(())
    }

    fn join_cgroups(&self) -> Result<()> {
        if !self.cgroup_paths.is_empty() {
            for (controller, path) in &self.cgroup_paths {
                if let Err(err) = sys::write_cgroup_proc(path, self.pid) {
                    // Rootless containers often lack write access to
                    // their (unowned) cgroups.
                    if self.rootless_cgroups {
                        tracing::debug!(%controller, "skipping cgroup join: {err}");
                        continue;
                    }
                    return Err(err);
                }
            }
        } else if self.init_process_pid > 0 {
            // No recorded paths: join whatever cgroup init lives in now.
            let map = sys::parse_cgroup_file(Path::new(&format!(
                "/proc/{}/cgroup",
                self.init_process_pid
            )))?;
            if let Some(path) = map.get("") {
                let full = PathBuf::from("/sys/fs/cgroup")
                    .join(path.trim_start_matches('/'));
                sys::write_cgroup_proc(&full, self.pid)?;
            }
        }

        if let Some(rdt_path) = &self.intel_rdt_path {
            std::fs::write(rdt_path.join("tasks"), format!("{}\n", self.pid)).map_err(
                |e| Error::Manager(format!("cannot join Intel RDT group: {e}")),
            )?;
        }
        Ok(())
    }

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
