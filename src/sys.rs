//! Thin wrappers over /proc and signal delivery.

use std::collections::HashMap;
use std::path::Path;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::managers::CgroupManager;

/// Snapshot of the fields of `/proc/<pid>/stat` the core cares about.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProcStat {
    /// Process start time in clock ticks since boot. Stable for the
    /// process lifetime, so a mismatch means the pid was reused.
    pub start_time: u64,
    /// Zombie or dead processes no longer run anything.
    pub defunct: bool,
}

/// Read the stat of a live process. Fails if the pid does not exist.
pub(crate) fn proc_stat(pid: Pid) -> Result<ProcStat> {
    let proc = procfs::process::Process::new(pid.as_raw())
        .map_err(|e| Error::ChildFailure(format!("stat pid {pid}: {e}")))?;
    let stat = proc
        .stat()
        .map_err(|e| Error::ChildFailure(format!("stat pid {pid}: {e}")))?;
    let defunct = matches!(
        stat.state(),
        Ok(procfs::process::ProcState::Zombie) | Ok(procfs::process::ProcState::Dead)
    );
    Ok(ProcStat {
        start_time: stat.starttime,
        defunct,
    })
}

/// Resolve where a process's standard descriptors point, as symbolic
/// names (`pipe:[...]`, `/dev/pts/0`, ...). Needed for checkpointing.
pub(crate) fn pipe_fds(pid: Pid) -> Result<Vec<String>> {
    let mut fds = Vec::with_capacity(3);
    for fd in 0..3 {
        let link = format!("/proc/{pid}/fd/{fd}");
        let target = std::fs::read_link(&link)?;
        fds.push(target.to_string_lossy().into_owned());
    }
    Ok(fds)
}

/// Deliver a signal to every process in the container's cgroup.
/// Processes that exit mid-iteration are skipped.
pub(crate) fn signal_all_processes(manager: &dyn CgroupManager, sig: Signal) -> Result<()> {
    for pid in manager.get_all_pids()? {
        match signal::kill(pid, sig) {
            Ok(()) | Err(nix::Error::ESRCH) => {}
            Err(e) => {
                tracing::warn!(pid = pid.as_raw(), signal = %sig, "failed to signal process: {e}");
            }
        }
    }
    Ok(())
}

/// Parse `/proc/<pid>/cgroup` into controller -> path.
///
/// v1 lines name one or more controllers per entry; v2 has a single
/// entry with an empty controller list, keyed here as "".
pub(crate) fn parse_cgroup_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    let mut out = HashMap::new();
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let (Some(_), Some(ctrls), Some(cg_path)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if ctrls.is_empty() {
            out.insert(String::new(), cg_path.to_string());
            continue;
        }
        for ctrl in ctrls.split(',') {
            // name=systemd style entries keep only the name part.
            let ctrl = ctrl.strip_prefix("name=").unwrap_or(ctrl);
            out.insert(ctrl.to_string(), cg_path.to_string());
        }
    }
    Ok(out)
}

/// Move a pid into a cgroup by path, outside of any manager. Used when
/// joining the sub-cgroups of an existing container.
pub(crate) fn write_cgroup_proc(cgroup_path: &Path, pid: Pid) -> Result<()> {
    let procs = cgroup_path.join("cgroup.procs");
    std::fs::write(&procs, format!("{pid}\n")).map_err(|e| {
        Error::Manager(format!("cannot add pid {pid} to {}: {e}", procs.display()))
    })
}

/// Scoped umask override, restoring the previous mask on drop.
pub(crate) struct UmaskGuard {
    previous: nix::sys::stat::Mode,
}

impl UmaskGuard {
    pub(crate) fn set(mode: nix::sys::stat::Mode) -> Self {
        Self {
            previous: nix::sys::stat::umask(mode),
        }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        nix::sys::stat::umask(self.previous);
    }
}
