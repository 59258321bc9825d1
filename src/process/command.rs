//! Stub command construction.
//!
//! The stub is a re-exec of the runtime binary (`/proc/self/exe init`)
//! with argv[0] preserved. Every file descriptor it inherits beyond
//! stdio is tracked here; `add_fd` assigns the child-side number
//! (`3 + index`) and emits the matching environment variable in one
//! step so the numbering can never drift from the fd list.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use crate::config::{Config, Process};
use crate::error::{Error, Result};

use super::{InitType, STDIO_FD_COUNT};

pub(crate) const ENV_INIT_TYPE: &str = "_LIBCONTAINER_INITTYPE";
pub(crate) const ENV_INIT_PIPE: &str = "_LIBCONTAINER_INITPIPE";
pub(crate) const ENV_LOG_PIPE: &str = "_LIBCONTAINER_LOGPIPE";
pub(crate) const ENV_LOG_LEVEL: &str = "_LIBCONTAINER_LOGLEVEL";
pub(crate) const ENV_STATE_DIR: &str = "_LIBCONTAINER_STATEDIR";
pub(crate) const ENV_FIFO_FD: &str = "_LIBCONTAINER_FIFOFD";
pub(crate) const ENV_CONSOLE: &str = "_LIBCONTAINER_CONSOLE";
pub(crate) const ENV_MOUNT_FDS: &str = "_LIBCONTAINER_MOUNT_FDS";

/// Concurrency hint forwarded to the stub, mirroring the host setting.
const ENV_NPROC: &str = "CORRAL_NPROC";

pub(crate) struct StubCommand {
    cmd: Command,
    extras: Vec<OwnedFd>,
}

impl StubCommand {
    /// Build the template command: stdio from the user process, cwd at
    /// the rootfs, a cleared environment, and the parent-death signal
    /// when configured.
    pub(crate) fn new(
        config: &Config,
        process: &mut Process,
        init_type: InitType,
        state_dir: &std::path::Path,
    ) -> Self {
        let mut cmd = Command::new("/proc/self/exe");
        if let Some(arg0) = std::env::args_os().next() {
            cmd.arg0(arg0);
        }
        cmd.arg("init");
        cmd.current_dir(&config.rootfs);
        cmd.env_clear();
        cmd.env(ENV_INIT_TYPE, init_type.as_str());
        cmd.env(ENV_STATE_DIR, state_dir);
        cmd.env(ENV_LOG_LEVEL, &process.log_level);
        if let Ok(nproc) = std::env::var(ENV_NPROC) {
            cmd.env(ENV_NPROC, nproc);
        }

        cmd.stdin(process.stdin.take().unwrap_or_else(Stdio::inherit));
        cmd.stdout(process.stdout.take().unwrap_or_else(Stdio::inherit));
        cmd.stderr(process.stderr.take().unwrap_or_else(Stdio::inherit));

        let pdeathsig = config.parent_death_signal;
        if pdeathsig > 0 {
            unsafe {
                cmd.pre_exec(move || {
                    if libc::prctl(libc::PR_SET_PDEATHSIG, pdeathsig as libc::c_ulong) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        Self {
            cmd,
            extras: Vec::new(),
        }
    }

    /// Inherit `fd` in the child and announce its number through
    /// `env_name`. Returns the number the child will see.
    pub(crate) fn add_fd(&mut self, env_name: &str, fd: OwnedFd) -> i32 {
        let child_fd = STDIO_FD_COUNT + self.extras.len() as i32;
        self.cmd.env(env_name, child_fd.to_string());
        self.extras.push(fd);
        child_fd
    }

    /// Inherit `fd` without an environment variable; returns the number.
    pub(crate) fn add_unnamed_fd(&mut self, fd: OwnedFd) -> i32 {
        let child_fd = STDIO_FD_COUNT + self.extras.len() as i32;
        self.extras.push(fd);
        child_fd
    }

    pub(crate) fn env(&mut self, key: &str, value: &str) {
        self.cmd.env(key, value);
    }

    /// Spawn the stub. The inherited descriptors are remapped to their
    /// announced numbers between fork and exec; the parent-side copies
    /// are closed when `self` is dropped here, so pipe EOFs track the
    /// child alone.
    pub(crate) fn spawn(mut self) -> Result<Child> {
        let mut raws: Vec<RawFd> = self.extras.iter().map(AsRawFd::as_raw_fd).collect();
        unsafe {
            self.cmd.pre_exec(move || remap_fds(&mut raws));
        }
        let child = self.cmd.spawn().map_err(|e| {
            Error::ChildFailure(format!("cannot spawn init stub: {e}"))
        })?;
        Ok(child)
    }
}

/// Move inherited fds to `3 + index`. Runs after fork: only
/// async-signal-safe calls, no allocation. `dup2` both lands the fd at
/// its announced number and clears CLOEXEC so it survives exec.
pub(crate) fn remap_fds(raws: &mut [RawFd]) -> std::io::Result<()> {
    let floor = STDIO_FD_COUNT + raws.len() as RawFd;
    for i in 0..raws.len() {
        let target = STDIO_FD_COUNT + i as RawFd;
        if raws[i] == target {
            // Already in place; just clear CLOEXEC.
            if unsafe { libc::fcntl(target, libc::F_SETFD, 0) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
            continue;
        }
        // Evict any pending source that occupies our target number.
        for j in (i + 1)..raws.len() {
            if raws[j] == target {
                let moved = unsafe { libc::fcntl(raws[j], libc::F_DUPFD, floor) };
                if moved < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                raws[j] = moved;
            }
        }
        if unsafe { libc::dup2(raws[i], target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Read;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap()
    }

    #[test]
    fn test_add_fd_numbers_from_three() {
        let config = Config {
            rootfs: "/".into(),
            ..Default::default()
        };
        let mut process = Process::default();
        let mut cmd = StubCommand::new(
            &config,
            &mut process,
            InitType::Standard,
            std::path::Path::new("/tmp"),
        );

        let (r1, _w1) = pipe_pair();
        let (r2, _w2) = pipe_pair();
        let (r3, _w3) = pipe_pair();
        assert_eq!(cmd.add_fd("_TEST_A", r1), 3);
        assert_eq!(cmd.add_unnamed_fd(r2), 4);
        assert_eq!(cmd.add_fd("_TEST_B", r3), 5);
    }

    #[test]
    fn test_spawned_child_sees_remapped_fd() {
        // Replace the stub binary with /bin/sh to observe the child's
        // view of an inherited pipe.
        let (read_end, write_end) = pipe_pair();

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("echo -n ok >&3");
        cmd.stdin(Stdio::null());
        let mut raws = vec![write_end.as_raw_fd()];
        unsafe {
            cmd.pre_exec(move || remap_fds(&mut raws));
        }
        let mut child = cmd.spawn().unwrap();
        drop(write_end);

        let status = child.wait().unwrap();
        assert!(status.success());

        let mut out = String::new();
        std::fs::File::from(read_end).read_to_string(&mut out).unwrap();
        assert_eq!(out, "ok");
    }
}
