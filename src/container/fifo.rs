//! The exec fifo: a rendezvous between host and container init.
//!
//! After bootstrap the in-container init opens `exec.fifo` for writing
//! and blocks. The host releases it by reading the fifo; a non-empty
//! payload is the stub's readiness mark. The fifo exists exactly while
//! the container is in the created state.

use std::io::Read;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use nix::sys::stat::Mode;
use nix::unistd::{Gid, Pid, Uid};

use crate::error::{Error, Result};
use crate::sys::{self, UmaskGuard};

pub(crate) const EXEC_FIFO_FILENAME: &str = "exec.fifo";

/// How often init liveness is re-checked while waiting on the fifo.
const LIVENESS_POLL: Duration = Duration::from_millis(100);

fn fifo_path(root: &Path) -> PathBuf {
    root.join(EXEC_FIFO_FILENAME)
}

/// Create the fifo, owned by the host ids that map to container root.
/// A leftover fifo from a previous start is an error, not something to
/// silently reuse.
pub(crate) fn create(root: &Path, uid: u32, gid: u32) -> Result<()> {
    let path = fifo_path(root);
    if path.exists() {
        return Err(Error::AlreadyExists(format!("exec fifo {}", path.display())));
    }
    let _mask = UmaskGuard::set(Mode::empty());
    nix::unistd::mkfifo(&path, Mode::from_bits_truncate(0o622))
        .map_err(|e| Error::syscall("mkfifo", e))?;
    nix::unistd::chown(&path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .map_err(|e| Error::syscall("chown exec fifo", e))?;
    Ok(())
}

pub(crate) fn delete(root: &Path) {
    let _ = std::fs::remove_file(fifo_path(root));
}

pub(crate) fn exists(root: &Path) -> bool {
    fifo_path(root).exists()
}

/// Open the fifo as a path-only descriptor for the stub to inherit.
/// O_PATH keeps the fifo itself unopened and denies the stub a handle
/// into the state directory.
pub(crate) fn open_path_fd(root: &Path) -> Result<OwnedFd> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_PATH | libc::O_CLOEXEC)
        .open(fifo_path(root))?;
    Ok(OwnedFd::from(file))
}

fn fifo_open(path: &Path, block: bool) -> std::io::Result<std::fs::File> {
    let flags = if block { 0 } else { libc::O_NONBLOCK };
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(flags)
        .open(path)
}

/// Drain an opened fifo and unlink it. The stub writes at least one
/// byte right before exec; an empty read means the container was
/// already released.
fn handle_fifo_result(file: std::io::Result<std::fs::File>, path: &Path) -> Result<()> {
    let mut file = file.map_err(|e| Error::ChildFailure(format!("exec fifo: {e}")))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    if data.is_empty() {
        return Err(Error::ChildFailure(
            "cannot start an already running container".into(),
        ));
    }
    std::fs::remove_file(path)?;
    Ok(())
}

/// Block until the fifo is released or init dies.
///
/// A background thread performs the blocking open and reports through a
/// oneshot channel; this thread polls init liveness every 100ms. When
/// init turns out to be gone, one last non-blocking open distinguishes
/// "ran to completion between polls" from "never started".
pub(crate) fn exec(root: &Path, init_pid: Pid, init_start_time: u64) -> Result<()> {
    let path = fifo_path(root);
    let rx = await_fifo_open(path.clone());
    loop {
        match rx.recv_timeout(LIVENESS_POLL) {
            Ok(result) => return handle_fifo_result(result, &path),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let alive = sys::proc_stat(init_pid)
                    .map(|s| s.start_time == init_start_time && !s.defunct)
                    .unwrap_or(false);
                if !alive {
                    // Init may have run and exited between polls; the
                    // non-blocking open succeeds if a writer completed.
                    return match handle_fifo_result(fifo_open(&path, false), &path) {
                        Ok(()) => Ok(()),
                        Err(_) => Err(Error::ChildFailure(
                            "container process is already dead".into(),
                        )),
                    };
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(Error::ChildFailure(
                    "container process is already dead".into(),
                ));
            }
        }
    }
}

fn await_fifo_open(path: PathBuf) -> mpsc::Receiver<std::io::Result<std::fs::File>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("exec-fifo".into())
        .spawn(move || {
            let _ = tx.send(fifo_open(&path, true));
        })
        .expect("spawn exec-fifo thread");
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn mkfifo_for_test(root: &Path) {
        nix::unistd::mkfifo(&fifo_path(root), Mode::from_bits_truncate(0o622)).unwrap();
    }

    #[test]
    fn test_create_rejects_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let uid = nix::unistd::geteuid().as_raw();
        let gid = nix::unistd::getegid().as_raw();
        create(tmp.path(), uid, gid).unwrap();
        assert!(exists(tmp.path()));

        let err = create(tmp.path(), uid, gid).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_exec_releases_on_writer() {
        let tmp = tempfile::tempdir().unwrap();
        mkfifo_for_test(tmp.path());
        let path = fifo_path(tmp.path());

        // Stand in for the blocked init: open for write, mark ready.
        let writer = std::thread::spawn(move || {
            let mut f = std::fs::OpenOptions::new().write(true).open(path).unwrap();
            f.write_all(b"0").unwrap();
        });

        let me = Pid::this();
        let start_time = sys::proc_stat(me).unwrap().start_time;
        exec(tmp.path(), me, start_time).unwrap();
        writer.join().unwrap();

        assert!(!exists(tmp.path()));
    }

    #[test]
    fn test_exec_empty_payload_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        mkfifo_for_test(tmp.path());
        let path = fifo_path(tmp.path());

        // A writer that opens and closes without writing anything.
        let writer = std::thread::spawn(move || {
            let _f = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        });

        let me = Pid::this();
        let start_time = sys::proc_stat(me).unwrap().start_time;
        let err = exec(tmp.path(), me, start_time).unwrap_err();
        assert!(err.to_string().contains("already running"));
        writer.join().unwrap();
    }

    #[test]
    fn test_exec_dead_init_fails() {
        let tmp = tempfile::tempdir().unwrap();
        mkfifo_for_test(tmp.path());

        // A pid that does not exist: liveness check fails immediately
        // and there is no writer for the last-chance open.
        let err = exec(tmp.path(), Pid::from_raw(999_999_999), 1).unwrap_err();
        assert!(err.to_string().contains("already dead"));
    }
}
