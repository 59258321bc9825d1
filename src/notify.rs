//! OOM and memory-pressure notification channels.
//!
//! Callers get a receiver of void events. On cgroup v1 the kernel
//! delivers events through an eventfd registered in
//! `cgroup.event_control`; on v2 the `memory.events` file is watched
//! for oom counter increments. Producer threads exit when the receiver
//! is dropped or the cgroup disappears.

use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

use crate::error::{Error, Result};

/// Memory pressure levels of the v1 `memory.pressure_level` interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    Low,
    Medium,
    Critical,
}

impl PressureLevel {
    fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Low => "low",
            PressureLevel::Medium => "medium",
            PressureLevel::Critical => "critical",
        }
    }
}

/// Register an eventfd in the v1 event_control file and stream events.
///
/// `target` names the control file the eventfd is paired with
/// (`memory.oom_control` or `memory.pressure_level`); `args` carries
/// the optional pressure level.
fn register_v1(
    cgroup_dir: &Path,
    target: &str,
    args: Option<&str>,
) -> Result<mpsc::Receiver<()>> {
    let control = std::fs::File::open(cgroup_dir.join(target))?;
    let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if raw < 0 {
        return Err(Error::syscall("eventfd", nix::Error::last()));
    }
    let eventfd = unsafe { OwnedFd::from_raw_fd(raw) };

    use std::os::fd::AsRawFd;
    let mut line = format!("{} {}", eventfd.as_raw_fd(), control.as_raw_fd());
    if let Some(args) = args {
        line.push(' ');
        line.push_str(args);
    }
    std::fs::write(cgroup_dir.join("cgroup.event_control"), line)?;

    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("cgroup-event".into())
        .spawn(move || {
            // The control fd must outlive the registration.
            let _control = control;
            let mut eventfd = std::fs::File::from(eventfd);
            let mut counter = [0u8; 8];
            loop {
                if eventfd.read_exact(&mut counter).is_err() {
                    return;
                }
                if tx.send(()).is_err() {
                    return;
                }
            }
        })
        .expect("spawn cgroup-event thread");
    Ok(rx)
}

/// Stream OOM kill events for a v1 memory cgroup.
pub(crate) fn notify_on_oom(cgroup_dir: &Path) -> Result<mpsc::Receiver<()>> {
    register_v1(cgroup_dir, "memory.oom_control", None)
}

/// Stream memory pressure events for a v1 memory cgroup.
pub(crate) fn notify_memory_pressure(
    cgroup_dir: &Path,
    level: PressureLevel,
) -> Result<mpsc::Receiver<()>> {
    register_v1(cgroup_dir, "memory.pressure_level", Some(level.as_str()))
}

/// Parse the `oom` counter out of a v2 `memory.events` document.
fn parse_oom_count(content: &str) -> u64 {
    content
        .lines()
        .find_map(|line| line.strip_prefix("oom "))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// Stream OOM events for a v2 cgroup by watching `memory.events`.
pub(crate) fn notify_on_oom_v2(cgroup_dir: &Path) -> Result<mpsc::Receiver<()>> {
    let events_path = cgroup_dir.join("memory.events");
    let mut last = parse_oom_count(&std::fs::read_to_string(&events_path)?);

    let inotify = Inotify::init(InitFlags::IN_CLOEXEC)
        .map_err(|e| Error::syscall("inotify_init", e))?;
    inotify
        .add_watch(&events_path, AddWatchFlags::IN_MODIFY)
        .map_err(|e| Error::syscall("inotify_add_watch", e))?;

    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("memory-events".into())
        .spawn(move || {
            watch_oom_v2(inotify, events_path, &mut last, tx);
        })
        .expect("spawn memory-events thread");
    Ok(rx)
}

fn watch_oom_v2(
    inotify: Inotify,
    events_path: PathBuf,
    last: &mut u64,
    tx: mpsc::Sender<()>,
) {
    loop {
        if inotify.read_events().is_err() {
            return;
        }
        let content = match std::fs::read_to_string(&events_path) {
            Ok(content) => content,
            // The cgroup went away with its container.
            Err(_) => return,
        };
        let current = parse_oom_count(&content);
        if current > *last {
            *last = current;
            if tx.send(()).is_err() {
                return;
            }
        }
    }
}
