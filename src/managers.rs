//! Interfaces to the external collaborators of the lifecycle core.
//!
//! Cgroups, Intel RDT, hooks, network strategies, interface statistics
//! and restore-time mount preparation are all owned elsewhere; the core
//! only drives them through these traits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use serde::Serialize;

use crate::config::{FreezerState, Mount, Network, Resources};
use crate::error::{Error, Result};
use crate::state::OciState;

/// Capability set the core needs from a cgroup manager.
pub trait CgroupManager: Send {
    /// Place the given pid into the container's cgroup, creating it if
    /// necessary.
    fn apply(&self, pid: Pid) -> Result<()>;
    /// Apply resource limits to the cgroup.
    fn set(&self, resources: &Resources) -> Result<()>;
    /// Path of a single subsystem ("" for the v2 unified path).
    fn path(&self, subsystem: &str) -> Option<PathBuf>;
    /// All controller paths, keyed by subsystem ("" for v2).
    fn get_paths(&self) -> HashMap<String, PathBuf>;
    fn get_stats(&self) -> Result<CgroupStats>;
    fn freeze(&self, state: FreezerState) -> Result<()>;
    fn freezer_state(&self) -> Result<FreezerState>;
    /// Whether the cgroup still exists. Systemd removes the unit cgroup
    /// once every process has exited.
    fn exists(&self) -> bool;
    fn get_all_pids(&self) -> Result<Vec<Pid>>;
    fn destroy(&self) -> Result<()>;
    /// True when running on the cgroup v2 unified hierarchy.
    fn is_cgroup2(&self) -> bool;
}

/// Capability set the core needs from an Intel RDT manager.
pub trait IntelRdtManager: Send {
    fn apply(&self, pid: Pid) -> Result<()>;
    fn set(&self, config: &crate::config::Config) -> Result<()>;
    fn path(&self) -> PathBuf;
    fn get_stats(&self) -> Result<IntelRdtStats>;
    fn destroy(&self) -> Result<()>;
}

/// Lifecycle hook kinds the core invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Prestart,
    CreateRuntime,
    Poststart,
    Poststop,
}

impl HookKind {
    pub fn name(&self) -> &'static str {
        match self {
            HookKind::Prestart => "prestart",
            HookKind::CreateRuntime => "createRuntime",
            HookKind::Poststart => "poststart",
            HookKind::Poststop => "poststop",
        }
    }
}

/// Runs configured lifecycle hooks with an OCI state payload.
pub trait HookRunner: Send {
    fn run(&self, kind: HookKind, state: &OciState) -> Result<()>;
}

/// Attaches and detaches container network interfaces. Used by the C/R
/// driver for the network-lock and network-unlock notifications.
pub trait NetworkStrategy: Send {
    fn attach(&self, network: &Network) -> Result<()>;
    fn detach(&self, network: &Network) -> Result<()>;
}

/// Reads host-side interface statistics for `Stats()`.
pub trait InterfaceStatsReader: Send {
    fn stats(&self, host_interface: &str) -> Result<InterfaceStats>;
}

/// Prepares mount points during restore, the same way the rootfs setup
/// does for initial creation.
pub trait MountPreparer: Send {
    fn prepare_mountpoint(&self, mount: &Mount, rootfs: &Path) -> Result<()>;
}

/// Cgroup statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CgroupStats {
    pub memory_usage_bytes: u64,
    pub cpu_usage_ns: u64,
    pub pids_current: u64,
}

/// Intel RDT statistics snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntelRdtStats {
    pub l3_cache_schema: String,
    pub mem_bw_schema: String,
}

/// Host-side statistics for one container interface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InterfaceStats {
    pub name: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
}

/// Everything a container needs from the outside world, bundled for
/// construction.
pub struct Components {
    pub cgroup: Box<dyn CgroupManager>,
    pub intel_rdt: Option<Box<dyn IntelRdtManager>>,
    pub hooks: Option<Box<dyn HookRunner>>,
    pub network: Option<Box<dyn NetworkStrategy>>,
    pub iface_stats: Option<Box<dyn InterfaceStatsReader>>,
    pub mounts: Box<dyn MountPreparer>,
}

/// Default mount preparer: validates bind sources and creates missing
/// mount points under the rootfs.
pub struct FsMountPreparer;

impl MountPreparer for FsMountPreparer {
    fn prepare_mountpoint(&self, mount: &Mount, rootfs: &Path) -> Result<()> {
        let dest = join_rootfs(rootfs, &mount.destination);
        if mount.is_bind() {
            let source = Path::new(&mount.source);
            let meta = std::fs::metadata(source).map_err(|e| {
                Error::InvalidConfig(format!(
                    "bind mount source {}: {e}",
                    source.display()
                ))
            })?;
            if meta.is_dir() {
                std::fs::create_dir_all(&dest)?;
            } else {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                if !dest.exists() {
                    std::fs::File::create(&dest)?;
                }
            }
        } else {
            std::fs::create_dir_all(&dest)?;
        }
        Ok(())
    }
}

/// Join a destination path onto the rootfs, stripping the leading
/// separator so absolute in-container paths stay inside the rootfs.
pub(crate) fn join_rootfs(rootfs: &Path, destination: &str) -> PathBuf {
    rootfs.join(destination.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_rootfs_strips_leading_slash() {
        let joined = join_rootfs(Path::new("/var/lib/c1/rootfs"), "/dev/null");
        assert_eq!(joined, PathBuf::from("/var/lib/c1/rootfs/dev/null"));
    }

    #[test]
    fn test_prepare_mountpoint_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = Mount {
            device: "proc".into(),
            source: "proc".into(),
            destination: "/proc".into(),
            flags: 0,
            data: String::new(),
        };
        FsMountPreparer
            .prepare_mountpoint(&mount, tmp.path())
            .unwrap();
        assert!(tmp.path().join("proc").is_dir());
    }

    #[test]
    fn test_prepare_mountpoint_bind_file() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("resolv.conf");
        std::fs::write(&source, "nameserver 10.0.0.1\n").unwrap();

        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir(&rootfs).unwrap();
        let mount = Mount {
            device: "bind".into(),
            source: source.to_string_lossy().into_owned(),
            destination: "/etc/resolv.conf".into(),
            flags: libc::MS_BIND as u64,
            data: String::new(),
        };
        FsMountPreparer.prepare_mountpoint(&mount, &rootfs).unwrap();
        assert!(rootfs.join("etc/resolv.conf").is_file());
    }

    #[test]
    fn test_prepare_mountpoint_missing_bind_source() {
        let tmp = tempfile::tempdir().unwrap();
        let mount = Mount {
            device: "bind".into(),
            source: "/definitely/not/here".into(),
            destination: "/data".into(),
            flags: libc::MS_BIND as u64,
            data: String::new(),
        };
        let err = FsMountPreparer
            .prepare_mountpoint(&mount, tmp.path())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
