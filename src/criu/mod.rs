//! Checkpoint/restore driver.
//!
//! Drives the CRIU helper over a length-framed RPC on a seqpacket
//! socketpair: the helper is spawned as `criu swrk 3` with the server
//! socket at fd 3, requests and responses are single datagrams, and
//! asynchronous NOTIFY messages interleave with the terminal response.
//! Ancillary data on the socket carries SCM_RIGHTS descriptors (the
//! orphaned pty master during restore).

pub mod rpc;

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::Utc;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
    UnixAddr, recvmsg, sendmsg, socketpair,
};
use nix::unistd::Pid;
use prost::Message;

use crate::config::{NamespaceType, Process};
use crate::container::{Container, Inner, StateNode};
use crate::error::{Error, Result};
use crate::managers::{HookKind, join_rootfs};
use crate::process::command::remap_fds;
use crate::process::{ParentProcess, RestoredParent};
use crate::sys;

/// The version RPC appeared in CRIU 3.0.0; older helpers cannot be
/// driven at all.
const MIN_CRIU_VERSION: u32 = 30000;
/// External network namespaces.
const VERSION_EXTERNAL_NET_NS: u32 = 31100;
/// Cgroup v2 freezer support.
const VERSION_CGROUP2_FREEZER: u32 = 31400;
/// External pid namespaces and status notifications.
const VERSION_EXTERNAL_PID_NS: u32 = 31500;
const VERSION_STATUS_NOTIFY: u32 = 31500;
/// LSM profile and mount-context options.
const VERSION_LSM: u32 = 31600;

const DESCRIPTORS_FILENAME: &str = "descriptors.json";
const CHECKPOINT_MARKER: &str = "checkpoint";

/// Page server endpoint for lazy migration.
#[derive(Debug, Clone, Default)]
pub struct PageServer {
    pub address: String,
    pub port: i32,
}

/// A veth pair to re-plumb on restore.
#[derive(Debug, Clone)]
pub struct VethPair {
    pub container_interface_name: String,
    pub host_interface_name: String,
}

/// User-facing checkpoint/restore options.
#[derive(Debug, Clone)]
pub struct CriuOpts {
    pub images_directory: PathBuf,
    pub work_directory: Option<PathBuf>,
    /// Previous image for an iterative (pre-dump) migration chain.
    pub parent_image: Option<String>,
    pub leave_running: bool,
    pub tcp_established: bool,
    pub tcp_skip_in_flight: bool,
    pub external_unix_connections: bool,
    pub shell_job: bool,
    pub file_locks: bool,
    pub pre_dump: bool,
    pub page_server: Option<PageServer>,
    pub veth_pairs: Vec<VethPair>,
    pub manage_cgroups_mode: Option<rpc::CriuCgMode>,
    /// CLONE_NEW* bitmask of namespaces the helper should not touch.
    pub empty_ns: u32,
    pub auto_dedup: bool,
    pub lazy_pages: bool,
    /// Fd to signal lazy-pages readiness on; -1 when unused.
    pub status_fd: i32,
    pub lsm_profile: Option<String>,
    pub lsm_mount_context: Option<String>,
}

impl Default for CriuOpts {
    fn default() -> Self {
        Self {
            images_directory: PathBuf::new(),
            work_directory: None,
            parent_image: None,
            leave_running: false,
            tcp_established: false,
            tcp_skip_in_flight: false,
            external_unix_connections: false,
            shell_job: false,
            file_locks: false,
            pre_dump: false,
            page_server: None,
            veth_pairs: Vec::new(),
            manage_cgroups_mode: None,
            empty_ns: 0,
            auto_dedup: false,
            lazy_pages: false,
            status_fd: -1,
            lsm_profile: None,
            lsm_mount_context: None,
        }
    }
}

/// The helper binary; overridable for test rigs and packaged installs.
fn criu_binary() -> String {
    std::env::var("CRIU_BINARY").unwrap_or_else(|_| "criu".into())
}

/// External-namespace key, byte-for-byte the helper's expected casing.
fn ext_ns_key(t: NamespaceType) -> &'static str {
    match t {
        NamespaceType::Net => "extRootNetNS",
        NamespaceType::Pid => "extRootPidNS",
        _ => unreachable!("only net and pid namespaces are external"),
    }
}

/// Detaches recorded bind mounts when the restore attempt ends.
struct UnmountGuard {
    targets: Vec<PathBuf>,
}

impl Drop for UnmountGuard {
    fn drop(&mut self) {
        for target in self.targets.iter().rev() {
            if let Err(err) = umount2(target, MntFlags::MNT_DETACH) {
                // EINVAL: not a mount point, already unmounted.
                if err != nix::Error::EINVAL {
                    tracing::warn!(
                        "error during cleanup unmounting of {}: {err}",
                        target.display()
                    );
                }
            }
        }
    }
}

/// State threaded through one swrk conversation.
pub(crate) struct SwrkContext<'a> {
    process: Option<&'a mut Process>,
    opts: Option<&'a CriuOpts>,
    /// Symbolic stdio destinations of the (future) restored init.
    ext_fds: Vec<String>,
    log_path: String,
    /// User status fd, written and closed on the status-ready notify.
    status_fd: Option<i32>,
    /// Status fd passed through the RPC option (pre-3.15 helpers),
    /// closed on the first response to release waiters.
    rpc_status_fd: Option<i32>,
}

impl Container {
    /// Checkpoint the container into `opts.images_directory`.
    pub fn checkpoint(&self, opts: &CriuOpts) -> Result<()> {
        let mut inner = self.lock();
        self.check_criu_version(&mut inner, MIN_CRIU_VERSION)?;

        if opts.images_directory.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "invalid directory to save checkpoint".into(),
            ));
        }
        mkdir_private(&opts.images_directory)?;
        let image_dir = std::fs::File::open(&opts.images_directory)?;

        let init_pid = inner
            .init_process
            .as_ref()
            .map(|p| p.pid())
            .ok_or(Error::NotRunning)?;

        let mut rpc_opts = rpc::CriuOpts {
            images_dir_fd: image_dir.as_raw_fd(),
            log_level: Some(4),
            log_file: Some("dump.log".into()),
            root: Some(inner.config.rootfs.clone()),
            manage_cgroups: Some(true),
            notify_scripts: Some(true),
            pid: Some(init_pid.as_raw()),
            shell_job: Some(opts.shell_job),
            leave_running: Some(opts.leave_running),
            tcp_established: Some(opts.tcp_established),
            tcp_skip_in_flight: Some(opts.tcp_skip_in_flight),
            ext_unix_sk: Some(opts.external_unix_connections),
            file_locks: Some(opts.file_locks),
            empty_ns: Some(opts.empty_ns),
            orphan_pts_master: Some(true),
            auto_dedup: Some(opts.auto_dedup),
            lazy_pages: Some(opts.lazy_pages),
            ..Default::default()
        };

        let _work_dir = self.open_work_dir(opts, &mut rpc_opts)?;
        self.criu_configuration_file(&inner, &mut rpc_opts);

        // Network and pid namespaces with explicit paths are recorded
        // as external; the helper expects equivalents at restore.
        self.checkpoint_external_ns(&mut inner, &mut rpc_opts, NamespaceType::Net)?;
        self.checkpoint_external_ns(&mut inner, &mut rpc_opts, NamespaceType::Pid)?;

        // Freezing through the cgroup beats ptrace-seizing every task;
        // v2 freezer needs a recent enough helper.
        if !inner.cgroup.is_cgroup2()
            || self.check_criu_version(&mut inner, VERSION_CGROUP2_FREEZER).is_ok()
        {
            if let Some(freezer) = inner.cgroup.path("freezer") {
                rpc_opts.freeze_cgroup = Some(freezer.to_string_lossy().into_owned());
            }
        }

        if let Some(ps) = &opts.page_server {
            if !ps.address.is_empty() && ps.port != 0 {
                rpc_opts.ps = Some(rpc::CriuPageServerInfo {
                    address: Some(ps.address.clone()),
                    port: Some(ps.port),
                    ..Default::default()
                });
            }
        }

        if let Some(parent) = &opts.parent_image {
            rpc_opts.parent_img = Some(parent.clone());
            rpc_opts.track_mem = Some(true);
        }

        if let Some(mode) = opts.manage_cgroups_mode {
            rpc_opts.manage_cgroups_mode = Some(mode as i32);
        }

        let req_type = if opts.pre_dump {
            self.check_criu_features(
                &mut inner,
                &rpc_opts,
                rpc::CriuFeatures {
                    mem_track: Some(true),
                    ..Default::default()
                },
            )?;
            rpc::CriuReqType::PreDump
        } else {
            rpc::CriuReqType::Dump
        };

        if opts.lazy_pages {
            self.check_criu_features(
                &mut inner,
                &rpc_opts,
                rpc::CriuFeatures {
                    lazy_pages: Some(true),
                    ..Default::default()
                },
            )?;
            if opts.status_fd != -1 {
                let flags = unsafe { libc::fcntl(opts.status_fd, libc::F_GETFL) };
                if flags < 0 {
                    return Err(Error::InvalidConfig(format!(
                        "invalid status-fd argument {}",
                        opts.status_fd
                    )));
                }
                if flags & libc::O_WRONLY == 0 {
                    return Err(Error::InvalidConfig(format!(
                        "invalid status-fd argument {}: not writable",
                        opts.status_fd
                    )));
                }
                if self.check_criu_version(&mut inner, VERSION_STATUS_NOTIFY).is_err() {
                    // Older helpers have no status-ready notification;
                    // hand them the fd directly.
                    rpc_opts.status_fd = Some(opts.status_fd);
                }
            }
        }

        // Pre-dump captures memory only; mounts and descriptors belong
        // to the final dump.
        if !opts.pre_dump {
            self.add_checkpoint_mounts(&inner, &mut rpc_opts, init_pid)?;

            let descriptors = inner
                .init_process
                .as_ref()
                .map(|p| p.external_descriptors().to_vec())
                .unwrap_or_default();
            std::fs::write(
                opts.images_directory.join(DESCRIPTORS_FILENAME),
                serde_json::to_vec(&descriptors)?,
            )?;
        }

        let mut req = rpc::CriuReq {
            r#type: req_type as i32,
            opts: Some(rpc_opts),
            ..Default::default()
        };
        self.criu_swrk(&mut inner, None, &mut req, Some(opts), Vec::new())
    }

    /// Restore a container from a checkpoint image. The restored init
    /// is re-bound to this container through the post-restore
    /// notification before the terminal response arrives.
    pub fn restore(&self, process: &mut Process, opts: &CriuOpts) -> Result<()> {
        let mut inner = self.lock();
        self.check_criu_version(&mut inner, MIN_CRIU_VERSION)?;

        if opts.images_directory.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "invalid directory to restore checkpoint".into(),
            ));
        }
        let image_dir = std::fs::File::open(&opts.images_directory)?;

        // The helper requires a root that is a mount point whose parent
        // is not overmounted; bind the rootfs to a private spot.
        let criu_root = self.root.join("criu-root");
        std::fs::create_dir_all(&criu_root)?;
        let criu_root = criu_root.canonicalize()?;
        mount(
            Some(Path::new(&inner.config.rootfs)),
            &criu_root,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| Error::syscall("bind mount criu root", e))?;
        let mut guard = UnmountGuard {
            targets: vec![criu_root.clone()],
        };

        let result = self.restore_with_root(
            &mut inner,
            process,
            opts,
            &image_dir,
            &criu_root,
            &mut guard,
        );

        drop(guard);
        let _ = std::fs::remove_dir(&criu_root);
        result
    }

    fn restore_with_root(
        &self,
        inner: &mut Inner,
        process: &mut Process,
        opts: &CriuOpts,
        image_dir: &std::fs::File,
        criu_root: &Path,
        guard: &mut UnmountGuard,
    ) -> Result<()> {
        let mut rpc_opts = rpc::CriuOpts {
            images_dir_fd: image_dir.as_raw_fd(),
            evasive_devices: Some(true),
            log_level: Some(4),
            log_file: Some("restore.log".into()),
            rst_sibling: Some(true),
            root: Some(criu_root.to_string_lossy().into_owned()),
            manage_cgroups: Some(true),
            notify_scripts: Some(true),
            shell_job: Some(opts.shell_job),
            ext_unix_sk: Some(opts.external_unix_connections),
            tcp_established: Some(opts.tcp_established),
            tcp_skip_in_flight: Some(opts.tcp_skip_in_flight),
            file_locks: Some(opts.file_locks),
            empty_ns: Some(opts.empty_ns),
            orphan_pts_master: Some(true),
            auto_dedup: Some(opts.auto_dedup),
            lazy_pages: Some(opts.lazy_pages),
            ..Default::default()
        };

        if let Some(profile) = &opts.lsm_profile {
            self.check_criu_version(inner, VERSION_LSM)
                .map_err(|_| Error::FeatureMissing("LsmProfile"))?;
            rpc_opts.lsm_profile = Some(profile.clone());
        }
        if let Some(context) = &opts.lsm_mount_context {
            self.check_criu_version(inner, VERSION_LSM)
                .map_err(|_| Error::FeatureMissing("LsmMountContext"))?;
            rpc_opts.lsm_mount_context = Some(context.clone());
        }

        let _work_dir = self.open_work_dir(opts, &mut rpc_opts)?;
        self.criu_configuration_file(inner, &mut rpc_opts);

        let mut extra_files = Vec::new();
        self.restore_namespaces(inner, &mut rpc_opts, &mut extra_files)?;
        self.prepare_restore_mounts(inner, &mut guard.targets)?;
        self.add_restore_mounts(inner, &mut rpc_opts)?;

        if opts.empty_ns & (libc::CLONE_NEWNET as u32) == 0 {
            self.restore_network(inner, opts, &mut rpc_opts);
        }

        if let Some(mode) = opts.manage_cgroups_mode {
            rpc_opts.manage_cgroups_mode = Some(mode as i32);
        }

        // Descriptors that were pipes at dump time are inherited by
        // position from the restoring process.
        let descriptors: Vec<String> = serde_json::from_slice(&std::fs::read(
            opts.images_directory.join(DESCRIPTORS_FILENAME),
        )?)?;
        for (i, name) in descriptors.iter().enumerate() {
            if name.contains("pipe:") {
                rpc_opts.inherit_fd.push(rpc::InheritFd {
                    key: name.clone(),
                    fd: i as i32,
                });
            }
        }

        let mut req = rpc::CriuReq {
            r#type: rpc::CriuReqType::Restore as i32,
            opts: Some(rpc_opts),
            ..Default::default()
        };
        self.criu_swrk(inner, Some(process), &mut req, Some(opts), extra_files)
    }

    // ------------------------------------------------------------------
    // Version and feature gates
    // ------------------------------------------------------------------

    /// Ensure the helper is at least `min`. The version is fetched once
    /// per container via the VERSION RPC and cached.
    pub(crate) fn check_criu_version(&self, inner: &mut Inner, min: u32) -> Result<()> {
        if inner.criu_version == 0 {
            let mut req = rpc::CriuReq {
                r#type: rpc::CriuReqType::Version as i32,
                ..Default::default()
            };
            self.criu_swrk(inner, None, &mut req, None, Vec::new())
                .map_err(|e| Error::Codec(format!("CRIU version check failed: {e}")))?;
            if inner.criu_version == 0 {
                return Err(Error::Codec(
                    "CRIU version check failed: helper reported no version".into(),
                ));
            }
        }
        if inner.criu_version < min {
            return Err(Error::VersionTooOld {
                found: inner.criu_version,
                required: min,
            });
        }
        Ok(())
    }

    /// Ask the helper which of the required features it has; any
    /// required-but-absent feature fails the call.
    fn check_criu_features(
        &self,
        inner: &mut Inner,
        rpc_opts: &rpc::CriuOpts,
        required: rpc::CriuFeatures,
    ) -> Result<()> {
        // Make sure the comparison cannot see a stale response.
        inner.criu_features = None;
        let mut req = rpc::CriuReq {
            r#type: rpc::CriuReqType::FeatureCheck as i32,
            // Helpers before 2.12 segfault on an absent opts field.
            opts: Some(rpc_opts.clone()),
            features: Some(required),
            ..Default::default()
        };
        self.criu_swrk(inner, None, &mut req, None, Vec::new())
            .map_err(|e| Error::Codec(format!("CRIU feature check failed: {e}")))?;
        let supported = inner
            .criu_features
            .ok_or(Error::FeatureMissing("feature response"))?;

        if required.mem_track == Some(true) && supported.mem_track != Some(true) {
            return Err(Error::FeatureMissing("MemTrack"));
        }
        if required.lazy_pages == Some(true) && supported.lazy_pages != Some(true) {
            return Err(Error::FeatureMissing("LazyPages"));
        }
        Ok(())
    }

    fn criu_supports_ext_ns(&self, inner: &mut Inner, t: NamespaceType) -> bool {
        let min = match t {
            NamespaceType::Net => VERSION_EXTERNAL_NET_NS,
            NamespaceType::Pid => VERSION_EXTERNAL_PID_NS,
            _ => return false,
        };
        self.check_criu_version(inner, min).is_ok()
    }

    // ------------------------------------------------------------------
    // Option assembly
    // ------------------------------------------------------------------

    /// The `org.criu.config` label selects a container-specific helper
    /// configuration file; an empty value disables the default one.
    fn criu_configuration_file(&self, inner: &Inner, rpc_opts: &mut rpc::CriuOpts) {
        match inner.config.label("org.criu.config") {
            Some("") => {}
            Some(path) => rpc_opts.config_file = Some(path.to_string()),
            None => rpc_opts.config_file = Some("/etc/criu/corral.conf".into()),
        }
    }

    fn open_work_dir(
        &self,
        opts: &CriuOpts,
        rpc_opts: &mut rpc::CriuOpts,
    ) -> Result<Option<std::fs::File>> {
        let Some(work_directory) = &opts.work_directory else {
            return Ok(None);
        };
        mkdir_private(work_directory)?;
        let work_dir = std::fs::File::open(work_directory)?;
        rpc_opts.work_dir_fd = Some(work_dir.as_raw_fd());
        Ok(Some(work_dir))
    }

    fn checkpoint_external_ns(
        &self,
        inner: &mut Inner,
        rpc_opts: &mut rpc::CriuOpts,
        t: NamespaceType,
    ) -> Result<()> {
        if !self.criu_supports_ext_ns(inner, t) {
            return Ok(());
        }
        let Some(ns_path) = inner.config.namespaces.path_of(t).map(String::from) else {
            return Ok(());
        };
        // The helper records externals as <type>[<inode>]:<key>.
        let st = nix::sys::stat::stat(Path::new(&ns_path))
            .map_err(|e| Error::syscall("stat namespace path", e))?;
        rpc_opts
            .external
            .push(format!("{}[{}]:{}", t.name(), st.st_ino, ext_ns_key(t)));
        Ok(())
    }

    fn restore_namespaces(
        &self,
        inner: &mut Inner,
        rpc_opts: &mut rpc::CriuOpts,
        extra_files: &mut Vec<OwnedFd>,
    ) -> Result<()> {
        let namespaces = inner.config.namespaces.0.clone();
        for ns in namespaces {
            let Some(path) = ns.path.clone().filter(|p| !p.is_empty()) else {
                continue;
            };
            match ns.ns_type {
                NamespaceType::Net | NamespaceType::Pid => {
                    if !self.criu_supports_ext_ns(inner, ns.ns_type) {
                        continue;
                    }
                    // The key must match the one recorded at dump time;
                    // the fd lands after stdio and the swrk socket.
                    let ns_file = std::fs::File::open(&path).map_err(|e| {
                        Error::InvalidConfig(format!(
                            "requested namespace {path} does not exist: {e}"
                        ))
                    })?;
                    rpc_opts.inherit_fd.push(rpc::InheritFd {
                        key: ext_ns_key(ns.ns_type).to_string(),
                        fd: 4 + extra_files.len() as i32,
                    });
                    extra_files.push(OwnedFd::from(ns_file));
                }
                NamespaceType::Cgroup => {
                    // The helper has no code to join cgroup namespaces.
                    return Err(Error::InvalidConfig(
                        "do not know how to handle cgroup namespace on restore".into(),
                    ));
                }
                _ => {
                    rpc_opts.join_ns.push(rpc::JoinNamespace {
                        ns: ns.ns_type.name().to_string(),
                        ns_file: path,
                        extra_opt: None,
                    });
                }
            }
        }
        Ok(())
    }

    /// Set up the rootfs the same way initial creation does, except
    /// that mount points under a tmpfs are skipped (the helper restores
    /// tmpfs contents wholesale). Bind mounts are pre-mounted and
    /// recorded for detached unmount when the attempt ends.
    fn prepare_restore_mounts(
        &self,
        inner: &Inner,
        umounts: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let rootfs = PathBuf::from(&inner.config.rootfs);
        let tmpfs: Vec<&str> = inner
            .config
            .mounts
            .iter()
            .filter(|m| m.device == "tmpfs")
            .map(|m| m.destination.as_str())
            .collect();

        for m in &inner.config.mounts {
            if tmpfs
                .iter()
                .any(|prefix| m.destination.starts_with(&format!("{prefix}/")))
            {
                continue;
            }
            if m.device == "cgroup" {
                // Mount points are either restored from the image (v1,
                // tmpfs-backed) or appear with /sys (v2).
                continue;
            }
            inner.mounts.prepare_mountpoint(m, &rootfs)?;
            if m.device == "bind" {
                let dest = join_rootfs(&rootfs, &m.destination);
                mount(
                    Some(Path::new(&m.source)),
                    &dest,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REC,
                    None::<&str>,
                )
                .map_err(|e| Error::syscall("bind mount for restore", e))?;
                umounts.push(dest);
            }
        }
        Ok(())
    }

    fn mount_dest<'a>(&self, inner: &Inner, dest: &'a str) -> &'a str {
        dest.strip_prefix(inner.config.rootfs.as_str()).unwrap_or(dest)
    }

    fn add_checkpoint_mounts(
        &self,
        inner: &Inner,
        rpc_opts: &mut rpc::CriuOpts,
        init_pid: Pid,
    ) -> Result<()> {
        let has_cgroupns = inner.config.namespaces.contains(NamespaceType::Cgroup);
        for m in &inner.config.mounts {
            match m.device.as_str() {
                "bind" => {
                    let dest = self.mount_dest(inner, &m.destination).to_string();
                    rpc_opts.ext_mnt.push(rpc::ExtMountMap {
                        key: dest.clone(),
                        val: dest,
                    });
                }
                "cgroup" => {
                    if inner.cgroup.is_cgroup2() || has_cgroupns {
                        // Real mounts, nothing external about them.
                        continue;
                    }
                    // v1 without cgroupns is a set of per-subsystem
                    // bind mounts.
                    for dest in self.cgroup_bind_destinations(inner, &m.destination) {
                        rpc_opts.ext_mnt.push(rpc::ExtMountMap {
                            key: dest.clone(),
                            val: dest,
                        });
                    }
                }
                _ => {}
            }
        }

        // Masked paths that resolve to non-directories were replaced
        // with /dev/null bind mounts at creation.
        for path in &inner.config.mask_paths {
            let proc_path = format!(
                "/proc/{}/root/{}",
                init_pid,
                path.trim_start_matches('/')
            );
            let meta = match std::fs::metadata(&proc_path) {
                Ok(meta) => meta,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if meta.is_dir() {
                continue;
            }
            rpc_opts.ext_mnt.push(rpc::ExtMountMap {
                key: path.clone(),
                val: "/dev/null".into(),
            });
        }

        for node in &inner.config.devices {
            rpc_opts.ext_mnt.push(rpc::ExtMountMap {
                key: node.path.clone(),
                val: node.path.clone(),
            });
        }
        Ok(())
    }

    fn add_restore_mounts(&self, inner: &Inner, rpc_opts: &mut rpc::CriuOpts) -> Result<()> {
        let has_cgroupns = inner.config.namespaces.contains(NamespaceType::Cgroup);
        for m in &inner.config.mounts {
            match m.device.as_str() {
                "bind" => {
                    rpc_opts.ext_mnt.push(rpc::ExtMountMap {
                        key: self.mount_dest(inner, &m.destination).to_string(),
                        val: m.source.clone(),
                    });
                }
                "cgroup" => {
                    if inner.cgroup.is_cgroup2() || has_cgroupns {
                        continue;
                    }
                    for dest in self.cgroup_bind_destinations(inner, &m.destination) {
                        rpc_opts.ext_mnt.push(rpc::ExtMountMap {
                            key: dest.clone(),
                            val: dest,
                        });
                    }
                }
                _ => {}
            }
        }

        if !inner.config.mask_paths.is_empty() {
            rpc_opts.ext_mnt.push(rpc::ExtMountMap {
                key: "/dev/null".into(),
                val: "/dev/null".into(),
            });
        }

        for node in &inner.config.devices {
            rpc_opts.ext_mnt.push(rpc::ExtMountMap {
                key: node.path.clone(),
                val: node.path.clone(),
            });
        }
        Ok(())
    }

    /// Expand a v1 `cgroup` mount into its per-subsystem bind targets.
    fn cgroup_bind_destinations(&self, inner: &Inner, destination: &str) -> Vec<String> {
        let mut dests: Vec<String> = inner
            .cgroup
            .get_paths()
            .keys()
            .filter(|subsystem| !subsystem.is_empty())
            .flat_map(|subsystem| subsystem.split(','))
            .map(|subsystem| format!("{destination}/{subsystem}"))
            .collect();
        dests.sort();
        dests.dedup();
        dests
    }

    fn restore_network(
        &self,
        inner: &Inner,
        opts: &CriuOpts,
        rpc_opts: &mut rpc::CriuOpts,
    ) {
        for iface in &inner.config.networks {
            if iface.net_type == "veth" {
                rpc_opts.veths.push(rpc::CriuVethPair {
                    if_in: iface.name.clone(),
                    if_out: iface.host_interface_name.clone(),
                });
            }
        }
        for pair in &opts.veth_pairs {
            rpc_opts.veths.push(rpc::CriuVethPair {
                if_in: pair.container_interface_name.clone(),
                if_out: pair.host_interface_name.clone(),
            });
        }
    }

    // ------------------------------------------------------------------
    // The swrk conversation
    // ------------------------------------------------------------------

    /// Cgroups must exist before the helper re-creates processes into
    /// them; for v1 the controller roots are forwarded explicitly.
    fn criu_apply_cgroups(
        &self,
        inner: &mut Inner,
        pid: Pid,
        req: &mut rpc::CriuReq,
    ) -> Result<()> {
        if req.r#type != rpc::CriuReqType::Restore as i32 {
            return Ok(());
        }
        inner.cgroup.apply(pid)?;
        inner.cgroup.set(&inner.config.cgroups.resources)?;

        if inner.cgroup.is_cgroup2() {
            return Ok(());
        }
        let paths =
            sys::parse_cgroup_file(Path::new(&format!("/proc/{pid}/cgroup")))?;
        if let Some(opts) = req.opts.as_mut() {
            for (ctrl, path) in paths {
                if ctrl.is_empty() {
                    continue;
                }
                opts.cg_root.push(rpc::CgroupRoot {
                    ctrl: Some(ctrl),
                    path,
                });
            }
        }
        Ok(())
    }

    fn criu_swrk(
        &self,
        inner: &mut Inner,
        process: Option<&mut Process>,
        req: &mut rpc::CriuReq,
        opts: Option<&CriuOpts>,
        extra_files: Vec<OwnedFd>,
    ) -> Result<()> {
        let (client, server) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| Error::syscall("socketpair", e))?;

        let log_path = match (opts, req.opts.as_ref()) {
            (Some(opts), Some(rpc_opts)) => opts
                .work_directory
                .clone()
                .unwrap_or_default()
                .join(rpc_opts.log_file.clone().unwrap_or_default())
                .to_string_lossy()
                .into_owned(),
            // The version RPC runs without options; no log to point at.
            _ => String::new(),
        };

        let mut process = process;
        let mut cmd = Command::new(criu_binary());
        cmd.arg("swrk").arg("3");
        match process.as_deref_mut() {
            Some(p) => {
                cmd.stdin(p.stdin.take().unwrap_or_else(Stdio::inherit));
                cmd.stdout(p.stdout.take().unwrap_or_else(Stdio::inherit));
                cmd.stderr(p.stderr.take().unwrap_or_else(Stdio::inherit));
            }
            None => {
                cmd.stdin(Stdio::null());
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }
        // The server socket lands at fd 3, extra files from fd 4 up.
        let mut raws: Vec<RawFd> = vec![server.as_raw_fd()];
        raws.extend(extra_files.iter().map(AsRawFd::as_raw_fd));
        unsafe {
            cmd.pre_exec(move || remap_fds(&mut raws));
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ChildFailure(format!("cannot spawn criu: {e}")))?;
        // Closing our server copy makes helper death observable as EOF.
        drop(server);
        let criu_pid = Pid::from_raw(child.id() as i32);

        let result =
            self.swrk_conversation(inner, &client, criu_pid, process, req, opts, &log_path);

        // The helper owns its copies now.
        drop(extra_files);

        let _ = nix::sys::socket::shutdown(
            client.as_raw_fd(),
            nix::sys::socket::Shutdown::Write,
        );
        let status = child
            .wait()
            .map_err(|e| Error::ChildFailure(format!("wait on criu: {e}")))?;
        result?;

        // After a successful PRE_DUMP the helper keeps waiting for the
        // final DUMP; it is killed on purpose, so a non-zero exit is
        // expected there.
        if !status.success() && req.r#type != rpc::CriuReqType::PreDump as i32 {
            return Err(Error::ChildFailure(format!(
                "criu failed: {status}, log file: {log_path}"
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn swrk_conversation(
        &self,
        inner: &mut Inner,
        client: &OwnedFd,
        criu_pid: Pid,
        process: Option<&mut Process>,
        req: &mut rpc::CriuReq,
        opts: Option<&CriuOpts>,
        log_path: &str,
    ) -> Result<()> {
        self.criu_apply_cgroups(inner, criu_pid, req)?;

        let ext_fds = if process.is_some() {
            sys::pipe_fds(criu_pid)?
        } else {
            Vec::new()
        };
        let mut ctx = SwrkContext {
            process,
            opts,
            ext_fds,
            log_path: log_path.to_string(),
            status_fd: opts.map(|o| o.status_fd).filter(|fd| *fd != -1),
            rpc_status_fd: req.opts.as_ref().and_then(|o| o.status_fd),
        };
        self.rpc_exchange(inner, client, req, &mut ctx)
    }

    /// Send the request and process responses until the terminal one.
    /// NOTIFY responses invoke their handlers and are acknowledged so
    /// the helper proceeds.
    pub(crate) fn rpc_exchange(
        &self,
        inner: &mut Inner,
        client: &OwnedFd,
        req: &rpc::CriuReq,
        ctx: &mut SwrkContext<'_>,
    ) -> Result<()> {
        let req_name = rpc::CriuReqType::try_from(req.r#type)
            .map(|t| t.name())
            .unwrap_or("UNKNOWN");

        nix::unistd::write(client, &req.encode_to_vec())
            .map_err(|e| Error::syscall("write criu request", e))?;

        let mut buf = vec![0u8; 10 * 4096];
        loop {
            let mut received_fds: Vec<RawFd> = Vec::new();
            let n = {
                let mut iov = [IoSliceMut::new(&mut buf)];
                let mut cmsg_space = nix::cmsg_space!([RawFd; 2]);
                let msg = recvmsg::<UnixAddr>(
                    client.as_raw_fd(),
                    &mut iov,
                    Some(&mut cmsg_space),
                    MsgFlags::empty(),
                )
                .map_err(|e| Error::syscall("read criu response", e))?;
                for cmsg in msg.cmsgs().into_iter().flatten() {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        received_fds.extend(fds);
                    }
                }
                msg.bytes
            };

            // Release anyone blocked on the status fd as soon as the
            // helper has spoken once; it has reopened the fd by now.
            if let Some(fd) = ctx.rpc_status_fd.take() {
                unsafe { libc::close(fd) };
            }

            if n == 0 {
                return Err(Error::Codec("unexpected EOF from criu".into()));
            }
            if n == buf.len() {
                return Err(Error::Codec("criu response buffer is too small".into()));
            }

            let resp = rpc::CriuResp::decode(&buf[..n])?;
            if !resp.success {
                return Err(Error::HelperFailure {
                    req_type: req_name,
                    errno: resp.cr_errno.unwrap_or(0),
                    log_path: ctx.log_path.clone(),
                });
            }

            match rpc::CriuReqType::try_from(resp.r#type) {
                Ok(rpc::CriuReqType::Version) => {
                    if let Some(version) = &resp.version {
                        inner.criu_version = version.number();
                        tracing::debug!(version = inner.criu_version, "using criu");
                    }
                    return Ok(());
                }
                Ok(rpc::CriuReqType::FeatureCheck) => {
                    inner.criu_features = resp.features;
                    return Ok(());
                }
                Ok(rpc::CriuReqType::Notify) => {
                    self.handle_notification(inner, ctx, &resp, &received_fds)?;
                    let ack = rpc::CriuReq {
                        r#type: rpc::CriuReqType::Notify as i32,
                        notify_success: Some(true),
                        ..Default::default()
                    };
                    nix::unistd::write(client, &ack.encode_to_vec())
                        .map_err(|e| Error::syscall("write notify ack", e))?;
                    continue;
                }
                Ok(rpc::CriuReqType::Restore)
                | Ok(rpc::CriuReqType::Dump)
                | Ok(rpc::CriuReqType::PreDump) => return Ok(()),
                _ => {
                    return Err(Error::Codec(format!(
                        "unable to parse criu response type {}",
                        resp.r#type
                    )));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn handle_notification(
        &self,
        inner: &mut Inner,
        ctx: &mut SwrkContext<'_>,
        resp: &rpc::CriuResp,
        received_fds: &[RawFd],
    ) -> Result<()> {
        let notify = resp
            .notify
            .as_ref()
            .ok_or_else(|| Error::Codec("notify response without payload".into()))?;
        let script = notify.script.as_deref().unwrap_or("");
        tracing::debug!(script, "criu notification");
        match script {
            "post-dump" => {
                std::fs::File::create(self.root.join(CHECKPOINT_MARKER))?;
            }
            "network-lock" => self.each_network(inner, |strategy, net| strategy.detach(net))?,
            "network-unlock" => {
                self.each_network(inner, |strategy, net| strategy.attach(net))?
            }
            "setup-namespaces" => {
                if inner.config.has_hooks {
                    if let Some(hooks) = inner.hooks.take() {
                        let result = self.current_oci_state(inner).and_then(|mut oci| {
                            oci.pid = notify.pid;
                            hooks.run(HookKind::Prestart, &oci)?;
                            hooks.run(HookKind::CreateRuntime, &oci)
                        });
                        inner.hooks = Some(hooks);
                        result?;
                    }
                }
            }
            "post-restore" => self.handle_post_restore(inner, ctx, notify)?,
            "orphan-pts-master" => {
                let &master = received_fds.first().ok_or_else(|| {
                    Error::Codec("orphan-pts-master without descriptor".into())
                })?;
                let master = unsafe { OwnedFd::from_raw_fd(master) };
                let console = ctx
                    .process
                    .as_ref()
                    .and_then(|p| p.console_socket.as_ref())
                    .ok_or_else(|| {
                        Error::InvalidConfig("orphan-pts-master without console socket".into())
                    })?;
                let iov = [IoSlice::new(b"/dev/ptmx")];
                let fds = [master.as_raw_fd()];
                let cmsg = [ControlMessage::ScmRights(&fds)];
                sendmsg::<()>(
                    console.as_raw_fd(),
                    &iov,
                    &cmsg,
                    MsgFlags::empty(),
                    None,
                )
                .map_err(|e| Error::syscall("send pty master", e))?;
            }
            "status-ready" => {
                if let Some(fd) = ctx.status_fd.take() {
                    // Failures are logged only: racing a writer against
                    // a reader timeout helps nobody.
                    let n = unsafe { libc::write(fd, [0u8].as_ptr().cast(), 1) };
                    if n != 1 {
                        tracing::warn!(
                            "can't write \\0 to status fd: {}",
                            std::io::Error::last_os_error()
                        );
                    }
                    unsafe { libc::close(fd) };
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn each_network(
        &self,
        inner: &Inner,
        f: impl Fn(
            &dyn crate::managers::NetworkStrategy,
            &crate::config::Network,
        ) -> Result<()>,
    ) -> Result<()> {
        if inner.config.networks.is_empty() {
            return Ok(());
        }
        let strategy = inner.network.as_deref().ok_or_else(|| {
            Error::InvalidConfig("no network strategy configured".into())
        })?;
        for net in &inner.config.networks {
            f(strategy, net)?;
        }
        Ok(())
    }

    /// Bind the restored init to this container: new parent handle,
    /// state transition, fresh creation timestamp, persisted state, and
    /// the checkpoint marker removed.
    fn handle_post_restore(
        &self,
        inner: &mut Inner,
        ctx: &mut SwrkContext<'_>,
        notify: &rpc::CriuNotify,
    ) -> Result<()> {
        let pid = notify
            .pid
            .ok_or_else(|| Error::Codec("post-restore without pid".into()))?;
        let restored = RestoredParent::new(Pid::from_raw(pid), ctx.ext_fds.clone())?;
        inner.init_process_start_time = restored.start_time;
        inner.init_process = Some(ParentProcess::Restored(restored));

        let image_dir = ctx
            .opts
            .map(|o| o.images_directory.clone())
            .unwrap_or_default();
        inner.node.transition(StateNode::Restored { image_dir })?;
        inner.created = Utc::now();
        self.update_state(inner)?;

        if let Err(err) = std::fs::remove_file(self.root.join(CHECKPOINT_MARKER)) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::error!("cannot remove checkpoint marker: {err}");
            }
        }
        Ok(())
    }
}

fn mkdir_private(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match std::fs::DirBuilder::new().mode(0o700).create(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::container::Status;
    use crate::managers::HookKind;
    use crate::testutil::{FakeCgroup, RecordingHooks, RecordingNetwork, components};

    fn test_container(
        root: &Path,
        config: Config,
        cgroup: FakeCgroup,
        hooks: Option<RecordingHooks>,
        network: Option<RecordingNetwork>,
    ) -> Container {
        Container::new("c1", root, config, components(cgroup, hooks, network)).unwrap()
    }

    fn seqpacket_pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    /// Play the helper side of the conversation: read the request,
    /// send each canned response, expecting a NotifySuccess ack after
    /// every NOTIFY.
    fn fake_helper(
        server: OwnedFd,
        responses: Vec<rpc::CriuResp>,
    ) -> std::thread::JoinHandle<rpc::CriuReq> {
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            let n = nix::unistd::read(server.as_raw_fd(), &mut buf).unwrap();
            let req = rpc::CriuReq::decode(&buf[..n]).unwrap();
            for resp in responses {
                let is_notify = resp.r#type == rpc::CriuReqType::Notify as i32;
                nix::unistd::write(&server, &resp.encode_to_vec()).unwrap();
                if is_notify {
                    let n = nix::unistd::read(server.as_raw_fd(), &mut buf).unwrap();
                    let ack = rpc::CriuReq::decode(&buf[..n]).unwrap();
                    assert_eq!(ack.notify_success, Some(true));
                }
            }
            req
        })
    }

    fn notify_resp(script: &str, pid: Option<i32>) -> rpc::CriuResp {
        rpc::CriuResp {
            r#type: rpc::CriuReqType::Notify as i32,
            success: true,
            notify: Some(rpc::CriuNotify {
                script: Some(script.into()),
                pid,
            }),
            ..Default::default()
        }
    }

    fn terminal_resp(t: rpc::CriuReqType) -> rpc::CriuResp {
        rpc::CriuResp {
            r#type: t as i32,
            success: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_checkpoint_rejects_old_helper() {
        let tmp = tempfile::tempdir().unwrap();
        let container = test_container(
            &tmp.path().join("c1"),
            Config::default(),
            FakeCgroup::default(),
            None,
            None,
        );
        container.lock().criu_version = 20000;

        let opts = CriuOpts {
            images_directory: tmp.path().join("img"),
            ..Default::default()
        };
        let err = container.checkpoint(&opts).unwrap_err();
        assert!(matches!(
            err,
            Error::VersionTooOld {
                found: 20000,
                required: 30000
            }
        ));
        assert!(err.to_string().contains("30000"));
    }

    #[test]
    fn test_checkpoint_requires_images_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let container = test_container(
            &tmp.path().join("c1"),
            Config::default(),
            FakeCgroup::default(),
            None,
            None,
        );
        container.lock().criu_version = 31700;

        let err = container.checkpoint(&CriuOpts::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_version_response_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let container = test_container(
            &tmp.path().join("c1"),
            Config::default(),
            FakeCgroup::default(),
            None,
            None,
        );
        let (client, server) = seqpacket_pair();
        let helper = fake_helper(
            server,
            vec![rpc::CriuResp {
                r#type: rpc::CriuReqType::Version as i32,
                success: true,
                version: Some(rpc::CriuVersion {
                    major_number: 3,
                    minor_number: 17,
                    sublevel: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            }],
        );

        let mut inner = container.lock();
        let req = rpc::CriuReq {
            r#type: rpc::CriuReqType::Version as i32,
            ..Default::default()
        };
        let mut ctx = SwrkContext {
            process: None,
            opts: None,
            ext_fds: Vec::new(),
            log_path: String::new(),
            status_fd: None,
            rpc_status_fd: None,
        };
        container
            .rpc_exchange(&mut inner, &client, &req, &mut ctx)
            .unwrap();
        assert_eq!(inner.criu_version, 31701);
        helper.join().unwrap();
    }

    #[test]
    fn test_helper_failure_carries_errno_and_log() {
        let tmp = tempfile::tempdir().unwrap();
        let container = test_container(
            &tmp.path().join("c1"),
            Config::default(),
            FakeCgroup::default(),
            None,
            None,
        );
        let (client, server) = seqpacket_pair();
        let helper = fake_helper(
            server,
            vec![rpc::CriuResp {
                r#type: rpc::CriuReqType::Dump as i32,
                success: false,
                cr_errno: Some(12),
                ..Default::default()
            }],
        );

        let mut inner = container.lock();
        let req = rpc::CriuReq {
            r#type: rpc::CriuReqType::Dump as i32,
            ..Default::default()
        };
        let mut ctx = SwrkContext {
            process: None,
            opts: None,
            ext_fds: Vec::new(),
            log_path: "/work/dump.log".into(),
            status_fd: None,
            rpc_status_fd: None,
        };
        let err = container
            .rpc_exchange(&mut inner, &client, &req, &mut ctx)
            .unwrap_err();
        match err {
            Error::HelperFailure {
                req_type,
                errno,
                log_path,
            } => {
                assert_eq!(req_type, "DUMP");
                assert_eq!(errno, 12);
                assert_eq!(log_path, "/work/dump.log");
            }
            other => panic!("unexpected error: {other}"),
        }
        helper.join().unwrap();
    }

    #[test]
    fn test_restore_notification_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        let hooks = RecordingHooks::default();
        let config = Config {
            labels: vec!["bundle=/run/bundle".into()],
            has_hooks: true,
            ..Default::default()
        };
        let container = test_container(
            &tmp.path().join("c1"),
            config,
            FakeCgroup::default(),
            Some(hooks.clone()),
            None,
        );
        // A live process stands in for the restored init.
        let mut sleeper = crate::testutil::spawn_sleeper();
        let pid = sleeper.id() as i32;

        // Leftover marker from the dump that produced this image.
        std::fs::File::create(container.root().join(CHECKPOINT_MARKER)).unwrap();

        let (client, server) = seqpacket_pair();
        let helper = fake_helper(
            server,
            vec![
                notify_resp("setup-namespaces", Some(pid)),
                notify_resp("post-restore", Some(pid)),
                terminal_resp(rpc::CriuReqType::Restore),
            ],
        );

        let opts = CriuOpts {
            images_directory: tmp.path().join("img"),
            ..Default::default()
        };
        let req = rpc::CriuReq {
            r#type: rpc::CriuReqType::Restore as i32,
            ..Default::default()
        };
        {
            let mut inner = container.lock();
            let mut ctx = SwrkContext {
                process: None,
                opts: Some(&opts),
                ext_fds: vec!["pipe:[100]".into(), "pipe:[101]".into(), "pipe:[102]".into()],
                log_path: String::new(),
                status_fd: None,
                rpc_status_fd: None,
            };
            container
                .rpc_exchange(&mut inner, &client, &req, &mut ctx)
                .unwrap();
        }
        helper.join().unwrap();

        // Hooks ran once each, with the restored pid.
        let calls = hooks.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                (HookKind::Prestart, Some(pid)),
                (HookKind::CreateRuntime, Some(pid)),
            ]
        );

        // The container now tracks the restored init and persisted it.
        assert_eq!(container.status().unwrap(), Status::Running);
        let state = container.state().unwrap();
        assert_eq!(state.init_process_pid, pid);
        assert_eq!(
            state.external_descriptors,
            vec!["pipe:[100]", "pipe:[101]", "pipe:[102]"]
        );
        let on_disk: serde_json::Value = serde_json::from_slice(
            &std::fs::read(container.root().join("state.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk["init_process_pid"], pid);

        // The marker is gone after a successful restore.
        assert!(!container.root().join(CHECKPOINT_MARKER).exists());

        let _ = sleeper.kill();
        let _ = sleeper.wait();
    }

    #[test]
    fn test_network_lock_unlock_notifications() {
        let tmp = tempfile::tempdir().unwrap();
        let network = RecordingNetwork::default();
        let config = Config {
            networks: vec![crate::config::Network {
                net_type: "veth".into(),
                name: "eth0".into(),
                host_interface_name: "veth1".into(),
            }],
            ..Default::default()
        };
        let container = test_container(
            &tmp.path().join("c1"),
            config,
            FakeCgroup::default(),
            None,
            Some(network.clone()),
        );

        let (client, server) = seqpacket_pair();
        let helper = fake_helper(
            server,
            vec![
                notify_resp("network-lock", None),
                notify_resp("network-unlock", None),
                terminal_resp(rpc::CriuReqType::Dump),
            ],
        );

        let mut inner = container.lock();
        let req = rpc::CriuReq {
            r#type: rpc::CriuReqType::Dump as i32,
            ..Default::default()
        };
        let mut ctx = SwrkContext {
            process: None,
            opts: None,
            ext_fds: Vec::new(),
            log_path: String::new(),
            status_fd: None,
            rpc_status_fd: None,
        };
        container
            .rpc_exchange(&mut inner, &client, &req, &mut ctx)
            .unwrap();
        helper.join().unwrap();

        assert_eq!(*network.detached.lock().unwrap(), vec!["eth0"]);
        assert_eq!(*network.attached.lock().unwrap(), vec!["eth0"]);
    }

    #[test]
    fn test_post_dump_creates_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let container = test_container(
            &tmp.path().join("c1"),
            Config::default(),
            FakeCgroup::default(),
            None,
            None,
        );

        let (client, server) = seqpacket_pair();
        let helper = fake_helper(
            server,
            vec![
                notify_resp("post-dump", None),
                terminal_resp(rpc::CriuReqType::Dump),
            ],
        );

        let mut inner = container.lock();
        let req = rpc::CriuReq {
            r#type: rpc::CriuReqType::Dump as i32,
            ..Default::default()
        };
        let mut ctx = SwrkContext {
            process: None,
            opts: None,
            ext_fds: Vec::new(),
            log_path: String::new(),
            status_fd: None,
            rpc_status_fd: None,
        };
        container
            .rpc_exchange(&mut inner, &client, &req, &mut ctx)
            .unwrap();
        helper.join().unwrap();

        assert!(container.root().join(CHECKPOINT_MARKER).exists());
    }

    #[test]
    fn test_status_ready_writes_nul() {
        let tmp = tempfile::tempdir().unwrap();
        let container = test_container(
            &tmp.path().join("c1"),
            Config::default(),
            FakeCgroup::default(),
            None,
            None,
        );

        let (read_end, write_end) =
            nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();

        let (client, server) = seqpacket_pair();
        let helper = fake_helper(
            server,
            vec![
                notify_resp("status-ready", None),
                terminal_resp(rpc::CriuReqType::Dump),
            ],
        );

        let mut inner = container.lock();
        let req = rpc::CriuReq {
            r#type: rpc::CriuReqType::Dump as i32,
            ..Default::default()
        };
        // The context owns the raw fd from here on.
        let status_fd = write_end.as_raw_fd();
        std::mem::forget(write_end);
        let mut ctx = SwrkContext {
            process: None,
            opts: None,
            ext_fds: Vec::new(),
            log_path: String::new(),
            status_fd: Some(status_fd),
            rpc_status_fd: None,
        };
        container
            .rpc_exchange(&mut inner, &client, &req, &mut ctx)
            .unwrap();
        helper.join().unwrap();

        let mut buf = [0u8; 8];
        let n = nix::unistd::read(read_end.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0]);
        // The fd was closed by the handler; EOF follows.
        let n = nix::unistd::read(read_end.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_restore_rejects_cgroup_namespace() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            namespaces: crate::config::Namespaces(vec![crate::config::Namespace {
                ns_type: NamespaceType::Cgroup,
                path: Some("/proc/1/ns/cgroup".into()),
            }]),
            ..Default::default()
        };
        let container = test_container(
            &tmp.path().join("c1"),
            config,
            FakeCgroup::default(),
            None,
            None,
        );
        let mut inner = container.lock();
        inner.criu_version = 31700;
        let mut rpc_opts = rpc::CriuOpts::default();
        let mut extra = Vec::new();
        let err = container
            .restore_namespaces(&mut inner, &mut rpc_opts, &mut extra)
            .unwrap_err();
        assert!(err.to_string().contains("cgroup namespace"));
    }

    #[test]
    fn test_ext_ns_key_casing() {
        assert_eq!(ext_ns_key(NamespaceType::Net), "extRootNetNS");
        assert_eq!(ext_ns_key(NamespaceType::Pid), "extRootPidNS");
    }

    #[test]
    fn test_configuration_file_label_handling() {
        let tmp = tempfile::tempdir().unwrap();

        // No label: the packaged default is used.
        let container = test_container(
            &tmp.path().join("a"),
            Config::default(),
            FakeCgroup::default(),
            None,
            None,
        );
        let mut rpc_opts = rpc::CriuOpts::default();
        container.criu_configuration_file(&container.lock(), &mut rpc_opts);
        assert_eq!(rpc_opts.config_file.as_deref(), Some("/etc/criu/corral.conf"));

        // Explicit label wins.
        let config = Config {
            labels: vec!["org.criu.config=/etc/criu/c1.conf".into()],
            ..Default::default()
        };
        let container = test_container(
            &tmp.path().join("b"),
            config,
            FakeCgroup::default(),
            None,
            None,
        );
        let mut rpc_opts = rpc::CriuOpts::default();
        container.criu_configuration_file(&container.lock(), &mut rpc_opts);
        assert_eq!(rpc_opts.config_file.as_deref(), Some("/etc/criu/c1.conf"));

        // Empty label disables configuration files entirely.
        let config = Config {
            labels: vec!["org.criu.config=".into()],
            ..Default::default()
        };
        let container = test_container(
            &tmp.path().join("c"),
            config,
            FakeCgroup::default(),
            None,
            None,
        );
        let mut rpc_opts = rpc::CriuOpts::default();
        container.criu_configuration_file(&container.lock(), &mut rpc_opts);
        assert_eq!(rpc_opts.config_file, None);
    }
}
