//! Container core: the authoritative in-memory model of one container
//! and its public lifecycle API.
//!
//! Every operation serializes on a single mutex. The persisted state
//! document and the in-memory state node are kept consistent by
//! re-deriving status from syscall-observable signals before each
//! status-dependent decision.

mod fifo;
mod status;

pub use status::Status;
pub(crate) use status::StateNode;

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
use nix::unistd::Pid;
use serde::Serialize;

use crate::bootstrap;
use crate::config::{Config, FreezerState, NamespaceType, Process};
use crate::criu::rpc;
use crate::error::{Error, Result, ignore_terminate_errors};
use crate::managers::{
    CgroupStats, Components, HookKind, IntelRdtStats, InterfaceStats,
};
use crate::notify::{self, PressureLevel};
use crate::process::{
    InitParent, InitType, ParentProcess, SetnsParent, StubCommand,
    should_send_mount_sources,
};
use crate::process::command::{
    ENV_CONSOLE, ENV_FIFO_FD, ENV_INIT_PIPE, ENV_LOG_PIPE, ENV_MOUNT_FDS,
};
use crate::state::{self, OCI_VERSION, OciState, State};
use crate::sys;

/// Statistics snapshot across the container's managers.
#[derive(Debug, Default, Serialize)]
pub struct Stats {
    pub cgroup: CgroupStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intel_rdt: Option<IntelRdtStats>,
    pub interfaces: Vec<InterfaceStats>,
}

/// A single container instance.
pub struct Container {
    pub(crate) id: String,
    pub(crate) root: PathBuf,
    pub(crate) inner: Mutex<Inner>,
}

/// Mutable container state, guarded by the public-API mutex.
pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) cgroup: Box<dyn crate::managers::CgroupManager>,
    pub(crate) intel_rdt: Option<Box<dyn crate::managers::IntelRdtManager>>,
    pub(crate) hooks: Option<Box<dyn crate::managers::HookRunner>>,
    pub(crate) network: Option<Box<dyn crate::managers::NetworkStrategy>>,
    pub(crate) iface_stats: Option<Box<dyn crate::managers::InterfaceStatsReader>>,
    pub(crate) mounts: Box<dyn crate::managers::MountPreparer>,
    pub(crate) init_process: Option<ParentProcess>,
    pub(crate) init_process_start_time: u64,
    pub(crate) node: StateNode,
    pub(crate) created: DateTime<Utc>,
    /// Path-only fd to the exec fifo, held from Start to the moment the
    /// stub has inherited its copy.
    pub(crate) fifo: Option<OwnedFd>,
    /// Cached helper version; 0 until the first version handshake.
    pub(crate) criu_version: u32,
    /// Features reported by the last FEATURE_CHECK; overwritten by each
    /// check.
    pub(crate) criu_features: Option<rpc::CriuFeatures>,
}

impl Container {
    /// Create the in-memory model for a container rooted at `root`.
    /// The directory holds the state document and the exec fifo and is
    /// created if missing.
    pub fn new(
        id: impl Into<String>,
        root: impl Into<PathBuf>,
        config: Config,
        components: Components,
    ) -> Result<Self> {
        let id = id.into();
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            id,
            root,
            inner: Mutex::new(Inner {
                config,
                cgroup: components.cgroup,
                intel_rdt: components.intel_rdt,
                hooks: components.hooks,
                network: components.network,
                iface_stats: components.iface_stats,
                mounts: components.mounts,
                init_process: None,
                init_process_start_time: 0,
                node: StateNode::Stopped,
                created: Utc::now(),
                fifo: None,
                criu_version: 0,
                criu_features: None,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the state document persisted under a container root,
    /// tolerating its absence. For out-of-process consumers.
    pub fn saved_state(root: &Path) -> Result<Option<State>> {
        state::load(root)
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Config {
        self.lock().config.clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Current status, re-derived from the kernel's view.
    pub fn status(&self) -> Result<Status> {
        let mut inner = self.lock();
        self.refresh_state(&mut inner)?;
        Ok(inner.node.status())
    }

    /// Full state document, including synthesized namespace paths.
    pub fn state(&self) -> Result<State> {
        let inner = self.lock();
        Ok(self.current_state(&inner))
    }

    /// OCI-shaped status view.
    pub fn oci_state(&self) -> Result<OciState> {
        let mut inner = self.lock();
        self.current_oci_state(&mut inner)
    }

    /// All pids inside the container's cgroup, in the host pid
    /// namespace. Empty when the container stopped and systemd already
    /// removed the cgroup.
    pub fn processes(&self) -> Result<Vec<Pid>> {
        let mut inner = self.lock();
        self.refresh_state(&mut inner)?;
        if inner.node.status() == Status::Stopped && !inner.cgroup.exists() {
            return Ok(Vec::new());
        }
        inner
            .cgroup
            .get_all_pids()
            .map_err(|e| Error::Manager(format!("unable to get all container pids: {e}")))
    }

    /// Cgroup, Intel RDT, and per-veth interface statistics.
    pub fn stats(&self) -> Result<Stats> {
        let inner = self.lock();
        let mut stats = Stats {
            cgroup: inner
                .cgroup
                .get_stats()
                .map_err(|e| Error::Manager(format!("unable to get cgroup stats: {e}")))?,
            ..Default::default()
        };
        if let Some(rdt) = &inner.intel_rdt {
            stats.intel_rdt = Some(rdt.get_stats()?);
        }
        if let Some(reader) = &inner.iface_stats {
            for net in &inner.config.networks {
                if net.net_type == "veth" {
                    stats.interfaces.push(reader.stats(&net.host_interface_name)?);
                }
            }
        }
        Ok(stats)
    }

    /// Replace the effective resources. On partial failure the previous
    /// resources are restored best-effort and the original error is
    /// returned.
    pub fn set(&self, config: Config) -> Result<()> {
        let mut inner = self.lock();
        self.refresh_state(&mut inner)?;
        if inner.node.status() == Status::Stopped {
            return Err(Error::NotRunning);
        }
        if let Err(err) = inner.cgroup.set(&config.cgroups.resources) {
            if let Err(rollback) = inner.cgroup.set(&inner.config.cgroups.resources) {
                tracing::warn!(
                    "rolling back cgroup configs failed: {rollback}; \
                     state.json and actual configs might be inconsistent"
                );
            }
            return Err(err);
        }
        if let Some(rdt) = &inner.intel_rdt {
            if let Err(err) = rdt.set(&config) {
                if let Err(rollback) = inner.cgroup.set(&inner.config.cgroups.resources) {
                    tracing::warn!(
                        "rolling back cgroup configs failed: {rollback}; \
                         state.json and actual configs might be inconsistent"
                    );
                }
                if let Err(rollback) = rdt.set(&inner.config) {
                    tracing::warn!(
                        "rolling back intelrdt configs failed: {rollback}; \
                         state.json and actual configs might be inconsistent"
                    );
                }
                return Err(err);
            }
        }
        inner.config = config;
        self.update_state(&mut inner)?;
        Ok(())
    }

    /// Start a process inside the container. For an init process this
    /// creates the exec fifo and leaves the container in the created
    /// state; `exec` releases it.
    pub fn start(&self, process: &mut Process) -> Result<()> {
        let mut inner = self.lock();
        if inner.config.cgroups.resources.skip_devices {
            return Err(Error::InvalidConfig(
                "can't start container with SkipDevices set".into(),
            ));
        }
        if process.init {
            let uid = inner.config.host_root_uid()?;
            let gid = inner.config.host_root_gid()?;
            fifo::create(&self.root, uid, gid)?;
        }
        let result = self.start_process(&mut inner, process);
        if result.is_err() && process.init {
            drop(inner.fifo.take());
            fifo::delete(&self.root);
        }
        result
    }

    /// Start and, for an init process, immediately release it.
    pub fn run(&self, process: &mut Process) -> Result<()> {
        self.start(process)?;
        if process.init {
            self.exec()?;
        }
        Ok(())
    }

    /// Release the init blocked on the exec fifo.
    pub fn exec(&self) -> Result<()> {
        let inner = self.lock();
        let Some(init) = &inner.init_process else {
            return Err(Error::NotRunning);
        };
        let pid = init.pid();
        let start_time = inner.init_process_start_time;
        fifo::exec(&self.root, pid, start_time)
    }

    /// Deliver a signal to the init process, or to every process in the
    /// cgroup when `all` is set.
    pub fn signal(&self, sig: Signal, all: bool) -> Result<()> {
        let mut inner = self.lock();
        self.refresh_state(&mut inner)?;
        let status = inner.node.status();
        if all {
            // Systemd removes the unit cgroup once everything exited;
            // nothing left to signal then.
            if status == Status::Stopped && !inner.cgroup.exists() {
                return Ok(());
            }
            return sys::signal_all_processes(inner.cgroup.as_ref(), sig);
        }
        // Restricting to live statuses avoids signaling a reused pid.
        match status {
            Status::Running | Status::Created | Status::Paused => {
                let init = inner.init_process.as_ref().ok_or(Error::NotRunning)?;
                init.signal(sig)
                    .map_err(|e| Error::Manager(format!("unable to signal init: {e}")))?;
                if status == Status::Paused && sig == Signal::SIGKILL {
                    // A frozen v1 cgroup swallows SIGKILL until thawed.
                    let _ = inner.cgroup.freeze(FreezerState::Thawed);
                }
                Ok(())
            }
            Status::Stopped => Err(Error::NotRunning),
        }
    }

    /// Freeze the container. Legal from created or running.
    pub fn pause(&self) -> Result<()> {
        let mut inner = self.lock();
        self.refresh_state(&mut inner)?;
        match inner.node.status() {
            Status::Running | Status::Created => {
                inner.cgroup.freeze(FreezerState::Frozen)?;
                inner.node.transition(StateNode::Paused)
            }
            _ => Err(Error::NotRunning),
        }
    }

    /// Thaw a paused container back to running.
    pub fn resume(&self) -> Result<()> {
        let mut inner = self.lock();
        self.refresh_state(&mut inner)?;
        if inner.node.status() != Status::Paused {
            return Err(Error::NotPaused);
        }
        inner.cgroup.freeze(FreezerState::Thawed)?;
        inner.node.transition(StateNode::Running)
    }

    /// Destroy the container: remove the cgroup, the Intel RDT group,
    /// and the state directory, then run poststop hooks. Idempotent;
    /// destroying an already destroyed container is not an error.
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.lock();
        self.refresh_state(&mut inner)?;
        match inner.node.clone() {
            StateNode::Stopped => self.destroy_inner(&mut inner),
            StateNode::Created => {
                // The init never ran user code; kill it outright.
                if let Some(init) = &inner.init_process {
                    let _ = init.signal(Signal::SIGKILL);
                }
                self.destroy_inner(&mut inner)
            }
            StateNode::Running | StateNode::Restored { .. } => {
                if self.run_type(&inner) == Status::Running {
                    return Err(Error::NotStopped);
                }
                self.destroy_inner(&mut inner)
            }
            StateNode::Paused => {
                let t = self.run_type(&inner);
                if t == Status::Running || t == Status::Created {
                    return Err(Error::PausedOrStopped);
                }
                inner.cgroup.freeze(FreezerState::Thawed)?;
                self.destroy_inner(&mut inner)
            }
        }
    }

    /// Stream of void events fired on container OOM kills.
    pub fn notify_oom(&self) -> Result<std::sync::mpsc::Receiver<()>> {
        let inner = self.lock();
        if inner.config.rootless_cgroups {
            tracing::warn!(
                "getting OOM notifications may fail if you don't have full access to cgroups"
            );
        }
        let path = inner
            .cgroup
            .path("memory")
            .ok_or_else(|| Error::Manager("no memory cgroup path".into()))?;
        if inner.cgroup.is_cgroup2() {
            notify::notify_on_oom_v2(&path)
        } else {
            notify::notify_on_oom(&path)
        }
    }

    /// Stream of void events fired when the container reaches the given
    /// memory pressure level. Cgroup v1 only.
    pub fn notify_memory_pressure(
        &self,
        level: PressureLevel,
    ) -> Result<std::sync::mpsc::Receiver<()>> {
        let inner = self.lock();
        if inner.config.rootless_cgroups {
            tracing::warn!(
                "getting memory pressure notifications may fail if you don't have full \
                 access to cgroups"
            );
        }
        let path = inner
            .cgroup
            .path("memory")
            .ok_or_else(|| Error::Manager("no memory cgroup path".into()))?;
        notify::notify_memory_pressure(&path, level)
    }

    // ------------------------------------------------------------------
    // Start internals
    // ------------------------------------------------------------------

    fn start_process(&self, inner: &mut Inner, process: &mut Process) -> Result<()> {
        let mut parent = self.new_parent_process(inner, process)?;
        let log_handle = parent.forward_child_logs();

        let start_result = {
            let Inner {
                cgroup, intel_rdt, ..
            } = &mut *inner;
            parent.start(cgroup.as_ref(), intel_rdt.as_deref())
        };
        if let Err(err) = start_result {
            drop(inner.fifo.take());
            return Err(Error::ChildFailure(format!(
                "unable to start container process: {err}"
            )));
        }

        process.pid = Some(parent.pid().as_raw());
        let is_init = process.init;
        if is_init {
            // The stub holds its own copy now; dropping ours lets the
            // fifo lifetime track the exec barrier alone.
            drop(inner.fifo.take());
            inner.init_process_start_time = parent.start_time();
            inner.init_process = Some(parent);
        }
        // A joined process is the caller's to track; the container only
        // ever owns its init.

        if let Some(handle) = log_handle {
            match handle.join() {
                Ok(result) => {
                    if let Err(err) = result {
                        tracing::warn!("unable to forward init logs: {err}");
                    }
                }
                Err(_) => tracing::warn!("log forwarder panicked"),
            }
        }

        if is_init {
            if let Err(err) = self.run_poststart_hooks(inner) {
                if let Some(init) = &mut inner.init_process {
                    if let Err(terr) = ignore_terminate_errors(init.terminate()) {
                        tracing::warn!("error terminating after failed poststart hook: {terr}");
                    }
                }
                return Err(err);
            }
            self.update_state(inner)?;
        }
        Ok(())
    }

    fn run_poststart_hooks(&self, inner: &mut Inner) -> Result<()> {
        if !inner.config.has_hooks {
            return Ok(());
        }
        let Some(hooks) = inner.hooks.take() else {
            return Ok(());
        };
        let result = self
            .current_oci_state(inner)
            .and_then(|oci| hooks.run(HookKind::Poststart, &oci));
        inner.hooks = Some(hooks);
        result
    }

    /// Build the host-side parent handle: pipes, stub command,
    /// bootstrap message, and (for init) the fifo and mount-source
    /// plumbing.
    fn new_parent_process(
        &self,
        inner: &mut Inner,
        process: &mut Process,
    ) -> Result<ParentProcess> {
        let (parent_init, child_init) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| Error::syscall("socketpair", e))?;
        let (log_read, log_write) =
            nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
                .map_err(|e| Error::syscall("pipe2", e))?;

        let init_type = if process.init {
            InitType::Standard
        } else {
            InitType::Setns
        };
        let mut cmd = StubCommand::new(&inner.config, process, init_type, &self.root);

        for extra in process.extra_files.drain(..) {
            cmd.add_unnamed_fd(extra);
        }
        if let Some(console) = process.console_socket.take() {
            cmd.add_fd(ENV_CONSOLE, console);
        }
        // Keep a duplicate around for mount-fd placeholders before the
        // child end moves into the command.
        let placeholder_src = child_init
            .try_clone()
            .map_err(|e| Error::Io(e.into()))?;
        cmd.add_fd(ENV_INIT_PIPE, child_init);
        cmd.add_fd(ENV_LOG_PIPE, log_write);

        if process.init {
            self.build_init_parent(inner, cmd, parent_init, log_read, placeholder_src)
        } else {
            self.build_setns_parent(inner, process, cmd, parent_init, log_read)
        }
    }

    fn build_init_parent(
        &self,
        inner: &mut Inner,
        mut cmd: StubCommand,
        parent_init: OwnedFd,
        log_read: OwnedFd,
        placeholder_src: OwnedFd,
    ) -> Result<ParentProcess> {
        let fifo_fd = fifo::open_path_fd(&self.root)?;
        let child_fifo = fifo_fd.try_clone().map_err(|e| Error::Io(e.into()))?;
        cmd.add_fd(ENV_FIFO_FD, child_fifo);
        inner.fifo = Some(fifo_fd);

        let config = &inner.config;
        let ns_maps = config.namespaces.join_paths();
        let share_pidns = !config.namespaces.contains(NamespaceType::Pid)
            || ns_maps.contains_key(&NamespaceType::Pid);
        let data = bootstrap::bootstrap_data(
            config,
            config.namespaces.clone_flags(),
            &ns_maps,
            InitType::Standard,
        )?;

        let mut mount_sources = Vec::new();
        if should_send_mount_sources(config) {
            // One entry per configured mount; the placeholder numbers
            // are overwritten by the stub via dup3 once the real fds
            // arrive over the init pipe.
            let mut mount_fds = vec![-1i32; config.mounts.len()];
            for (i, mount) in config.mounts.iter().enumerate() {
                if !mount.is_bind() {
                    continue;
                }
                let placeholder = placeholder_src
                    .try_clone()
                    .map_err(|e| Error::Io(e.into()))?;
                mount_fds[i] = cmd.add_unnamed_fd(placeholder);
                mount_sources.push(PathBuf::from(&mount.source));
            }
            cmd.env(ENV_MOUNT_FDS, &serde_json::to_string(&mount_fds)?);
        }

        Ok(ParentProcess::Init(InitParent::new(
            cmd,
            parent_init,
            log_read,
            data,
            mount_sources,
            share_pidns,
        )))
    }

    fn build_setns_parent(
        &self,
        inner: &mut Inner,
        process: &Process,
        cmd: StubCommand,
        parent_init: OwnedFd,
        log_read: OwnedFd,
    ) -> Result<ParentProcess> {
        let state = self.current_state(inner);
        // Joining uses the captured namespace paths; no namespaces are
        // created, so no clone flags.
        let data = bootstrap::bootstrap_data(
            &inner.config,
            0,
            &state.namespace_paths,
            InitType::Setns,
        )?;

        let mut cgroup_paths = state.cgroup_paths.clone();
        let mut fallback_pid = state.init_process_pid;
        if !process.sub_cgroup_paths.is_empty() {
            if let Some(add) = process.sub_cgroup_paths.get("") {
                // One path for all controllers (the only v2 shape).
                for path in cgroup_paths.values_mut() {
                    *path = sub_cgroup_join(path, add)?;
                }
                // With an explicit sub-cgroup, never fall back to
                // joining init's own cgroup.
                fallback_pid = 0;
            } else {
                for (ctrl, add) in &process.sub_cgroup_paths {
                    match cgroup_paths.get_mut(ctrl) {
                        Some(path) => *path = sub_cgroup_join(path, add)?,
                        None => {
                            return Err(Error::InvalidConfig(format!(
                                "unknown controller {ctrl} in SubCgroupPaths"
                            )));
                        }
                    }
                }
            }
        }

        let intel_rdt_path = (!state.intel_rdt_path.is_empty())
            .then(|| PathBuf::from(&state.intel_rdt_path));

        Ok(ParentProcess::Setns(SetnsParent::new(
            cmd,
            parent_init,
            log_read,
            data,
            cgroup_paths,
            inner.config.rootless_cgroups,
            intel_rdt_path,
            fallback_pid,
        )))
    }

    // ------------------------------------------------------------------
    // State derivation and persistence
    // ------------------------------------------------------------------

    /// Re-derive the state node from the kernel's view: freezer state,
    /// init liveness (start-time qualified), and fifo presence.
    pub(crate) fn refresh_state(&self, inner: &mut Inner) -> Result<()> {
        let frozen = inner.cgroup.freezer_state()? == FreezerState::Frozen;
        if frozen {
            inner.node.observe(StateNode::Paused);
            return Ok(());
        }
        let next = match self.run_type(inner) {
            Status::Created => StateNode::Created,
            Status::Running => {
                // Don't degrade a freshly restored node before anyone
                // has observed it.
                if let StateNode::Restored { image_dir } = &inner.node {
                    StateNode::Restored {
                        image_dir: image_dir.clone(),
                    }
                } else {
                    StateNode::Running
                }
            }
            _ => StateNode::Stopped,
        };
        inner.node.observe(next);
        Ok(())
    }

    /// What the kernel says the container is doing right now.
    pub(crate) fn run_type(&self, inner: &Inner) -> Status {
        let Some(init) = &inner.init_process else {
            return Status::Stopped;
        };
        let Ok(stat) = sys::proc_stat(init.pid()) else {
            return Status::Stopped;
        };
        if stat.start_time != inner.init_process_start_time || stat.defunct {
            // Start-time mismatch means the pid was reused for an
            // unrelated process.
            return Status::Stopped;
        }
        if fifo::exists(&self.root) {
            return Status::Created;
        }
        Status::Running
    }

    pub(crate) fn current_state(&self, inner: &Inner) -> State {
        let (pid, start_time, external_descriptors) = match &inner.init_process {
            Some(init) => (
                init.pid().as_raw(),
                init.start_time(),
                init.external_descriptors().to_vec(),
            ),
            None => (-1, 0, Vec::new()),
        };
        let intel_rdt_path = inner
            .intel_rdt
            .as_ref()
            .map(|rdt| rdt.path().to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut namespace_paths = HashMap::new();
        if pid > 0 {
            for ns in &inner.config.namespaces.0 {
                let path = ns
                    .path
                    .clone()
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| ns.ns_type.proc_path(pid));
                namespace_paths.insert(ns.ns_type, path);
            }
            for ns_type in crate::config::NAMESPACE_TYPES {
                namespace_paths
                    .entry(ns_type)
                    .or_insert_with(|| ns_type.proc_path(pid));
            }
        }

        State {
            id: self.id.clone(),
            init_process_pid: pid,
            init_process_start: start_time,
            created: inner.created,
            config: inner.config.clone(),
            rootless: inner.config.rootless_euid && inner.config.rootless_cgroups,
            cgroup_paths: inner.cgroup.get_paths(),
            namespace_paths,
            external_descriptors,
            intel_rdt_path,
        }
    }

    pub(crate) fn current_oci_state(&self, inner: &mut Inner) -> Result<OciState> {
        self.refresh_state(inner)?;
        let status = inner.node.status();
        let (bundle, annotations) = inner.config.annotations();
        let pid = (status != Status::Stopped)
            .then(|| inner.init_process.as_ref().map(|p| p.pid().as_raw()))
            .flatten();
        Ok(OciState {
            oci_version: OCI_VERSION.into(),
            id: self.id.clone(),
            status: status.as_str().into(),
            pid,
            bundle,
            annotations,
        })
    }

    /// Persist the current state document; reflects every completed
    /// mutation up to this call.
    pub(crate) fn update_state(&self, inner: &mut Inner) -> Result<State> {
        let state = self.current_state(inner);
        state::save(&self.root, &state)?;
        Ok(state)
    }

    // ------------------------------------------------------------------
    // Destroy internals
    // ------------------------------------------------------------------

    fn destroy_inner(&self, inner: &mut Inner) -> Result<()> {
        // Without a private pid namespace, killing init does not take
        // the rest of the cgroup with it.
        let shared_pidns = match &inner.init_process {
            Some(ParentProcess::Init(p)) => p.share_pidns(),
            _ => {
                !inner.config.namespaces.contains(NamespaceType::Pid)
                    || inner
                        .config
                        .namespaces
                        .path_of(NamespaceType::Pid)
                        .is_some()
            }
        };
        if shared_pidns {
            let _ = sys::signal_all_processes(inner.cgroup.as_ref(), Signal::SIGKILL);
        }

        let mut first_err: Option<Error> = None;
        let mut record = |err: Error| {
            tracing::warn!("destroy: {err}");
            if first_err.is_none() {
                first_err = Some(err);
            }
        };

        if let Err(err) = inner.cgroup.destroy() {
            record(err);
        }
        if let Err(err) = std::fs::remove_dir_all(&self.root) {
            if err.kind() != std::io::ErrorKind::NotFound {
                record(err.into());
            }
        }
        if let Some(rdt) = &inner.intel_rdt {
            if let Err(err) = rdt.destroy() {
                record(err);
            }
        }
        if let Some(mut init) = inner.init_process.take() {
            // Reap a zombie init so the pid is released.
            let _ = init.wait();
        }
        inner.node.observe(StateNode::Stopped);

        if inner.config.has_hooks {
            if let Some(hooks) = inner.hooks.take() {
                let result = self
                    .current_oci_state(inner)
                    .and_then(|oci| hooks.run(HookKind::Poststop, &oci));
                inner.hooks = Some(hooks);
                if let Err(err) = result {
                    record(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Lexically join a sub-cgroup onto a controller path, rejecting
/// escapes through `..`.
fn sub_cgroup_join(base: &Path, add: &str) -> Result<PathBuf> {
    let mut parts: Vec<&str> = base
        .to_str()
        .unwrap_or_default()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    let depth = parts.len();
    for comp in add.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if parts.len() <= depth {
                    return Err(Error::InvalidConfig(format!(
                        "{add} is not a sub cgroup path"
                    )));
                }
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    let mut joined = String::new();
    for part in parts {
        joined.push('/');
        joined.push_str(part);
    }
    Ok(PathBuf::from(joined))
}
