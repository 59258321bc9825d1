//! Scriptable fakes for the container's external collaborators.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use nix::unistd::Pid;

use crate::config::{FreezerState, Network, Resources};
use crate::error::{Error, Result};
use crate::managers::{
    CgroupManager, CgroupStats, Components, FsMountPreparer, HookKind, HookRunner,
    NetworkStrategy,
};
use crate::state::OciState;

/// Shared scriptable state of a [`FakeCgroup`].
#[derive(Debug)]
pub(crate) struct FakeCgroupState {
    pub exists: bool,
    pub freezer: FreezerState,
    pub pids: Vec<Pid>,
    pub cgroup2: bool,
    pub fail_set: bool,
    pub set_calls: Vec<Resources>,
    pub destroyed: bool,
}

impl Default for FakeCgroupState {
    fn default() -> Self {
        Self {
            exists: true,
            freezer: FreezerState::Thawed,
            pids: Vec::new(),
            cgroup2: false,
            fail_set: false,
            set_calls: Vec::new(),
            destroyed: false,
        }
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeCgroup {
    pub state: Arc<Mutex<FakeCgroupState>>,
}

impl FakeCgroup {
    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, FakeCgroupState> {
        self.state.lock().unwrap()
    }
}

impl CgroupManager for FakeCgroup {
    fn apply(&self, pid: Pid) -> Result<()> {
        self.lock().pids.push(pid);
        Ok(())
    }

    fn set(&self, resources: &Resources) -> Result<()> {
        let mut state = self.lock();
        state.set_calls.push(resources.clone());
        if state.fail_set {
            return Err(Error::Manager("fake set failure".into()));
        }
        Ok(())
    }

    fn path(&self, _subsystem: &str) -> Option<PathBuf> {
        Some(PathBuf::from("/sys/fs/cgroup/fake"))
    }

    fn get_paths(&self) -> HashMap<String, PathBuf> {
        HashMap::from([(String::new(), PathBuf::from("/sys/fs/cgroup/fake"))])
    }

    fn get_stats(&self) -> Result<CgroupStats> {
        Ok(CgroupStats::default())
    }

    fn freeze(&self, state: FreezerState) -> Result<()> {
        self.lock().freezer = state;
        Ok(())
    }

    fn freezer_state(&self) -> Result<FreezerState> {
        Ok(self.lock().freezer)
    }

    fn exists(&self) -> bool {
        self.lock().exists
    }

    fn get_all_pids(&self) -> Result<Vec<Pid>> {
        Ok(self.lock().pids.clone())
    }

    fn destroy(&self) -> Result<()> {
        let mut state = self.lock();
        state.destroyed = true;
        state.exists = false;
        Ok(())
    }

    fn is_cgroup2(&self) -> bool {
        self.lock().cgroup2
    }
}

/// Records every hook invocation with the pid it carried.
#[derive(Clone, Default)]
pub(crate) struct RecordingHooks {
    pub calls: Arc<Mutex<Vec<(HookKind, Option<i32>)>>>,
}

impl HookRunner for RecordingHooks {
    fn run(&self, kind: HookKind, state: &OciState) -> Result<()> {
        self.calls.lock().unwrap().push((kind, state.pid));
        Ok(())
    }
}

/// Records attach/detach calls.
#[derive(Clone, Default)]
pub(crate) struct RecordingNetwork {
    pub detached: Arc<Mutex<Vec<String>>>,
    pub attached: Arc<Mutex<Vec<String>>>,
}

impl NetworkStrategy for RecordingNetwork {
    fn attach(&self, network: &Network) -> Result<()> {
        self.attached.lock().unwrap().push(network.name.clone());
        Ok(())
    }

    fn detach(&self, network: &Network) -> Result<()> {
        self.detached.lock().unwrap().push(network.name.clone());
        Ok(())
    }
}

pub(crate) fn components(
    cgroup: FakeCgroup,
    hooks: Option<RecordingHooks>,
    network: Option<RecordingNetwork>,
) -> Components {
    Components {
        cgroup: Box::new(cgroup),
        intel_rdt: None,
        hooks: hooks.map(|h| Box::new(h) as Box<dyn HookRunner>),
        network: network.map(|n| Box::new(n) as Box<dyn NetworkStrategy>),
        iface_stats: None,
        mounts: Box::new(FsMountPreparer),
    }
}

/// Bind a live pid to the container as its init, the way a restore
/// does, so lifecycle paths that need a running init can be exercised.
pub(crate) fn install_init(container: &crate::container::Container, pid: Pid) {
    use crate::process::{ParentProcess, RestoredParent};
    let parent = RestoredParent::new(pid, Vec::new()).unwrap();
    let mut inner = container.lock();
    inner.init_process_start_time = parent.start_time;
    inner.init_process = Some(ParentProcess::Restored(parent));
}

/// Spawn a long sleep we can treat as a container init.
pub(crate) fn spawn_sleeper() -> std::process::Child {
    std::process::Command::new("sleep")
        .arg("300")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .expect("spawn sleeper")
}
