//! Shared fixtures: a scriptable cgroup manager and an isolated
//! container with automatic cleanup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use nix::unistd::Pid;
use tempfile::TempDir;

use corral::{
    CgroupManager, CgroupStats, Components, Config, Container, FreezerState,
    FsMountPreparer, Resources,
};

/// Scriptable state shared between a test and its fake cgroup manager.
#[derive(Debug)]
pub struct CgroupState {
    pub exists: bool,
    pub freezer: FreezerState,
    pub pids: Vec<Pid>,
    pub destroyed: bool,
}

impl Default for CgroupState {
    fn default() -> Self {
        Self {
            exists: true,
            freezer: FreezerState::Thawed,
            pids: Vec::new(),
            destroyed: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeCgroup {
    pub state: Arc<Mutex<CgroupState>>,
}

impl FakeCgroup {
    pub fn lock(&self) -> std::sync::MutexGuard<'_, CgroupState> {
        self.state.lock().unwrap()
    }
}

impl CgroupManager for FakeCgroup {
    fn apply(&self, pid: Pid) -> corral::Result<()> {
        self.lock().pids.push(pid);
        Ok(())
    }

    fn set(&self, _resources: &Resources) -> corral::Result<()> {
        Ok(())
    }

    fn path(&self, _subsystem: &str) -> Option<PathBuf> {
        Some(PathBuf::from("/sys/fs/cgroup/fake"))
    }

    fn get_paths(&self) -> HashMap<String, PathBuf> {
        HashMap::from([(String::new(), PathBuf::from("/sys/fs/cgroup/fake"))])
    }

    fn get_stats(&self) -> corral::Result<CgroupStats> {
        Ok(CgroupStats::default())
    }

    fn freeze(&self, state: FreezerState) -> corral::Result<()> {
        self.lock().freezer = state;
        Ok(())
    }

    fn freezer_state(&self) -> corral::Result<FreezerState> {
        Ok(self.lock().freezer)
    }

    fn exists(&self) -> bool {
        self.lock().exists
    }

    fn get_all_pids(&self) -> corral::Result<Vec<Pid>> {
        Ok(self.lock().pids.clone())
    }

    fn destroy(&self) -> corral::Result<()> {
        let mut state = self.lock();
        state.destroyed = true;
        state.exists = false;
        Ok(())
    }

    fn is_cgroup2(&self) -> bool {
        false
    }
}

/// Test context with an isolated container root and automatic cleanup.
pub struct TestContext {
    pub container: Container,
    pub cgroup: FakeCgroup,
    pub root: PathBuf,
    _temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let root = temp_dir.path().join("container");
        let cgroup = FakeCgroup::default();
        let components = Components {
            cgroup: Box::new(cgroup.clone()),
            intel_rdt: None,
            hooks: None,
            network: None,
            iface_stats: None,
            mounts: Box::new(FsMountPreparer),
        };
        let container =
            Container::new("test-container", &root, config, components).expect("create container");
        Self {
            container,
            cgroup,
            root,
            _temp_dir: temp_dir,
        }
    }
}
