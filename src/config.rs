//! Container configuration snapshot.
//!
//! The configuration is set once at container creation and persisted as
//! part of the state document. Everything here is plain data; the
//! injected managers and hook runners live in [`crate::managers`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Linux namespace kinds, in the canonical setns order.
///
/// The order matters: the user namespace must be entered first so that
/// the remaining namespaces are owned by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceType {
    User,
    Ipc,
    Uts,
    Net,
    Pid,
    Mount,
    Cgroup,
}

/// All supported namespace types in canonical order.
pub const NAMESPACE_TYPES: [NamespaceType; 7] = [
    NamespaceType::User,
    NamespaceType::Ipc,
    NamespaceType::Uts,
    NamespaceType::Net,
    NamespaceType::Pid,
    NamespaceType::Mount,
    NamespaceType::Cgroup,
];

impl NamespaceType {
    /// Short name as used in bootstrap messages and external-namespace keys.
    pub fn name(&self) -> &'static str {
        match self {
            NamespaceType::User => "user",
            NamespaceType::Ipc => "ipc",
            NamespaceType::Uts => "uts",
            NamespaceType::Net => "net",
            NamespaceType::Pid => "pid",
            NamespaceType::Mount => "mnt",
            NamespaceType::Cgroup => "cgroup",
        }
    }

    /// The CLONE_* flag used to create this namespace.
    pub fn clone_flag(&self) -> u32 {
        match self {
            NamespaceType::User => libc::CLONE_NEWUSER as u32,
            NamespaceType::Ipc => libc::CLONE_NEWIPC as u32,
            NamespaceType::Uts => libc::CLONE_NEWUTS as u32,
            NamespaceType::Net => libc::CLONE_NEWNET as u32,
            NamespaceType::Pid => libc::CLONE_NEWPID as u32,
            NamespaceType::Mount => libc::CLONE_NEWNS as u32,
            NamespaceType::Cgroup => libc::CLONE_NEWCGROUP as u32,
        }
    }

    /// Path of this namespace for the given pid, e.g. `/proc/42/ns/mnt`.
    pub fn proc_path(&self, pid: i32) -> String {
        format!("/proc/{}/ns/{}", pid, self.name())
    }
}

/// A namespace the container creates or joins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: NamespaceType,
    /// Path of an existing namespace to join; empty means create new.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Ordered namespace set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Namespaces(pub Vec<Namespace>);

impl Namespaces {
    pub fn contains(&self, t: NamespaceType) -> bool {
        self.0.iter().any(|ns| ns.ns_type == t)
    }

    pub fn path_of(&self, t: NamespaceType) -> Option<&str> {
        self.0
            .iter()
            .find(|ns| ns.ns_type == t)
            .and_then(|ns| ns.path.as_deref())
            .filter(|p| !p.is_empty())
    }

    /// Combined CLONE_* flags for all namespaces without a join path.
    pub fn clone_flags(&self) -> u32 {
        self.0
            .iter()
            .filter(|ns| ns.path.as_deref().is_none_or(str::is_empty))
            .fold(0, |acc, ns| acc | ns.ns_type.clone_flag())
    }

    /// Map of namespace type to join path, for namespaces that have one.
    pub fn join_paths(&self) -> HashMap<NamespaceType, String> {
        self.0
            .iter()
            .filter_map(|ns| {
                ns.path
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .map(|p| (ns.ns_type, p.to_string()))
            })
            .collect()
    }
}

/// A single uid or gid mapping for a user namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: i64,
    pub host_id: i64,
    pub size: i64,
}

/// A mount to perform inside the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    /// Filesystem type, or "bind"/"cgroup" for the special cases.
    pub device: String,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub data: String,
}

impl Mount {
    pub fn is_bind(&self) -> bool {
        self.flags & (libc::MS_BIND as u64) != 0 || self.device == "bind"
    }
}

/// A device node the container is given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub path: String,
    #[serde(rename = "type")]
    pub dev_type: char,
    pub major: i64,
    pub minor: i64,
    #[serde(default)]
    pub file_mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

/// A resource limit applied to the init process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Rlimit {
    #[serde(rename = "type")]
    pub kind: i32,
    pub hard: u64,
    pub soft: u64,
}

/// A network interface attached to the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    /// Strategy type, e.g. "veth" or "loopback".
    #[serde(rename = "type")]
    pub net_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host_interface_name: String,
}

/// Freezer cgroup states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreezerState {
    Undefined,
    Frozen,
    Thawed,
}

/// Cgroup resource knobs the lifecycle core cares about. The full
/// resource model belongs to the cgroup manager; the core only needs
/// the flags that gate lifecycle operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    /// Skip device cgroup programming. Set while updating resources on
    /// a live container; a container cannot be started with it.
    #[serde(default)]
    pub skip_devices: bool,
    /// Opaque resource document handed to the cgroup manager.
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Cgroup placement and resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CgroupSpec {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub resources: Resources,
}

/// Immutable-once-set container configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub rootfs: String,
    #[serde(default)]
    pub namespaces: Namespaces,
    #[serde(default)]
    pub uid_mappings: Vec<IdMap>,
    #[serde(default)]
    pub gid_mappings: Vec<IdMap>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub mask_paths: Vec<String>,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub rlimits: Vec<Rlimit>,
    /// `key=value` labels; the `bundle` label feeds the OCI state view.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub cgroups: CgroupSpec,
    #[serde(default)]
    pub rootless_euid: bool,
    #[serde(default)]
    pub rootless_cgroups: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oom_score_adj: Option<i32>,
    /// Signal delivered to init when the parent runtime dies; 0 disables.
    #[serde(default)]
    pub parent_death_signal: i32,
    #[serde(default)]
    pub has_hooks: bool,
}

impl Config {
    /// Host uid that maps to uid 0 inside the container.
    pub fn host_root_uid(&self) -> Result<u32> {
        host_id_for(&self.uid_mappings, 0, "uid")
    }

    /// Host gid that maps to gid 0 inside the container.
    pub fn host_root_gid(&self) -> Result<u32> {
        host_id_for(&self.gid_mappings, 0, "gid")
    }

    /// Look up a label value by key. Labels are `key=value` strings.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find_map(|l| {
            l.split_once('=')
                .and_then(|(k, v)| (k == key).then_some(v))
        })
    }

    /// Bundle directory and remaining annotations for the OCI state view.
    pub fn annotations(&self) -> (String, HashMap<String, String>) {
        let mut bundle = String::new();
        let mut annotations = HashMap::new();
        for label in &self.labels {
            if let Some((k, v)) = label.split_once('=') {
                if k == "bundle" {
                    bundle = v.to_string();
                } else {
                    annotations.insert(k.to_string(), v.to_string());
                }
            }
        }
        (bundle, annotations)
    }

    /// Whether id mapping needs `setgroups` disabled or the external
    /// mapping tool: everything except the single identity gid map of
    /// the calling process.
    pub fn requires_root_or_mapping_tool(&self) -> bool {
        let egid = nix::unistd::getegid().as_raw() as i64;
        self.gid_mappings
            != vec![IdMap {
                container_id: 0,
                host_id: egid,
                size: 1,
            }]
    }
}

fn host_id_for(mappings: &[IdMap], id: i64, what: &str) -> Result<u32> {
    if mappings.is_empty() {
        // No user namespace mapping; ids are not shifted.
        return Ok(id as u32);
    }
    for m in mappings {
        if id >= m.container_id && id < m.container_id + m.size {
            return Ok((m.host_id + (id - m.container_id)) as u32);
        }
    }
    Err(Error::InvalidConfig(format!(
        "no {what} mapping found for container id {id}"
    )))
}

/// The user process to run inside the container, or to join into it.
#[derive(Debug, Default)]
pub struct Process {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    /// True for the container's init process, false for a setns join.
    pub init: bool,
    /// Filled in by `start`: the pid of the launched process. Joined
    /// processes are not tracked by the container, so this is the
    /// caller's handle for waiting on them.
    pub pid: Option<i32>,
    pub stdin: Option<std::process::Stdio>,
    pub stdout: Option<std::process::Stdio>,
    pub stderr: Option<std::process::Stdio>,
    /// Unix socket over which the stub sends the pty master, if a
    /// terminal was requested.
    pub console_socket: Option<std::os::fd::OwnedFd>,
    /// Additional files inherited by the stub, numbered after stdio.
    pub extra_files: Vec<std::os::fd::OwnedFd>,
    /// Log level string forwarded to the stub.
    pub log_level: String,
    /// Sub-cgroup to place a joined process into. Key "" applies to all
    /// controllers (and is the only option on cgroup v2).
    pub sub_cgroup_paths: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(t: NamespaceType, path: Option<&str>) -> Namespace {
        Namespace {
            ns_type: t,
            path: path.map(String::from),
        }
    }

    #[test]
    fn test_clone_flags_skip_joined() {
        let nss = Namespaces(vec![
            ns(NamespaceType::Pid, None),
            ns(NamespaceType::Net, Some("/proc/1/ns/net")),
        ]);
        let flags = nss.clone_flags();
        assert_ne!(flags & libc::CLONE_NEWPID as u32, 0);
        assert_eq!(flags & libc::CLONE_NEWNET as u32, 0);
    }

    #[test]
    fn test_path_of_ignores_empty() {
        let nss = Namespaces(vec![ns(NamespaceType::Uts, Some(""))]);
        assert!(nss.path_of(NamespaceType::Uts).is_none());
    }

    #[test]
    fn test_host_root_uid_mapped() {
        let config = Config {
            uid_mappings: vec![IdMap {
                container_id: 0,
                host_id: 1000,
                size: 65536,
            }],
            ..Default::default()
        };
        assert_eq!(config.host_root_uid().unwrap(), 1000);
    }

    #[test]
    fn test_host_root_uid_unmapped_is_identity() {
        let config = Config::default();
        assert_eq!(config.host_root_uid().unwrap(), 0);
    }

    #[test]
    fn test_host_root_uid_out_of_range() {
        let config = Config {
            uid_mappings: vec![IdMap {
                container_id: 100,
                host_id: 1000,
                size: 1,
            }],
            ..Default::default()
        };
        assert!(config.host_root_uid().is_err());
    }

    #[test]
    fn test_bundle_and_annotations() {
        let config = Config {
            labels: vec![
                "bundle=/run/bundle".to_string(),
                "owner=ci".to_string(),
            ],
            ..Default::default()
        };
        let (bundle, annotations) = config.annotations();
        assert_eq!(bundle, "/run/bundle");
        assert_eq!(annotations.get("owner").map(String::as_str), Some("ci"));
        assert!(!annotations.contains_key("bundle"));
    }

    #[test]
    fn test_mount_is_bind() {
        let bind = Mount {
            device: "bind".into(),
            source: "/src".into(),
            destination: "/dst".into(),
            flags: 0,
            data: String::new(),
        };
        assert!(bind.is_bind());

        let tmpfs = Mount {
            device: "tmpfs".into(),
            source: "tmpfs".into(),
            destination: "/tmp".into(),
            flags: 0,
            data: String::new(),
        };
        assert!(!tmpfs.is_bind());
    }
}
