//! Persisted container state document.
//!
//! The state file is the on-disk source of truth for out-of-process
//! consumers. Writes go to a temporary file in the same directory and
//! are renamed into place, so readers observe either the previous or
//! the new document, never a torn one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Config, NamespaceType};
use crate::error::Result;

pub(crate) const STATE_FILENAME: &str = "state.json";

/// OCI runtime-spec version reported in the OCI state view.
pub const OCI_VERSION: &str = "1.0.2";

/// Full container state document, as persisted to `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub id: String,
    pub init_process_pid: i32,
    /// Clock-tick start time of init, used to detect pid reuse.
    pub init_process_start: u64,
    pub created: DateTime<Utc>,
    pub config: Config,
    /// True when created without real root on the host.
    pub rootless: bool,
    /// Controller -> cgroup path. Cgroup v2 uses the key "".
    pub cgroup_paths: HashMap<String, PathBuf>,
    /// Namespace type -> `/proc/<pid>/ns/<name>` path.
    pub namespace_paths: HashMap<NamespaceType, String>,
    /// Symbolic destinations of init's standard descriptors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_descriptors: Vec<String>,
    #[serde(default)]
    pub intel_rdt_path: String,
}

/// OCI-shaped status view of a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciState {
    pub oci_version: String,
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub bundle: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// Atomically replace the state document inside `root`.
pub(crate) fn save(root: &Path, state: &State) -> Result<()> {
    let tmp = root.join(format!("{STATE_FILENAME}.tmp"));
    let data = serde_json::to_vec(state)?;
    std::fs::write(&tmp, data)?;
    if let Err(err) = std::fs::rename(&tmp, root.join(STATE_FILENAME)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

/// Load the state document, tolerating its absence.
pub(crate) fn load(root: &Path) -> Result<Option<State>> {
    let path = root.join(STATE_FILENAME);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}
