//! Bootstrap message encoder.
//!
//! The init stub consumes a netlink-style TLV message on its init pipe
//! before entering namespaces: clone flags, namespace join paths, id
//! mappings, and mount-source hints. The attribute identifiers and the
//! wire layout are a fixed contract with the stub.

use std::collections::HashMap;

use crate::config::{Config, NAMESPACE_TYPES, NamespaceType};
use crate::error::{Error, Result};
use crate::process::{InitType, should_send_mount_sources};

/// Message type of the bootstrap request.
pub const INIT_MSG: u16 = 62000;

pub const CLONE_FLAGS_ATTR: u16 = 27281;
pub const NS_PATHS_ATTR: u16 = 27282;
pub const UIDMAP_ATTR: u16 = 27283;
pub const GIDMAP_ATTR: u16 = 27284;
pub const SETGROUP_ATTR: u16 = 27285;
pub const OOM_SCORE_ADJ_ATTR: u16 = 27286;
pub const ROOTLESS_EUID_ATTR: u16 = 27287;
pub const UIDMAP_PATH_ATTR: u16 = 27288;
pub const GIDMAP_PATH_ATTR: u16 = 27289;
pub const MOUNT_SOURCES_ATTR: u16 = 27290;

const NLMSG_HDRLEN: usize = 16;
const NLM_F_REQUEST: u16 = 0x1;
const NLA_HDRLEN: usize = 4;

/// Incrementally built netlink request. Attributes are appended with
/// explicit fallible calls; the header length is patched on finish.
struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    fn new(msg_type: u16) -> Self {
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());
        buf[6..8].copy_from_slice(&NLM_F_REQUEST.to_ne_bytes());
        Self { buf }
    }

    fn push_header(&mut self, attr_type: u16, payload_len: usize) -> Result<()> {
        let total = NLA_HDRLEN + payload_len;
        let len = u16::try_from(total)
            .map_err(|_| Error::Codec(format!("attribute {attr_type} payload too large")))?;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        Ok(())
    }

    fn pad(&mut self) {
        while (self.buf.len() - NLMSG_HDRLEN) % 4 != 0 {
            self.buf.push(0);
        }
    }

    fn add_u32(&mut self, attr_type: u16, value: u32) -> Result<()> {
        self.push_header(attr_type, 4)?;
        self.buf.extend_from_slice(&value.to_ne_bytes());
        self.pad();
        Ok(())
    }

    /// Byte attributes carry a trailing NUL so the stub can treat them
    /// as C strings.
    fn add_bytes(&mut self, attr_type: u16, value: &[u8]) -> Result<()> {
        self.push_header(attr_type, value.len() + 1)?;
        self.buf.extend_from_slice(value);
        self.buf.push(0);
        self.pad();
        Ok(())
    }

    fn add_bool(&mut self, attr_type: u16, value: bool) -> Result<()> {
        self.push_header(attr_type, 1)?;
        self.buf.push(value as u8);
        self.pad();
        Ok(())
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// Sort namespace join paths into the canonical setns order, producing
/// `type:path` entries. Paths must exist and must not contain the comma
/// used as the list separator.
fn order_namespace_paths(
    config: &Config,
    ns_paths: &HashMap<NamespaceType, String>,
) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for ns_type in NAMESPACE_TYPES {
        if !config.namespaces.contains(ns_type) {
            continue;
        }
        let Some(path) = ns_paths.get(&ns_type).filter(|p| !p.is_empty()) else {
            continue;
        };
        if std::fs::symlink_metadata(path).is_err() {
            return Err(Error::InvalidConfig(format!(
                "namespace path {path} does not exist"
            )));
        }
        if path.contains(',') {
            return Err(Error::InvalidConfig(format!("invalid namespace path {path}")));
        }
        paths.push(format!("{}:{}", ns_type.name(), path));
    }
    Ok(paths)
}

fn encode_id_mappings(mappings: &[crate::config::IdMap]) -> Vec<u8> {
    let mut data = Vec::new();
    for m in mappings {
        data.extend_from_slice(
            format!("{} {} {}\n", m.container_id, m.host_id, m.size).as_bytes(),
        );
    }
    data
}

/// Locate an external id-mapping tool on the host PATH. Resolved here
/// so the stub never has to do a path lookup from inside the new
/// namespaces.
fn lookup_mapping_tool(name: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Encode the bootstrap message for the init stub.
///
/// `ns_paths` holds the namespaces to join (from config for an init
/// start, from persisted state for a setns join); `clone_flags` is 0
/// for setns-only children.
pub(crate) fn bootstrap_data(
    config: &Config,
    clone_flags: u32,
    ns_paths: &HashMap<NamespaceType, String>,
    init_type: InitType,
) -> Result<Vec<u8>> {
    let mut msg = MessageBuilder::new(INIT_MSG);

    msg.add_u32(CLONE_FLAGS_ATTR, clone_flags)?;

    if !ns_paths.is_empty() {
        let ordered = order_namespace_paths(config, ns_paths)?;
        msg.add_bytes(NS_PATHS_ATTR, ordered.join(",").as_bytes())?;
    }

    // Id mappings are installed by the stub only when it creates the
    // user namespace itself.
    let joins_existing_userns = ns_paths.contains_key(&NamespaceType::User);
    if !joins_existing_userns {
        if !config.uid_mappings.is_empty() {
            if config.rootless_euid {
                if let Some(path) = lookup_mapping_tool("newuidmap") {
                    msg.add_bytes(UIDMAP_PATH_ATTR, path.as_os_str().as_encoded_bytes())?;
                }
            }
            msg.add_bytes(UIDMAP_ATTR, &encode_id_mappings(&config.uid_mappings))?;
        }
        if !config.gid_mappings.is_empty() {
            msg.add_bytes(GIDMAP_ATTR, &encode_id_mappings(&config.gid_mappings))?;
            if config.rootless_euid {
                if let Some(path) = lookup_mapping_tool("newgidmap") {
                    msg.add_bytes(GIDMAP_PATH_ATTR, path.as_os_str().as_encoded_bytes())?;
                }
            }
            if config.requires_root_or_mapping_tool() {
                msg.add_bool(SETGROUP_ATTR, true)?;
            }
        }
    }

    if let Some(adj) = config.oom_score_adj {
        msg.add_bytes(OOM_SCORE_ADJ_ATTR, adj.to_string().as_bytes())?;
    }

    msg.add_bool(ROOTLESS_EUID_ATTR, config.rootless_euid)?;

    if init_type == InitType::Standard && should_send_mount_sources(config) {
        let mut sources = Vec::new();
        for m in &config.mounts {
            if m.is_bind() {
                if m.source.as_bytes().contains(&0) {
                    return Err(Error::InvalidConfig(format!(
                        "mount source string contains null byte: {:?}",
                        m.source
                    )));
                }
                sources.extend_from_slice(m.source.as_bytes());
            }
            sources.push(0);
        }
        msg.add_bytes(MOUNT_SOURCES_ATTR, &sources)?;
    }

    Ok(msg.finish())
}
