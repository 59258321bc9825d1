//! corral - process-level Linux container lifecycle library.
//!
//! This crate owns the authoritative in-memory model of a single
//! container: creating, tracking, signaling, pausing, destroying, and
//! checkpointing/restoring it. The privileged bootstrap of the
//! container's first process happens in a stub (a re-exec of the
//! runtime binary) driven over a seqpacket init pipe; the user-visible
//! "start" moment is gated by a fifo rendezvous; checkpoint/restore is
//! driven through CRIU over its swrk RPC.
//!
//! Cgroups, Intel RDT, rootfs preparation, hooks, and networking are
//! collaborators injected through the traits in [`managers`].
//!
//! ## Example
//!
//! ```no_run
//! use corral::{Components, Container, Process};
//!
//! # fn components() -> Components { unimplemented!() }
//! # fn main() -> corral::Result<()> {
//! let container = Container::new(
//!     "c1",
//!     "/run/corral/c1",
//!     corral::Config::default(),
//!     components(),
//! )?;
//!
//! let mut init = Process {
//!     args: vec!["/bin/sh".into()],
//!     init: true,
//!     ..Default::default()
//! };
//! container.start(&mut init)?;   // container is Created, init waits
//! container.exec()?;             // fifo released, user code runs
//! # Ok(())
//! # }
//! ```

mod bootstrap;
mod config;
mod container;
mod criu;
mod error;
mod managers;
mod notify;
mod process;
mod state;
mod sys;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{
    CgroupSpec, Config, Device, FreezerState, IdMap, Mount, NAMESPACE_TYPES, Namespace,
    NamespaceType, Namespaces, Network, Process, Resources, Rlimit,
};
pub use container::{Container, Stats, Status};
pub use criu::rpc::CriuCgMode;
pub use criu::{CriuOpts, PageServer, VethPair};
pub use error::{Error, Result};
pub use managers::{
    CgroupManager, CgroupStats, Components, FsMountPreparer, HookKind, HookRunner,
    IntelRdtManager, IntelRdtStats, InterfaceStats, InterfaceStatsReader, MountPreparer,
    NetworkStrategy,
};
pub use notify::PressureLevel;
pub use state::{OCI_VERSION, OciState, State};
