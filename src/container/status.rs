//! Container lifecycle status and state machine.
//!
//! The in-memory node is advisory: `Container::refresh_state` re-derives
//! it from syscall-observable signals (freezer state, init liveness,
//! fifo presence) before every status-dependent decision. Transitions
//! between nodes are still validated so that logic errors surface as
//! typed failures instead of silent corruption.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Externally visible container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Created,
    Running,
    Paused,
    Stopped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(Status::Created),
            "running" => Ok(Status::Running),
            "paused" => Ok(Status::Paused),
            "stopped" => Ok(Status::Stopped),
            _ => Err(()),
        }
    }
}

/// Tagged state node. `Restored` keeps the image directory it came
/// from; every other node carries no data beyond its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StateNode {
    Stopped,
    Created,
    Running,
    Paused,
    Restored { image_dir: PathBuf },
}

impl StateNode {
    pub(crate) fn status(&self) -> Status {
        match self {
            StateNode::Stopped => Status::Stopped,
            StateNode::Created => Status::Created,
            StateNode::Running => Status::Running,
            StateNode::Paused => Status::Paused,
            // A restored container is a running container.
            StateNode::Restored { .. } => Status::Running,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            StateNode::Stopped => "stopped",
            StateNode::Created => "created",
            StateNode::Running => "running",
            StateNode::Paused => "paused",
            StateNode::Restored { .. } => "restored",
        }
    }

    pub(crate) fn can_transition_to(&self, next: &StateNode) -> bool {
        use StateNode::*;
        if std::mem::discriminant(self) == std::mem::discriminant(next) {
            // Re-entering the current node is always allowed; refresh
            // does this constantly.
            return true;
        }
        matches!(
            (self, next),
            (Stopped, Running)
                | (Stopped, Restored { .. })
                | (Created, Running)
                | (Created, Paused)
                | (Created, Stopped)
                | (Running, Paused)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Restored { .. }, Stopped)
                | (Restored { .. }, Paused)
        )
    }

    /// Move to `next`, or fail with a typed error naming both ends.
    pub(crate) fn transition(&mut self, next: StateNode) -> Result<()> {
        if !self.can_transition_to(&next) {
            return Err(Error::InvalidTransition {
                from: self.name(),
                to: next.name(),
            });
        }
        *self = next;
        Ok(())
    }

    /// Replace the node with what the kernel says is true. Observation
    /// bypasses the transition guards: the guards protect lifecycle
    /// decisions, not reality.
    pub(crate) fn observe(&mut self, next: StateNode) {
        if *self != next {
            tracing::trace!(from = self.name(), to = next.name(), "state refreshed");
            *self = next;
        }
    }
}
