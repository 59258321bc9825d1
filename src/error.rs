//! Error types for container lifecycle operations.
//!
//! Errors are categorized by what the caller can do about them:
//! state-precondition violations, configuration problems, helper
//! capability failures, and wrapped OS errors. Causes are carried as
//! sources, never flattened into strings.

use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during container lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation requires a created, running, or paused container.
    #[error("container not running")]
    NotRunning,

    /// Resume was called on a container that is not paused.
    #[error("container not paused")]
    NotPaused,

    /// Operation cannot be performed while paused or stopped.
    #[error("container paused or stopped")]
    PausedOrStopped,

    /// Destroy was called on a container whose processes still run.
    #[error("container is not stopped")]
    NotStopped,

    /// Requested state transition is not legal.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    /// The checkpoint/restore helper is too old for the operation.
    #[error("criu version {found} must be {required} or higher")]
    VersionTooOld { found: u32, required: u32 },

    /// The checkpoint/restore helper lacks a required feature.
    #[error("criu is missing feature {0}")]
    FeatureMissing(&'static str),

    /// Configuration rejected by a lifecycle operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A syscall failed.
    #[error("{op}: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    /// The checkpoint/restore helper reported a failure over RPC.
    #[error("criu failed: type {req_type} errno {errno}, log file: {log_path}")]
    HelperFailure {
        req_type: &'static str,
        errno: i32,
        log_path: String,
    },

    /// The init stub failed during bootstrap, or its pipe closed early.
    #[error("container init failed: {0}")]
    ChildFailure(String),

    /// An artifact that must not pre-exist does (e.g. the exec fifo).
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Generic IO error (catch-all for file operations).
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Hook execution failed.
    #[error("hook {kind}: {source}")]
    Hook {
        kind: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Cgroup or Intel RDT manager reported an error.
    #[error("manager: {0}")]
    Manager(String),

    /// Message framing or serialization failed.
    #[error("codec: {0}")]
    Codec(String),
}

impl Error {
    /// Wrap a `nix` failure with the name of the operation that failed.
    pub(crate) fn syscall(op: &'static str, source: nix::Error) -> Self {
        Error::Syscall { op, source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<prost::EncodeError> for Error {
    fn from(err: prost::EncodeError) -> Self {
        Error::Codec(err.to_string())
    }
}

/// Filters errors that indicate a terminate already happened: the child
/// exited on its own, was reaped elsewhere, or the wait raced. Anything
/// else is returned unaltered.
pub(crate) fn ignore_terminate_errors(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(Error::Syscall { source, .. })
            if source == nix::Error::ESRCH || source == nix::Error::ECHILD =>
        {
            Ok(())
        }
        Err(err) => {
            let s = err.to_string();
            if s.contains("already exited")
                || s.contains("process done")
                || s.contains("wait already called")
            {
                return Ok(());
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_terminate_errors_passes_ok() {
        assert!(ignore_terminate_errors(Ok(())).is_ok());
    }

    #[test]
    fn test_ignore_terminate_errors_swallows_reaped() {
        let gone = Err(Error::syscall("kill", nix::Error::ESRCH));
        assert!(ignore_terminate_errors(gone).is_ok());

        let reaped = Err(Error::syscall("waitpid", nix::Error::ECHILD));
        assert!(ignore_terminate_errors(reaped).is_ok());
    }

    #[test]
    fn test_ignore_terminate_errors_swallows_exited_message() {
        let err = Err(Error::ChildFailure("process already exited".into()));
        assert!(ignore_terminate_errors(err).is_ok());
    }

    #[test]
    fn test_ignore_terminate_errors_keeps_real_failures() {
        let err = Err(Error::syscall("kill", nix::Error::EPERM));
        assert!(ignore_terminate_errors(err).is_err());
    }

    #[test]
    fn test_error_display() {
        let err = Error::VersionTooOld {
            found: 20000,
            required: 30000,
        };
        assert_eq!(err.to_string(), "criu version 20000 must be 30000 or higher");

        let err = Error::HelperFailure {
            req_type: "DUMP",
            errno: 12,
            log_path: "/work/dump.log".into(),
        };
        assert!(err.to_string().contains("type DUMP errno 12"));
    }
}
