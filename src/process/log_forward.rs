//! Forwards framed log records from the stub's log pipe.
//!
//! The stub writes one JSON record per line (`{"level": "...",
//! "msg": "..."}`) until it execs or dies. A dedicated thread re-emits
//! each record through `tracing` under the `stub` target and exits at
//! EOF.

use std::io::{BufRead, BufReader};
use std::os::fd::OwnedFd;
use std::thread::JoinHandle;

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(default)]
    level: String,
    #[serde(default)]
    msg: String,
}

/// Spawn the forwarder thread over the read end of the log pipe.
/// The returned handle resolves when the stub closes its write end.
pub(crate) fn forward(read_end: OwnedFd) -> JoinHandle<Result<()>> {
    std::thread::Builder::new()
        .name("stub-log".into())
        .spawn(move || {
            let reader = BufReader::new(std::fs::File::from(read_end));
            for line in reader.lines() {
                let line = line?;
                match serde_json::from_str::<LogRecord>(&line) {
                    Ok(record) => emit(&record),
                    // Not every write is framed; pass raw lines through.
                    Err(_) => tracing::debug!(target: "stub", "{line}"),
                }
            }
            tracing::debug!(target: "stub", "log pipe closed");
            Ok(())
        })
        .expect("spawn stub-log thread")
}

fn emit(record: &LogRecord) {
    match record.level.as_str() {
        "error" => tracing::error!(target: "stub", "{}", record.msg),
        "warning" | "warn" => tracing::warn!(target: "stub", "{}", record.msg),
        "info" => tracing::info!(target: "stub", "{}", record.msg),
        _ => tracing::debug!(target: "stub", "{}", record.msg),
    }
}
