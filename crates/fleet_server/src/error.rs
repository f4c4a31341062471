use std::path::PathBuf;

use fleet_utils::{error::LocatedError, exit::ExitCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no {count} consecutive free ports for {name} within {window} ports of {base}")]
    PortExhaustion {
        name: String,
        base: u16,
        count: u16,
        window: u16,
    },

    #[error("snapshot {0} does not exist; the instance was never initialized")]
    SnapshotMissing(PathBuf),

    #[error("initializing {server} exited with code {code} (see {error_log})")]
    InitFailed {
        server: String,
        code: ExitCode,
        error_log: PathBuf,
    },

    #[error("{server} failed to start (see {error_log})")]
    UnexpectedStartupFailure { server: String, error_log: PathBuf },

    #[error("{server} started, but it was expected to fail")]
    UnexpectedStartupSuccess { server: String },

    #[error("{engine} servers cannot be linked for replication")]
    ReplicationUnsupported { engine: String },

    #[error("{0}")]
    Located(#[from] LocatedError),
}
