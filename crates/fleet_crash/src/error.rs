use std::{path::PathBuf, time::Duration};

use fleet_manager::error::FleetError;
use fleet_server::{error::ServerError, sql::SqlError};
use fleet_utils::{error::LocatedError, exit::ExitCode};
use thiserror::Error;

use crate::checksum::ChecksumDiff;

#[derive(Debug, Error)]
pub enum CrashError {
    #[error("crash cycles need a master and at least one replica, but {owner} holds {servers} servers")]
    NotEnoughServers { owner: String, servers: usize },

    #[error("{server} was not reachable within {waited:?} of restarting after a crash")]
    RecoveryTimeout { server: String, waited: Duration },

    #[error("{replica} did not catch up with its master within {waited:?}")]
    ReplicationSyncTimeout { replica: String, waited: Duration },

    #[error("replication on {replica} stopped with error {errno}: {message}")]
    ReplicationBroken {
        replica: String,
        errno: String,
        message: String,
    },

    #[error("{0}")]
    ChecksumMismatch(ChecksumDiff),

    #[error("{step} of the backup tool exited with code {code} (see {log})")]
    Backup {
        step: &'static str,
        code: ExitCode,
        log: PathBuf,
    },

    #[error("unexpected result from {server}: {reason}")]
    UnexpectedResult { server: String, reason: String },

    #[error("crash cycle abandoned on interrupt")]
    Interrupted,

    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("{0}")]
    Located(#[from] LocatedError),
}
