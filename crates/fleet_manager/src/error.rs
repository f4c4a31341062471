use std::path::PathBuf;

use fleet_server::{error::ServerError, id::OwnerId};
use fleet_utils::error::LocatedError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("{owner} holds no server at index {index}")]
    UnknownServer { owner: OwnerId, index: usize },

    #[error("server {index} cannot replicate from itself")]
    SelfReplication { index: usize },

    #[error("dataset {name} does not exist at {path}")]
    DatasetMissing { name: String, path: PathBuf },

    #[error("invalid configuration document {path}: {reason}")]
    InvalidOverrides { path: PathBuf, reason: String },

    #[error("{0}")]
    Located(#[from] LocatedError),
}
