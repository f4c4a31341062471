//! Database server instances: their ports, data directory snapshots, and lifecycle.

pub mod command;
pub mod engine;
pub mod environment;
pub mod error;
pub mod id;
pub mod instance;
pub mod layout;
pub mod ports;
pub mod snapshot;
pub mod sql;
pub mod timeouts;
