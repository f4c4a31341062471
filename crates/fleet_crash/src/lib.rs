//! Crash/recovery verification: repeatedly kill a master under load, bring it back, and check
//! that its replicas still hold the same data.

pub mod backup;
pub mod checksum;
pub mod error;
pub mod kill;
pub mod orchestrator;
pub mod replication;
pub mod workload;

pub use orchestrator::{CrashConfig, CrashCycle, CrashReport, CrashTimeouts, ReplicaSeeding};
