//! Reconciles the servers held by test owners against what their tests declare.

pub mod error;
pub mod executor;
pub mod overrides;
pub mod registry;
pub mod requirements;
pub mod session;

pub use registry::{FleetManager, Provisioned, ReconcileReport, ServerRequest};
