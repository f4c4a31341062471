//! Runs declared test units against the fleet.

use std::path::PathBuf;

use async_trait::async_trait;
use fleet_server::{environment::Environment, id::OwnerId, instance::ServerInfo};
use fleet_utils::error::AnyError;

use crate::{
    error::FleetError,
    registry::{FleetManager, ServerRequest},
    requirements::{RequirementSet, SpecialRequests},
};

/// A test that needs live servers.
#[async_trait]
pub trait TestUnit: Send + Sync {
    fn name(&self) -> &str;

    /// One option set per server the test needs.
    fn requirements(&self) -> RequirementSet {
        RequirementSet::default()
    }

    fn special_requests(&self) -> SpecialRequests {
        SpecialRequests::default()
    }

    /// Configuration document with per-server overrides.
    fn config_path(&self) -> Option<PathBuf> {
        None
    }

    /// The test passes iff its servers fail to start; its body is not run.
    fn expect_failure(&self) -> bool {
        false
    }

    async fn run(&self, fleet: &FleetManager, servers: &[ServerInfo]) -> Result<(), AnyError>;
}

/// The executor a unit runs on: it owns servers across the units it runs.
#[derive(Debug, Clone)]
pub struct Executor {
    pub owner: OwnerId,
    pub workdir: PathBuf,
    pub environment: Environment,
}

#[derive(Debug)]
pub enum UnitOutcome {
    Passed,
    /// Servers did not start the way the unit expected.
    BadStart { count: usize },
    Failed(AnyError),
}

impl UnitOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, UnitOutcome::Passed)
    }
}

impl Executor {
    /// Provisions the unit's servers, runs its body against them, and reports the result to the
    /// fleet.
    #[tracing::instrument(level = "trace", skip(self, fleet, unit), fields(owner = %self.owner, unit = unit.name()))]
    pub async fn run_unit(
        &self,
        fleet: &FleetManager,
        unit: &dyn TestUnit,
    ) -> Result<UnitOutcome, FleetError> {
        let request = ServerRequest {
            owner: self.owner.clone(),
            requirements: unit.requirements(),
            special: unit.special_requests(),
            workdir: self.workdir.clone(),
            config_path: unit.config_path(),
            environment: self.environment.clone(),
            expect_failure: unit.expect_failure(),
        };

        let provisioned = match fleet.request_servers(&request).await {
            Ok(provisioned) => provisioned,
            Err(error) => {
                fleet.finish_test(&self.owner, false).await;
                return Err(error);
            }
        };

        let outcome = if provisioned.bad_starts() > 0 {
            UnitOutcome::BadStart {
                count: provisioned.bad_starts(),
            }
        } else if unit.expect_failure() {
            UnitOutcome::Passed
        } else {
            match unit.run(fleet, &provisioned.servers).await {
                Ok(()) => UnitOutcome::Passed,
                Err(error) => UnitOutcome::Failed(error),
            }
        };

        match &outcome {
            UnitOutcome::Passed => tracing::info!(unit = unit.name(), "passed"),
            UnitOutcome::BadStart { count } => {
                tracing::error!(unit = unit.name(), count, "servers started unexpectedly")
            }
            UnitOutcome::Failed(error) => tracing::error!(unit = unit.name(), %error, "failed"),
        }

        fleet.finish_test(&self.owner, outcome.is_passed()).await;
        Ok(outcome)
    }
}
