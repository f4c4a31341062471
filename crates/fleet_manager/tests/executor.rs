use std::path::PathBuf;

use async_trait::async_trait;
use fleet_manager::{
    executor::{Executor, TestUnit, UnitOutcome},
    requirements::RequirementSet,
    FleetManager,
};
use fleet_server::{
    id::OwnerId,
    instance::{ServerInfo, ServerStatus},
};
use fleet_test_utils::{allocator, settings, FakeEngine, REJECTED_OPTION};
use fleet_utils::error::AnyError;
use ntest::timeout;

struct CountServers {
    expected: usize,
}

#[async_trait]
impl TestUnit for CountServers {
    fn name(&self) -> &str {
        "count_servers"
    }

    fn requirements(&self) -> RequirementSet {
        RequirementSet::bare(self.expected)
    }

    async fn run(&self, _fleet: &FleetManager, servers: &[ServerInfo]) -> Result<(), AnyError> {
        if servers.len() != self.expected {
            return Err(AnyError::msg(format!("got {} servers", servers.len())));
        }
        if servers.iter().any(|s| s.status != ServerStatus::Running) {
            return Err(AnyError::msg("a server is not running"));
        }
        Ok(())
    }
}

struct AlwaysFails;

#[async_trait]
impl TestUnit for AlwaysFails {
    fn name(&self) -> &str {
        "always_fails"
    }

    async fn run(&self, _fleet: &FleetManager, _servers: &[ServerInfo]) -> Result<(), AnyError> {
        Err(AnyError::msg("assertion failed"))
    }
}

struct RejectsStart;

#[async_trait]
impl TestUnit for RejectsStart {
    fn name(&self) -> &str {
        "rejects_start"
    }

    fn requirements(&self) -> RequirementSet {
        [vec![REJECTED_OPTION]].into_iter().collect()
    }

    fn expect_failure(&self) -> bool {
        true
    }

    async fn run(&self, _fleet: &FleetManager, _servers: &[ServerInfo]) -> Result<(), AnyError> {
        unreachable!("the body of an expected-failure unit is never run")
    }
}

fn executor(workdir: PathBuf) -> Executor {
    Executor {
        owner: OwnerId::from("bot0"),
        workdir,
        environment: Default::default(),
    }
}

#[tokio::test]
#[timeout(30000)]
async fn passing_unit() {
    let tmp = tempfile::tempdir().unwrap();
    let fleet = FleetManager::new(settings(FakeEngine::new()), allocator());
    let executor = executor(tmp.path().to_owned());

    let outcome = executor
        .run_unit(&fleet, &CountServers { expected: 2 })
        .await
        .unwrap();
    assert!(outcome.is_passed());

    fleet.cleanup().await;
}

#[tokio::test]
#[timeout(30000)]
async fn failing_unit_resets_servers_for_the_next_unit() {
    let tmp = tempfile::tempdir().unwrap();
    let fleet = FleetManager::new(settings(FakeEngine::new()), allocator());
    let executor = executor(tmp.path().to_owned());

    let outcome = executor.run_unit(&fleet, &AlwaysFails).await.unwrap();
    assert!(matches!(outcome, UnitOutcome::Failed(e) if e.to_string() == "assertion failed"));

    let before = fleet.servers(&executor.owner).await[0].pid;
    let outcome = executor
        .run_unit(&fleet, &CountServers { expected: 1 })
        .await
        .unwrap();
    assert!(outcome.is_passed());
    assert_ne!(fleet.servers(&executor.owner).await[0].pid, before);

    fleet.cleanup().await;
}

#[tokio::test]
#[timeout(30000)]
async fn expected_failure_unit_passes_without_running() {
    let tmp = tempfile::tempdir().unwrap();
    let fleet = FleetManager::new(settings(FakeEngine::new()), allocator());
    let executor = executor(tmp.path().to_owned());

    let outcome = executor.run_unit(&fleet, &RejectsStart).await.unwrap();
    assert!(outcome.is_passed());

    fleet.cleanup().await;
}

#[tokio::test]
#[timeout(30000)]
async fn unexpected_bad_start_fails_unit() {
    let tmp = tempfile::tempdir().unwrap();
    let fleet = FleetManager::new(
        settings(FakeEngine::new().start_behavior(fleet_test_utils::FakeStart::Fail)),
        allocator(),
    );
    let executor = executor(tmp.path().to_owned());

    let outcome = executor
        .run_unit(&fleet, &CountServers { expected: 1 })
        .await
        .unwrap();
    assert!(matches!(outcome, UnitOutcome::BadStart { count: 1 }));

    fleet.cleanup().await;
}
