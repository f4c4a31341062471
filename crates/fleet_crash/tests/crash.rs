use std::{os::unix::fs::PermissionsExt, path::Path, sync::Arc, time::Duration};

use fleet_crash::{
    backup::BackupTool, error::CrashError, kill::KillDelay, workload::LoadGenerator, CrashConfig,
    CrashCycle, CrashTimeouts, ReplicaSeeding,
};
use fleet_manager::{requirements::RequirementSet, FleetManager, ServerRequest};
use fleet_server::{
    command::CommandLine,
    id::OwnerId,
    instance::{ServerSettings, ServerStatus},
    timeouts::LifecycleTimeouts,
};
use fleet_test_utils::{
    allocator, settings, FakeEngine, FakeSqlClient, FakeStart, FAST_TIMEOUTS,
};
use fleet_utils::shutdown::ShutdownManager;
use indoc::indoc;
use ntest::timeout;
use tracing_test::traced_test;

const MASTER: &str = "bot0.s0";
const REPLICA: &str = "bot0.s1";

const FAST: CrashTimeouts = CrashTimeouts {
    recovery: Duration::from_secs(5),
    recovery_interval: Duration::from_millis(20),
    sync: Duration::from_millis(500),
    sync_interval: Duration::from_millis(20),
};

async fn provisioned_fleet(servers: usize, workdir: &Path) -> Arc<FleetManager> {
    provisioned_fleet_with(settings(FakeEngine::new()), servers, workdir).await
}

async fn provisioned_fleet_with(
    settings: ServerSettings,
    servers: usize,
    workdir: &Path,
) -> Arc<FleetManager> {
    let fleet = Arc::new(FleetManager::new(settings, allocator()));
    let request = ServerRequest::new(
        OwnerId::from("bot0"),
        RequirementSet::bare(servers),
        workdir,
    );
    let provisioned = fleet.request_servers(&request).await.unwrap();
    assert_eq!(provisioned.bad_starts(), 0);
    fleet
}

fn config(iterations: usize) -> CrashConfig {
    CrashConfig {
        iterations,
        kill_delay: KillDelay::Fixed { millis: 50 },
        timeouts: FAST,
        ..CrashConfig::default()
    }
}

fn cycle(fleet: &Arc<FleetManager>, sql: &FakeSqlClient, config: CrashConfig) -> CrashCycle {
    CrashCycle::new(
        Arc::clone(fleet),
        OwnerId::from("bot0"),
        Arc::new(sql.clone()),
        config,
    )
}

fn same_tables(sql: &FakeSqlClient) {
    for server in [MASTER, REPLICA] {
        sql.set_table(server, "test.t1", "3412934");
        sql.set_table(server, "test.t2", "77");
    }
}

#[tokio::test]
#[traced_test]
async fn crash_cycles_verify_replicas() {
    let tmp = tempfile::tempdir().unwrap();
    let fleet = provisioned_fleet(2, tmp.path()).await;
    let sql = FakeSqlClient::new();
    same_tables(&sql);

    let workload = LoadGenerator::new(
        CommandLine::new("sh").args(["-c", "echo \"load on $1\"", "workload"]),
        tmp.path().join("workload.log"),
    );
    let mut crash = cycle(
        &fleet,
        &sql,
        CrashConfig {
            workload: Some(workload),
            ..config(2)
        },
    );

    let owner = OwnerId::from("bot0");
    let first_pid = fleet.servers(&owner).await[0].pid;

    crash.prepare_replicas().await.unwrap();
    let (_shutdown, mut rx) = ShutdownManager::new_pair();
    let report = crash.run(&mut rx).await.unwrap();

    assert_eq!(report.cycles, 2);
    assert_eq!(report.kills, 2);
    assert_eq!(report.tables_compared, 4);
    assert_eq!(report.workloads.len(), 2);
    assert!(report.workloads[0].output.contains("load on fake://127.0.0.1:"));
    assert_eq!(crash.crashes_remaining(), 0);

    let servers = fleet.servers(&owner).await;
    assert_eq!(servers[0].status, ServerStatus::Running);
    assert_ne!(servers[0].pid, first_pid);

    let replica_sql = sql.executed_on(REPLICA);
    assert!(replica_sql[0].starts_with("CHANGE MASTER TO"));
    assert!(replica_sql[0].contains("MASTER_LOG_FILE='mysql-bin.000001', MASTER_LOG_POS=154"));
    assert_eq!(
        replica_sql
            .iter()
            .filter(|s| s.as_str() == "STOP SLAVE")
            .count(),
        2
    );
    assert!(logs_contain("crash cycles passed"));

    fleet.cleanup().await;
}

#[tokio::test]
#[timeout(30000)]
async fn checksum_mismatch_reports_the_diff() {
    let tmp = tempfile::tempdir().unwrap();
    let fleet = provisioned_fleet(2, tmp.path()).await;
    let sql = FakeSqlClient::new();
    same_tables(&sql);
    sql.set_table(REPLICA, "test.t2", "78");
    // One-sided tables are not compared.
    sql.set_table(MASTER, "test.only_master", "1");

    let mut crash = cycle(&fleet, &sql, config(3));
    crash.prepare_replicas().await.unwrap();
    let (_shutdown, mut rx) = ShutdownManager::new_pair();
    let err = crash.run(&mut rx).await.unwrap_err();

    let CrashError::ChecksumMismatch(diff) = err else {
        panic!("expected a checksum mismatch, got {err:?}");
    };
    assert_eq!(diff.master, MASTER);
    assert_eq!(diff.replica, REPLICA);
    assert_eq!(diff.tables.len(), 1);
    assert_eq!(diff.tables[0].table, "test.t2");
    assert_eq!(diff.tables[0].master, "77");
    assert_eq!(diff.tables[0].replica, "78");
    assert_eq!(
        diff.to_string(),
        "1 tables differ between bot0.s0 and bot0.s1:\n  test.t2: 77 != 78\n"
    );
    // The failing cycle is not counted as done.
    assert_eq!(crash.crashes_remaining(), 3);

    fleet.cleanup().await;
}

#[tokio::test]
#[timeout(30000)]
async fn lagging_replica_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let fleet = provisioned_fleet(2, tmp.path()).await;
    let sql = FakeSqlClient::new();
    same_tables(&sql);
    sql.state().lagging_polls = usize::MAX;

    let mut crash = cycle(&fleet, &sql, config(1));
    crash.prepare_replicas().await.unwrap();
    let (_shutdown, mut rx) = ShutdownManager::new_pair();
    let err = crash.run(&mut rx).await.unwrap_err();

    assert!(
        matches!(&err, CrashError::ReplicationSyncTimeout { replica, .. } if replica == REPLICA),
        "{err:?}"
    );
    assert!(!sql
        .executed_on(MASTER)
        .iter()
        .any(|s| s.starts_with("CHECKSUM TABLE")));

    fleet.cleanup().await;
}

#[tokio::test]
#[traced_test]
async fn interrupt_abandons_the_cycle() {
    let tmp = tempfile::tempdir().unwrap();
    let fleet = provisioned_fleet(2, tmp.path()).await;
    let sql = FakeSqlClient::new();

    let mut crash = cycle(
        &fleet,
        &sql,
        CrashConfig {
            kill_delay: KillDelay::Fixed { millis: 60_000 },
            ..config(1)
        },
    );
    crash.prepare_replicas().await.unwrap();

    let (mut shutdown, mut rx) = ShutdownManager::new_pair();
    let interrupter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.shutdown_immediately().unwrap();
        shutdown
    });

    let err = crash.run(&mut rx).await.unwrap_err();
    assert!(matches!(err, CrashError::Interrupted), "{err:?}");
    assert_eq!(crash.crashes_remaining(), 1);
    assert!(logs_contain("crash cycles interrupted"));
    interrupter.await.unwrap();

    // The pending kill was cancelled.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let servers = fleet.servers(&OwnerId::from("bot0")).await;
    assert_eq!(servers[0].status, ServerStatus::Running);

    fleet.cleanup().await;
}

#[tokio::test]
#[timeout(30000)]
async fn crash_cycles_need_a_replica() {
    let tmp = tempfile::tempdir().unwrap();
    let fleet = provisioned_fleet(1, tmp.path()).await;
    let sql = FakeSqlClient::new();

    let mut crash = cycle(&fleet, &sql, config(1));
    let err = crash.prepare_replicas().await.unwrap_err();
    assert!(
        matches!(&err, CrashError::NotEnoughServers { servers: 1, .. }),
        "{err:?}"
    );

    let (_shutdown, mut rx) = ShutdownManager::new_pair();
    let err = crash.run(&mut rx).await.unwrap_err();
    assert!(matches!(err, CrashError::NotEnoughServers { .. }));
    assert!(sql.state().executed.is_empty());

    fleet.cleanup().await;
}

/// Servers that start at once, but take `restart_delay` to come back after a crash, with a
/// lifecycle start timeout far below that delay.
fn slow_recovery(restart_delay: Duration) -> ServerSettings {
    ServerSettings {
        timeouts: LifecycleTimeouts {
            start: Duration::from_millis(300),
            ..FAST_TIMEOUTS
        },
        ..settings(FakeEngine::new().start_behavior(FakeStart::SlowRestart(restart_delay)))
    }
}

#[tokio::test]
#[timeout(30000)]
async fn recovery_may_outlast_the_start_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = slow_recovery(Duration::from_millis(1500));
    let fleet = provisioned_fleet_with(settings, 2, tmp.path()).await;
    let sql = FakeSqlClient::new();
    same_tables(&sql);

    let mut crash = cycle(
        &fleet,
        &sql,
        CrashConfig {
            timeouts: CrashTimeouts {
                recovery: Duration::from_secs(10),
                ..FAST
            },
            ..config(1)
        },
    );
    crash.prepare_replicas().await.unwrap();
    let (_shutdown, mut rx) = ShutdownManager::new_pair();
    let report = crash.run(&mut rx).await.unwrap();

    assert_eq!(report.cycles, 1);
    assert_eq!(report.kills, 1);
    let servers = fleet.servers(&OwnerId::from("bot0")).await;
    assert_eq!(servers[0].status, ServerStatus::Running);

    fleet.cleanup().await;
}

#[tokio::test]
#[timeout(30000)]
async fn master_that_never_recovers_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let settings = slow_recovery(Duration::from_secs(5));
    let fleet = provisioned_fleet_with(settings, 2, tmp.path()).await;
    let sql = FakeSqlClient::new();
    same_tables(&sql);

    let recovery = Duration::from_millis(400);
    let mut crash = cycle(
        &fleet,
        &sql,
        CrashConfig {
            timeouts: CrashTimeouts { recovery, ..FAST },
            ..config(1)
        },
    );
    crash.prepare_replicas().await.unwrap();
    let (_shutdown, mut rx) = ShutdownManager::new_pair();
    let err = crash.run(&mut rx).await.unwrap_err();

    assert!(
        matches!(
            &err,
            CrashError::RecoveryTimeout { server, waited }
                if server == MASTER && *waited == recovery
        ),
        "{err:?}"
    );
    assert_eq!(crash.crashes_remaining(), 1);
    // Replicas were never resynchronized.
    assert!(!sql.executed_on(REPLICA).iter().any(|s| s == "STOP SLAVE"));

    fleet.cleanup().await;
}

const FAKE_BACKUP_TOOL: &str = indoc! {r#"
    #!/bin/sh
    for last; do :; done
    case "$*" in
      *--apply-log*) ;;
      *--copy-back*)
        for arg; do
          case "$arg" in --datadir=*) echo restored > "${arg#--datadir=}/restored.dat" ;; esac
        done ;;
      *) mkdir -p "$last" && printf 'mysql-bin.000009\t4\n' > "$last/xtrabackup_binlog_info" ;;
    esac
"#};

#[tokio::test]
#[timeout(30000)]
async fn replicas_are_seeded_from_a_backup() {
    let tmp = tempfile::tempdir().unwrap();
    let fleet = provisioned_fleet(2, tmp.path()).await;
    let sql = FakeSqlClient::new();

    let script = tmp.path().join("innobackupex");
    std::fs::write(&script, FAKE_BACKUP_TOOL).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let crash = cycle(
        &fleet,
        &sql,
        CrashConfig {
            seeding: ReplicaSeeding::Backup(BackupTool::new(script, "xtrabackup")),
            ..config(1)
        },
    );
    crash.prepare_replicas().await.unwrap();

    let servers = fleet.servers(&OwnerId::from("bot0")).await;
    assert_eq!(servers[1].status, ServerStatus::Running);
    assert!(servers[1].datadir.join("restored.dat").exists());
    // The seed file of the initialized data directory was cleared before the restore.
    assert!(!servers[1].datadir.join(fleet_test_utils::SEED_FILE).exists());

    let replica_sql = sql.executed_on(REPLICA);
    assert!(replica_sql[0].contains("MASTER_LOG_FILE='mysql-bin.000009', MASTER_LOG_POS=4"));
    assert_eq!(replica_sql[1], "START SLAVE");
    assert!(sql.executed_on(MASTER).is_empty());

    fleet.cleanup().await;
}
