//! Kill-restart-resync-verify cycles against one owner's master and replicas.
//!
//! The first server of the owner is the master; every other server replicates from it. Each
//! cycle runs the workload against the master, SIGKILLs the master from a background worker,
//! restarts it, waits for every replica to catch up, and compares table checksums.

use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use fleet_manager::{session::OwnerSession, FleetManager};
use fleet_server::{
    environment::Environment,
    id::OwnerId,
    instance::ServerInstance,
    snapshot,
    sql::SqlClient,
};
use fleet_utils::{
    error::{ErrorLocation, ResultLocation},
    here,
    poll::wait_until,
    shutdown::ShutdownReceiver,
};
use rand::{rngs::StdRng, SeedableRng};
use serde_derive::Deserialize;

use crate::{
    backup::BackupTool,
    checksum::{self, checksum_tables},
    error::CrashError,
    kill::{KillDelay, KillWorker},
    replication,
    workload::{LoadGenerator, WorkloadReport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashTimeouts {
    /// How long a restarted master may take to answer again.
    pub recovery: Duration,
    pub recovery_interval: Duration,
    /// How long a replica may take to catch up with a recovered master.
    pub sync: Duration,
    pub sync_interval: Duration,
}

impl Default for CrashTimeouts {
    fn default() -> Self {
        Self {
            recovery: Duration::from_secs(300),
            recovery_interval: Duration::from_secs(1),
            sync: Duration::from_secs(60),
            sync_interval: Duration::from_secs(1),
        }
    }
}

/// How replicas get the master's data before the first cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaSeeding {
    /// Point replicas at the master's current binary log position.
    #[default]
    ChangeMaster,
    /// Restore a fresh backup of the master into every replica first.
    Backup(BackupTool),
}

#[derive(Debug, Clone)]
pub struct CrashConfig {
    pub iterations: usize,
    pub kill_delay: KillDelay,
    pub workload: Option<LoadGenerator>,
    pub seeding: ReplicaSeeding,
    pub timeouts: CrashTimeouts,
    /// Environment a crashed master is restarted with.
    pub environment: Environment,
}

impl Default for CrashConfig {
    fn default() -> Self {
        Self {
            iterations: 1,
            kill_delay: KillDelay::default(),
            workload: None,
            seeding: ReplicaSeeding::default(),
            timeouts: CrashTimeouts::default(),
            environment: Environment::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrashReport {
    pub cycles: usize,
    /// Kills that found a live master process.
    pub kills: usize,
    pub workloads: Vec<WorkloadReport>,
    /// Tables compared between the master and a replica, over all cycles.
    pub tables_compared: usize,
}

pub struct CrashCycle {
    fleet: Arc<FleetManager>,
    owner: OwnerId,
    sql: Arc<dyn SqlClient>,
    config: CrashConfig,
    crashes_remaining: usize,
    worker: Option<KillWorker>,
    rng: StdRng,
}

impl CrashCycle {
    pub fn new(
        fleet: Arc<FleetManager>,
        owner: OwnerId,
        sql: Arc<dyn SqlClient>,
        config: CrashConfig,
    ) -> Self {
        Self {
            fleet,
            owner,
            sql,
            crashes_remaining: config.iterations,
            config,
            worker: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Makes kill delays reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn crashes_remaining(&self) -> usize {
        self.crashes_remaining
    }

    fn check_size(&self, session: &OwnerSession) -> Result<(), CrashError> {
        if session.len() < 2 {
            return Err(CrashError::NotEnoughServers {
                owner: self.owner.to_string(),
                servers: session.len(),
            });
        }
        Ok(())
    }

    /// Makes every replica replicate from the master, seeded as configured.
    #[tracing::instrument(level = "trace", skip(self), fields(owner = %self.owner))]
    pub async fn prepare_replicas(&self) -> Result<(), CrashError> {
        let handle = self.fleet.session(&self.owner);
        let mut session = handle.lock().await;
        self.check_size(&session)?;

        let (master, replicas) = split_master(&mut session)?;
        let master_info = master.info();
        let master_port = master
            .ports()
            .ok_or_else(|| "master has no ports".located(here!()))?
            .first();

        match &self.config.seeding {
            ReplicaSeeding::ChangeMaster => {
                let coords = replication::master_position(&*self.sql, &master_info).await?;
                for replica in replicas.iter() {
                    let info = replica.info();
                    replication::set_master(&*self.sql, &info, master_port, Some(&coords)).await?;
                    replication::start_stream(&*self.sql, &info).await?;
                }
            }
            ReplicaSeeding::Backup(tool) => {
                let dir = master.layout().tmpdir.join("seed-backup");
                remove_dir_if_exists(dir.clone()).await?;
                let log = master.layout().logdir.join("backup.log");

                let taken = tool.take(master_port, dir, log).await?;
                let prepared = tool.prepare(taken).await?;

                for replica in replicas.iter_mut() {
                    replica.stop().await?;
                    let datadir = replica.layout().datadir.clone();
                    tokio::task::spawn_blocking(move || snapshot::clear_dir(&datadir))
                        .await
                        .located(here!())?
                        .located(here!())?;

                    let coords = tool.restore(&prepared, &replica.layout().datadir).await?;
                    // The data directory no longer matches the snapshot.
                    replica.mark_needs_reset();
                    self.restart(replica).await?;

                    let info = replica.info();
                    replication::set_master(&*self.sql, &info, master_port, Some(&coords))
                        .await?;
                    replication::start_stream(&*self.sql, &info).await?;
                }
            }
        }

        tracing::info!(owner=%self.owner, replicas=replicas.len(), "replicas prepared");
        Ok(())
    }

    /// Runs the remaining crash cycles. An interrupt abandons the cycle in progress.
    #[tracing::instrument(level = "trace", skip(self, shutdown), fields(owner = %self.owner))]
    pub async fn run(&mut self, shutdown: &mut ShutdownReceiver) -> Result<CrashReport, CrashError> {
        let handle = self.fleet.session(&self.owner);
        let mut session = handle.lock().await;
        self.check_size(&session)?;

        let mut report = CrashReport::default();
        while self.crashes_remaining > 0 {
            tokio::select! {
                result = self.cycle(&mut session, &mut report) => result?,
                _ = shutdown.recv_shutdown_immediately() => {
                    if let Some(worker) = self.worker.take() {
                        worker.abort();
                    }
                    tracing::warn!(owner=%self.owner, remaining=self.crashes_remaining, "crash cycles interrupted");
                    return Err(CrashError::Interrupted);
                }
            }
            self.crashes_remaining -= 1;
        }

        tracing::info!(
            owner=%self.owner,
            cycles=report.cycles,
            kills=report.kills,
            tables=report.tables_compared,
            "crash cycles passed"
        );
        Ok(report)
    }

    async fn cycle(
        &mut self,
        session: &mut OwnerSession,
        report: &mut CrashReport,
    ) -> Result<(), CrashError> {
        let (master, replicas) = split_master(session)?;
        let cycle = report.cycles + 1;
        tracing::info!(cycle, master=%master.id(), "starting crash cycle");

        let workload = match (&self.config.workload, master.connection_url()) {
            (Some(generator), Some(url)) => Some(generator.launch(&url)),
            _ => None,
        };

        // At most one kill is ever in flight.
        if let Some(mut previous) = self.worker.take() {
            previous.join().await?;
        }
        let delay = self.config.kill_delay.sample(&mut self.rng);
        let worker = self
            .worker
            .insert(KillWorker::spawn(master.kill_handle(), delay));
        let killed = worker.join().await;
        self.worker = None;
        let killed = killed?;

        master.mark_crashed().await;
        if killed {
            report.kills += 1;
        }

        if let Some(workload) = workload {
            let result = workload.finish().await?;
            if !result.completed_cleanly() {
                tracing::warn!(cycle, code=?result.code, "workload did not complete cleanly");
            }
            report.workloads.push(result);
        }

        self.recover(master).await?;

        let master_info = master.info();
        for replica in replicas.iter() {
            replication::restart_stream(&*self.sql, &replica.info()).await?;
        }
        for replica in replicas.iter() {
            replication::wait_caught_up(
                &*self.sql,
                &master_info,
                &replica.info(),
                self.config.timeouts.sync_interval,
                self.config.timeouts.sync,
            )
            .await?;
        }

        let master_sums = checksum_tables(&*self.sql, &master_info).await?;
        for replica in replicas.iter() {
            let info = replica.info();
            let replica_sums = checksum_tables(&*self.sql, &info).await?;
            checksum::compare(
                (&master_info.name, &master_sums),
                (&info.name, &replica_sums),
            )
            .map_err(CrashError::ChecksumMismatch)?;
            report.tables_compared += master_sums.len();
        }

        report.cycles += 1;
        tracing::info!(cycle, tables = master_sums.len(), "crash cycle verified");
        Ok(())
    }

    /// Restarts a crashed master and waits until it answers again.
    ///
    /// The whole recovery budget applies, not the lifecycle start timeout.
    async fn recover(&self, master: &mut ServerInstance) -> Result<(), CrashError> {
        let timeouts = self.config.timeouts;
        let started = Instant::now();
        let timed_out = |server: &ServerInstance| CrashError::RecoveryTimeout {
            server: server.name().to_owned(),
            waited: timeouts.recovery,
        };

        let outcome = master
            .start_within(
                self.fleet.ports(),
                &self.config.environment,
                false,
                timeouts.recovery,
            )
            .await?;
        if outcome.raw_failed {
            return Err(timed_out(master));
        }

        let master = &*master;
        let remaining = timeouts.recovery.saturating_sub(started.elapsed());
        if !wait_until(|| master.ping(), timeouts.recovery_interval, remaining).await {
            return Err(timed_out(master));
        }
        tracing::info!(server=%master.id(), elapsed=?started.elapsed(), "recovered after crash");
        Ok(())
    }

    async fn restart(&self, instance: &mut ServerInstance) -> Result<(), CrashError> {
        let outcome = instance
            .start(self.fleet.ports(), &self.config.environment, false)
            .await?;
        match outcome.issue() {
            Some(issue) => Err(issue.into()),
            None => Ok(()),
        }
    }
}

fn split_master(
    session: &mut OwnerSession,
) -> Result<(&mut ServerInstance, &mut [ServerInstance]), CrashError> {
    let owner = session.owner().to_string();
    let servers = session.len();
    session
        .instances_mut()
        .split_first_mut()
        .filter(|(_, replicas)| !replicas.is_empty())
        .ok_or(CrashError::NotEnoughServers { owner, servers })
}

async fn remove_dir_if_exists(dir: PathBuf) -> Result<(), CrashError> {
    match tokio::fs::remove_dir_all(&dir).await {
        Err(error) if error.kind() != std::io::ErrorKind::NotFound => {
            Err(error.located(here!()).into())
        }
        _ => Ok(()),
    }
}
