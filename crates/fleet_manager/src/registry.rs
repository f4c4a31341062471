//! The fleet registry: which owner holds which servers, and the reconciliation pipeline that
//! brings an owner's servers in line with what its next test declares.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use fleet_server::{
    engine::MasterLink,
    environment::Environment,
    id::{OwnerId, ServerId},
    instance::{ServerInfo, ServerInstance, ServerSettings, ServerStatus},
    ports::PortAllocator,
    snapshot,
};
use fleet_utils::{error::ResultLocation, here};
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    error::FleetError,
    overrides::OverrideDocument,
    requirements::{
        options_match, strip_runner_options, ClusterLink, DatasetLoad, RequirementSet,
        SpecialRequests,
    },
    session::OwnerSession,
};

/// Everything an owner declares for its next test.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    pub owner: OwnerId,
    pub requirements: RequirementSet,
    pub special: SpecialRequests,
    /// Root under which new servers lay out their directories.
    pub workdir: PathBuf,
    /// Configuration document with per-server overrides.
    pub config_path: Option<PathBuf>,
    pub environment: Environment,
    pub expect_failure: bool,
}

impl ServerRequest {
    pub fn new(owner: OwnerId, requirements: RequirementSet, workdir: impl Into<PathBuf>) -> Self {
        Self {
            owner,
            requirements,
            special: SpecialRequests::default(),
            workdir: workdir.into(),
            config_path: None,
            environment: Environment::new(),
            expect_failure: false,
        }
    }
}

/// What one reconciliation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub retired: usize,
    pub resets: usize,
    pub starts: usize,
    /// Starts whose result disagreed with the request's expectation.
    pub bad_starts: usize,
}

#[derive(Debug, Clone)]
pub struct Provisioned {
    pub servers: Vec<ServerInfo>,
    pub report: ReconcileReport,
}

impl Provisioned {
    pub fn bad_starts(&self) -> usize {
        self.report.bad_starts
    }
}

type SessionHandle = Arc<AsyncMutex<OwnerSession>>;

pub struct FleetManager {
    settings: ServerSettings,
    datasets_dir: Option<PathBuf>,
    ports: PortAllocator,
    sessions: parking_lot::Mutex<BTreeMap<OwnerId, SessionHandle>>,
}

impl FleetManager {
    pub fn new(settings: ServerSettings, ports: PortAllocator) -> Self {
        Self {
            settings,
            datasets_dir: None,
            ports,
            sessions: Default::default(),
        }
    }

    /// Directory holding the canned datasets that `load_dataset` requests name.
    pub fn with_datasets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.datasets_dir = Some(dir.into());
        self
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// The session of `owner`, created empty if the owner is new.
    ///
    /// Holding the session's lock excludes every other pipeline on the same owner.
    pub fn session(&self, owner: &OwnerId) -> SessionHandle {
        let mut sessions = self.sessions.lock();
        Arc::clone(
            sessions
                .entry(owner.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(OwnerSession::new(owner.clone())))),
        )
    }

    fn all_sessions(&self) -> Vec<SessionHandle> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn owners(&self) -> Vec<OwnerId> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub async fn servers(&self, owner: &OwnerId) -> Vec<ServerInfo> {
        self.session(owner).lock().await.infos()
    }

    /// Hands `owner` live servers matching `request`, creating, reconfiguring, resetting and
    /// starting servers as needed.
    #[tracing::instrument(level = "trace", skip(self, request), fields(owner = %request.owner))]
    pub async fn request_servers(&self, request: &ServerRequest) -> Result<Provisioned, FleetError> {
        let handle = self.session(&request.owner);
        let mut session = handle.lock().await;
        let mut report = ReconcileReport::default();

        self.reset_failed(&mut session, &mut report).await?;
        self.reconcile_count(
            &mut session,
            request.requirements.len(),
            &request.workdir,
            &mut report,
        )
        .await?;

        let mut special = request.special.clone();
        let overrides = match &request.config_path {
            Some(path) => OverrideDocument::load(path).await?,
            None => OverrideDocument::default(),
        };
        self.reconcile_options(
            &mut session,
            &request.requirements,
            &overrides,
            &mut special,
            &mut report,
        )
        .await?;

        self.apply_special_requests(&mut session, &special).await?;

        self.start_stopped(
            &mut session,
            &request.environment,
            request.expect_failure,
            &mut report,
        )
        .await?;

        tracing::info!(
            owner=%request.owner,
            servers=session.len(),
            created=report.created,
            retired=report.retired,
            resets=report.resets,
            starts=report.starts,
            bad_starts=report.bad_starts,
            "servers ready"
        );

        Ok(Provisioned {
            servers: session.infos(),
            report,
        })
    }

    /// Servers whose last test failed are in an unknown state, and start over from their
    /// snapshot.
    async fn reset_failed(
        &self,
        session: &mut OwnerSession,
        report: &mut ReconcileReport,
    ) -> Result<(), FleetError> {
        for instance in session.instances_mut() {
            if instance.failed_last_test() {
                tracing::debug!(server=%instance.id(), "resetting after failed test");
                instance.reset().await?;
                report.resets += 1;
            }
        }
        Ok(())
    }

    async fn reconcile_count(
        &self,
        session: &mut OwnerSession,
        desired: usize,
        workdir: &Path,
        report: &mut ReconcileReport,
    ) -> Result<(), FleetError> {
        while session.len() < desired {
            let id = ServerId::new(session.owner().clone(), session.len());
            let mut instance = ServerInstance::new(id, self.settings.clone(), workdir);
            instance.initialize().await?;
            session.push(instance);
            report.created += 1;
        }

        // Retired servers stay tracked until all of them are destroyed, so that a failed or
        // interrupted shrink leaves them to cleanup.
        for retired in session.tail_mut(desired) {
            tracing::debug!(server=%retired.id(), "retiring server");
            retired.destroy(&self.ports).await?;
            report.retired += 1;
        }
        session.truncate(desired);
        Ok(())
    }

    async fn reconcile_options(
        &self,
        session: &mut OwnerSession,
        requirements: &RequirementSet,
        overrides: &OverrideDocument,
        special: &mut SpecialRequests,
        report: &mut ReconcileReport,
    ) -> Result<(), FleetError> {
        for (index, (instance, required)) in session
            .instances_mut()
            .iter_mut()
            .zip(requirements.iter())
            .enumerate()
        {
            if instance.needs_reset() {
                instance.reset().await?;
                instance.set_master(None)?;
                report.resets += 1;
            }

            let mut desired = required.to_vec();
            if let Some(over) = overrides.get(index) {
                if let Some(options) = &over.options {
                    desired = options.clone();
                }
                if over.restart {
                    desired.push("--restart".to_owned());
                }
                if let Some(dataset) = &over.load_dataset {
                    special.load_dataset.push(DatasetLoad {
                        dataset: dataset.clone(),
                        server: index,
                    });
                }
            }

            if !options_match(instance.options(), &desired) {
                tracing::info!(
                    kind = "ReconciliationMismatch",
                    server=%instance.id(), from=?instance.options(), to=?desired,
                    "options changed, resetting server"
                );
                instance.reset().await?;
                instance.set_options(strip_runner_options(desired));
                report.resets += 1;
            }
        }
        Ok(())
    }

    async fn apply_special_requests(
        &self,
        session: &mut OwnerSession,
        special: &SpecialRequests,
    ) -> Result<(), FleetError> {
        for load in &special.load_dataset {
            self.load_dataset(session, load).await?;
        }
        for link in &special.join_cluster {
            self.join_cluster(session, *link).await?;
        }
        Ok(())
    }

    async fn load_dataset(
        &self,
        session: &mut OwnerSession,
        load: &DatasetLoad,
    ) -> Result<(), FleetError> {
        let source = match &self.datasets_dir {
            Some(dir) => dir.join(&load.dataset),
            None => PathBuf::from(&load.dataset),
        };
        if !source.is_dir() {
            return Err(FleetError::DatasetMissing {
                name: load.dataset.clone(),
                path: source,
            });
        }

        let instance = session.get_mut(load.server)?;
        instance.stop().await?;

        let datadir = instance.layout().datadir.clone();
        let from = source.clone();
        tokio::task::spawn_blocking(move || {
            snapshot::clear_dir(&datadir)?;
            snapshot::copy_dir_all(&from, &datadir)
        })
        .await
        .located(here!())?
        .located(here!())?;

        // The data directory no longer matches the snapshot.
        instance.mark_needs_reset();
        tracing::info!(server=%instance.id(), dataset=%load.dataset, "loaded dataset");
        Ok(())
    }

    async fn join_cluster(
        &self,
        session: &mut OwnerSession,
        link: ClusterLink,
    ) -> Result<(), FleetError> {
        let (master, replica) = session.pair_mut(link.master, link.replica)?;

        let master_ports = master.ensure_ports(&self.ports)?;
        let master_link = MasterLink {
            name: master.name().to_owned(),
            port: master_ports.first(),
        };
        replica.set_master(Some(master_link))?;

        // Both ends restart with the replication configuration.
        for end in [master, replica] {
            if end.status() != ServerStatus::Stopped {
                end.stop().await?;
            }
            end.mark_needs_reset();
        }
        tracing::info!(
            master = link.master,
            replica = link.replica,
            owner=%session.owner(),
            "joined cluster"
        );
        Ok(())
    }

    async fn start_stopped(
        &self,
        session: &mut OwnerSession,
        environment: &Environment,
        expect_failure: bool,
        report: &mut ReconcileReport,
    ) -> Result<(), FleetError> {
        for instance in session.instances_mut() {
            match instance.status() {
                ServerStatus::Running => {
                    tracing::debug!(server=%instance.id(), "already running");
                    continue;
                }
                // A failed start may have left a late-starting process behind.
                ServerStatus::Failed | ServerStatus::Starting => instance.stop().await?,
                ServerStatus::Stopped => {}
            }

            let outcome = instance
                .start(&self.ports, environment, expect_failure)
                .await?;
            report.starts += 1;
            if outcome.is_bad() {
                report.bad_starts += 1;
            }
        }
        Ok(())
    }

    /// Resets every server of `owner` to its snapshot.
    pub async fn reset_all(&self, owner: &OwnerId) -> Result<(), FleetError> {
        let handle = self.session(owner);
        let mut session = handle.lock().await;
        for instance in session.instances_mut() {
            instance.reset().await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self, owner: &OwnerId) -> Result<(), FleetError> {
        let handle = self.session(owner);
        let mut session = handle.lock().await;
        for instance in session.instances_mut() {
            instance.stop().await?;
        }
        Ok(())
    }

    /// Records the result of the test `owner` just ran. Servers of a failed test are reset before
    /// they are handed out again.
    pub async fn finish_test(&self, owner: &OwnerId, passed: bool) {
        if passed {
            return;
        }
        let handle = self.session(owner);
        let mut session = handle.lock().await;
        for instance in session.instances_mut() {
            instance.set_failed_last_test(true);
        }
        tracing::debug!(%owner, "marked servers of failed test");
    }

    /// Stops every server of every owner and frees every port. Failures are logged; cleanup
    /// always runs to the end.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn cleanup(&self) {
        let mut stopped = 0;
        for handle in self.all_sessions() {
            let mut session = handle.lock().await;
            for instance in session.instances_mut() {
                if let Err(error) = instance.stop().await {
                    tracing::error!(server=%instance.id(), %error, "failed to stop server during cleanup");
                }
                instance.release_ports(&self.ports);
                stopped += 1;
            }
        }

        let leaked = self.ports.free_all();
        if leaked > 0 {
            tracing::warn!(leaked, "freed port ranges held by no server");
        }
        tracing::info!(stopped, "cleaned up all servers");
    }
}
