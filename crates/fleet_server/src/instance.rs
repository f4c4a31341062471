//! The lifecycle of one server instance.
//!
//! ```text
//!              start                 live
//!   Stopped ----------> Starting ------------> Running
//!      ^                   |                      |
//!      |                   | never live           | stop / crash
//!      |                   v                      |
//!      +--- stop ------ Failed <------------------+
//! ```
//!
//! An instance owns its ports from its first start until it is destroyed, so restarts always
//! reuse the same ports.

use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use fleet_utils::{
    error::{ErrorLocation, ResultLocation},
    here, log_assert,
    poll::wait_until,
};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use serde_derive::Serialize;
use tokio::process::Child;

use crate::{
    command::{append_stdio, CommandLine, CommandOutput},
    engine::{Engine, EngineKind, LaunchContext, LivenessCheck, MasterLink},
    environment::{self, Environment},
    error::ServerError,
    id::ServerId,
    layout::ServerLayout,
    ports::{PortAllocator, PortRange},
    snapshot,
    timeouts::{ExecutionMode, LifecycleTimeouts},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Failed,
}

/// Settings shared by every instance of a fleet.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub engine: Arc<dyn Engine>,
    pub mode: ExecutionMode,
    pub timeouts: LifecycleTimeouts,
    /// Port from which range allocation scans upward.
    pub base_port: u16,
}

/// Result of a start attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub server: String,
    /// The server never became live.
    pub raw_failed: bool,
    /// The caller asked for a start that should fail.
    pub expected_failure: bool,
    pub error_log: PathBuf,
}

impl StartOutcome {
    /// A start is bad when its raw result disagrees with the caller's expectation.
    pub fn is_bad(&self) -> bool {
        self.raw_failed != self.expected_failure
    }

    pub fn issue(&self) -> Option<ServerError> {
        match (self.raw_failed, self.expected_failure) {
            (true, false) => Some(ServerError::UnexpectedStartupFailure {
                server: self.server.clone(),
                error_log: self.error_log.clone(),
            }),
            (false, true) => Some(ServerError::UnexpectedStartupSuccess {
                server: self.server.clone(),
            }),
            _ => None,
        }
    }
}

/// Read-only view of an instance, handed to test code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub engine: EngineKind,
    pub status: ServerStatus,
    pub ports: Option<PortRange>,
    pub connection_url: Option<String>,
    pub options: Vec<String>,
    pub master: Option<MasterLink>,
    pub datadir: PathBuf,
    pub error_log: PathBuf,
    pub socket_file: PathBuf,
    pub pid: Option<i32>,
}

pub struct ServerInstance {
    id: ServerId,
    name: String,
    settings: ServerSettings,
    layout: ServerLayout,
    options: Vec<String>,
    ports: Option<PortRange>,
    master: Option<MasterLink>,
    status: ServerStatus,
    tried_start: bool,
    failed_last_test: bool,
    needs_reset: bool,
    process: Option<Child>,
}

impl ServerInstance {
    pub fn new(id: ServerId, settings: ServerSettings, workdir: &Path) -> Self {
        let layout = ServerLayout::for_server(workdir, id.owner.as_str(), &id.short_name());
        Self {
            name: id.to_string(),
            id,
            settings,
            layout,
            options: vec![],
            ports: None,
            master: None,
            status: ServerStatus::Stopped,
            tried_start: false,
            failed_last_test: false,
            needs_reset: false,
            process: None,
        }
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    /// Fully-qualified name, e.g. `bot0.s1`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.settings.engine
    }

    pub fn layout(&self) -> &ServerLayout {
        &self.layout
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    pub fn ports(&self) -> Option<PortRange> {
        self.ports
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Replaces the options the next start runs with.
    pub fn set_options(&mut self, options: Vec<String>) {
        self.options = options;
    }

    pub fn master(&self) -> Option<&MasterLink> {
        self.master.as_ref()
    }

    pub fn set_master(&mut self, master: Option<MasterLink>) -> Result<(), ServerError> {
        let engine = &self.settings.engine;
        if master.is_some() && !engine.supports_replication() {
            return Err(ServerError::ReplicationUnsupported {
                engine: engine.kind().to_string(),
            });
        }
        self.master = master;
        Ok(())
    }

    pub fn tried_start(&self) -> bool {
        self.tried_start
    }

    pub fn failed_last_test(&self) -> bool {
        self.failed_last_test
    }

    pub fn set_failed_last_test(&mut self, failed: bool) {
        self.failed_last_test = failed;
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    pub fn mark_needs_reset(&mut self) {
        self.needs_reset = true;
    }

    pub fn connection_url(&self) -> Option<String> {
        self.ports.map(|p| self.settings.engine.connection_url(p))
    }

    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            engine: self.settings.engine.kind(),
            status: self.status,
            ports: self.ports,
            connection_url: self.connection_url(),
            options: self.options.clone(),
            master: self.master.clone(),
            datadir: self.layout.datadir.clone(),
            error_log: self.layout.error_log.clone(),
            socket_file: self.layout.socket_file.clone(),
            pid: read_pid(&self.layout.pid_file).map(Pid::as_raw),
        }
    }

    fn launch_context(&self) -> Option<LaunchContext<'_>> {
        Some(LaunchContext {
            name: &self.name,
            server_id: self.id.replication_id(),
            layout: &self.layout,
            ports: self.ports?,
            options: &self.options,
            master: self.master.as_ref(),
        })
    }

    /// Creates the instance's directories and data directory, then snapshots the fresh data
    /// directory so later resets can return to it.
    #[tracing::instrument(level = "trace", skip(self), fields(server = %self.id))]
    pub async fn initialize(&mut self) -> Result<(), ServerError> {
        self.layout.create_dirs().located(here!())?;

        if let Some(mut init) = self.settings.engine.init_command(&self.layout) {
            init.env.extend(self.settings.engine.environment());
            tracing::debug!(server=%self.id, cmd=%init, "initializing data directory");

            let timeout = self.settings.timeouts.start_timeout(self.settings.mode);
            let code = init
                .run(CommandOutput::AppendTo(&self.layout.error_log), timeout)
                .await
                .located(here!())?;
            if !code.is_success() {
                return Err(ServerError::InitFailed {
                    server: self.name.clone(),
                    code,
                    error_log: self.layout.error_log.clone(),
                });
            }
        }

        snapshot::capture(&self.layout).await?;
        tracing::info!(server=%self.id, "initialized");
        Ok(())
    }

    /// Allocates the instance's ports if it does not hold any yet.
    pub fn ensure_ports(&mut self, allocator: &PortAllocator) -> Result<PortRange, ServerError> {
        if let Some(ports) = self.ports {
            return Ok(ports);
        }
        let ports = allocator.allocate(
            &self.name,
            self.settings.base_port,
            self.settings.engine.port_count(),
        )?;
        self.ports = Some(ports);
        Ok(ports)
    }

    pub fn release_ports(&mut self, allocator: &PortAllocator) {
        if let Some(ports) = self.ports.take() {
            allocator.free(ports);
        }
    }

    /// Launches the server and waits for it to become live.
    ///
    /// A server that never becomes live is not an error: the outcome records the raw failure,
    /// and whether it was what the caller expected.
    pub async fn start(
        &mut self,
        allocator: &PortAllocator,
        env: &Environment,
        expect_failure: bool,
    ) -> Result<StartOutcome, ServerError> {
        let live_within = self.settings.timeouts.start_timeout(self.settings.mode);
        self.start_within(allocator, env, expect_failure, live_within)
            .await
    }

    /// Like [start][Self::start], but gives the server `live_within` to become live instead of
    /// the lifecycle start timeout. Crash recovery can take far longer than a fresh start.
    #[tracing::instrument(level = "trace", skip(self, allocator, env), fields(server = %self.id))]
    pub async fn start_within(
        &mut self,
        allocator: &PortAllocator,
        env: &Environment,
        expect_failure: bool,
        live_within: Duration,
    ) -> Result<StartOutcome, ServerError> {
        log_assert!(
            !matches!(self.status, ServerStatus::Running | ServerStatus::Starting),
            server=%self.id, status=?self.status, "starting a server that is already up"
        );

        self.ensure_ports(allocator)?;
        self.layout.create_dirs().located(here!())?;
        remove_if_exists(&self.layout.pid_file).located(here!())?;

        let cmdline = self.start_command(env)?;
        tracing::info!(server=%self.id, cmd=%cmdline, expect_failure, "starting server");

        self.tried_start = true;
        self.status = ServerStatus::Starting;

        let raw_failed = match self.spawn(&cmdline) {
            Ok(child) => {
                self.process = Some(child);
                !self.wait_until_live(live_within).await
            }
            Err(error) => {
                tracing::error!(server=%self.id, ?error, "could not spawn server");
                true
            }
        };

        self.status = if raw_failed {
            ServerStatus::Failed
        } else {
            ServerStatus::Running
        };

        let outcome = StartOutcome {
            server: self.name.clone(),
            raw_failed,
            expected_failure: expect_failure,
            error_log: self.layout.error_log.clone(),
        };
        match outcome.issue() {
            Some(issue) => tracing::error!(server=%self.id, %issue, "unexpected start result"),
            None => tracing::debug!(server=%self.id, status=?self.status, "start finished"),
        }
        Ok(outcome)
    }

    fn start_command(&self, env: &Environment) -> Result<CommandLine, ServerError> {
        let ctx = self
            .launch_context()
            .ok_or_else(|| "server has no ports".located(here!()))?;
        let engine = &self.settings.engine;

        let mut cmdline = engine.start_command(&ctx);
        if self.settings.mode == ExecutionMode::Valgrind {
            cmdline = cmdline.wrapped_in(valgrind(&self.layout));
        }
        cmdline
            .env
            .extend(environment::compose(&engine.environment(), env));
        Ok(cmdline)
    }

    fn spawn(&self, cmdline: &CommandLine) -> io::Result<Child> {
        let (stdout, stderr) = append_stdio(&self.layout.error_log)?;
        let mut cmd = cmdline.to_command();
        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
        cmd.spawn()
    }

    async fn wait_until_live(&mut self, timeout: Duration) -> bool {
        let interval = self.settings.timeouts.poll_interval;
        let started = Instant::now();

        loop {
            if let Some(status) = self.reap_exited() {
                tracing::warn!(server=%self.id, %status, "server exited while starting");
                return false;
            }
            if self.observed_live().await {
                tracing::debug!(server=%self.id, elapsed=?started.elapsed(), "server is live");
                return true;
            }
            if started.elapsed() >= timeout {
                break;
            }
            tokio::time::sleep(interval).await;
        }

        // Liveness signals can lag; give the server one last chance to answer.
        tracing::warn!(server=%self.id, ?timeout, "server did not become live in time");
        self.ping().await
    }

    async fn observed_live(&self) -> bool {
        match self.settings.engine.liveness() {
            LivenessCheck::PidFile => read_pid(&self.layout.pid_file).is_some(),
            LivenessCheck::Ping => self.ping().await,
        }
    }

    /// If the launched process has exited, reaps it and returns its exit status.
    fn reap_exited(&mut self) -> Option<std::process::ExitStatus> {
        let child = self.process.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.process = None;
                Some(status)
            }
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(server=%self.id, ?error, "could not poll server process");
                None
            }
        }
    }

    /// Whether the server answers its engine's ping invocation.
    pub async fn ping(&self) -> bool {
        let Some(ctx) = self.launch_context() else {
            return false;
        };
        let ping = self.settings.engine.ping_command(&ctx);
        match ping
            .run(CommandOutput::Discard, self.settings.timeouts.ping)
            .await
        {
            Ok(code) => code.is_success(),
            Err(error) => {
                tracing::debug!(server=%self.id, ?error, "ping did not complete");
                false
            }
        }
    }

    /// Whether the server process exists.
    pub async fn is_alive(&mut self) -> bool {
        if let Some(child) = self.process.as_mut() {
            if let Ok(None) = child.try_wait() {
                return true;
            }
            self.process = None;
        }
        read_pid(&self.layout.pid_file).map_or(false, pid_exists)
    }

    /// Shuts the server down, killing it if it does not exit in time.
    ///
    /// Stopping an instance that is not running is a no-op.
    #[tracing::instrument(level = "trace", skip(self), fields(server = %self.id))]
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        let timeouts = self.settings.timeouts;

        if self.tried_start && self.status != ServerStatus::Running && self.is_alive().await {
            // A start was attempted but never confirmed; the server may still be coming up, and
            // would miss a shutdown sent now.
            let came_up =
                wait_until(|| self.ping(), timeouts.poll_interval, timeouts.stop_race).await;
            tracing::debug!(server=%self.id, came_up, "waited out unconfirmed start");
        }

        if self.is_alive().await {
            if let Some(ctx) = self.launch_context() {
                let shutdown = self.settings.engine.stop_command(&ctx);
                tracing::debug!(server=%self.id, cmd=%shutdown, "shutting down");
                match shutdown
                    .run(CommandOutput::AppendTo(&self.layout.error_log), timeouts.shutdown)
                    .await
                {
                    Ok(code) if code.is_success() => {}
                    Ok(code) => {
                        tracing::error!(server=%self.id, %code, "shutdown command failed")
                    }
                    Err(error) => {
                        tracing::warn!(server=%self.id, ?error, "shutdown command did not complete")
                    }
                }
            }

            if !self.wait_for_exit().await {
                tracing::warn!(
                    server=%self.id, timeout=?timeouts.shutdown,
                    "server did not shut down in time, killing it"
                );
                self.kill_handle().kill().located(here!())?;
                self.reap().await;
            }
        }

        self.process = None;
        self.status = ServerStatus::Stopped;
        self.tried_start = false;
        remove_if_exists(&self.layout.pid_file).located(here!())?;
        tracing::info!(server=%self.id, "stopped");
        Ok(())
    }

    async fn wait_for_exit(&mut self) -> bool {
        let timeouts = self.settings.timeouts;
        let started = Instant::now();
        loop {
            if !self.is_alive().await {
                return true;
            }
            if started.elapsed() >= timeouts.shutdown {
                return false;
            }
            tokio::time::sleep(timeouts.poll_interval).await;
        }
    }

    async fn reap(&mut self) {
        if let Some(mut child) = self.process.take() {
            let timeout = self.settings.timeouts.shutdown;
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(server=%self.id, %status, "reaped server"),
                Ok(Err(error)) => tracing::warn!(server=%self.id, ?error, "could not reap server"),
                Err(_) => tracing::warn!(server=%self.id, "server survived being killed"),
            }
        }
    }

    /// Stops the server and returns its data directory to the snapshot.
    #[tracing::instrument(level = "trace", skip(self), fields(server = %self.id))]
    pub async fn reset(&mut self) -> Result<(), ServerError> {
        self.stop().await?;
        snapshot::restore(&self.layout).await?;
        self.failed_last_test = false;
        self.needs_reset = false;
        tracing::info!(server=%self.id, "reset to snapshot");
        Ok(())
    }

    /// A handle that can kill the server process from another task.
    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            server: self.name.clone(),
            pid_file: self.layout.pid_file.clone(),
            child_pid: self.process.as_ref().and_then(Child::id),
        }
    }

    /// Records that the server was killed from outside the lifecycle, reaping its process.
    pub async fn mark_crashed(&mut self) {
        self.reap().await;
        self.status = ServerStatus::Stopped;
        self.tried_start = false;
        tracing::info!(server=%self.id, "marked crashed");
    }

    /// Stops the instance for good, returning its ports and deleting its snapshot.
    #[tracing::instrument(level = "trace", skip(self, allocator), fields(server = %self.id))]
    pub async fn destroy(&mut self, allocator: &PortAllocator) -> Result<(), ServerError> {
        let stopped = self.stop().await;
        self.release_ports(allocator);
        snapshot::discard(&self.layout).await?;
        stopped
    }
}

/// Kills a server process without access to its instance.
#[derive(Debug, Clone)]
pub struct KillHandle {
    server: String,
    pid_file: PathBuf,
    child_pid: Option<u32>,
}

impl KillHandle {
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Sends SIGKILL to the server. Returns whether there was a process to kill.
    pub fn kill(&self) -> io::Result<bool> {
        let pid = read_pid(&self.pid_file)
            .or_else(|| self.child_pid.map(|pid| Pid::from_raw(pid as i32)));
        let Some(pid) = pid else {
            tracing::warn!(server=%self.server, "no process to kill");
            return Ok(false);
        };

        match kill(pid, Signal::SIGKILL) {
            Ok(()) => {
                tracing::info!(server=%self.server, %pid, "sent SIGKILL");
                Ok(true)
            }
            Err(Errno::ESRCH) => Ok(false),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }
}

fn valgrind(layout: &ServerLayout) -> CommandLine {
    CommandLine::new("valgrind")
        .args([
            "--tool=memcheck",
            "--error-exitcode=1",
            "--leak-check=yes",
            "--num-callers=16",
        ])
        .arg(format!(
            "--log-file={}",
            layout.logdir.join("valgrind.log").display()
        ))
}

fn read_pid(pid_file: &Path) -> Option<Pid> {
    let content = std::fs::read_to_string(pid_file).ok()?;
    let pid: i32 = content.trim().parse().ok()?;
    (pid > 0).then(|| Pid::from_raw(pid))
}

fn pid_exists(pid: Pid) -> bool {
    // EPERM still means the process exists.
    !matches!(kill(pid, None), Err(Errno::ESRCH))
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        res => res,
    }
}
