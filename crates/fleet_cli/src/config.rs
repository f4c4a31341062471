//! The dbfleet configuration file.
//!
//! ```toml
//! [fleet]
//! workdir = "/var/tmp/dbfleet"
//! engine = "percona"
//! base_port = 13000
//!
//! [fleet.binaries]
//! server = "/usr/sbin/mysqld"
//! client = "/usr/bin/mysqladmin"
//!
//! [crash]
//! iterations = 10
//! kill_delay = { kind = "uniform", min_millis = 2000, max_millis = 8000 }
//! workload = ["gentest.pl", "--dsn={url}", "--threads=8"]
//!
//! [sql]
//! client = "/usr/bin/mysql"
//! ```

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use etcetera::{app_strategy, AppStrategy, AppStrategyArgs};
use fleet_crash::{kill::KillDelay, workload::LoadGenerator, CrashConfig, ReplicaSeeding};
use fleet_manager::FleetManager;
use fleet_server::{
    command::CommandLine,
    engine::{EngineBinaries, EngineKind},
    instance::ServerSettings,
    ports::{PortAllocator, PortCheck, DEFAULT_SEARCH_WINDOW},
    sql::MysqlCliClient,
    timeouts::{ExecutionMode, LifecycleTimeouts},
};
use serde_derive::Deserialize;

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    let strategy = app_strategy::Xdg::new(AppStrategyArgs {
        top_level_domain: "org".to_string(),
        author: "dbfleet".to_string(),
        app_name: "dbfleet".to_string(),
    })?;
    Ok(strategy.config_dir().join("config.toml"))
}

#[derive(Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DbfleetConfig {
    #[serde(default)]
    pub fleet: FleetSection,
    #[serde(default)]
    pub crash: CrashSection,
    #[serde(default)]
    pub sql: SqlSection,
}

#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct FleetSection {
    /// Root of every server's directories.
    pub workdir: PathBuf,
    pub engine: EngineKind,
    pub binaries: EngineBinaries,
    pub mode: ExecutionMode,
    /// First port tried for every server.
    pub base_port: u16,
    /// How far above `base_port` free ports are searched for.
    pub port_window: u16,
    pub datasets_dir: Option<PathBuf>,
    /// Environment every server is started with.
    pub environment: BTreeMap<String, String>,
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            workdir: std::env::temp_dir().join("dbfleet"),
            engine: EngineKind::Mysql,
            binaries: EngineBinaries {
                server: PathBuf::from("mysqld"),
                client: Some(PathBuf::from("mysqladmin")),
                ..EngineBinaries::default()
            },
            mode: ExecutionMode::Native,
            base_port: 9306,
            port_window: DEFAULT_SEARCH_WINDOW,
            datasets_dir: None,
            environment: BTreeMap::new(),
        }
    }
}

impl FleetSection {
    pub fn settings(&self) -> ServerSettings {
        ServerSettings {
            engine: self.engine.capability(self.binaries.clone()),
            mode: self.mode,
            timeouts: LifecycleTimeouts::DEFAULT,
            base_port: self.base_port,
        }
    }

    pub fn manager(&self) -> FleetManager {
        let ports = PortAllocator::new(self.port_window, PortCheck::Bind);
        let fleet = FleetManager::new(self.settings(), ports);
        match &self.datasets_dir {
            Some(dir) => fleet.with_datasets_dir(dir),
            None => fleet,
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct CrashSection {
    pub iterations: usize,
    pub kill_delay: KillDelay,
    /// Load generator command. The master's URL replaces `{url}` in its arguments, or is
    /// appended.
    pub workload: Vec<String>,
    /// Where workload output is collected. Defaults to `workload.log` in the fleet workdir.
    pub workload_log: Option<PathBuf>,
    /// `seeding = "change_master"`, or a `[crash.seeding.backup]` table describing the backup
    /// tool.
    pub seeding: ReplicaSeeding,
    pub recovery_timeout_secs: u64,
    pub sync_timeout_secs: u64,
}

impl Default for CrashSection {
    fn default() -> Self {
        let config = CrashConfig::default();
        Self {
            iterations: config.iterations,
            kill_delay: config.kill_delay,
            workload: vec![],
            workload_log: None,
            seeding: config.seeding,
            recovery_timeout_secs: config.timeouts.recovery.as_secs(),
            sync_timeout_secs: config.timeouts.sync.as_secs(),
        }
    }
}

impl CrashSection {
    pub fn to_config(&self, fleet: &FleetSection) -> CrashConfig {
        let mut config = CrashConfig {
            iterations: self.iterations,
            kill_delay: self.kill_delay,
            environment: fleet.environment.clone(),
            ..CrashConfig::default()
        };
        config.timeouts.recovery = Duration::from_secs(self.recovery_timeout_secs);
        config.timeouts.sync = Duration::from_secs(self.sync_timeout_secs);

        if let Some((program, args)) = self.workload.split_first() {
            let log = self
                .workload_log
                .clone()
                .unwrap_or_else(|| fleet.workdir.join("workload.log"));
            config.workload = Some(LoadGenerator::new(
                CommandLine::new(program).args(args.iter().cloned()),
                log,
            ));
        }
        config.seeding = self.seeding.clone();
        config
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SqlSection {
    /// The `mysql` command-line client.
    pub client: PathBuf,
    pub timeout_secs: u64,
}

impl Default for SqlSection {
    fn default() -> Self {
        Self {
            client: PathBuf::from("mysql"),
            timeout_secs: 60,
        }
    }
}

impl SqlSection {
    pub fn client(&self) -> MysqlCliClient {
        MysqlCliClient::new(&self.client, Duration::from_secs(self.timeout_secs))
    }
}

impl DbfleetConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.fleet.port_window == 0 {
            bail!("fleet.port_window must be positive");
        }
        Ok(config)
    }

    /// Reads the configuration at `path`, or at the default location if no path is given.
    /// Only a missing default file is tolerated.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path.to_owned(), true),
            None => (default_config_path()?, false),
        };
        if !explicit && !path.exists() {
            tracing::debug!(?path, "no configuration file, using defaults");
            return Ok(Self::default());
        }

        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("parsing configuration {}", path.display()))?;
        tracing::debug!(?path, "loaded configuration");
        Ok(config)
    }
}
