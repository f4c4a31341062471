//! Engine capabilities.
//!
//! Everything that differs between database server families (how to initialize a data
//! directory, how to start, ping and shut down a server, how liveness is observed) lives behind
//! the [Engine] trait. The lifecycle in [crate::instance] is engine-agnostic.

mod drizzled;
mod mysqld;

use std::{fmt, num::NonZeroU16, path::PathBuf, sync::Arc};

use serde_derive::{Deserialize, Serialize};

use crate::{command::CommandLine, layout::ServerLayout, ports::PortRange};

pub use drizzled::DrizzledEngine;
pub use mysqld::{MysqldEngine, MysqldFlavor};

/// Host every fleet server listens on.
pub const LOCALHOST: &str = "127.0.0.1";

/// Supported server families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Mysql,
    Percona,
    Drizzle,
}

impl EngineKind {
    /// Builds the capability implementation for this engine family.
    pub fn capability(&self, binaries: EngineBinaries) -> Arc<dyn Engine> {
        match self {
            EngineKind::Mysql => Arc::new(MysqldEngine::new(MysqldFlavor::Mysql, binaries)),
            EngineKind::Percona => Arc::new(MysqldEngine::new(MysqldFlavor::Percona, binaries)),
            EngineKind::Drizzle => Arc::new(DrizzledEngine::new(binaries)),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineKind::Mysql => "mysql",
            EngineKind::Percona => "percona",
            EngineKind::Drizzle => "drizzle",
        };
        f.write_str(name)
    }
}

/// Locations of an engine's programs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineBinaries {
    /// The server daemon.
    pub server: PathBuf,
    /// The client used to ping and shut the server down.
    pub client: Option<PathBuf>,
    /// A dedicated data directory initialization program, if the server cannot initialize
    /// itself.
    pub install_db: Option<PathBuf>,
    /// Installation root passed to the server as its base directory.
    pub basedir: Option<PathBuf>,
    /// Libraries preloaded into every server process.
    #[serde(default)]
    pub preload: Vec<PathBuf>,
}

impl EngineBinaries {
    pub(crate) fn preload_env(&self) -> Vec<(String, String)> {
        if self.preload.is_empty() {
            return vec![];
        }
        let joined = self
            .preload
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        vec![("LD_PRELOAD".to_owned(), joined)]
    }
}

/// How a starting server is observed to have become live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessCheck {
    /// The server writes its pid file once it accepts connections.
    PidFile,
    /// The server must answer a ping invocation.
    Ping,
}

/// The master a replica server follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterLink {
    pub name: String,
    pub port: u16,
}

/// Everything an engine needs to build the command lines for one server.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    pub name: &'a str,
    pub server_id: u32,
    pub layout: &'a ServerLayout,
    pub ports: PortRange,
    pub options: &'a [String],
    pub master: Option<&'a MasterLink>,
}

/// Capabilities of one database server family.
pub trait Engine: Send + Sync + fmt::Debug {
    fn kind(&self) -> EngineKind;

    /// How many consecutive ports one server reserves.
    fn port_count(&self) -> NonZeroU16;

    fn liveness(&self) -> LivenessCheck;

    /// Environment every server process of this engine is started with.
    fn environment(&self) -> Vec<(String, String)>;

    /// Command that initializes a fresh data directory, if the engine needs one.
    fn init_command(&self, layout: &ServerLayout) -> Option<CommandLine>;

    fn start_command(&self, ctx: &LaunchContext<'_>) -> CommandLine;

    fn stop_command(&self, ctx: &LaunchContext<'_>) -> CommandLine;

    /// Command that exits with zero iff the server accepts connections.
    fn ping_command(&self, ctx: &LaunchContext<'_>) -> CommandLine;

    fn supports_replication(&self) -> bool;

    /// Connection string handed to external programs such as load generators.
    fn connection_url(&self, ports: PortRange) -> String;
}
