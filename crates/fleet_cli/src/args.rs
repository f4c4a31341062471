use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Database server fleets for tests
///
/// Provisions live database servers matching declared requirements, runs commands against them,
/// and verifies crash recovery of replicated servers.
#[derive(Parser, Debug)]
#[clap(name = "dbfleet", version)]
pub struct Cli {
    /// Configuration file to read.
    /// Defaults to `$XDG_CONFIG_HOME/dbfleet/config.toml`, which may be absent.
    #[clap(long, global = true, env = "DBFLEET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[clap(long, global = true, env = "DBFLEET_LOG_JSON")]
    pub log_json: bool,

    /// Write logs to this file instead of stderr.
    #[clap(long, global = true, env = "DBFLEET_LOGFILE")]
    pub log_file: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Name under which the servers are held.
    #[clap(long, default_value = "dbfleet")]
    pub owner: String,

    /// Number of servers to provision.
    #[clap(long, default_value_t = 1)]
    pub servers: usize,

    /// Option passed to every server. May be repeated.
    #[clap(long = "server-option", allow_hyphen_values = true)]
    pub options: Vec<String>,

    /// Document with per-server overrides, keyed `[servers.<index>]`.
    #[clap(long)]
    pub overrides: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Starts servers and holds them until interrupted.
    Provision {
        #[clap(flatten)]
        servers: ServerArgs,

        /// Print server descriptions as JSON.
        #[clap(long)]
        json: bool,
    },
    /// Starts servers, then runs a command against them.
    ///
    /// The command sees `DBFLEET_URL_<n>` and `DBFLEET_PORT_<n>` for every server `n`.
    /// dbfleet exits with 0 if the command passes, 1 if it fails, and 101 if the servers did
    /// not start as expected.
    #[clap(arg_required_else_help = true)]
    Run {
        #[clap(flatten)]
        servers: ServerArgs,

        /// The servers are expected to fail to start; the command is not run.
        #[clap(long)]
        expect_failure: bool,

        /// The command to run.
        #[clap(required = true, last = true)]
        command: Vec<String>,
    },
    /// Repeatedly kills a master, and verifies its replicas after every recovery.
    Crash {
        #[clap(long, default_value = "dbfleet")]
        owner: String,

        /// Number of replicas following the master.
        #[clap(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
        replicas: u16,

        /// Crash cycles to run. Overrides the configuration.
        #[clap(long)]
        iterations: Option<usize>,

        /// Seed for random kill delays.
        #[clap(long)]
        seed: Option<u64>,
    },
}
