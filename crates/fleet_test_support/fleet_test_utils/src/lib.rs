//! Test doubles for fleet servers.
//!
//! [FakeEngine] drives `sh` scripts instead of real database servers, so lifecycle and fleet
//! tests run without any database installed. A fake server writes its pid file as soon as it is
//! launched, then sleeps until it is shut down or killed. [FakeSqlClient] answers the queries
//! the crash orchestrator issues from an in-memory model of a replicated cluster.

mod sql;

pub use sql::{FakeSqlClient, FakeSqlState};

use std::{num::NonZeroU16, path::Path, sync::Arc, time::Duration};

use fleet_server::{
    command::CommandLine,
    engine::{Engine, EngineKind, LaunchContext, LivenessCheck},
    layout::ServerLayout,
    instance::ServerSettings,
    ports::{PortAllocator, PortCheck, PortRange},
    timeouts::{ExecutionMode, LifecycleTimeouts},
};
use indoc::indoc;

/// Passing this option makes a fake server refuse to start.
pub const REJECTED_OPTION: &str = "--fake-reject-start";

/// Name of the file fake initialization seeds every data directory with.
pub const SEED_FILE: &str = "seed.dat";

const SERVE: &str = indoc! {r#"
    pid_file="$1"; port="$2"; shift 2
    for opt in "$@"; do
      if [ "$opt" = "--fake-reject-start" ]; then
        echo "[ERROR] unknown option '$opt'" >&2
        exit 1
      fi
    done
    echo "fake server on port $port with options: $*"
    echo $$ > "$pid_file"
    exec sleep 3600
"#};

const EXIT_AT_ONCE: &str = indoc! {r#"
    echo "[ERROR] fake server aborting" >&2
    exit 1
"#};

const PING: &str = r#"kill -0 "$(cat "$1" 2>/dev/null)" 2>/dev/null"#;

const SHUTDOWN: &str = r#"kill -TERM "$(cat "$1")""#;

const INIT: &str = indoc! {r#"
    mkdir -p "$1" && echo "seed" > "$1/seed.dat"
"#};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeStart {
    /// Serve until shut down, unless started with [REJECTED_OPTION].
    Serve,
    /// Exit with an error immediately.
    Fail,
    /// Ignore shutdown requests; only SIGKILL stops the server.
    IgnoreShutdown,
    /// Serve, but only write the pid file after the delay.
    Delayed(Duration),
    /// Serve at once on the first launch; every later launch, such as a restart after a crash,
    /// writes its pid file only after the delay.
    SlowRestart(Duration),
}

#[derive(Debug, Clone)]
pub struct FakeEngine {
    start: FakeStart,
    port_count: NonZeroU16,
    replication: bool,
    fail_init: bool,
    fail_shutdown: bool,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            start: FakeStart::Serve,
            port_count: NonZeroU16::new(2).unwrap(),
            replication: true,
            fail_init: false,
            fail_shutdown: false,
        }
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_behavior(mut self, start: FakeStart) -> Self {
        self.start = start;
        self
    }

    pub fn port_count(mut self, count: u16) -> Self {
        self.port_count = NonZeroU16::new(count).unwrap();
        self
    }

    pub fn without_replication(mut self) -> Self {
        self.replication = false;
        self
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// The shutdown command exits nonzero without touching the server.
    pub fn failing_shutdown(mut self) -> Self {
        self.fail_shutdown = true;
        self
    }

    pub fn shared(self) -> Arc<dyn Engine> {
        Arc::new(self)
    }
}

/// The serving script, running `pause` just before the pid file is written.
fn delay_pid_file(pause: &str) -> String {
    SERVE.replace(
        "echo $$ > \"$pid_file\"",
        &format!("{pause}\necho $$ > \"$pid_file\""),
    )
}

fn sh(script: &str, name: &str) -> CommandLine {
    CommandLine::new("sh").arg("-c").arg(script).arg(name)
}

impl Engine for FakeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Mysql
    }

    fn port_count(&self) -> NonZeroU16 {
        self.port_count
    }

    fn liveness(&self) -> LivenessCheck {
        LivenessCheck::PidFile
    }

    fn environment(&self) -> Vec<(String, String)> {
        vec![("FAKE_ENGINE".to_owned(), "1".to_owned())]
    }

    fn init_command(&self, layout: &ServerLayout) -> Option<CommandLine> {
        if self.fail_init {
            return Some(sh("echo 'cannot initialize' >&2; exit 3", "fake-init"));
        }
        Some(sh(INIT, "fake-init").arg(layout.datadir.display().to_string()))
    }

    fn start_command(&self, ctx: &LaunchContext<'_>) -> CommandLine {
        let script = match self.start {
            FakeStart::Serve => SERVE.to_owned(),
            FakeStart::Fail => EXIT_AT_ONCE.to_owned(),
            FakeStart::IgnoreShutdown => format!(
                "trap '' TERM\n{}",
                SERVE.replace("exec sleep 3600", "while true; do sleep 1; done")
            ),
            FakeStart::Delayed(delay) => delay_pid_file(&format!("sleep {}", delay.as_secs_f64())),
            FakeStart::SlowRestart(delay) => delay_pid_file(&format!(
                "marker=\"$pid_file.launched\"\n\
                 if [ -e \"$marker\" ]; then sleep {}; fi\n\
                 touch \"$marker\"",
                delay.as_secs_f64()
            )),
        };
        sh(&script, "fake-server")
            .arg(ctx.layout.pid_file.display().to_string())
            .arg(ctx.ports.first().to_string())
            .args(ctx.options.iter().cloned())
    }

    fn stop_command(&self, ctx: &LaunchContext<'_>) -> CommandLine {
        if self.fail_shutdown {
            return sh("echo 'shutdown refused' >&2; exit 2", "fake-shutdown");
        }
        sh(SHUTDOWN, "fake-shutdown").arg(ctx.layout.pid_file.display().to_string())
    }

    fn ping_command(&self, ctx: &LaunchContext<'_>) -> CommandLine {
        sh(PING, "fake-ping").arg(ctx.layout.pid_file.display().to_string())
    }

    fn supports_replication(&self) -> bool {
        self.replication
    }

    fn connection_url(&self, ports: PortRange) -> String {
        format!("fake://127.0.0.1:{}/test", ports.first())
    }
}

/// Lifecycle timeouts short enough for tests.
pub const FAST_TIMEOUTS: LifecycleTimeouts = LifecycleTimeouts {
    start: Duration::from_secs(5),
    poll_interval: Duration::from_millis(20),
    stop_race: Duration::from_millis(500),
    shutdown: Duration::from_secs(2),
    ping: Duration::from_secs(2),
};

pub fn settings(engine: FakeEngine) -> ServerSettings {
    ServerSettings {
        engine: engine.shared(),
        mode: ExecutionMode::Native,
        timeouts: FAST_TIMEOUTS,
        base_port: 31_000,
    }
}

/// An allocator that does not check the host, since fake servers never bind their ports.
pub fn allocator() -> PortAllocator {
    PortAllocator::new(10_000, PortCheck::Bookkeeping)
}

/// Whether the error log of a server mentions `needle`.
pub fn error_log_contains(layout: &ServerLayout, needle: &str) -> bool {
    std::fs::read_to_string(&layout.error_log).map_or(false, |log| log.contains(needle))
}

/// Files directly inside `dir`, sorted.
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
