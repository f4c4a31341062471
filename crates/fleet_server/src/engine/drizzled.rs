use std::{num::NonZeroU16, path::PathBuf};

use crate::{command::CommandLine, layout::ServerLayout, ports::PortRange};

use super::{Engine, EngineBinaries, EngineKind, LaunchContext, LivenessCheck, LOCALHOST};

const DEFAULT_CLIENT: &str = "drizzle";

/// Ports, in range order: drizzle protocol, mysql protocol, memcached stats, pbms, rabbitmq,
/// json server.
const PORT_COUNT: NonZeroU16 = match NonZeroU16::new(6) {
    Some(n) => n,
    None => unreachable!(),
};

/// Drizzle servers. Drizzle does not write its pid file reliably before it accepts connections,
/// so liveness is checked by pinging.
#[derive(Debug)]
pub struct DrizzledEngine {
    binaries: EngineBinaries,
}

impl DrizzledEngine {
    pub fn new(binaries: EngineBinaries) -> Self {
        Self { binaries }
    }

    fn client(&self, ctx: &LaunchContext<'_>) -> CommandLine {
        let client = self
            .binaries
            .client
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CLIENT));
        CommandLine::new(client)
            .arg("--user=root")
            .arg("--password=")
            .arg(format!("--host={LOCALHOST}"))
            .arg(format!("--port={}", ctx.ports.first()))
            .arg("--connect-timeout=5")
    }
}

impl Engine for DrizzledEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Drizzle
    }

    fn port_count(&self) -> NonZeroU16 {
        PORT_COUNT
    }

    fn liveness(&self) -> LivenessCheck {
        LivenessCheck::Ping
    }

    fn environment(&self) -> Vec<(String, String)> {
        self.binaries.preload_env()
    }

    fn init_command(&self, _layout: &ServerLayout) -> Option<CommandLine> {
        // drizzled creates its own data directory on first start.
        None
    }

    fn start_command(&self, ctx: &LaunchContext<'_>) -> CommandLine {
        let port = |i: u16| ctx.ports.nth(i).unwrap_or(0);
        let layout = ctx.layout;

        let mut cmd = CommandLine::new(&self.binaries.server).arg("--no-defaults");
        if let Some(basedir) = &self.binaries.basedir {
            cmd = cmd.arg(format!("--basedir={}", basedir.display()));
        }
        cmd.arg(format!("--datadir={}", layout.datadir.display()))
            .arg(format!("--pid-file={}", layout.pid_file.display()))
            .arg(format!("--server-id={}", ctx.server_id))
            .arg(format!("--drizzle-protocol.port={}", port(0)))
            .arg(format!("--mysql-protocol.port={}", port(1)))
            .arg("--mysql-protocol.connect-timeout=60")
            .arg(format!(
                "--mysql-unix-socket-protocol.path={}",
                layout.socket_file.display()
            ))
            .arg(format!("--memcached-stats.port={}", port(2)))
            .arg(format!("--pbms.port={}", port(3)))
            .arg(format!("--rabbitmq.port={}", port(4)))
            .arg(format!("--json-server.port={}", port(5)))
            .arg("--innodb.data-file-path=ibdata1:20M:autoextend")
            .arg("--user=root")
            .args(ctx.options.iter().cloned())
    }

    fn stop_command(&self, ctx: &LaunchContext<'_>) -> CommandLine {
        self.client(ctx).arg("--silent").arg("--shutdown")
    }

    fn ping_command(&self, ctx: &LaunchContext<'_>) -> CommandLine {
        self.client(ctx).arg("--ping")
    }

    fn supports_replication(&self) -> bool {
        false
    }

    fn connection_url(&self, ports: PortRange) -> String {
        format!("drizzle://root@{LOCALHOST}:{}/test", ports.first())
    }
}
