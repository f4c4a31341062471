use std::{num::NonZeroU16, path::PathBuf};

use crate::{command::CommandLine, layout::ServerLayout, ports::PortRange};

use super::{Engine, EngineBinaries, EngineKind, LaunchContext, LivenessCheck, LOCALHOST};

const DEFAULT_ADMIN: &str = "mysqladmin";

const PORT_COUNT: NonZeroU16 = match NonZeroU16::new(2) {
    Some(n) => n,
    None => unreachable!(),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MysqldFlavor {
    Mysql,
    Percona,
}

/// MySQL-family servers (`mysqld`), administered through `mysqladmin`.
///
/// Each server reserves two ports: the classic protocol port, and the X protocol port.
#[derive(Debug)]
pub struct MysqldEngine {
    flavor: MysqldFlavor,
    binaries: EngineBinaries,
}

impl MysqldEngine {
    pub fn new(flavor: MysqldFlavor, binaries: EngineBinaries) -> Self {
        Self { flavor, binaries }
    }

    fn admin(&self, ctx: &LaunchContext<'_>, action: &str) -> CommandLine {
        let admin = self
            .binaries
            .client
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ADMIN));
        CommandLine::new(admin)
            .arg("--no-defaults")
            .arg("--user=root")
            .arg(format!("--host={LOCALHOST}"))
            .arg(format!("--port={}", ctx.ports.first()))
            .arg("--protocol=tcp")
            .arg("--connect-timeout=5")
            .arg(action)
    }

    fn basedir_arg(&self) -> Option<String> {
        self.binaries
            .basedir
            .as_ref()
            .map(|b| format!("--basedir={}", b.display()))
    }
}

impl Engine for MysqldEngine {
    fn kind(&self) -> EngineKind {
        match self.flavor {
            MysqldFlavor::Mysql => EngineKind::Mysql,
            MysqldFlavor::Percona => EngineKind::Percona,
        }
    }

    fn port_count(&self) -> NonZeroU16 {
        PORT_COUNT
    }

    fn liveness(&self) -> LivenessCheck {
        LivenessCheck::PidFile
    }

    fn environment(&self) -> Vec<(String, String)> {
        self.binaries.preload_env()
    }

    fn init_command(&self, layout: &ServerLayout) -> Option<CommandLine> {
        let datadir = format!("--datadir={}", layout.datadir.display());
        let cmd = match &self.binaries.install_db {
            Some(install_db) => CommandLine::new(install_db).arg("--no-defaults"),
            None => CommandLine::new(&self.binaries.server)
                .arg("--no-defaults")
                .arg("--initialize-insecure"),
        };
        Some(cmd.args(self.basedir_arg()).arg(datadir))
    }

    fn start_command(&self, ctx: &LaunchContext<'_>) -> CommandLine {
        let LaunchContext {
            name: _,
            server_id,
            layout,
            ports,
            options,
            master,
        } = ctx;

        let mut cmd = CommandLine::new(&self.binaries.server)
            .arg("--no-defaults")
            .args(self.basedir_arg())
            .arg(format!("--datadir={}", layout.datadir.display()))
            .arg(format!("--tmpdir={}", layout.tmpdir.display()))
            .arg(format!("--port={}", ports.first()))
            .arg(format!("--loose-mysqlx-port={}", ports.nth(1).unwrap_or(0)))
            .arg(format!("--socket={}", layout.socket_file.display()))
            .arg(format!("--pid-file={}", layout.pid_file.display()))
            .arg(format!("--log-error={}", layout.error_log.display()))
            .arg(format!("--server-id={server_id}"))
            .arg("--log-bin=mysql-bin")
            .arg("--binlog-format=ROW");

        if master.is_some() {
            cmd = cmd
                .arg("--log-slave-updates")
                .arg("--relay-log=relay-bin")
                .arg(format!("--report-host={LOCALHOST}"))
                .arg(format!("--report-port={}", ports.first()));
        }

        cmd.args(options.iter().cloned())
    }

    fn stop_command(&self, ctx: &LaunchContext<'_>) -> CommandLine {
        self.admin(ctx, "shutdown")
    }

    fn ping_command(&self, ctx: &LaunchContext<'_>) -> CommandLine {
        self.admin(ctx, "ping")
    }

    fn supports_replication(&self) -> bool {
        true
    }

    fn connection_url(&self, ports: PortRange) -> String {
        format!("mysql://root@{LOCALHOST}:{}/test", ports.first())
    }
}

#[cfg(test)]
mod test {
    use std::{num::NonZeroU16, path::PathBuf};

    use crate::{
        engine::{Engine, EngineBinaries, LaunchContext, MasterLink},
        layout::ServerLayout,
        ports::PortRange,
    };

    use super::{MysqldEngine, MysqldFlavor};

    fn engine() -> MysqldEngine {
        MysqldEngine::new(
            MysqldFlavor::Mysql,
            EngineBinaries {
                server: PathBuf::from("/opt/mysql/bin/mysqld"),
                client: Some(PathBuf::from("/opt/mysql/bin/mysqladmin")),
                install_db: None,
                basedir: Some(PathBuf::from("/opt/mysql")),
                preload: vec![],
            },
        )
    }

    #[test]
    fn start_command_for_replica() {
        let layout = ServerLayout::new("/w/bot0/s1");
        let options = vec!["--innodb-flush-log-at-trx-commit=2".to_owned()];
        let master = MasterLink {
            name: "bot0.s0".to_owned(),
            port: 9300,
        };
        let ctx = LaunchContext {
            name: "bot0.s1",
            server_id: 2,
            layout: &layout,
            ports: PortRange::new(9302, NonZeroU16::new(2).unwrap()),
            options: &options,
            master: Some(&master),
        };

        insta::assert_snapshot!(engine().start_command(&ctx).args.join("\n"), @r###"
        --no-defaults
        --basedir=/opt/mysql
        --datadir=/w/bot0/s1/var/datadir
        --tmpdir=/w/bot0/s1/var/tmp
        --port=9302
        --loose-mysqlx-port=9303
        --socket=/w/bot0/s1/var/run/server.sock
        --pid-file=/w/bot0/s1/var/run/server.pid
        --log-error=/w/bot0/s1/var/log/error.log
        --server-id=2
        --log-bin=mysql-bin
        --binlog-format=ROW
        --log-slave-updates
        --relay-log=relay-bin
        --report-host=127.0.0.1
        --report-port=9302
        --innodb-flush-log-at-trx-commit=2
        "###);
    }

    #[test]
    fn admin_commands() {
        let layout = ServerLayout::new("/w/bot0/s0");
        let ctx = LaunchContext {
            name: "bot0.s0",
            server_id: 1,
            layout: &layout,
            ports: PortRange::new(9300, NonZeroU16::new(2).unwrap()),
            options: &[],
            master: None,
        };
        let engine = engine();

        assert_eq!(
            engine.ping_command(&ctx).to_string(),
            "/opt/mysql/bin/mysqladmin --no-defaults --user=root --host=127.0.0.1 --port=9300 --protocol=tcp --connect-timeout=5 ping"
        );
        assert_eq!(engine.stop_command(&ctx).args.last().unwrap(), "shutdown");
        assert_eq!(
            engine.connection_url(ctx.ports),
            "mysql://root@127.0.0.1:9300/test"
        );
    }

    #[test]
    fn initializes_with_server_when_no_install_program() {
        let layout = ServerLayout::new("/w/bot0/s0");
        let init = engine().init_command(&layout).unwrap();
        assert_eq!(
            init.to_string(),
            "/opt/mysql/bin/mysqld --no-defaults --initialize-insecure --basedir=/opt/mysql --datadir=/w/bot0/s0/var/datadir"
        );
    }
}
