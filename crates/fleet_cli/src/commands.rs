//! The dbfleet subcommands.

use std::{path::PathBuf, process::Stdio, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use fleet_crash::{error::CrashError, CrashCycle};
use fleet_manager::{
    executor::{Executor, TestUnit, UnitOutcome},
    requirements::{RequirementSet, SpecialRequests},
    FleetManager, ServerRequest,
};
use fleet_server::{command::CommandLine, id::OwnerId, instance::ServerInfo};
use fleet_utils::{
    error::AnyError, exit::ExitCode, log_located_error, shutdown::ShutdownReceiver,
};

use crate::{
    args::{Command, ServerArgs},
    config::DbfleetConfig,
};

pub async fn run(
    command: Command,
    config: &DbfleetConfig,
    fleet: Arc<FleetManager>,
    shutdown: &mut ShutdownReceiver,
) -> anyhow::Result<ExitCode> {
    match command {
        Command::Provision { servers, json } => {
            provision(config, &fleet, servers, json, shutdown).await
        }
        Command::Run {
            servers,
            expect_failure,
            command,
        } => run_command(config, &fleet, servers, expect_failure, command, shutdown).await,
        Command::Crash {
            owner,
            replicas,
            iterations,
            seed,
        } => crash(config, fleet, owner, replicas, iterations, seed, shutdown).await,
    }
}

fn requirements(args: &ServerArgs) -> RequirementSet {
    std::iter::repeat(args.options.clone())
        .take(args.servers)
        .collect()
}

fn server_request(config: &DbfleetConfig, args: &ServerArgs) -> ServerRequest {
    ServerRequest {
        config_path: args.overrides.clone(),
        environment: config.fleet.environment.clone(),
        ..ServerRequest::new(
            OwnerId::from(args.owner.as_str()),
            requirements(args),
            &config.fleet.workdir,
        )
    }
}

async fn provision(
    config: &DbfleetConfig,
    fleet: &FleetManager,
    args: ServerArgs,
    json: bool,
    shutdown: &mut ShutdownReceiver,
) -> anyhow::Result<ExitCode> {
    let request = server_request(config, &args);
    let provisioned = tokio::select! {
        provisioned = fleet.request_servers(&request) => provisioned?,
        _ = shutdown.recv_shutdown_immediately() => return Ok(ExitCode::INTERRUPTED),
    };
    if provisioned.bad_starts() > 0 {
        tracing::error!(count = provisioned.bad_starts(), "servers failed to start");
        return Ok(ExitCode::FLEET_ERROR);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&provisioned.servers)?);
    } else {
        for server in &provisioned.servers {
            println!(
                "{}\t{}\t{}",
                server.name,
                server.connection_url.as_deref().unwrap_or("-"),
                server.datadir.display()
            );
        }
    }

    tracing::info!("holding servers until interrupted");
    shutdown.recv_shutdown_immediately().await?;
    Ok(ExitCode::INTERRUPTED)
}

/// An external command run as a test against provisioned servers.
struct CommandUnit {
    name: String,
    requirements: RequirementSet,
    overrides: Option<PathBuf>,
    expect_failure: bool,
    command: CommandLine,
}

/// Variables telling a command where its servers are.
fn server_env(servers: &[ServerInfo]) -> Vec<(String, String)> {
    let mut env = vec![("DBFLEET_SERVERS".to_owned(), servers.len().to_string())];
    for (n, server) in servers.iter().enumerate() {
        if let Some(url) = &server.connection_url {
            env.push((format!("DBFLEET_URL_{n}"), url.clone()));
        }
        if let Some(ports) = server.ports {
            env.push((format!("DBFLEET_PORT_{n}"), ports.first().to_string()));
        }
    }
    env
}

#[async_trait]
impl TestUnit for CommandUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn requirements(&self) -> RequirementSet {
        self.requirements.clone()
    }

    fn config_path(&self) -> Option<PathBuf> {
        self.overrides.clone()
    }

    fn expect_failure(&self) -> bool {
        self.expect_failure
    }

    async fn run(&self, _fleet: &FleetManager, servers: &[ServerInfo]) -> Result<(), AnyError> {
        let mut cmd = self.command.to_command();
        cmd.envs(server_env(servers))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        tracing::info!(cmd=%self.command, "running command");

        let code: ExitCode = cmd.status().await?.into();
        if !code.is_success() {
            return Err(anyhow!("{} exited with {code}", self.name));
        }
        Ok(())
    }
}

async fn run_command(
    config: &DbfleetConfig,
    fleet: &FleetManager,
    args: ServerArgs,
    expect_failure: bool,
    command: Vec<String>,
    shutdown: &mut ShutdownReceiver,
) -> anyhow::Result<ExitCode> {
    let Some((program, rest)) = command.split_first() else {
        return Err(anyhow!("no command given"));
    };
    let unit = CommandUnit {
        name: program.clone(),
        requirements: requirements(&args),
        overrides: args.overrides.clone(),
        expect_failure,
        command: CommandLine::new(program).args(rest.iter().cloned()),
    };
    let executor = Executor {
        owner: OwnerId::from(args.owner.as_str()),
        workdir: config.fleet.workdir.clone(),
        environment: config.fleet.environment.clone(),
    };

    let outcome = tokio::select! {
        outcome = executor.run_unit(fleet, &unit) => outcome?,
        _ = shutdown.recv_shutdown_immediately() => return Ok(ExitCode::INTERRUPTED),
    };
    Ok(match outcome {
        UnitOutcome::Passed => ExitCode::SUCCESS,
        UnitOutcome::Failed(_) => ExitCode::FAILURE,
        UnitOutcome::BadStart { .. } => ExitCode::FLEET_ERROR,
    })
}

async fn crash(
    config: &DbfleetConfig,
    fleet: Arc<FleetManager>,
    owner: String,
    replicas: u16,
    iterations: Option<usize>,
    seed: Option<u64>,
    shutdown: &mut ShutdownReceiver,
) -> anyhow::Result<ExitCode> {
    let owner = OwnerId::from(owner.as_str());
    let replicas = usize::from(replicas);
    let special = (1..=replicas).fold(SpecialRequests::default(), |special, replica| {
        special.join_cluster(0, replica)
    });
    let request = ServerRequest {
        special,
        environment: config.fleet.environment.clone(),
        ..ServerRequest::new(
            owner.clone(),
            RequirementSet::bare(replicas + 1),
            &config.fleet.workdir,
        )
    };

    let provisioned = tokio::select! {
        provisioned = fleet.request_servers(&request) => provisioned?,
        _ = shutdown.recv_shutdown_immediately() => return Ok(ExitCode::INTERRUPTED),
    };
    if provisioned.bad_starts() > 0 {
        tracing::error!(count = provisioned.bad_starts(), "servers failed to start");
        return Ok(ExitCode::FLEET_ERROR);
    }

    let mut crash_config = config.crash.to_config(&config.fleet);
    if let Some(iterations) = iterations {
        crash_config.iterations = iterations;
    }
    let sql = Arc::new(config.sql.client());
    let mut cycle = CrashCycle::new(Arc::clone(&fleet), owner.clone(), sql, crash_config);
    if let Some(seed) = seed {
        cycle = cycle.with_seed(seed);
    }

    let verified = async {
        cycle.prepare_replicas().await?;
        cycle.run(shutdown).await
    };
    match verified.await {
        Ok(report) => {
            println!(
                "{} crash cycles passed: {} kills, {} table comparisons",
                report.cycles, report.kills, report.tables_compared
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(CrashError::Interrupted) => Ok(ExitCode::INTERRUPTED),
        Err(CrashError::Located(located)) => {
            log_located_error!(located, "crash verification failed: {}");
            fleet.finish_test(&owner, false).await;
            Ok(ExitCode::FAILURE)
        }
        Err(error) => {
            tracing::error!(%owner, %error, "crash verification failed");
            fleet.finish_test(&owner, false).await;
            Ok(ExitCode::FAILURE)
        }
    }
}

#[cfg(test)]
mod test {
    use std::num::NonZeroU16;

    use fleet_server::{
        engine::EngineKind,
        instance::{ServerInfo, ServerStatus},
        ports::PortRange,
    };

    use super::{requirements, server_env};
    use crate::args::ServerArgs;

    #[test]
    fn every_server_gets_the_options() {
        let args = ServerArgs {
            owner: "ci".to_owned(),
            servers: 3,
            options: vec!["--a=1".to_owned()],
            overrides: None,
        };
        let reqs = requirements(&args);
        assert_eq!(reqs.len(), 3);
        assert!(reqs.iter().all(|opts| opts == ["--a=1"]));
    }

    #[test]
    fn command_sees_its_servers() {
        let server = |n: u16, url: Option<&str>| ServerInfo {
            name: format!("ci.s{n}"),
            engine: EngineKind::Mysql,
            status: ServerStatus::Running,
            ports: url.map(|_| PortRange::new(9306 + 10 * n, NonZeroU16::new(1).unwrap())),
            connection_url: url.map(str::to_owned),
            options: vec![],
            master: None,
            datadir: "/tmp/d".into(),
            error_log: "/tmp/e".into(),
            socket_file: "/tmp/s".into(),
            pid: None,
        };
        let env = server_env(&[
            server(0, Some("mysql://root@127.0.0.1:9306/test")),
            server(1, None),
        ]);
        assert_eq!(
            env,
            vec![
                ("DBFLEET_SERVERS".to_owned(), "2".to_owned()),
                (
                    "DBFLEET_URL_0".to_owned(),
                    "mysql://root@127.0.0.1:9306/test".to_owned()
                ),
                ("DBFLEET_PORT_0".to_owned(), "9306".to_owned()),
            ]
        );
    }
}
