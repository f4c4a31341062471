mod args;
mod commands;
mod config;
mod logging;

use std::sync::Arc;

use clap::Parser;
use fleet_utils::{exit::ExitCode, shutdown::ShutdownManager};
use futures::StreamExt;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook_tokio::Signals;

use args::Cli;
use config::DbfleetConfig;

fn main() {
    let cli = Cli::parse();

    let code = match dbfleet(cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("dbfleet: {error:#}");
            ExitCode::FLEET_ERROR
        }
    };
    std::process::exit(code.get());
}

fn dbfleet(cli: Cli) -> anyhow::Result<ExitCode> {
    let _log_guard = logging::init(cli.log_json, cli.log_file.as_deref())?;
    let config = DbfleetConfig::load(cli.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let fleet = Arc::new(config.fleet.manager());
        let (mut shutdown, mut shutdown_rx) = ShutdownManager::new_pair();

        // Cleanup below runs whether or not a signal arrives.
        let mut signals = Signals::new(TERM_SIGNALS)?;
        let signals_handle = signals.handle();
        let signal_watcher = tokio::spawn(async move {
            if let Some(signal) = signals.next().await {
                tracing::warn!(signal, "received termination signal");
                if let Err(error) = shutdown.shutdown_immediately() {
                    tracing::error!(%error, "could not propagate termination");
                }
            }
        });

        let result =
            commands::run(cli.command, &config, Arc::clone(&fleet), &mut shutdown_rx).await;

        fleet.cleanup().await;
        signals_handle.close();
        let _ = signal_watcher.await;

        if shutdown_rx.is_interrupted() {
            return Ok(ExitCode::INTERRUPTED);
        }
        result
    })
}
