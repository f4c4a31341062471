//! The external load generator run against a master while it is crashed.

use std::{path::PathBuf, time::Duration};

use fleet_server::command::{CommandLine, CommandOutput};
use fleet_utils::{
    error::{ErrorLocation, ResultLocation},
    exit::ExitCode,
    here,
};
use tokio::task::JoinHandle;

use crate::error::CrashError;

/// Placeholder in workload arguments replaced by the master's connection URL.
pub const URL_PLACEHOLDER: &str = "{url}";

#[derive(Debug, Clone)]
pub struct LoadGenerator {
    command: CommandLine,
    log: PathBuf,
    /// How long a workload may keep running after its server was killed.
    grace: Duration,
}

impl LoadGenerator {
    pub fn new(command: CommandLine, log: impl Into<PathBuf>) -> Self {
        Self {
            command,
            log: log.into(),
            grace: Duration::from_secs(60),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// The workload command against `url`. The URL replaces every [URL_PLACEHOLDER], or is
    /// appended when no argument carries one.
    pub fn command_for(&self, url: &str) -> CommandLine {
        let mut cmd = self.command.clone();
        let mut substituted = false;
        for arg in &mut cmd.args {
            if arg.contains(URL_PLACEHOLDER) {
                *arg = arg.replace(URL_PLACEHOLDER, url);
                substituted = true;
            }
        }
        if !substituted {
            cmd.args.push(url.to_owned());
        }
        cmd
    }

    /// Starts the workload in the background.
    pub fn launch(&self, url: &str) -> RunningWorkload {
        let cmd = self.command_for(url);
        let log = self.log.clone();
        let grace = self.grace;
        tracing::info!(cmd=%cmd, "launching workload");
        let task =
            tokio::spawn(async move { cmd.run(CommandOutput::AppendTo(&log), grace).await });
        RunningWorkload {
            task,
            log: self.log.clone(),
        }
    }
}

pub struct RunningWorkload {
    task: JoinHandle<std::io::Result<ExitCode>>,
    log: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadReport {
    /// `None` if the workload had to be killed.
    pub code: Option<ExitCode>,
    pub output: String,
}

impl WorkloadReport {
    pub fn completed_cleanly(&self) -> bool {
        self.code.map_or(false, |c| c.is_success())
    }
}

impl RunningWorkload {
    /// Waits for the workload to exit, and reads back its output.
    pub async fn finish(self) -> Result<WorkloadReport, CrashError> {
        let code = match self.task.await.located(here!())? {
            Ok(code) => Some(code),
            Err(error) if error.kind() == std::io::ErrorKind::TimedOut => {
                tracing::warn!(%error, "workload killed");
                None
            }
            Err(error) => return Err(error.located(here!()).into()),
        };
        let output = tokio::fs::read_to_string(&self.log)
            .await
            .unwrap_or_default();
        Ok(WorkloadReport { code, output })
    }
}
