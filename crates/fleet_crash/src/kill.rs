//! The background worker that crashes a master.

use std::{io, time::Duration};

use fleet_server::instance::KillHandle;
use fleet_utils::{error::ResultLocation, here};
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::CrashError;

/// How long after the workload starts the master is killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KillDelay {
    Fixed { millis: u64 },
    /// Uniformly random within `[min_millis, max_millis]`.
    Uniform { min_millis: u64, max_millis: u64 },
}

impl Default for KillDelay {
    fn default() -> Self {
        KillDelay::Fixed { millis: 5_000 }
    }
}

impl KillDelay {
    pub fn sample(&self, rng: &mut impl Rng) -> Duration {
        let millis = match *self {
            KillDelay::Fixed { millis } => millis,
            KillDelay::Uniform {
                min_millis,
                max_millis,
            } if min_millis < max_millis => rng.gen_range(min_millis..=max_millis),
            KillDelay::Uniform { min_millis, .. } => min_millis,
        };
        Duration::from_millis(millis)
    }
}

/// A spawned task that SIGKILLs one server after a delay.
pub struct KillWorker {
    server: String,
    task: JoinHandle<io::Result<bool>>,
}

impl KillWorker {
    pub fn spawn(handle: KillHandle, delay: Duration) -> Self {
        let server = handle.server().to_owned();
        tracing::debug!(%server, ?delay, "scheduled kill");
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.kill()
        });
        Self { server, task }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// Waits for the kill to happen. Returns whether a live process was killed.
    ///
    /// A worker must be joined at most once.
    pub async fn join(&mut self) -> Result<bool, CrashError> {
        let killed = (&mut self.task).await.located(here!())?.located(here!())?;
        if !killed {
            tracing::warn!(server=%self.server, "server was already gone when the kill fired");
        }
        Ok(killed)
    }

    /// Cancels a kill that has not fired yet.
    pub fn abort(&self) {
        self.task.abort();
    }
}
