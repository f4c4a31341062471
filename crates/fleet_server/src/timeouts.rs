use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

/// How server processes are being executed. Instrumented modes run far slower than native ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Native,
    /// Servers run under valgrind's memcheck.
    Valgrind,
    /// Servers are debug builds, or run attached to a debugger.
    Debug,
}

impl ExecutionMode {
    pub fn is_instrumented(&self) -> bool {
        !matches!(self, ExecutionMode::Native)
    }

    pub fn timeout_multiplier(&self) -> u32 {
        if self.is_instrumented() {
            10
        } else {
            1
        }
    }
}

/// Bounds on every wait of the server lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTimeouts {
    /// How long a native server may take to become live.
    pub start: Duration,
    /// Sampling interval of liveness while starting, and of process exit while stopping.
    pub poll_interval: Duration,
    /// How long a stop waits for a server that was started but never confirmed live.
    pub stop_race: Duration,
    /// How long a server may take to exit after the shutdown command.
    pub shutdown: Duration,
    /// Upper bound on a single ping invocation.
    pub ping: Duration,
}

impl LifecycleTimeouts {
    pub const DEFAULT: Self = Self {
        start: Duration::from_secs(60),
        poll_interval: Duration::from_millis(500),
        stop_race: Duration::from_secs(10),
        shutdown: Duration::from_secs(100),
        ping: Duration::from_secs(10),
    };

    /// Start timeout for servers executed in `mode`.
    pub fn start_timeout(&self, mode: ExecutionMode) -> Duration {
        self.start * mode.timeout_multiplier()
    }
}

impl Default for LifecycleTimeouts {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{ExecutionMode, LifecycleTimeouts};

    #[test]
    fn instrumented_modes_wait_ten_times_longer() {
        let t = LifecycleTimeouts::DEFAULT;
        assert_eq!(t.start_timeout(ExecutionMode::Native), Duration::from_secs(60));
        assert_eq!(t.start_timeout(ExecutionMode::Valgrind), Duration::from_secs(600));
        assert_eq!(t.start_timeout(ExecutionMode::Debug), Duration::from_secs(600));
    }
}
