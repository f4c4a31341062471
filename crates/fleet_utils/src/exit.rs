use std::{fmt, process::ExitStatus};

/// Code reported by `dbfleet` when the fleet itself fails, and standing in for the code of a
/// process that exited without one (killed by a signal).
pub const CODE_ERROR: i32 = 101;

/// Conventional code of a process ended by SIGINT.
pub const CODE_INTERRUPTED: i32 = 128 + 2;

/// The exit code of a server, test command or workload, or of `dbfleet` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
    pub const FLEET_ERROR: ExitCode = ExitCode(CODE_ERROR);
    pub const INTERRUPTED: ExitCode = ExitCode(CODE_INTERRUPTED);

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    pub const fn get(&self) -> i32 {
        self.0
    }

    pub const fn is_success(&self) -> bool {
        self.0 == Self::SUCCESS.0
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self(code),
            None => Self::FLEET_ERROR,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use std::{os::unix::process::ExitStatusExt, process::ExitStatus};

    use super::ExitCode;

    #[test]
    fn signalled_process_has_fleet_error_code() {
        // Raw wait status of a process killed by SIGKILL.
        let killed = ExitStatus::from_raw(9);
        assert_eq!(ExitCode::from(killed), ExitCode::FLEET_ERROR);

        let exited = ExitStatus::from_raw(3 << 8);
        assert_eq!(ExitCode::from(exited).get(), 3);
        assert!(!ExitCode::from(exited).is_success());
    }

    #[test]
    fn interrupted_code() {
        assert_eq!(ExitCode::INTERRUPTED.get(), 130);
        assert_eq!(ExitCode::INTERRUPTED.to_string(), "130");
    }
}
