use std::fmt;

use anyhow::anyhow;

/// Opaque thread-safe error, for failures that are only ever reported, never handled.
pub type AnyError = anyhow::Error;

/// A position in the source, captured with [here!].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// An opaque failure, tagged with where in the fleet it was observed.
///
/// I/O and join failures deep in the lifecycle carry little context of their own; the location
/// is what makes them actionable in a log.
#[derive(Debug)]
pub struct LocatedError {
    pub error: AnyError,
    pub location: &'static Location,
}

impl std::error::Error for LocatedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for LocatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.location)
    }
}

pub type LocatedResult<T> = Result<T, LocatedError>;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

fn locate(error: impl Into<BoxedError>, location: &'static Location) -> LocatedError {
    let boxed: BoxedError = error.into();
    LocatedError {
        error: anyhow!(boxed),
        location,
    }
}

pub trait ResultLocation<T> {
    fn located(self, location: &'static Location) -> LocatedResult<T>;
}

impl<T, E: Into<BoxedError>> ResultLocation<T> for Result<T, E> {
    #[inline]
    fn located(self, location: &'static Location) -> LocatedResult<T> {
        self.map_err(|error| locate(error, location))
    }
}

pub trait ErrorLocation {
    fn located(self, location: &'static Location) -> LocatedError;
}

impl<E: Into<BoxedError>> ErrorLocation for E {
    #[inline]
    fn located(self, location: &'static Location) -> LocatedError {
        locate(self, location)
    }
}

pub use crate::here;

#[macro_export]
macro_rules! here {
    () => {
        &$crate::error::Location {
            file: file!(),
            line: line!(),
            column: column!(),
        }
    };
}

pub use crate::log_located_error;

/// Logs a [LocatedError] with its location split out into structured fields.
/// The trailing message is a format string receiving the error.
#[macro_export]
macro_rules! log_located_error {
    ($err:expr, $($field:tt)*) => {{
        let $crate::error::LocatedError {
            error,
            location: $crate::error::Location { file, line, column },
        } = $err;
        tracing::error!(file, line, column, $($field)*, error);
    }};
}

#[cfg(test)]
mod test {
    use super::{ErrorLocation, ResultLocation};
    use crate::here;

    #[test]
    fn located_result_displays_location() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no pid file",
        ));
        let err = result.located(here!()).unwrap_err();
        let shown = err.to_string();
        assert!(shown.starts_with("no pid file ("), "{shown}");
        assert!(shown.contains("error.rs:"), "{shown}");
    }

    #[test]
    fn located_error_from_string() {
        let err = "snapshot copy failed".located(here!());
        assert_eq!(err.location.file, file!());
        assert_eq!(err.error.to_string(), "snapshot copy failed");
    }
}
