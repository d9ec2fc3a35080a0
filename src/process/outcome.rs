//! Final outcome of a supervised process.

use std::fmt;
use std::process::ExitStatus;

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The process exited on its own with this status.
    Exited(ExitStatus),
    /// The process was terminated after `kill` was requested.
    Canceled,
    /// The process was terminated because its timeout elapsed.
    TimedOut,
    /// The process could not be launched.
    LaunchFailed(String),
    /// Waiting on the process failed; its exit status is unknown.
    WaitFailed(String),
}

impl Outcome {
    pub(crate) fn from_wait(result: std::io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => Self::Exited(status),
            Err(e) => Self::WaitFailed(e.to_string()),
        }
    }

    /// Whether the process exited on its own with status zero.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(status) if status.success())
    }

    /// Whether the process exited without being terminated by the supervisor.
    #[must_use]
    pub fn exited_on_its_own(&self) -> bool {
        matches!(self, Self::Exited(_))
    }

    /// Exit code of a natural exit, if the process reported one.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(status) => status.code(),
            _ => None,
        }
    }

    /// Exit code for a shell wrapping this process.
    ///
    /// Follows the `timeout(1)` convention: 124 on timeout, 127 when the
    /// program could not be launched, 130 when canceled and 128 plus the
    /// signal number when the child died from a signal on its own.
    #[must_use]
    pub fn shell_code(&self) -> i32 {
        match self {
            Self::Exited(status) => status.code().unwrap_or_else(|| signal_code(status)),
            Self::Canceled => 130,
            Self::TimedOut => 124,
            Self::LaunchFailed(_) => 127,
            Self::WaitFailed(_) => 1,
        }
    }

    /// Convert into the `wait` result: `Ok` only for a clean exit.
    ///
    /// # Errors
    ///
    /// Returns the matching `ExitError` for every outcome other than a zero exit.
    pub fn into_result(self) -> Result<(), ExitError> {
        match self {
            Self::Exited(status) if status.success() => Ok(()),
            Self::Exited(status) => Err(ExitError::Status(status)),
            Self::Canceled => Err(ExitError::Canceled),
            Self::TimedOut => Err(ExitError::TimedOut),
            Self::LaunchFailed(msg) => Err(ExitError::LaunchFailed(msg)),
            Self::WaitFailed(msg) => Err(ExitError::WaitFailed(msg)),
        }
    }
}

#[cfg(unix)]
fn signal_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map_or(1, |signal| 128 + signal)
}

#[cfg(not(unix))]
fn signal_code(_status: &ExitStatus) -> i32 {
    1
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(status) => write!(f, "exited ({status})"),
            Self::Canceled => f.write_str("canceled"),
            Self::TimedOut => f.write_str("timed out"),
            Self::LaunchFailed(msg) => write!(f, "launch failed: {msg}"),
            Self::WaitFailed(msg) => write!(f, "wait failed: {msg}"),
        }
    }
}

/// Error returned by `wait` when the process did not exit cleanly.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExitError {
    /// The process exited on its own with a nonzero status.
    #[error("Process exited unsuccessfully: {0}")]
    Status(ExitStatus),
    /// The process was killed on request.
    #[error("Process was canceled")]
    Canceled,
    /// The process was killed after its timeout elapsed.
    #[error("Process timed out")]
    TimedOut,
    /// The process never started.
    #[error("Process failed to launch: {0}")]
    LaunchFailed(String),
    /// The exit status could not be collected.
    #[error("Failed to wait for process: {0}")]
    WaitFailed(String),
}

impl ExitError {
    /// Exit code reported by the child, if it exited on its own.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Status(status) => status.code(),
            _ => None,
        }
    }

    /// Whether the supervisor terminated the process (kill or timeout).
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Canceled | Self::TimedOut)
    }
}
