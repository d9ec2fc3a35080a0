//! Errors returned by the supervisor's configuration and launch API.

/// Error type for configuring and launching a supervised process.
///
/// The first three variants are contract violations: they only occur when
/// the caller uses the API out of order, and never depend on the child.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    /// The process was already started.
    #[error("Process already started")]
    AlreadyStarted,
    /// An input stream was already opened for this process.
    #[error("Input stream already set")]
    InputStreamAlreadySet,
    /// An output stream was already attached to this process.
    #[error("Output stream already set")]
    OutputStreamAlreadySet,
    /// The program was not found.
    #[error("Program not found: {0}")]
    NotFound(String),
    /// Permission denied when spawning.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// Other I/O error while spawning.
    #[error("Failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
}

impl SupervisorError {
    /// Create a `SupervisorError` from a spawn I/O error, classifying common cases.
    pub(crate) fn from_spawn(program: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(program.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(program.to_string()),
            _ => Self::Spawn(err),
        }
    }

    /// Whether this error is a misuse of the API rather than a launch failure.
    #[must_use]
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::AlreadyStarted | Self::InputStreamAlreadySet | Self::OutputStreamAlreadySet
        )
    }
}
