//! Error types for process creation and control

use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

/// Failures raised by the spawner, the process handle and launch-file loading
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Malformed call-site input, detected before any OS resource is used
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A syscall failed, either locally or in a child and relayed back
    #[error("OS error: {0}")]
    Os(#[from] Errno),

    /// The process has already been reaped
    #[error("Process {0} is not running")]
    NotRunning(Pid),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProcessError {
    /// Build an OS failure from the calling thread's current `errno`
    pub fn last_os_error() -> Self {
        ProcessError::Os(Errno::last())
    }

    /// Build an OS failure from an explicit error number
    pub fn from_errno(number: i32) -> Self {
        ProcessError::Os(Errno::from_raw(number))
    }

    /// The OS error number behind this failure, if there is one.
    ///
    /// `NotRunning` reports `ESRCH`, the "no such process" code.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            ProcessError::Os(errno) => Some(*errno),
            ProcessError::NotRunning(_) => Some(Errno::ESRCH),
            ProcessError::IoError(e) => e.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            ProcessError::InvalidArgument(_) => "PROC001",
            ProcessError::Os(_) => "PROC002",
            ProcessError::NotRunning(_) => "PROC003",
            ProcessError::ConfigurationError(_) => "PROC004",
            ProcessError::ValidationError(_) => "PROC005",
            ProcessError::InitializationError(_) => "PROC006",
            ProcessError::IoError(_) => "PROC007",
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ProcessError::InvalidArgument(msg.into())
    }
}

/// Result type used throughout brood-core
pub type Result<T> = std::result::Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ProcessError::invalid("x").code(), "PROC001");
        assert_eq!(ProcessError::Os(Errno::EMFILE).code(), "PROC002");
        assert_eq!(
            ProcessError::NotRunning(Pid::from_raw(42)).code(),
            "PROC003"
        );
        assert_eq!(
            ProcessError::ConfigurationError("x".to_string()).code(),
            "PROC004"
        );
        assert_eq!(
            ProcessError::ValidationError("x".to_string()).code(),
            "PROC005"
        );
    }

    #[test]
    fn test_from_errno_keeps_number() {
        let err = ProcessError::from_errno(libc::ENOENT);
        assert_eq!(err.errno(), Some(Errno::ENOENT));
        assert!(err.to_string().contains("No such file or directory"));
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_last_os_error_reads_errno() {
        let rc = unsafe { libc::close(-1) };
        assert_eq!(rc, -1);
        let err = ProcessError::last_os_error();
        assert_eq!(err.errno(), Some(Errno::EBADF));
        assert_eq!(err.code(), "PROC002");
    }

    #[test]
    fn test_not_running_reports_esrch() {
        let err = ProcessError::NotRunning(Pid::from_raw(7));
        assert_eq!(err.errno(), Some(Errno::ESRCH));
        assert_eq!(err.to_string(), "Process 7 is not running");
    }

    #[test]
    fn test_invalid_argument_has_no_errno() {
        let err = ProcessError::invalid("duplicate target fd 3");
        assert_eq!(err.errno(), None);
        assert_eq!(err.to_string(), "Invalid argument: duplicate target fd 3");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::from_raw_os_error(libc::EACCES);
        let err: ProcessError = io.into();
        assert!(matches!(err, ProcessError::IoError(_)));
        assert_eq!(err.errno(), Some(Errno::EACCES));
    }
}
