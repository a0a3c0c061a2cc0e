//! Core functionality for brood: spawning and reaping child processes
//!
//! Children are created with [`run`] (fork + exec) or [`fork`] (fork only).
//! Each one is tracked in a process-wide registry until it is reaped, either
//! by [`Process::wait`] or by the SIGCHLD handler this crate installs on first
//! use. Launch failures inside the child, exec failures included, come back
//! to the caller as ordinary errors.
//!
//! ```no_run
//! use brood_core::{run, FdMapping};
//!
//! let stdio = FdMapping::inherit_stdio();
//! let child = run("/bin/echo", &["hello"], Some(&stdio))?;
//! let status = child.wait()?;
//! assert!(status.success());
//! # Ok::<(), brood_core::ProcessError>(())
//! ```

#[cfg(not(unix))]
compile_error!("brood-core only supports Unix targets");

pub mod config;
pub mod error;
pub mod fdmap;
pub mod process;
mod registry;
pub mod spawn;

pub use config::{
    load_launch_file_from_toml_path, load_launch_file_from_toml_str, LaunchFile, LaunchSpec,
};
pub use error::{ProcessError, Result};
pub use fdmap::{validate_mapping, FdMapping};
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
pub use process::{wait_all, CompletionHandler, Process};
pub use registry::{tracked_count, tracked_pids, unmatched_reaps};
pub use spawn::{fork, run};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| crate::ProcessError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_only_once() {
        let _ = utils::init_tracing("debug");
        assert!(matches!(
            utils::init_tracing("debug"),
            Err(ProcessError::InitializationError(_))
        ));
    }
}
