//! Handles to spawned children and the operations that control them
//!
//! A [`Process`] is shared between the caller and the registry. Its pid and
//! exit status are written only by whichever path reaps the child, and that
//! always happens with the registry lock held, so a handle that reports
//! itself running still owns its pid: signals sent through it can never reach
//! a recycled pid.

#![allow(unsafe_code)]

use crate::registry::SigchldGuard;
use crate::{ProcessError, Result};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Callback run exactly once when a process is reaped.
///
/// It may run inside the SIGCHLD handler, so it must not panic and should
/// stick to async-signal-safe work (atomics, `write(2)` and the like). It runs
/// with the registry locked and must not call back into this crate.
pub type CompletionHandler = Box<dyn FnMut(Pid, ExitStatus) + Send + 'static>;

#[derive(Debug, Default)]
pub(crate) struct ProcessState {
    /// Pid while running, 0 once reaped (or before fork)
    pid: AtomicI32,
    /// Pid assigned at fork, never cleared
    spawned: AtomicI32,
    /// Raw wait status, valid once `exited` is set
    status: AtomicI32,
    exited: AtomicBool,
}

impl ProcessState {
    pub(crate) fn raw_pid(&self) -> i32 {
        self.pid.load(Ordering::Acquire)
    }

    pub(crate) fn running_pid(&self) -> Option<Pid> {
        match self.raw_pid() {
            0 => None,
            pid => Some(Pid::from_raw(pid)),
        }
    }

    pub(crate) fn set_spawned(&self, pid: Pid) {
        self.spawned.store(pid.as_raw(), Ordering::Release);
        self.pid.store(pid.as_raw(), Ordering::Release);
    }

    pub(crate) fn mark_exited(&self, raw_status: i32) {
        self.status.store(raw_status, Ordering::Relaxed);
        self.exited.store(true, Ordering::Release);
        self.pid.store(0, Ordering::Release);
    }

    pub(crate) fn mark_lost(&self) {
        self.pid.store(0, Ordering::Release);
    }

    fn spawned_pid(&self) -> Option<Pid> {
        match self.spawned.load(Ordering::Acquire) {
            0 => None,
            pid => Some(Pid::from_raw(pid)),
        }
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        if self.exited.load(Ordering::Acquire) {
            Some(ExitStatus::from_raw(self.status.load(Ordering::Relaxed)))
        } else {
            None
        }
    }
}

/// A child process created by [`run`](crate::run) or [`fork`](crate::fork)
#[derive(Clone)]
pub struct Process {
    state: Arc<ProcessState>,
}

impl Process {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(ProcessState::default()),
        }
    }

    pub(crate) fn state(&self) -> &Arc<ProcessState> {
        &self.state
    }

    /// The pid the child was started with, whether or not it is still running
    pub fn id(&self) -> Option<Pid> {
        self.state.spawned_pid()
    }

    /// The pid, while the process has not been reaped
    pub fn pid(&self) -> Option<Pid> {
        self.state.running_pid()
    }

    /// Whether the process has not been reaped yet. Issues no syscall.
    pub fn is_running(&self) -> bool {
        self.state.raw_pid() != 0
    }

    /// Exit status, once the process has been reaped
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.state.exit_status()
    }

    /// Block until this process is reaped and return its exit status.
    ///
    /// Cooperates with the SIGCHLD reaper: whichever of the two collects the
    /// child, the completion handler runs once and the status lands here.
    pub fn wait(&self) -> Result<ExitStatus> {
        loop {
            let Some(pid) = self.pid() else {
                return self.exit_status().ok_or(ProcessError::Os(Errno::ECHILD));
            };

            match block_until_exited(pid) {
                // ECHILD: the reaper got there first; the registry settles it
                Ok(()) | Err(Errno::EINTR) | Err(Errno::ECHILD) => {}
                Err(errno) => return Err(errno.into()),
            }

            let mut registry = SigchldGuard::acquire()?;
            if !self.is_running() {
                continue;
            }
            match registry.reap_pid(pid) {
                Ok(_) => {}
                Err(Errno::ECHILD) => {
                    registry.retire_lost(&self.state);
                    warn!("Process {} was reaped outside brood; exit status lost", pid);
                    return Err(ProcessError::Os(Errno::ECHILD));
                }
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    /// Terminate the process: SIGKILL when `force`, SIGTERM otherwise.
    /// A process that already exited is not an error.
    pub fn kill(&self, force: bool) -> Result<()> {
        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        self.deliver(signal as libc::c_int, true)
    }

    /// Ask the process to quit with SIGQUIT. A process that already exited is
    /// not an error.
    pub fn quit(&self) -> Result<()> {
        self.deliver(Signal::SIGQUIT as libc::c_int, true)
    }

    /// Suspend the process with SIGSTOP
    pub fn pause(&self) -> Result<()> {
        self.deliver(Signal::SIGSTOP as libc::c_int, false)
    }

    /// Continue a suspended process with SIGCONT
    pub fn resume(&self) -> Result<()> {
        self.deliver(Signal::SIGCONT as libc::c_int, false)
    }

    /// Send an arbitrary signal.
    ///
    /// Signals with a dedicated operation are rejected so call sites stay
    /// unambiguous. Fails with [`ProcessError::NotRunning`] once the process
    /// has been reaped.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        self.signal_raw(signal as libc::c_int)
    }

    /// [`signal`](Self::signal) by number, for signals `Signal` cannot name
    /// such as the real-time range. A number the OS rejects fails with
    /// [`ProcessError::InvalidArgument`].
    pub fn signal_raw(&self, signum: libc::c_int) -> Result<()> {
        let dedicated = match Signal::try_from(signum) {
            Ok(Signal::SIGKILL) => Some("kill(true)"),
            Ok(Signal::SIGTERM) => Some("kill(false)"),
            Ok(Signal::SIGQUIT) => Some("quit()"),
            Ok(Signal::SIGSTOP) => Some("pause()"),
            Ok(Signal::SIGCONT) => Some("resume()"),
            _ => None,
        };
        if let Some(operation) = dedicated {
            return Err(ProcessError::invalid(format!(
                "use Process::{} to send {}",
                operation,
                signal_name(signum)
            )));
        }
        self.deliver(signum, false)
    }

    /// Register the callback to run when this process is reaped, replacing
    /// any earlier one. If it has already been reaped the callback runs right
    /// away on the calling thread.
    pub fn set_completion_handler<F>(&self, handler: F) -> Result<()>
    where
        F: FnMut(Pid, ExitStatus) + Send + 'static,
    {
        let outcome = {
            let mut registry = SigchldGuard::acquire()?;
            registry.set_handler(&self.state, Box::new(handler))
        };
        if let Err(mut handler) = outcome {
            if let (Some(pid), Some(status)) = (self.id(), self.exit_status()) {
                handler(pid, status);
            }
        }
        Ok(())
    }

    fn deliver(&self, signum: libc::c_int, exited_is_ok: bool) -> Result<()> {
        let _registry = SigchldGuard::acquire()?;
        let Some(pid) = self.pid() else {
            return self.not_running(exited_is_ok);
        };

        let name = signal_name(signum);
        debug!("Sending {} to process {}", name, pid);
        match Errno::result(unsafe { libc::kill(pid.as_raw(), signum) }) {
            Ok(_) => Ok(()),
            Err(Errno::ESRCH) => {
                debug!("Process {} already exited", pid);
                self.not_running(exited_is_ok)
            }
            Err(Errno::EINVAL) => Err(ProcessError::invalid(format!("invalid signal {}", name))),
            Err(errno) => {
                error!("Failed to send {} to process {}: {}", name, pid, errno);
                Err(errno.into())
            }
        }
    }

    fn not_running(&self, exited_is_ok: bool) -> Result<()> {
        if exited_is_ok {
            Ok(())
        } else {
            Err(ProcessError::NotRunning(
                self.id().unwrap_or_else(|| Pid::from_raw(0)),
            ))
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id())
            .field("running", &self.is_running())
            .field("exit_status", &self.exit_status())
            .finish()
    }
}

fn signal_name(signum: libc::c_int) -> String {
    match Signal::try_from(signum) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => format!("signal {}", signum),
    }
}

/// Block until `pid` can be collected, without collecting it
fn block_until_exited(pid: Pid) -> std::result::Result<(), Errno> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            pid.as_raw() as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOWAIT,
        )
    };
    Errno::result(rc).map(drop)
}

/// Block until every tracked process has been reaped, including processes
/// spawned while waiting.
pub fn wait_all() -> Result<()> {
    loop {
        let current = match SigchldGuard::acquire()?.last() {
            Some(state) => Process { state },
            None => return Ok(()),
        };
        if !current.is_running() {
            // registered but not forked yet
            std::thread::yield_now();
            continue;
        }
        match current.wait() {
            Ok(_) => {}
            Err(e) if e.errno() == Some(Errno::ECHILD) => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state_is_not_running() {
        let process = Process::new();
        assert!(!process.is_running());
        assert_eq!(process.id(), None);
        assert_eq!(process.exit_status(), None);
    }

    #[test]
    fn test_state_transitions() {
        let state = ProcessState::default();
        state.set_spawned(Pid::from_raw(1234));
        assert_eq!(state.running_pid(), Some(Pid::from_raw(1234)));
        assert_eq!(state.exit_status(), None);

        state.mark_exited(7 << 8);
        assert_eq!(state.running_pid(), None);
        assert_eq!(state.spawned_pid(), Some(Pid::from_raw(1234)));
        assert_eq!(state.exit_status().and_then(|s| s.code()), Some(7));
    }

    #[test]
    fn test_lost_process_has_no_status() {
        let state = ProcessState::default();
        state.set_spawned(Pid::from_raw(99));
        state.mark_lost();
        assert_eq!(state.running_pid(), None);
        assert_eq!(state.exit_status(), None);
    }

    #[test]
    fn test_dedicated_signals_rejected() {
        let process = Process::new();
        for signal in [
            Signal::SIGKILL,
            Signal::SIGTERM,
            Signal::SIGQUIT,
            Signal::SIGSTOP,
            Signal::SIGCONT,
        ] {
            match process.signal(signal) {
                Err(ProcessError::InvalidArgument(msg)) => assert!(msg.contains("use Process::")),
                other => panic!("expected InvalidArgument for {:?}, got {:?}", signal, other),
            }
            assert!(matches!(
                process.signal_raw(signal as libc::c_int),
                Err(ProcessError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGUSR1), "SIGUSR1");
        assert_eq!(signal_name(-3), "signal -3");
    }

    #[test]
    fn test_unstarted_process_is_not_running() {
        let process = Process::new();
        assert!(process.kill(true).is_ok());
        assert!(process.quit().is_ok());
        assert!(matches!(
            process.signal(Signal::SIGUSR1),
            Err(ProcessError::NotRunning(_))
        ));
        assert!(matches!(process.pause(), Err(ProcessError::NotRunning(_))));
    }
}
