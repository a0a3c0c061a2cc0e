//! Process-wide registry of live children and the SIGCHLD reaper
//!
//! Every child spawned by this crate is tracked here from just before `fork()`
//! until it is reaped. The registry is only touched through a [`SigchldGuard`],
//! which blocks SIGCHLD on the calling thread and then takes the registry lock,
//! so the reaper can never interrupt a half-finished update on that thread.
//!
//! ## Reaper
//!
//! The SIGCHLD handler only *try*-locks the registry. When ordinary code holds
//! the lock, the handler raises a pending flag and returns; the holder sees the
//! flag when it releases the guard and runs the reap pass itself. Otherwise the
//! handler drains every exited child with `waitpid(-1, WNOHANG)`, removes each
//! from the registry and runs its completion. Removed entries are parked in a
//! list whose capacity was reserved at registration time, and are dropped later
//! from ordinary code, so the handler neither allocates nor frees.
//!
//! All reaps happen with the registry lock held, whichever path performs them.

#![allow(unsafe_code)]

use crate::process::{CompletionHandler, ProcessState};
use crate::Result;
use nix::errno::Errno;
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use nix::unistd::Pid;
use std::mem::{self, ManuallyDrop};
use std::ops::{Deref, DerefMut};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::{debug, warn};

static REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

/// Whether the SIGCHLD handler is installed in this process
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Set by the handler when it could not take the registry lock
static PENDING: AtomicBool = AtomicBool::new(false);

/// Reaped children that had no registry entry
static UNMATCHED: AtomicU64 = AtomicU64::new(0);
static UNMATCHED_REPORTED: AtomicU64 = AtomicU64::new(0);

/// A registry entry: the shared process state plus its completion handler
pub(crate) struct Tracked {
    state: Arc<ProcessState>,
    on_exit: Option<CompletionHandler>,
}

/// The set of live children. Only reachable through a [`SigchldGuard`].
pub(crate) struct Registry {
    live: Vec<Tracked>,
    /// Entries removed from `live`, waiting to be dropped in ordinary context.
    /// Capacity is kept at `retired.len() + live.len()` or more.
    retired: Vec<Tracked>,
}

impl Registry {
    const fn new() -> Self {
        Self {
            live: Vec::new(),
            retired: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, state: Arc<ProcessState>) {
        self.live.push(Tracked {
            state,
            on_exit: None,
        });
        self.retired.reserve(self.live.len());
    }

    /// Drop `state` from the live set without completing it. Returns whether
    /// it was still tracked.
    pub(crate) fn unregister(&mut self, state: &Arc<ProcessState>) -> bool {
        match self.live.iter().position(|t| Arc::ptr_eq(&t.state, state)) {
            Some(index) => {
                let entry = self.live.swap_remove(index);
                self.retire(entry);
                true
            }
            None => false,
        }
    }

    /// Remove and return the entry for a running `pid`
    pub(crate) fn find_and_remove(&mut self, pid: Pid) -> Option<Tracked> {
        let raw = pid.as_raw();
        let index = self.live.iter().position(|t| t.state.raw_pid() == raw)?;
        Some(self.live.swap_remove(index))
    }

    /// Install a completion handler on a tracked process. Hands the handler
    /// back when the process is no longer tracked; on success returns the
    /// handler it replaced.
    pub(crate) fn set_handler(
        &mut self,
        state: &Arc<ProcessState>,
        handler: CompletionHandler,
    ) -> std::result::Result<Option<CompletionHandler>, CompletionHandler> {
        match self.live.iter_mut().find(|t| Arc::ptr_eq(&t.state, state)) {
            Some(entry) => Ok(entry.on_exit.replace(handler)),
            None => Err(handler),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn pids(&self) -> Vec<Pid> {
        self.live
            .iter()
            .filter_map(|t| t.state.running_pid())
            .collect()
    }

    /// Most recently registered process still tracked
    pub(crate) fn last(&self) -> Option<Arc<ProcessState>> {
        self.live.last().map(|t| Arc::clone(&t.state))
    }

    /// Reap `pid` if it has exited, without blocking.
    ///
    /// `Ok(true)` when it was collected (and completed) now, `Ok(false)` when
    /// it is still running.
    pub(crate) fn reap_pid(&mut self, pid: Pid) -> std::result::Result<bool, Errno> {
        loop {
            let mut raw = 0;
            match unsafe { libc::waitpid(pid.as_raw(), &mut raw, libc::WNOHANG) } {
                0 => return Ok(false),
                -1 => match Errno::last() {
                    Errno::EINTR => continue,
                    errno => return Err(errno),
                },
                reaped => {
                    self.complete(Pid::from_raw(reaped), raw);
                    return Ok(true);
                }
            }
        }
    }

    /// Untrack a process that was collected outside this crate
    pub(crate) fn retire_lost(&mut self, state: &Arc<ProcessState>) {
        state.mark_lost();
        self.unregister(state);
    }

    /// Collect every exited child. Async-signal-safe.
    fn reap_ready(&mut self) {
        loop {
            let mut raw = 0;
            let pid = unsafe { libc::waitpid(-1, &mut raw, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            self.complete(Pid::from_raw(pid), raw);
        }
    }

    fn complete(&mut self, pid: Pid, raw_status: i32) {
        match self.find_and_remove(pid) {
            Some(mut entry) => {
                // the handler finishes before the handle reads as exited
                if let Some(handler) = entry.on_exit.as_mut() {
                    handler(pid, ExitStatus::from_raw(raw_status));
                }
                entry.state.mark_exited(raw_status);
                self.retire(entry);
            }
            None => {
                UNMATCHED.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn retire(&mut self, entry: Tracked) {
        if self.retired.len() < self.retired.capacity() {
            self.retired.push(entry);
        } else {
            // unreachable while the capacity invariant holds; leaking beats
            // allocating inside the signal handler
            mem::forget(entry);
        }
    }

    fn take_retired(&mut self) -> Vec<Tracked> {
        if self.retired.is_empty() {
            return Vec::new();
        }
        let fresh = Vec::with_capacity(self.live.len());
        mem::replace(&mut self.retired, fresh)
    }

    /// Forget everything inherited from the parent. Entries are leaked rather
    /// than dropped: they describe the parent's children, and freeing memory
    /// right after `fork()` is not safe in a multi-threaded parent.
    fn forget_inherited(&mut self) {
        mem::forget(mem::take(&mut self.live));
        mem::forget(mem::take(&mut self.retired));
    }
}

/// Scoped access to the registry with SIGCHLD blocked on this thread.
///
/// Dropping the guard releases the lock, runs any reap pass the handler had to
/// defer, restores the previous signal mask and finally drops retired entries.
pub(crate) struct SigchldGuard {
    registry: ManuallyDrop<MutexGuard<'static, Registry>>,
    saved_mask: SigSet,
}

impl SigchldGuard {
    pub(crate) fn acquire() -> Result<Self> {
        let saved_mask = block_sigchld()?;
        let registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Self {
            registry: ManuallyDrop::new(registry),
            saved_mask,
        })
    }

    /// In a forked child that is about to exec: restore the signal mask (it
    /// survives exec) and abandon the lock, whose memory exec discards.
    pub(crate) fn release_for_exec(self) {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.saved_mask), None);
        mem::forget(self);
    }

    /// In a forked child that keeps running: start over with an empty registry
    /// and a freshly installed handler.
    pub(crate) fn reset_in_child(mut self) -> std::result::Result<(), Errno> {
        self.registry.forget_inherited();
        PENDING.store(false, Ordering::SeqCst);
        UNMATCHED.store(0, Ordering::Relaxed);
        UNMATCHED_REPORTED.store(0, Ordering::Relaxed);
        INSTALLED.store(false, Ordering::SeqCst);
        arm_handler()?;
        INSTALLED.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Deref for SigchldGuard {
    type Target = Registry;

    fn deref(&self) -> &Registry {
        &self.registry
    }
}

impl DerefMut for SigchldGuard {
    fn deref_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }
}

impl Drop for SigchldGuard {
    fn drop(&mut self) {
        let mut parked = self.registry.take_retired();
        // SAFETY: the guard is dropped exactly once, here
        unsafe { ManuallyDrop::drop(&mut self.registry) };

        while PENDING.swap(false, Ordering::SeqCst) {
            let mut registry = REGISTRY.lock().unwrap_or_else(PoisonError::into_inner);
            registry.reap_ready();
            parked.append(&mut registry.take_retired());
        }

        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.saved_mask), None);
        report_unmatched();
        drop(parked);
    }
}

fn block_sigchld() -> std::result::Result<SigSet, Errno> {
    let mut blocked = SigSet::empty();
    blocked.add(Signal::SIGCHLD);
    let mut saved = SigSet::empty();
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut saved))?;
    Ok(saved)
}

/// Install the SIGCHLD reaper once per process
pub(crate) fn install_reaper() -> Result<()> {
    if INSTALLED.load(Ordering::SeqCst) {
        return Ok(());
    }
    let _registry = SigchldGuard::acquire()?;
    if !INSTALLED.load(Ordering::SeqCst) {
        arm_handler()?;
        INSTALLED.store(true, Ordering::SeqCst);
        debug!("Installed SIGCHLD reaper");
    }
    Ok(())
}

fn arm_handler() -> std::result::Result<(), Errno> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    // SAFETY: on_sigchld restricts itself to async-signal-safe work
    unsafe { sigaction(Signal::SIGCHLD, &action) }.map(drop)
}

extern "C" fn on_sigchld(_signum: libc::c_int) {
    let saved_errno = errno::get();
    PENDING.store(true, Ordering::SeqCst);
    loop {
        let mut registry = match REGISTRY.try_lock() {
            Ok(registry) => registry,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            // the holder reaps on release
            Err(TryLockError::WouldBlock) => break,
        };
        PENDING.store(false, Ordering::SeqCst);
        registry.reap_ready();
        drop(registry);
        if !PENDING.load(Ordering::SeqCst) {
            break;
        }
    }
    errno::set(saved_errno);
}

fn report_unmatched() {
    let seen = UNMATCHED.load(Ordering::Relaxed);
    let reported = UNMATCHED_REPORTED.swap(seen, Ordering::Relaxed);
    if seen > reported {
        warn!(
            "Reaper collected {} exited child(ren) that were not tracked",
            seen - reported
        );
    }
}

/// Number of processes currently tracked
pub fn tracked_count() -> Result<usize> {
    Ok(SigchldGuard::acquire()?.len())
}

/// Pids of every tracked, running process
pub fn tracked_pids() -> Result<Vec<Pid>> {
    Ok(SigchldGuard::acquire()?.pids())
}

/// How many reaped children had no registry entry since the process started
/// (or since the last `fork`, in a forked child)
pub fn unmatched_reaps() -> u64 {
    UNMATCHED.load(Ordering::Relaxed)
}

/// The handler must leave `errno` as it found it
mod errno {
    #[cfg(any(target_os = "linux", target_os = "emscripten", target_os = "redox"))]
    unsafe fn location() -> *mut libc::c_int {
        libc::__errno_location()
    }

    #[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))]
    unsafe fn location() -> *mut libc::c_int {
        libc::__errno()
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    unsafe fn location() -> *mut libc::c_int {
        libc::__error()
    }

    pub(super) fn get() -> libc::c_int {
        unsafe { *location() }
    }

    pub(super) fn set(value: libc::c_int) {
        unsafe { *location() = value }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(pid: i32) -> Arc<ProcessState> {
        let state = Arc::new(ProcessState::default());
        state.set_spawned(Pid::from_raw(pid));
        state
    }

    #[test]
    fn test_register_reserves_retirement_space() {
        let mut registry = Registry::new();
        for pid in 1..=4 {
            registry.register(tracked(pid));
        }
        assert_eq!(registry.len(), 4);
        assert!(registry.retired.capacity() >= registry.retired.len() + registry.live.len());
    }

    #[test]
    fn test_find_and_remove_by_pid() {
        let mut registry = Registry::new();
        let a = tracked(100);
        let b = tracked(200);
        registry.register(Arc::clone(&a));
        registry.register(Arc::clone(&b));

        let found = registry.find_and_remove(Pid::from_raw(200)).unwrap();
        assert!(Arc::ptr_eq(&found.state, &b));
        assert!(registry.find_and_remove(Pid::from_raw(200)).is_none());
        assert_eq!(registry.pids(), vec![Pid::from_raw(100)]);
    }

    #[test]
    fn test_unregister_parks_entry() {
        let mut registry = Registry::new();
        let a = tracked(300);
        registry.register(Arc::clone(&a));

        assert!(registry.unregister(&a));
        assert!(!registry.unregister(&a));
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.take_retired().len(), 1);
    }

    #[test]
    fn test_complete_runs_handler_once_and_clears_pid() {
        use std::sync::atomic::AtomicUsize;

        let mut registry = Registry::new();
        let a = tracked(400);
        registry.register(Arc::clone(&a));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handler: CompletionHandler = Box::new(move |pid, status| {
            assert_eq!(pid, Pid::from_raw(400));
            assert_eq!(status.code(), Some(3));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(matches!(registry.set_handler(&a, handler), Ok(None)));

        // raw wait status for exit(3)
        registry.complete(Pid::from_raw(400), 3 << 8);
        registry.complete(Pid::from_raw(400), 3 << 8);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.running_pid(), None);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_set_handler_on_untracked_returns_it() {
        let mut registry = Registry::new();
        let a = tracked(500);
        let handler: CompletionHandler = Box::new(|_, _| {});
        assert!(registry.set_handler(&a, handler).is_err());
    }

    #[test]
    fn test_guard_holder_reaps_deferred_exit() {
        use crate::fdmap::FdMapping;
        use std::os::fd::AsRawFd;
        use std::sync::atomic::{AtomicI32, AtomicUsize};
        use std::sync::mpsc;
        use std::time::{Duration, Instant};

        // the child exits once its stdin reaches EOF
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mapping = [FdMapping::new(read_end.as_raw_fd(), 0)];
        let child = crate::run("/bin/sh", &["-c", "read line; exit 6"], Some(&mapping)).unwrap();
        drop(read_end);
        let pid = child.pid().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let code = Arc::new(AtomicI32::new(-1));
        let (seen_calls, seen_code) = (Arc::clone(&calls), Arc::clone(&code));
        child
            .set_completion_handler(move |_pid, status| {
                seen_code.store(status.code().unwrap_or(-2), Ordering::SeqCst);
                seen_calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        // started before the mask below, so SIGCHLD can land on this thread
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let receiver = std::thread::spawn(move || {
            let _ = done_rx.recv();
        });

        let guard = SigchldGuard::acquire().unwrap();
        drop(write_end);

        // exited but not collected
        let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid.as_raw() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        assert_eq!(rc, 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !PENDING.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(PENDING.load(Ordering::SeqCst), "handler never ran");
        assert!(child.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(guard);

        // a guard released concurrently on another test thread may run the pass
        let deadline = Instant::now() + Duration::from_secs(1);
        while child.is_running() && Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert!(!child.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(code.load(Ordering::SeqCst), 6);
        assert_eq!(child.exit_status().and_then(|s| s.code()), Some(6));

        done_tx.send(()).unwrap();
        receiver.join().unwrap();
    }

    #[test]
    fn test_last_is_most_recent() {
        let mut registry = Registry::new();
        assert!(registry.last().is_none());
        let a = tracked(600);
        let b = tracked(601);
        registry.register(a);
        registry.register(Arc::clone(&b));
        assert!(Arc::ptr_eq(&registry.last().unwrap(), &b));
    }
}
