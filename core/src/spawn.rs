//! Creating children: fork/exec with a synchronous launch handshake
//!
//! Every launch registers its [`Process`] before `fork()` so the reaper never
//! sees a pid it does not know, then talks to the child over a private
//! close-on-exec pipe:
//!
//! - the child execs (or finishes its setup, in fork mode) and the pipe closes
//!   with nothing written: the parent reads EOF and the launch succeeded;
//! - any failure in the child is written as a short lowercase hex errno and
//!   the child exits with status 127: the parent reads the number back,
//!   collects the dead child and returns [`ProcessError::Os`] with that errno.
//!
//! Between `fork()` and `exec()` the child only issues async-signal-safe
//! syscalls on memory prepared by the parent.

#![allow(unsafe_code)]

use crate::fdmap::{FdMapping, ProcessFds, RemapPlan};
use crate::process::Process;
use crate::registry::{self, SigchldGuard};
use crate::{ProcessError, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::ForkResult;
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Longest failure report: a 32-bit errno in hex
const REPORT_LEN: usize = 8;

/// Exit status of a child that failed before or during exec
const LAUNCH_FAILURE_STATUS: libc::c_int = 127;

/// Start `program` with `args` in a new child process.
///
/// `argv[0]` is the program path, followed by `args`. The child keeps only
/// the descriptors named by `fd_mapping` (none at all when it is `None`; see
/// [`FdMapping::inherit_stdio`]). The call returns once the exec has
/// succeeded; a failure anywhere in the child, including the exec itself, is
/// returned here as [`ProcessError::Os`] and leaves nothing tracked.
pub fn run(
    program: impl AsRef<Path>,
    args: &[&str],
    fd_mapping: Option<&[FdMapping]>,
) -> Result<Process> {
    let program = program.as_ref();
    let image = ExecImage::new(program, args)?;
    let plan = RemapPlan::new(fd_mapping.unwrap_or(&[]))?;

    debug!("Spawning process: {} {:?}", program.display(), args);
    // SAFETY: the exec path only runs async-signal-safe code in the child
    let launched = unsafe { launch(ChildPath::Exec(&image), Some(plan)) };
    match launched {
        Ok(Some(process)) => {
            if let Some(pid) = process.id() {
                info!("Started {} with PID {}", program.display(), pid);
            }
            Ok(process)
        }
        Ok(None) => unreachable!("exec child returned into the caller"),
        Err(e) => {
            error!("Failed to spawn process '{}': {}", program.display(), e);
            Err(e)
        }
    }
}

/// Fork the calling process without exec.
///
/// Returns `Some(process)` in the parent and `None` in the child. The child
/// starts with an empty tracked set and its own reaper. With `preserve_fds`
/// it keeps every descriptor; otherwise it keeps exactly the descriptors
/// named by `fd_mapping`, and none when that is `None`. Asking for both is
/// rejected.
///
/// # Safety
///
/// If other threads exist, the child is a single-threaded copy of a
/// multi-threaded process: locks held by the vanished threads stay locked
/// forever. Until it execs or exits, the child must only use
/// async-signal-safe functions (no allocation, no `std::io` locks, no
/// logging).
pub unsafe fn fork(preserve_fds: bool, fd_mapping: Option<&[FdMapping]>) -> Result<Option<Process>> {
    let plan = match (preserve_fds, fd_mapping) {
        (true, Some(mapping)) if !mapping.is_empty() => {
            return Err(ProcessError::invalid(
                "fork: preserve_fds cannot be combined with an fd_mapping",
            ));
        }
        (true, _) => None,
        (false, mapping) => Some(RemapPlan::new(mapping.unwrap_or(&[]))?),
    };

    debug!("Forking (preserve_fds: {})", preserve_fds);
    let forked = launch(ChildPath::Continue, plan)?;
    if let Some(pid) = forked.as_ref().and_then(Process::id) {
        info!("Forked child with PID {}", pid);
    }
    Ok(forked)
}

/// Program and argument vector, converted before fork
struct ExecImage {
    program: CString,
    _args: Vec<CString>,
    /// Null-terminated pointers into `program` and `_args`
    argv: Vec<*const libc::c_char>,
}

impl ExecImage {
    fn new(program: &Path, args: &[&str]) -> Result<Self> {
        let bytes = program.as_os_str().as_bytes();
        if bytes.is_empty() {
            return Err(ProcessError::invalid("program cannot be empty"));
        }
        let program = CString::new(bytes)
            .map_err(|_| ProcessError::invalid("program contains a NUL byte"))?;
        let args = args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                CString::new(*arg)
                    .map_err(|_| ProcessError::invalid(format!("args[{}] contains a NUL byte", i)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut argv = Vec::with_capacity(args.len() + 2);
        argv.push(program.as_ptr());
        argv.extend(args.iter().map(|arg| arg.as_ptr()));
        argv.push(std::ptr::null());

        Ok(Self {
            program,
            _args: args,
            argv,
        })
    }
}

/// What the child does once forked
enum ChildPath<'a> {
    Exec(&'a ExecImage),
    /// Reset inherited state and return into the caller
    Continue,
}

enum Handshake {
    Launched,
    Failed(Errno),
}

/// Register, fork and complete the handshake.
///
/// Returns `Some` in the parent. Only [`ChildPath::Continue`] ever returns in
/// the child, as `None`.
unsafe fn launch(path: ChildPath<'_>, mut plan: Option<RemapPlan>) -> Result<Option<Process>> {
    registry::install_reaper()?;

    // the write end is only open while the guard is held, so no other launch
    // can fork a copy of it
    let mut guard = SigchldGuard::acquire()?;
    let process = Process::new();
    guard.register(Arc::clone(process.state()));

    let floor = plan.as_ref().map_or(0, |plan| plan.highest_fd() + 1);
    let (read_end, write_end) = match error_pipe(floor) {
        Ok(ends) => ends,
        Err(e) => {
            guard.unregister(process.state());
            return Err(e);
        }
    };
    if let Some(plan) = plan.as_mut() {
        plan.keep(write_end.as_raw_fd());
    }

    let child = match nix::unistd::fork() {
        Ok(ForkResult::Parent { child }) => child,
        Ok(ForkResult::Child) => {
            drop(read_end);
            let report_fd = write_end.as_raw_fd();
            return match path {
                ChildPath::Exec(image) => {
                    guard.release_for_exec();
                    exec_child(image, plan.as_mut(), report_fd)
                }
                ChildPath::Continue => {
                    if let Err(errno) = guard.reset_in_child() {
                        report_and_exit(report_fd, errno);
                    }
                    if let Some(plan) = plan.as_mut() {
                        if let Err(errno) = plan.apply(&mut ProcessFds) {
                            report_and_exit(report_fd, errno);
                        }
                    }
                    // closing the last write end is the success report
                    drop(write_end);
                    std::mem::forget(process);
                    Ok(None)
                }
            };
        }
        Err(errno) => {
            drop(write_end);
            guard.unregister(process.state());
            drop(guard);
            error!("fork failed: {}", errno);
            return Err(errno.into());
        }
    };
    process.state().set_spawned(child);
    drop(write_end);
    drop(guard);

    match await_handshake(read_end) {
        Ok(Handshake::Launched) => Ok(Some(process)),
        Ok(Handshake::Failed(errno)) => {
            debug!("Child {} reported launch failure: {}", child, errno);
            reclaim(&process);
            Err(errno.into())
        }
        Err(e) => {
            error!("Lost the launch report of child {}: {}", child, e);
            let _ = process.kill(true);
            reclaim(&process);
            Err(e.into())
        }
    }
}

/// Untrack a process that never forked
fn abandon(process: &Process) {
    if let Ok(mut registry) = SigchldGuard::acquire() {
        registry.unregister(process.state());
    }
}

/// Collect a child that failed to launch and make sure it is untracked
fn reclaim(process: &Process) {
    if let Err(e) = process.wait() {
        debug!("Could not collect failed child: {}", e);
    }
    abandon(process);
}

/// A close-on-exec pipe whose descriptors are both at or above `floor`, so
/// they cannot collide with any descriptor a remap plan mentions.
fn error_pipe(floor: RawFd) -> Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = new_pipe()?;
    Ok((relocate(read_end, floor)?, relocate(write_end, floor)?))
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn new_pipe() -> Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn new_pipe() -> Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe()?)
}

fn relocate(fd: OwnedFd, floor: RawFd) -> Result<OwnedFd> {
    let moved = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(floor))?;
    // SAFETY: F_DUPFD_CLOEXEC returned a fresh descriptor we now own
    Ok(unsafe { OwnedFd::from_raw_fd(moved) })
}

/// Read the child's report until EOF
fn await_handshake(read_end: OwnedFd) -> io::Result<Handshake> {
    let mut report = Vec::with_capacity(REPORT_LEN);
    File::from(read_end).read_to_end(&mut report)?;
    if report.is_empty() {
        Ok(Handshake::Launched)
    } else {
        Ok(Handshake::Failed(decode_errno(&report)))
    }
}

fn exec_child(image: &ExecImage, plan: Option<&mut RemapPlan>, report_fd: RawFd) -> ! {
    if let Some(plan) = plan {
        if let Err(errno) = plan.apply(&mut ProcessFds) {
            report_and_exit(report_fd, errno);
        }
    }
    unsafe {
        // ignored dispositions survive exec; programs expect the default
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        libc::execv(image.program.as_ptr(), image.argv.as_ptr());
    }
    report_and_exit(report_fd, Errno::last())
}

fn report_and_exit(report_fd: RawFd, errno: Errno) -> ! {
    let (buf, len) = encode_errno(errno as i32);
    unsafe {
        libc::write(report_fd, buf.as_ptr().cast(), len);
        libc::_exit(LAUNCH_FAILURE_STATUS)
    }
}

/// Lowercase hex without leading zeros. Allocation-free.
fn encode_errno(errno: i32) -> ([u8; REPORT_LEN], usize) {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut value = errno as u32;
    let mut buf = [0u8; REPORT_LEN];
    let mut len = 0;
    loop {
        buf[len] = DIGITS[(value & 0xf) as usize];
        len += 1;
        value >>= 4;
        if value == 0 {
            break;
        }
    }
    buf[..len].reverse();
    (buf, len)
}

/// Parse a report back into an errno. Anything malformed becomes `EPROTO`.
fn decode_errno(report: &[u8]) -> Errno {
    std::str::from_utf8(report)
        .ok()
        .filter(|text| text.len() <= REPORT_LEN)
        .and_then(|text| u32::from_str_radix(text, 16).ok())
        .filter(|&number| number != 0 && number <= i32::MAX as u32)
        .map_or(Errno::EPROTO, |number| Errno::from_raw(number as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(errno: i32) -> String {
        let (buf, len) = encode_errno(errno);
        String::from_utf8(buf[..len].to_vec()).unwrap()
    }

    #[test]
    fn test_encode_is_lowercase_hex() {
        assert_eq!(encoded(libc::ENOENT), "2");
        assert_eq!(encoded(libc::EMFILE), "18");
        assert_eq!(encoded(0x7fff_ffff), "7fffffff");
    }

    #[test]
    fn test_decode_known_reports() {
        assert_eq!(decode_errno(b"2"), Errno::ENOENT);
        assert_eq!(decode_errno(b"d"), Errno::EACCES);
        assert_eq!(decode_errno(encoded(libc::ENOEXEC).as_bytes()), Errno::ENOEXEC);
    }

    #[test]
    fn test_decode_malformed_reports() {
        assert_eq!(decode_errno(b"zz"), Errno::EPROTO);
        assert_eq!(decode_errno(b"0"), Errno::EPROTO);
        assert_eq!(decode_errno(b"123456789"), Errno::EPROTO);
        assert_eq!(decode_errno(&[0xff, 0xfe]), Errno::EPROTO);
    }

    #[test]
    fn test_exec_image_argv_layout() {
        let image = ExecImage::new(Path::new("/bin/echo"), &["a", "b"]).unwrap();
        assert_eq!(image.argv.len(), 4);
        assert_eq!(image.argv[0], image.program.as_ptr());
        assert!(image.argv[3].is_null());
    }

    #[test]
    fn test_exec_image_rejects_bad_input() {
        assert!(matches!(
            ExecImage::new(Path::new(""), &[]),
            Err(ProcessError::InvalidArgument(_))
        ));
        assert!(matches!(
            ExecImage::new(Path::new("/bin/echo"), &["a\0b"]),
            Err(ProcessError::InvalidArgument(msg)) if msg == "args[0] contains a NUL byte"
        ));
    }

    #[test]
    fn test_exec_image_accepts_blank_file_name() {
        // a name made of spaces is a legal relative path; exec decides
        assert!(ExecImage::new(Path::new("  "), &[]).is_ok());
    }

    #[test]
    fn test_error_pipe_sits_above_floor() {
        let (read_end, write_end) = error_pipe(40).unwrap();
        assert!(read_end.as_raw_fd() >= 40);
        assert!(write_end.as_raw_fd() >= 40);
        let flags = fcntl(write_end.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }
}
