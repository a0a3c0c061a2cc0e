//! Descriptor remapping across the exec boundary
//!
//! A child that is about to exec (or to continue as a forked copy) must end up
//! with exactly the descriptors its caller asked for: every requested target
//! refers to what its source referred to before the remap, a handful of
//! internal descriptors survive untouched, and nothing else stays open.
//!
//! ## Async-signal safety
//!
//! [`RemapPlan::apply`] runs in the child between `fork()` and `exec()`. It
//! only mutates the plan's existing storage and issues `dup`, `dup2`, `fcntl`
//! and `close`, so everything that allocates (validation, merging the keep
//! set, reading the descriptor limit) happens in [`RemapPlan::new`] and
//! [`RemapPlan::keep`] in the parent.

#![allow(unsafe_code)]

use crate::{ProcessError, Result};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::os::fd::RawFd;

/// One requested descriptor move: after the remap, `target` refers to the
/// file `source` referred to before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FdMapping {
    pub source: RawFd,
    pub target: RawFd,
}

impl FdMapping {
    pub const fn new(source: RawFd, target: RawFd) -> Self {
        Self { source, target }
    }

    /// Keep `fd` open at the same number
    pub const fn keep(fd: RawFd) -> Self {
        Self::new(fd, fd)
    }

    /// stdin, stdout and stderr mapped onto themselves
    pub const fn inherit_stdio() -> [FdMapping; 3] {
        [Self::keep(0), Self::keep(1), Self::keep(2)]
    }
}

/// Find the first malformed entry: a negative descriptor or a target that
/// already appeared earlier in the list.
pub(crate) fn find_fault(mapping: &[FdMapping]) -> Option<(usize, String)> {
    for (i, entry) in mapping.iter().enumerate() {
        if entry.source < 0 || entry.target < 0 {
            return Some((
                i,
                format!(
                    "descriptors must be non-negative (got {} -> {})",
                    entry.source, entry.target
                ),
            ));
        }
        if mapping[..i].iter().any(|prev| prev.target == entry.target) {
            return Some((i, format!("duplicate target fd {}", entry.target)));
        }
    }
    None
}

/// Reject a mapping with negative descriptors or duplicate targets
pub fn validate_mapping(mapping: &[FdMapping]) -> Result<()> {
    match find_fault(mapping) {
        Some((i, msg)) => Err(ProcessError::invalid(format!("fd_mapping[{}]: {}", i, msg))),
        None => Ok(()),
    }
}

/// The descriptor operations the remap algorithm needs.
pub(crate) trait FdTable {
    /// Duplicate `fd` onto the lowest free slot
    fn dup(&mut self, fd: RawFd) -> std::result::Result<RawFd, Errno>;

    /// Make `target` refer to the file behind `source`, clearing close-on-exec
    fn dup2(&mut self, source: RawFd, target: RawFd) -> std::result::Result<(), Errno>;

    fn close(&mut self, fd: RawFd);

    /// Clear close-on-exec so `fd` survives exec
    fn set_inheritable(&mut self, fd: RawFd) -> std::result::Result<(), Errno>;

    /// Close every descriptor in `first..limit`
    fn close_from(&mut self, first: RawFd, limit: RawFd) {
        for fd in first..limit {
            self.close(fd);
        }
    }
}

/// The calling process's own descriptor table. Every operation is a single
/// async-signal-safe syscall.
pub(crate) struct ProcessFds;

impl FdTable for ProcessFds {
    fn dup(&mut self, fd: RawFd) -> std::result::Result<RawFd, Errno> {
        Errno::result(unsafe { libc::dup(fd) })
    }

    fn dup2(&mut self, source: RawFd, target: RawFd) -> std::result::Result<(), Errno> {
        Errno::result(unsafe { libc::dup2(source, target) }).map(drop)
    }

    fn close(&mut self, fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn set_inheritable(&mut self, fd: RawFd) -> std::result::Result<(), Errno> {
        let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
        Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) })
            .map(drop)
    }

    #[cfg(target_os = "linux")]
    fn close_from(&mut self, first: RawFd, limit: RawFd) {
        if first >= limit {
            return;
        }
        // close_range(2) needs Linux 5.9; fall back to one close per slot
        let rc = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                first as libc::c_uint,
                (limit - 1) as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if rc != 0 {
            for fd in first..limit {
                self.close(fd);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    source: RawFd,
    target: RawFd,
    /// Caller-requested entries lose close-on-exec; internal keeps do not
    inherit: bool,
}

/// A validated remap, prepared in the parent and applied in the child.
#[derive(Debug, Clone)]
pub(crate) struct RemapPlan {
    slots: Vec<Slot>,
    limit: RawFd,
}

impl RemapPlan {
    /// Validate `mapping` and size the sweep from the process descriptor limit
    pub(crate) fn new(mapping: &[FdMapping]) -> Result<Self> {
        Self::with_limit(mapping, open_max())
    }

    pub(crate) fn with_limit(mapping: &[FdMapping], limit: RawFd) -> Result<Self> {
        validate_mapping(mapping)?;
        let mut slots = Vec::with_capacity(mapping.len() + 1);
        slots.extend(mapping.iter().map(|m| Slot {
            source: m.source,
            target: m.target,
            inherit: true,
        }));
        Ok(Self { slots, limit })
    }

    /// Add an internal descriptor that must survive the remap unchanged
    pub(crate) fn keep(&mut self, fd: RawFd) {
        self.slots.push(Slot {
            source: fd,
            target: fd,
            inherit: false,
        });
    }

    /// Highest descriptor number the plan mentions, as source or target
    pub(crate) fn highest_fd(&self) -> RawFd {
        self.slots
            .iter()
            .map(|s| s.source.max(s.target))
            .max()
            .unwrap_or(0)
    }

    /// Rearrange `fds` so exactly the planned targets remain open.
    ///
    /// An empty plan closes every descriptor. Otherwise each moved entry first
    /// rescues the current occupant of its target slot (if a later entry still
    /// reads from it) and then overwrites the slot, after which everything that
    /// is not a target is closed.
    pub(crate) fn apply<T: FdTable>(&mut self, fds: &mut T) -> std::result::Result<(), Errno> {
        if self.slots.is_empty() {
            fds.close_from(0, self.limit);
            return Ok(());
        }

        let mut highest = 0;
        for i in 0..self.slots.len() {
            let Slot {
                source,
                target,
                inherit,
            } = self.slots[i];

            if source != target {
                match retrying(|| fds.dup(target)) {
                    Ok(spare) => {
                        let mut used = false;
                        for later in &mut self.slots[i + 1..] {
                            if later.source == target {
                                later.source = spare;
                                used = true;
                            }
                        }
                        if !used {
                            fds.close(spare);
                        }
                    }
                    // nothing open at the target yet
                    Err(Errno::EBADF) => {}
                    Err(errno) => return Err(errno),
                }
                fds.close(target);
                retrying(|| fds.dup2(source, target))?;
            } else if inherit {
                fds.set_inheritable(target)?;
            }

            highest = highest.max(target);
        }

        fds.close_from(highest + 1, self.limit);
        for fd in 0..highest {
            if !self.slots.iter().any(|s| s.target == fd) {
                fds.close(fd);
            }
        }
        Ok(())
    }
}

fn retrying<T, F>(mut op: F) -> std::result::Result<T, Errno>
where
    F: FnMut() -> std::result::Result<T, Errno>,
{
    loop {
        match op() {
            Err(Errno::EINTR) | Err(Errno::EBUSY) => continue,
            other => return other,
        }
    }
}

fn open_max() -> RawFd {
    let max = unsafe { libc::sysconf(libc::_SC_OPEN_MAX) };
    if max > 0 {
        max.min(RawFd::MAX as libc::c_long) as RawFd
    } else {
        1024
    }
}
