// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fork/exec mechanics: signal-masking around `fork`, the parent-death
//! signal race, and non-channel FD closing for external workers. Everything
//! here runs in the narrow window between `fork()` returning in the child
//! and that child either running its own event loop (internal) or calling
//! `execve` (external), so none of it may touch the resource tree.
#![allow(unsafe_code)]

use std::os::fd::RawFd;

use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::unistd::{fork as nix_fork, getppid, ForkResult, Pid};

use crate::error::{Error, Result};

/// The process's signal mask as it was before [`block_all_signals`], restored
/// by [`restore`](SignalMaskGuard::restore) once the fork-time window has
/// closed on both sides.
pub struct SignalMaskGuard(SigSet);

/// Blocks every signal around `fork()`: a signal delivered to the parent
/// between `fork()` returning and the child installing its own handlers (or
/// to the child before it's done setting up) must not be allowed to run a
/// default disposition mid-setup.
pub fn block_all_signals() -> Result<SignalMaskGuard> {
    let mut old = SigSet::empty();
    unsafe {
        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), Some(&mut old)).map_err(Error::from)?;
    }
    Ok(SignalMaskGuard(old))
}

impl SignalMaskGuard {
    pub fn restore(self) -> Result<()> {
        unsafe {
            sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.0), None).map_err(Error::from)?;
        }
        Ok(())
    }
}

/// Which side of `fork()` the caller is now running on.
pub enum ForkOutcome {
    Parent { child_pid: i32 },
    Child,
}

/// # Safety
/// Must be called with signals blocked ([`block_all_signals`]) and with no
/// other thread running in this process — `fork()` only duplicates the
/// calling thread, and anything else holding a lock the child might touch
/// (allocator arenas, the tree's `RefCell`) would deadlock or corrupt state.
pub unsafe fn fork() -> Result<ForkOutcome> {
    match nix_fork().map_err(Error::from)? {
        ForkResult::Parent { child } => Ok(ForkOutcome::Parent {
            child_pid: child.as_raw(),
        }),
        ForkResult::Child => Ok(ForkOutcome::Child),
    }
}

/// `prctl(PR_SET_PDEATHSIG, sig)`: asks the kernel to deliver `sig` to this
/// (child) process once its parent dies, closing the window where a worker
/// could be orphaned and never notice. `nix` doesn't wrap `PR_SET_PDEATHSIG`,
/// so this goes straight to `libc`, same as the rest of the ecosystem does.
pub fn set_parent_death_signal(sig: Signal) -> Result<()> {
    let ret = unsafe { nix::libc::prctl(nix::libc::PR_SET_PDEATHSIG, sig as nix::libc::c_int) };
    if ret != 0 {
        return Err(Error::from(nix::Error::last()));
    }
    Ok(())
}

/// True if the parent recorded at fork time has already exited by the time
/// the child gets here — the race `PR_SET_PDEATHSIG` alone can't close,
/// since the parent may have died in the gap between `fork()` returning and
/// the `prctl` call actually taking effect.
pub fn parent_already_exited(original_parent_pid: i32) -> bool {
    getppid().as_raw() != original_parent_pid
}

/// Raises `SIGTERM` against the calling (child) process and never returns
/// normally — used when [`parent_already_exited`] is true, so the child
/// terminates immediately rather than running on as an orphan with a stale
/// parent-death signal setup.
pub fn terminate_self_as_orphan() -> ! {
    let _ = kill(Pid::this(), Signal::SIGTERM);
    std::process::exit(1);
}

/// Closes every open FD in this process except those in `keep`, by scanning
/// `/proc/self/fd`. Used only for external workers, right after fork and
/// before `execve`, so the child doesn't inherit daemon-internal FDs (listen
/// sockets, other workers' channels, log files) it has no business holding.
pub fn close_non_channel_fds(keep: &[RawFd]) -> Result<()> {
    let entries = std::fs::read_dir("/proc/self/fd").map_err(Error::from)?;
    for entry in entries.flatten() {
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let Ok(fd) = name.parse::<RawFd>() else {
            continue;
        };
        if !keep.contains(&fd) {
            let _ = nix::unistd::close(fd);
        }
    }
    Ok(())
}
