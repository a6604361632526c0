//! Process and process-group probing and signalling.
//!
//! Every helper here treats `ESRCH` as an ordinary outcome rather than an error: a process
//! that is already gone is what the callers are trying to achieve.
use std::{
    io,
    process::{Child, ExitStatus},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::{Pid, getpgid},
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn raw_pid(pid: u32) -> Option<Pid> {
    // 0 and negative values address groups, never a single process.
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}

fn errno_to_io(err: Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// Returns `true` if a process with `pid` exists, using a zero-signal probe.
pub fn process_exists(pid: u32) -> bool {
    let Some(target) = raw_pid(pid) else {
        return false;
    };

    match signal::kill(target, None) {
        Ok(()) => true,
        // Exists, but owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Returns `true` while at least one member of process group `pgid` is alive.
pub fn group_exists(pgid: u32) -> bool {
    let Some(target) = raw_pid(pgid) else {
        return false;
    };

    match signal::killpg(target, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Resolves the process group of `pid`, or `None` if the process is gone or shares the
/// group of the current process (signalling that group would hit ourselves).
pub fn group_of(pid: u32) -> Option<u32> {
    let target = raw_pid(pid)?;
    let own = getpgid(None).ok()?;
    let pgid = getpgid(Some(target)).ok()?;

    if pgid == own {
        None
    } else {
        u32::try_from(pgid.as_raw()).ok()
    }
}

/// Sends `sig` to every process in group `pgid`.
///
/// Returns `Ok(true)` when the signal was delivered and `Ok(false)` when the group no longer
/// exists.
pub fn signal_group(pgid: u32, sig: Signal) -> io::Result<bool> {
    let Some(target) = raw_pid(pgid) else {
        return Ok(false);
    };

    match signal::killpg(target, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(errno_to_io(err)),
    }
}

/// Sends `sig` to a single process. Same return convention as [`signal_group`].
pub fn signal_process(pid: u32, sig: Signal) -> io::Result<bool> {
    let Some(target) = raw_pid(pid) else {
        return Ok(false);
    };

    match signal::kill(target, sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(errno_to_io(err)),
    }
}

/// Wait for a child process with a timeout, returning `Ok(None)` on timeout.
pub fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Polls until process group `pgid` is empty or `timeout` elapses. Returns `true` if the
/// group emptied.
pub fn wait_for_group_exit(pgid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        if !group_exists(pgid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}
