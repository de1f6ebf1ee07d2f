//! Per-request caller impersonation.
//!
//! The filesystems run as root and hand permission enforcement to the
//! kernel by adopting the calling process' identity before issuing any
//! backing filesystem call.  POSIX setreuid/setregid/setgroups are
//! process-global, which is useless under a threaded FUSE session, so the
//! thread-scoped variants are issued directly as raw syscalls.

use std::io::{BufRead, BufReader};

use nix::errno::Errno;
use nix::unistd::{setfsgid, setfsuid, Gid, Uid};

/// Adopt the caller's filesystem uid/gid on the current thread.
///
/// setfsuid/setfsgid report no errors; adequate privilege is verified once
/// at server startup by requiring real uid 0.
pub fn set_caller_fsids(uid: u32, gid: u32) {
    setfsuid(Uid::from_raw(uid));
    setfsgid(Gid::from_raw(gid));
}

/// Set the current thread's effective uid.
pub fn set_thread_euid(uid: u32) -> Result<(), Errno> {
    let rv = unsafe {
        libc::syscall(
            libc::SYS_setreuid,
            -1 as libc::c_long,
            uid as libc::c_long,
        )
    };
    if rv < 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

/// Set the current thread's effective gid.
pub fn set_thread_egid(gid: u32) -> Result<(), Errno> {
    let rv = unsafe {
        libc::syscall(
            libc::SYS_setregid,
            -1 as libc::c_long,
            gid as libc::c_long,
        )
    };
    if rv < 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

/// Set the current thread's supplementary group list.
pub fn set_thread_groups(groups: &[libc::gid_t]) -> Result<(), Errno> {
    let rv = unsafe {
        libc::syscall(
            libc::SYS_setgroups,
            groups.len() as libc::c_long,
            groups.as_ptr(),
        )
    };
    if rv < 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

/// Supplementary groups of a process, read from procfs.
///
/// Fails soft: kernel threads, sandboxed processes, and processes in other
/// PID namespaces have no readable status file.  Granting them an empty
/// group list leaves them with no privilege beyond what their uid carries,
/// which is the safe direction.
pub fn caller_groups(pid: u32) -> Vec<libc::gid_t> {
    let file = match std::fs::File::open(format!("/proc/{pid}/status")) {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => return Vec::new(),
        };
        if let Some(rest) = line.strip_prefix("Groups:") {
            return rest
                .split_ascii_whitespace()
                .filter_map(|g| g.parse().ok())
                .collect();
        }
    }
    Vec::new()
}

/// Adopt the full identity of the calling process on this thread: group
/// list, then egid, then euid.  The thread must hold euid 0 on entry.
pub fn become_caller(uid: u32, gid: u32, pid: u32) -> Result<(), Errno> {
    set_thread_groups(&caller_groups(pid))?;
    set_thread_egid(gid)?;
    set_thread_euid(uid)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_groups_are_readable() {
        let groups = caller_groups(std::process::id());
        let mine = nix::unistd::getgroups().unwrap();
        assert_eq!(groups.len(), mine.len());
    }

    #[test]
    fn unknown_pid_yields_empty_groups() {
        assert!(caller_groups(u32::MAX).is_empty());
    }
}
