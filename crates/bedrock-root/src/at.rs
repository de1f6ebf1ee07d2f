//! Thin wrappers over the fd-relative syscall family.
//!
//! Filesystem calls relative to a directory file descriptor are inherently
//! thread safe, unlike anything involving the process root or cwd.  Both
//! filesystems funnel their backing operations through here.

use std::ffi::{CString, OsString};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStringExt;

use nix::errno::Errno;

fn cstr(path: &str) -> Result<CString, Errno> {
    CString::new(path).map_err(|_| Errno::EINVAL)
}

pub fn openat(dirfd: BorrowedFd, path: &str, flags: i32, mode: u32) -> Result<OwnedFd, Errno> {
    let path = cstr(path)?;
    let fd = Errno::result(unsafe {
        libc::openat(dirfd.as_raw_fd(), path.as_ptr(), flags, mode as libc::c_uint)
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn fstatat(dirfd: BorrowedFd, path: &str, flags: i32) -> Result<libc::stat, Errno> {
    let path = cstr(path)?;
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    Errno::result(unsafe {
        libc::fstatat(dirfd.as_raw_fd(), path.as_ptr(), st.as_mut_ptr(), flags)
    })?;
    Ok(unsafe { st.assume_init() })
}

pub fn fstat(fd: BorrowedFd) -> Result<libc::stat, Errno> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    Errno::result(unsafe { libc::fstat(fd.as_raw_fd(), st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

pub fn readlinkat(dirfd: BorrowedFd, path: &str) -> Result<OsString, Errno> {
    let path = cstr(path)?;
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let len = Errno::result(unsafe {
        libc::readlinkat(
            dirfd.as_raw_fd(),
            path.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    })?;
    buf.truncate(len as usize);
    Ok(OsString::from_vec(buf))
}

pub fn mkdirat(dirfd: BorrowedFd, path: &str, mode: u32) -> Result<(), Errno> {
    let path = cstr(path)?;
    Errno::result(unsafe { libc::mkdirat(dirfd.as_raw_fd(), path.as_ptr(), mode) }).map(drop)
}

pub fn mknodat(dirfd: BorrowedFd, path: &str, mode: u32, rdev: u64) -> Result<(), Errno> {
    let path = cstr(path)?;
    Errno::result(unsafe {
        libc::mknodat(dirfd.as_raw_fd(), path.as_ptr(), mode, rdev as libc::dev_t)
    })
    .map(drop)
}

pub fn symlinkat(target: &str, dirfd: BorrowedFd, path: &str) -> Result<(), Errno> {
    let target = cstr(target)?;
    let path = cstr(path)?;
    Errno::result(unsafe { libc::symlinkat(target.as_ptr(), dirfd.as_raw_fd(), path.as_ptr()) })
        .map(drop)
}

pub fn unlinkat(dirfd: BorrowedFd, path: &str, flags: i32) -> Result<(), Errno> {
    let path = cstr(path)?;
    Errno::result(unsafe { libc::unlinkat(dirfd.as_raw_fd(), path.as_ptr(), flags) }).map(drop)
}

pub fn renameat(
    from_dirfd: BorrowedFd,
    from: &str,
    to_dirfd: BorrowedFd,
    to: &str,
) -> Result<(), Errno> {
    let from = cstr(from)?;
    let to = cstr(to)?;
    Errno::result(unsafe {
        libc::renameat(
            from_dirfd.as_raw_fd(),
            from.as_ptr(),
            to_dirfd.as_raw_fd(),
            to.as_ptr(),
        )
    })
    .map(drop)
}

pub fn linkat(
    from_dirfd: BorrowedFd,
    from: &str,
    to_dirfd: BorrowedFd,
    to: &str,
) -> Result<(), Errno> {
    let from = cstr(from)?;
    let to = cstr(to)?;
    Errno::result(unsafe {
        libc::linkat(
            from_dirfd.as_raw_fd(),
            from.as_ptr(),
            to_dirfd.as_raw_fd(),
            to.as_ptr(),
            0,
        )
    })
    .map(drop)
}

pub fn fchownat(dirfd: BorrowedFd, path: &str, uid: u32, gid: u32, flags: i32) -> Result<(), Errno> {
    let path = cstr(path)?;
    Errno::result(unsafe { libc::fchownat(dirfd.as_raw_fd(), path.as_ptr(), uid, gid, flags) })
        .map(drop)
}

pub fn fchmodat(dirfd: BorrowedFd, path: &str, mode: u32, flags: i32) -> Result<(), Errno> {
    let path = cstr(path)?;
    Errno::result(unsafe { libc::fchmodat(dirfd.as_raw_fd(), path.as_ptr(), mode, flags) })
        .map(drop)
}

pub fn utimensat(
    dirfd: BorrowedFd,
    path: &str,
    times: &[libc::timespec; 2],
    flags: i32,
) -> Result<(), Errno> {
    let path = cstr(path)?;
    Errno::result(unsafe {
        libc::utimensat(dirfd.as_raw_fd(), path.as_ptr(), times.as_ptr(), flags)
    })
    .map(drop)
}

pub fn faccessat(dirfd: BorrowedFd, path: &str, mode: i32, flags: i32) -> Result<(), Errno> {
    let path = cstr(path)?;
    Errno::result(unsafe { libc::faccessat(dirfd.as_raw_fd(), path.as_ptr(), mode, flags) })
        .map(drop)
}

pub fn fstatvfs(fd: BorrowedFd) -> Result<libc::statvfs, Errno> {
    let mut st = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    Errno::result(unsafe { libc::fstatvfs(fd.as_raw_fd(), st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

pub fn fallocate(fd: BorrowedFd, mode: i32, offset: i64, length: i64) -> Result<(), Errno> {
    Errno::result(unsafe { libc::fallocate(fd.as_raw_fd(), mode, offset, length) }).map(drop)
}

pub fn ftruncate(fd: BorrowedFd, size: i64) -> Result<(), Errno> {
    Errno::result(unsafe { libc::ftruncate(fd.as_raw_fd(), size) }).map(drop)
}

pub fn flock(fd: BorrowedFd, op: i32) -> Result<(), Errno> {
    Errno::result(unsafe { libc::flock(fd.as_raw_fd(), op) }).map(drop)
}

pub fn pread(fd: BorrowedFd, buf: &mut [u8], offset: i64) -> Result<usize, Errno> {
    let n = Errno::result(unsafe {
        libc::pread(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), offset)
    })?;
    Ok(n as usize)
}

pub fn pwrite(fd: BorrowedFd, buf: &[u8], offset: i64) -> Result<usize, Errno> {
    let n = Errno::result(unsafe {
        libc::pwrite(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len(), offset)
    })?;
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn openat_and_stat_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"contents").unwrap();
        let dirfd = std::fs::File::open(dir.path()).unwrap();

        let st = fstatat(dirfd.as_fd(), "file", libc::AT_SYMLINK_NOFOLLOW).unwrap();
        assert_eq!(st.st_size, 8);

        let fd = openat(dirfd.as_fd(), "file", libc::O_RDONLY, 0).unwrap();
        let mut buf = [0u8; 16];
        let n = pread(fd.as_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"contents");
    }

    #[test]
    fn readlinkat_reads_target() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/somewhere", dir.path().join("link")).unwrap();
        let dirfd = std::fs::File::open(dir.path()).unwrap();
        assert_eq!(readlinkat(dirfd.as_fd(), "link").unwrap(), "/somewhere");
    }

    #[test]
    fn rename_within_dirfd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        let dirfd = std::fs::File::open(dir.path()).unwrap();
        renameat(dirfd.as_fd(), "a", dirfd.as_fd(), "b").unwrap();
        assert!(dir.path().join("b").exists());
        assert!(!dir.path().join("a").exists());
    }
}
