use std::collections::BTreeMap;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::io::Read;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::{Mutex, MutexGuard};

use nix::errno::Errno;
use tracing::info;

use crate::EntryKind;

const DOT: &CStr = c".";

/// libfuse occasionally sets 040 in open flags; it corresponds to no O_*
/// flag and openat2, unlike openat, rejects unknown bits.
const STRAY_FUSE_FLAG: u64 = 0o40;

fn openat2_in_root(dirfd: RawFd, path: &CStr, flags: u64, mode: u64) -> Result<OwnedFd, Errno> {
    let mut how: libc::open_how = unsafe { std::mem::zeroed() };
    how.flags = flags & !STRAY_FUSE_FLAG;
    how.mode = mode;
    how.resolve = libc::RESOLVE_IN_ROOT;
    let rv = unsafe {
        libc::syscall(
            libc::SYS_openat2,
            dirfd,
            path.as_ptr(),
            &how as *const libc::open_how,
            std::mem::size_of::<libc::open_how>(),
        )
    };
    if rv < 0 {
        Err(Errno::last())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(rv as RawFd) })
    }
}

fn cstr(path: &str) -> Result<CString, Errno> {
    CString::new(path).map_err(|_| Errno::EINVAL)
}

/// Process-wide root-resolution facility.  One per server process.
pub struct RootResolver {
    use_openat2: bool,
    /// Raw fd of the currently installed chroot.  Only consulted under the
    /// lock; fd numbers are stable here because stratum root fds live for
    /// the lifetime of their config entries.
    installed: Mutex<RawFd>,
}

impl RootResolver {
    /// Probe for `openat2` support and remember the starting root.
    pub fn probe(init_root: BorrowedFd) -> RootResolver {
        let use_openat2 = openat2_in_root(
            init_root.as_raw_fd(),
            c"/",
            libc::O_DIRECTORY as u64,
            0,
        )
        .is_ok();
        info!(openat2 = use_openat2, "root substrate selected");
        RootResolver {
            use_openat2,
            installed: Mutex::new(init_root.as_raw_fd()),
        }
    }

    pub fn openat2_available(&self) -> bool {
        self.use_openat2
    }

    /// Install `root` as the process chroot, returning the held guard.
    fn install(&self, root: BorrowedFd) -> Result<MutexGuard<'_, RawFd>, Errno> {
        let mut cur = self.installed.lock().unwrap();
        if *cur != root.as_raw_fd() {
            Errno::result(unsafe { libc::fchdir(root.as_raw_fd()) })?;
            Errno::result(unsafe { libc::chroot(DOT.as_ptr()) })?;
            *cur = root.as_raw_fd();
        }
        Ok(cur)
    }

    /// `open(2)` as if chrooted into `root`.
    pub fn open(&self, root: BorrowedFd, path: &str, flags: i32) -> Result<OwnedFd, Errno> {
        let path = cstr(path)?;
        if self.use_openat2 {
            return openat2_in_root(root.as_raw_fd(), &path, flags as u64, 0);
        }
        let _guard = self.install(root)?;
        let fd = Errno::result(unsafe { libc::open(path.as_ptr(), flags) })?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// `stat(2)` (following symlinks) as if chrooted into `root`.
    pub fn stat(&self, root: BorrowedFd, path: &str) -> Result<libc::stat, Errno> {
        if self.use_openat2 {
            // fstat() accepts O_PATH descriptors; symlinks are followed
            // because O_NOFOLLOW is left off.
            let fd = self.open(root, path, libc::O_RDONLY | libc::O_PATH)?;
            return crate::at::fstat(fd.as_fd());
        }
        let path = cstr(path)?;
        let _guard = self.install(root)?;
        let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
        Errno::result(unsafe { libc::stat(path.as_ptr(), st.as_mut_ptr()) })?;
        Ok(unsafe { st.assume_init() })
    }

    /// Whether anything other than a dangling symlink exists at `path`.
    pub fn exists(&self, root: BorrowedFd, path: &str) -> bool {
        if self.use_openat2 {
            return match self.open(root, path, libc::O_PATH) {
                Ok(_) => true,
                Err(e) => e != Errno::ENOENT,
            };
        }
        self.stat(root, path).is_ok()
    }

    /// `readlink(2)` as if chrooted into `root`.
    pub fn readlink(&self, root: BorrowedFd, path: &str) -> Result<OsString, Errno> {
        if self.use_openat2 {
            let fd = self.open(root, path, libc::O_NOFOLLOW | libc::O_PATH)?;
            return match crate::at::readlinkat(fd.as_fd(), "") {
                // readlinkat(fd, "") reports ENOENT for an existing
                // non-symlink; the fd proves existence, so report EINVAL
                // the way the chroot path would.
                Err(Errno::ENOENT) => Err(Errno::EINVAL),
                other => other,
            };
        }
        let path = cstr(path)?;
        let _guard = self.install(root)?;
        let mut buf = vec![0u8; libc::PATH_MAX as usize];
        let len = Errno::result(unsafe {
            libc::readlink(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
        })?;
        buf.truncate(len as usize);
        Ok(OsString::from_vec(buf))
    }

    /// Full contents of a regular file under `root`.
    pub fn read_to_vec(&self, root: BorrowedFd, path: &str) -> Result<Vec<u8>, Errno> {
        let fd = self.open(root, path, libc::O_RDONLY)?;
        let mut file = std::fs::File::from(fd);
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| io_errno_of(&e))?;
        Ok(contents)
    }

    /// Merge the names under a directory into `out`, skipping dangling
    /// symlinks and self-symlinks (e.g. the common `/usr/bin/X11 -> .`).
    /// First insertion wins, so earlier backing directories shadow later
    /// ones.  Missing directories are not an error.
    ///
    /// Always uses the locking substrate; see the crate docs.
    pub fn dir_entries(
        &self,
        root: BorrowedFd,
        path: &str,
        out: &mut BTreeMap<OsString, EntryKind>,
    ) -> Result<(), Errno> {
        let cpath = cstr(path)?;
        let _guard = self.install(root)?;

        let mut linkbuf = [0u8; 2];
        let len = unsafe {
            libc::readlink(cpath.as_ptr(), linkbuf.as_mut_ptr().cast(), linkbuf.len())
        };
        if len == 1 && linkbuf[0] == b'.' {
            return Ok(());
        }

        let dirp = unsafe { libc::opendir(cpath.as_ptr()) };
        if dirp.is_null() {
            return match Errno::last() {
                Errno::ENOENT => Ok(()),
                e => Err(e),
            };
        }

        loop {
            let ent = unsafe { libc::readdir(dirp) };
            if ent.is_null() {
                break;
            }
            let name = unsafe { CStr::from_ptr((*ent).d_name.as_ptr()) };
            let name = OsStr::from_bytes(name.to_bytes());
            if name == "." || name == ".." || out.contains_key(name) {
                continue;
            }

            let child = match CString::new(
                [path.as_bytes(), b"/", name.as_bytes()].concat(),
            ) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
            if unsafe { libc::stat(child.as_ptr(), st.as_mut_ptr()) } < 0 {
                continue;
            }
            let st = unsafe { st.assume_init() };
            out.insert(name.to_os_string(), EntryKind::from_mode(st.st_mode));
        }
        unsafe { libc::closedir(dirp) };
        Ok(())
    }
}

fn io_errno_of(err: &std::io::Error) -> Errno {
    match err.raw_os_error() {
        Some(raw) => Errno::from_raw(raw),
        None => Errno::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    fn resolver_for(dir: &std::path::Path) -> (RootResolver, std::fs::File) {
        let root = std::fs::File::open(dir).unwrap();
        let resolver = RootResolver::probe(root.as_fd());
        (resolver, root)
    }

    #[test]
    fn openat2_resolves_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("usr/bin")).unwrap();
        std::fs::write(dir.path().join("usr/bin/vim"), b"elf").unwrap();
        let (resolver, root) = resolver_for(dir.path());
        if !resolver.openat2_available() {
            return;
        }

        let st = resolver.stat(root.as_fd(), "/usr/bin/vim").unwrap();
        assert_eq!(st.st_size, 3);
        assert!(resolver.exists(root.as_fd(), "/usr/bin/vim"));
        assert!(!resolver.exists(root.as_fd(), "/usr/bin/emacs"));
    }

    #[test]
    fn openat2_confines_escapes() {
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("../../../../etc/passwd", dir.path().join("escape")).unwrap();
        let (resolver, root) = resolver_for(dir.path());
        if !resolver.openat2_available() {
            return;
        }

        // RESOLVE_IN_ROOT pins ".." at the root; the symlink resolves to
        // <root>/etc/passwd, which does not exist.
        assert!(!resolver.exists(root.as_fd(), "/escape"));
    }

    #[test]
    fn readlink_reports_einval_for_non_symlink() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain"), b"").unwrap();
        std::os::unix::fs::symlink("plain", dir.path().join("link")).unwrap();
        let (resolver, root) = resolver_for(dir.path());
        if !resolver.openat2_available() {
            return;
        }

        assert_eq!(
            resolver.readlink(root.as_fd(), "/link").unwrap(),
            "plain"
        );
        assert_eq!(
            resolver.readlink(root.as_fd(), "/plain"),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn read_to_vec_returns_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"hello").unwrap();
        let (resolver, root) = resolver_for(dir.path());
        if !resolver.openat2_available() {
            return;
        }
        assert_eq!(resolver.read_to_vec(root.as_fd(), "/f").unwrap(), b"hello");
    }
}
