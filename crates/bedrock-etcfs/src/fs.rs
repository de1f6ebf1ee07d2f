//! The etcfs FUSE server.
//!
//! Routes each request either to the calling process' stratum-local `/etc`
//! or to the globally shared bedrock `/etc`, enforcing content overrides on
//! the way.  Every request adopts the caller's identity (euid, egid,
//! supplementary groups) on the handling thread so the kernel performs the
//! actual permission checks.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, OsStr, OsString};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use nix::errno::Errno;
use tracing::{debug, warn};

use bedrock_core::identity::{become_caller, set_thread_euid};
use bedrock_core::inode::{InodeTable, ROOT_INO};
use bedrock_core::path::rel_path;
use bedrock_core::{CFG_NAME, LPATH_XATTR, STRATUM_XATTR};
use bedrock_root::{at, EntryKind};

use crate::config::{EtcConfig, OverrideType};
use crate::inject;

/// Zero TTLs: changes on the lower filesystem must be visible immediately.
const TTL: Duration = Duration::ZERO;

/// What a file routed to the global reference reports as its stratum.
const GLOBAL_STRATUM: &str = "global";

/// Sentinel file handle for the config pseudo-file, which has no backing
/// descriptor.
const CFG_FH: u64 = u64::MAX;

const CFG_PATH: &str = "/.bedrock-config-filesystem";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Local,
    Global,
}

pub struct EtcFs {
    config: RwLock<EtcConfig>,
    inodes: InodeTable,
    local_ref: OwnedFd,
    global_ref: OwnedFd,
    local_name: String,
    mntpt: String,
    start: SystemTime,
}

impl EtcFs {
    pub fn new(
        local_ref: OwnedFd,
        global_ref: OwnedFd,
        local_name: String,
        mntpt: String,
    ) -> EtcFs {
        EtcFs {
            config: RwLock::new(EtcConfig::new()),
            inodes: InodeTable::new(),
            local_ref,
            global_ref,
            local_name,
            mntpt,
            start: SystemTime::now(),
        }
    }

    fn ref_fd(&self, route: Route) -> BorrowedFd<'_> {
        match route {
            Route::Local => self.local_ref.as_fd(),
            Route::Global => self.global_ref.as_fd(),
        }
    }

    fn route_of(&self, path: &str) -> Route {
        if self.config.read().unwrap().is_global(path) {
            Route::Global
        } else {
            Route::Local
        }
    }

    /// Per-request preamble: raise to root, pick the reference descriptor,
    /// enforce any override on the path, then adopt the caller's identity
    /// for everything that follows.  The thread stays in the caller's
    /// identity until the next request raises it again.
    fn setup(&self, req: &Request<'_>, path: &str) -> Result<Route, Errno> {
        set_thread_euid(0).map_err(|_| Errno::EPERM)?;
        let route = self.route_of(path);
        self.apply_override(route, path)
            .map_err(|_| Errno::ERANGE)?;
        become_caller(req.uid(), req.gid(), req.pid()).map_err(|_| Errno::EPERM)?;
        Ok(route)
    }

    /// Check-then-fix enforcement of a configured override.  Re-applying
    /// within one second is suppressed: package managers that remove and
    /// immediately recreate a file get confused if the override reappears
    /// between their steps.
    fn apply_override(&self, route: Route, path: &str) -> Result<(), Errno> {
        let mut cfg = self.config.write().unwrap();
        let ov = match cfg.find_override_mut(path) {
            Some(ov) => ov,
            None => return Ok(()),
        };
        let ref_fd = self.ref_fd(route);
        let rpath = rel_path(path);
        let now = unix_now();

        match ov.otype {
            OverrideType::Symlink => {
                if let Ok(target) = at::readlinkat(ref_fd, rpath) {
                    if target.as_os_str().as_bytes() == ov.content.as_bytes() {
                        return Ok(());
                    }
                }
                if now - ov.last_applied <= 1 {
                    return Ok(());
                }
                ov.last_applied = now;
                debug!(path, target = %ov.content, "enforcing symlink override");
                let _ = at::unlinkat(ref_fd, rpath, 0);
                let _ = at::unlinkat(ref_fd, rpath, libc::AT_REMOVEDIR);
                at::symlinkat(&ov.content, ref_fd, rpath).map_err(|e| {
                    warn!(path, error = %e, "symlink override application failed");
                    e
                })?;
            }
            OverrideType::Directory => {
                if let Ok(st) = at::fstatat(ref_fd, rpath, libc::AT_SYMLINK_NOFOLLOW) {
                    if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
                        return Ok(());
                    }
                }
                if now - ov.last_applied <= 1 {
                    return Ok(());
                }
                ov.last_applied = now;
                debug!(path, "enforcing directory override");
                let _ = at::unlinkat(ref_fd, rpath, 0);
                let _ = at::unlinkat(ref_fd, rpath, libc::AT_REMOVEDIR);
                at::mkdirat(ref_fd, rpath, 0o755).map_err(|e| {
                    warn!(path, error = %e, "directory override application failed");
                    e
                })?;
            }
            OverrideType::Inject => {
                match at::fstatat(ref_fd, rpath, libc::AT_SYMLINK_NOFOLLOW) {
                    Ok(st) if st.st_mode & libc::S_IFMT == libc::S_IFREG => {}
                    _ => return Ok(()),
                }
                if now - ov.last_applied <= 1 {
                    return Ok(());
                }
                ov.last_applied = now;
                debug!(path, "enforcing inject override");
                inject::inject(ref_fd, rpath, &ov.inject).map_err(|e| {
                    warn!(path, error = %e, "inject override application failed");
                    e
                })?;
            }
        }
        Ok(())
    }

    fn cfg_attr(&self, ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: self.config.read().unwrap().serialized_len(),
            blocks: 0,
            atime: self.start,
            mtime: self.start,
            ctime: self.start,
            crtime: self.start,
            kind: FileType::RegularFile,
            perm: 0o600,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn attr_of(&self, route: Route, ino: u64, path: &str) -> Result<FileAttr, Errno> {
        let st = at::fstatat(self.ref_fd(route), rel_path(path), libc::AT_SYMLINK_NOFOLLOW)?;
        Ok(attr_from_stat(ino, &st))
    }

    fn path_of(&self, ino: u64) -> Result<String, Errno> {
        self.inodes
            .path_of(ino)
            .map(str::to_string)
            .ok_or(Errno::ENOENT)
    }

    /// Delegate an xattr fetch to the underlying file.  There is no
    /// syscall that is both fd-based and symlink-direct, so the fd is
    /// round-tripped through /proc to reach the l* variants.
    fn delegate_getxattr(fd: BorrowedFd, name: &OsStr) -> Result<Vec<u8>, Errno> {
        let proc_path = CString::new(format!("/proc/self/fd/{}", fd.as_raw_fd()))
            .map_err(|_| Errno::ENAMETOOLONG)?;
        let name = CString::new(name.as_bytes()).map_err(|_| Errno::EINVAL)?;
        let len = Errno::result(unsafe {
            libc::lgetxattr(proc_path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0)
        })?;
        let mut buf = vec![0u8; len as usize];
        let len = Errno::result(unsafe {
            libc::lgetxattr(
                proc_path.as_ptr(),
                name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        })?;
        buf.truncate(len as usize);
        Ok(buf)
    }

    fn xattr_reply(reply: ReplyXattr, size: u32, value: &[u8]) {
        if size == 0 {
            reply.size(value.len() as u32);
        } else if (size as usize) < value.len() {
            reply.error(Errno::ERANGE as i32);
        } else {
            reply.data(value);
        }
    }

    /// Names visible in a directory: global entries that are configured
    /// global, override points whose parent is this directory, then local
    /// entries not shadowed by either.
    fn readdir_entries(
        &self,
        route: Route,
        path: &str,
    ) -> Result<Vec<(OsString, EntryKind)>, Errno> {
        let cfg = self.config.read().unwrap();
        let rpath = rel_path(path);
        let mut entries: Vec<(OsString, EntryKind)> = Vec::new();
        let mut dir_exists = false;

        if let Ok(fd) = at::openat(
            self.global_ref.as_fd(),
            rpath,
            libc::O_NONBLOCK | libc::O_DIRECTORY | libc::O_RDONLY,
            0,
        ) {
            dir_exists = true;
            for (name, kind) in list_dir(fd) {
                if let Some(full) = join_path(path, &name) {
                    if cfg.is_global(&full) {
                        entries.push((name, kind));
                    }
                }
            }
        }

        for ov in cfg.overrides() {
            if ov.otype == OverrideType::Inject {
                continue;
            }
            if let Some(child) = direct_child(path, &ov.path) {
                let kind = match ov.otype {
                    OverrideType::Symlink => EntryKind::Symlink,
                    _ => EntryKind::Directory,
                };
                entries.push((OsString::from(child), kind));
            }
        }

        if let Ok(fd) = at::openat(
            self.ref_fd(route),
            rpath,
            libc::O_NONBLOCK | libc::O_DIRECTORY | libc::O_RDONLY,
            0,
        ) {
            dir_exists = true;
            for (name, kind) in list_dir(fd) {
                let full = match join_path(path, &name) {
                    Some(f) => f,
                    None => continue,
                };
                if cfg.is_global(&full) {
                    continue;
                }
                if cfg
                    .overrides()
                    .iter()
                    .any(|o| o.otype != OverrideType::Inject && o.path == full)
                {
                    continue;
                }
                // The config interface is virtual; a real file with the
                // same name must not show through twice.
                if path == "/" && name == CFG_NAME {
                    continue;
                }
                entries.push((name, kind));
            }
        }

        if !dir_exists {
            return Err(Errno::ENOENT);
        }
        if path == "/" {
            entries.push((OsString::from(CFG_NAME), EntryKind::Regular));
        }
        Ok(entries)
    }
}

impl Filesystem for EtcFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => return reply.error(Errno::ENOENT as i32),
        };
        let ino = self.inodes.ino_for(&path);
        if path == CFG_PATH {
            return reply.entry(&TTL, &self.cfg_attr(ino), 0);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        match self.attr_of(route, ino, &path) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e as i32),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            return reply.attr(&TTL, &self.cfg_attr(ino));
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        match self.attr_of(route, ino, &path) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e as i32),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let ref_fd = self.ref_fd(route);
        let rpath = rel_path(&path);

        let result = (|| -> Result<(), Errno> {
            if let Some(mode) = mode {
                at::fchmodat(ref_fd, rpath, mode & 0o7777, 0)?;
            }
            if uid.is_some() || gid.is_some() {
                at::fchownat(
                    ref_fd,
                    rpath,
                    uid.unwrap_or(u32::MAX),
                    gid.unwrap_or(u32::MAX),
                    libc::AT_SYMLINK_NOFOLLOW,
                )?;
            }
            if let Some(size) = size {
                match fh {
                    Some(fh) if fh != CFG_FH => {
                        let fd = unsafe { BorrowedFd::borrow_raw(fh as RawFd) };
                        at::ftruncate(fd, size as i64)?;
                    }
                    _ => {
                        let fd = at::openat(
                            ref_fd,
                            rpath,
                            libc::O_NONBLOCK | libc::O_RDWR | libc::O_NOFOLLOW,
                            0,
                        )?;
                        at::ftruncate(fd.as_fd(), size as i64)?;
                    }
                }
            }
            if atime.is_some() || mtime.is_some() {
                let times = [timespec_of(atime), timespec_of(mtime)];
                at::utimensat(ref_fd, rpath, &times, libc::AT_SYMLINK_NOFOLLOW)?;
            }
            Ok(())
        })();

        match result.and_then(|()| self.attr_of(route, ino, &path)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e as i32),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        match at::readlinkat(self.ref_fd(route), rel_path(&path)) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e as i32),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => return reply.error(Errno::ENOENT as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let ino = self.inodes.ino_for(&path);
        let rv = at::mknodat(self.ref_fd(route), rel_path(&path), mode, rdev as u64)
            .and_then(|()| self.attr_of(route, ino, &path));
        match rv {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e as i32),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => return reply.error(Errno::ENOENT as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let ino = self.inodes.ino_for(&path);
        let rv = at::mkdirat(self.ref_fd(route), rel_path(&path), mode)
            .and_then(|()| self.attr_of(route, ino, &path));
        match rv {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e as i32),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let path = match self.inodes.child_path(parent, link_name) {
            Some(p) => p,
            None => return reply.error(Errno::ENOENT as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let target = match target.to_str() {
            Some(t) => t,
            None => return reply.error(Errno::EINVAL as i32),
        };
        let ino = self.inodes.ino_for(&path);
        let rv = at::symlinkat(target, self.ref_fd(route), rel_path(&path))
            .and_then(|()| self.attr_of(route, ino, &path));
        match rv {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e as i32),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => return reply.error(Errno::ENOENT as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        match at::unlinkat(self.ref_fd(route), rel_path(&path), 0) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as i32),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => return reply.error(Errno::ENOENT as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        match at::unlinkat(self.ref_fd(route), rel_path(&path), libc::AT_REMOVEDIR) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as i32),
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => return reply.error(Errno::ENOENT as i32),
        };
        let to = match self.inodes.child_path(newparent, newname) {
            Some(p) => p,
            None => return reply.error(Errno::ENOENT as i32),
        };
        if from == CFG_PATH || to == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        // RENAME_NOREPLACE / RENAME_EXCHANGE are deliberately not honored.
        if flags != 0 {
            return reply.error(Errno::EOPNOTSUPP as i32);
        }
        let from_route = match self.setup(req, &from) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let to_route = self.route_of(&to);

        let rv = self.rename_impl(from_route, &from, to_route, &to);
        match rv {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok()
            }
            Err(e) => reply.error(e as i32),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let from = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        let to = match self.inodes.child_path(newparent, newname) {
            Some(p) => p,
            None => return reply.error(Errno::ENOENT as i32),
        };
        if from == CFG_PATH || to == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let from_route = match self.setup(req, &from) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let to_route = self.route_of(&to);
        let to_ino = self.inodes.ino_for(&to);
        let rv = at::linkat(
            self.ref_fd(from_route),
            rel_path(&from),
            self.ref_fd(to_route),
            rel_path(&to),
        )
        .and_then(|()| self.attr_of(to_route, to_ino, &to));
        match rv {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e as i32),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            if req.uid() != 0 {
                return reply.error(Errno::EACCES as i32);
            }
            return reply.opened(CFG_FH, 0);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        match at::openat(
            self.ref_fd(route),
            rel_path(&path),
            libc::O_NONBLOCK | flags,
            0,
        ) {
            Ok(fd) => reply.opened(fd.into_raw_fd() as u64, 0),
            Err(e) => reply.error(e as i32),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => return reply.error(Errno::ENOENT as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let ino = self.inodes.ino_for(&path);
        let fd = match at::openat(
            self.ref_fd(route),
            rel_path(&path),
            libc::O_NONBLOCK | flags,
            mode,
        ) {
            Ok(fd) => fd,
            Err(e) => return reply.error(e as i32),
        };
        match at::fstat(fd.as_fd()) {
            Ok(st) => {
                let attr = attr_from_stat(ino, &st);
                reply.created(&TTL, &attr, 0, fd.into_raw_fd() as u64, 0);
            }
            Err(e) => reply.error(e as i32),
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            if req.uid() != 0 {
                return reply.error(Errno::EACCES as i32);
            }
            let serialized = self.config.read().unwrap().serialize();
            return reply.data(slice_at(serialized.as_bytes(), offset, size));
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let rv = at::openat(
            self.ref_fd(route),
            rel_path(&path),
            libc::O_NONBLOCK | libc::O_RDONLY | libc::O_NOFOLLOW,
            0,
        )
        .and_then(|fd| {
            let mut buf = vec![0u8; size as usize];
            let n = at::pread(fd.as_fd(), &mut buf, offset)?;
            buf.truncate(n);
            Ok(buf)
        });
        match rv {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e as i32),
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            if req.uid() != 0 {
                return reply.error(Errno::EACCES as i32);
            }
            if let Err(e) = set_thread_euid(0) {
                return reply.error(e as i32);
            }
            let mut cfg = self.config.write().unwrap();
            return match cfg.apply_command(data, self.local_ref.as_fd()) {
                Ok(n) => {
                    debug!(command = %String::from_utf8_lossy(data).trim_end(), "config updated");
                    reply.written(n as u32)
                }
                Err(e) => reply.error(e as i32),
            };
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let rv = at::openat(
            self.ref_fd(route),
            rel_path(&path),
            libc::O_NONBLOCK | libc::O_WRONLY | libc::O_NOFOLLOW,
            0,
        )
        .and_then(|fd| at::pwrite(fd.as_fd(), data, offset));
        match rv {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e as i32),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if fh == CFG_FH {
            return reply.ok();
        }
        // This may be called several times per file; the descriptor must
        // survive, so flush through a dup.
        let rv = unsafe {
            let dup = libc::dup(fh as RawFd);
            if dup < 0 {
                -1
            } else {
                libc::close(dup)
            }
        };
        if rv < 0 {
            reply.error(Errno::last() as i32)
        } else {
            reply.ok()
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if fh != CFG_FH {
            drop(unsafe { OwnedFd::from_raw_fd(fh as RawFd) });
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        if fh == CFG_FH {
            return reply.ok();
        }
        let rv = unsafe {
            if datasync {
                libc::fdatasync(fh as RawFd)
            } else {
                libc::fsync(fh as RawFd)
            }
        };
        if rv < 0 {
            reply.error(Errno::last() as i32)
        } else {
            reply.ok()
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        match at::openat(
            self.ref_fd(route),
            rel_path(&path),
            libc::O_NONBLOCK | libc::O_DIRECTORY | libc::O_RDONLY | libc::O_NOFOLLOW,
            0,
        ) {
            Ok(_) => reply.opened(0, 0),
            Err(e) => reply.error(e as i32),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let entries = match self.readdir_entries(route, &path) {
            Ok(e) => e,
            Err(e) => return reply.error(e as i32),
        };

        let parent_ino = match path.rfind('/') {
            Some(0) | None => ROOT_INO,
            Some(idx) => self.inodes.ino_for(&path[..idx]),
        };
        let mut listing: Vec<(u64, FileType, OsString)> = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent_ino, FileType::Directory, OsString::from("..")),
        ];
        let mut seen = BTreeMap::new();
        for (name, kind) in entries {
            if seen.insert(name.clone(), ()).is_some() {
                continue;
            }
            let child_ino = match self.inodes.child_path(ino, &name) {
                Some(child) => self.inodes.ino_for(&child),
                None => continue,
            };
            listing.push((child_ino, file_type(kind), name));
        }

        for (i, (entry_ino, kind, name)) in listing.into_iter().enumerate() {
            if (i as i64) < offset {
                continue;
            }
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let rv = at::openat(
            self.ref_fd(route),
            rel_path(&path),
            libc::O_NONBLOCK | libc::O_RDONLY | libc::O_NOFOLLOW,
            0,
        )
        .and_then(|fd| at::fstatvfs(fd.as_fd()));
        match rv {
            Ok(st) => reply.statfs(
                st.f_blocks,
                st.f_bfree,
                st.f_bavail,
                st.f_files,
                st.f_ffree,
                st.f_bsize as u32,
                st.f_namemax as u32,
                st.f_frsize as u32,
            ),
            Err(e) => reply.error(e as i32),
        }
    }

    fn fallocate(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let rv = at::openat(
            self.ref_fd(route),
            rel_path(&path),
            libc::O_NONBLOCK | libc::O_RDWR | libc::O_NOFOLLOW,
            0,
        )
        .and_then(|fd| at::fallocate(fd.as_fd(), mode, offset, length));
        match rv {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as i32),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        match at::faccessat(self.ref_fd(route), rel_path(&path), mask, libc::AT_EACCESS) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as i32),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let rv = at::openat(
            self.ref_fd(route),
            rel_path(&path),
            libc::O_NONBLOCK | libc::O_RDONLY | libc::O_NOFOLLOW,
            0,
        )
        .and_then(|fd| {
            let proc_path = CString::new(format!("/proc/self/fd/{}", fd.as_raw_fd()))
                .map_err(|_| Errno::ENAMETOOLONG)?;
            let name = CString::new(name.as_bytes()).map_err(|_| Errno::EINVAL)?;
            Errno::result(unsafe {
                libc::lsetxattr(
                    proc_path.as_ptr(),
                    name.as_ptr(),
                    value.as_ptr().cast(),
                    value.len(),
                    flags,
                )
            })
            .map(drop)
        });
        match rv {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as i32),
        }
    }

    fn getxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            let value: Result<Vec<u8>, Errno> = if name == STRATUM_XATTR {
                Ok(GLOBAL_STRATUM.as_bytes().to_vec())
            } else if name == LPATH_XATTR {
                Ok(b"/".to_vec())
            } else {
                Err(Errno::ENODATA)
            };
            return match value {
                Ok(v) => Self::xattr_reply(reply, size, &v),
                Err(e) => reply.error(e as i32),
            };
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let fd = match at::openat(
            self.ref_fd(route),
            rel_path(&path),
            libc::O_NONBLOCK | libc::O_RDONLY | libc::O_NOFOLLOW,
            0,
        ) {
            Ok(fd) => fd,
            // Unopenable files (permission-restricted or bad symlinks)
            // cannot be delegated to.  Most callers probing here are after
            // attributes the file does not have; ENODATA is the least
            // wrong answer.
            Err(Errno::EACCES) | Err(Errno::EINVAL) | Err(Errno::ELOOP)
            | Err(Errno::ENAMETOOLONG) => return reply.error(Errno::ENODATA as i32),
            Err(e) => return reply.error(e as i32),
        };
        let value: Result<Vec<u8>, Errno> = if name == STRATUM_XATTR {
            match route {
                Route::Global => Ok(GLOBAL_STRATUM.as_bytes().to_vec()),
                Route::Local => Ok(self.local_name.as_bytes().to_vec()),
            }
        } else if name == LPATH_XATTR {
            Ok(format!("{}{}", self.mntpt, path).into_bytes())
        } else {
            Self::delegate_getxattr(fd.as_fd(), name)
        };
        match value {
            Ok(v) => Self::xattr_reply(reply, size, &v),
            Err(e) => reply.error(e as i32),
        }
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let rv = at::openat(
            self.ref_fd(route),
            rel_path(&path),
            libc::O_NONBLOCK | libc::O_RDONLY | libc::O_NOFOLLOW,
            0,
        )
        .and_then(|fd| {
            let proc_path = CString::new(format!("/proc/self/fd/{}", fd.as_raw_fd()))
                .map_err(|_| Errno::ENAMETOOLONG)?;
            let len = Errno::result(unsafe {
                libc::llistxattr(proc_path.as_ptr(), std::ptr::null_mut(), 0)
            })?;
            let mut buf = vec![0u8; len as usize];
            let len = Errno::result(unsafe {
                libc::llistxattr(proc_path.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
            })?;
            buf.truncate(len as usize);
            Ok(buf)
        });
        match rv {
            Ok(list) => Self::xattr_reply(reply, size, &list),
            Err(e) => reply.error(e as i32),
        }
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e as i32),
        };
        if path == CFG_PATH {
            return reply.error(Errno::EINVAL as i32);
        }
        let route = match self.setup(req, &path) {
            Ok(r) => r,
            Err(e) => return reply.error(e as i32),
        };
        let rv = at::openat(
            self.ref_fd(route),
            rel_path(&path),
            libc::O_NONBLOCK | libc::O_RDWR | libc::O_NOFOLLOW,
            0,
        )
        .and_then(|fd| {
            let proc_path = CString::new(format!("/proc/self/fd/{}", fd.as_raw_fd()))
                .map_err(|_| Errno::ENAMETOOLONG)?;
            let name = CString::new(name.as_bytes()).map_err(|_| Errno::EINVAL)?;
            Errno::result(unsafe { libc::lremovexattr(proc_path.as_ptr(), name.as_ptr()) })
                .map(drop)
        });
        match rv {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as i32),
        }
    }
}

impl EtcFs {
    /// renameat, with a manual copy fallback when source and destination
    /// live on different reference descriptors (EXDEV).
    fn rename_impl(
        &self,
        from_route: Route,
        from: &str,
        to_route: Route,
        to: &str,
    ) -> Result<(), Errno> {
        let from_fd = self.ref_fd(from_route);
        let to_fd = self.ref_fd(to_route);
        let rfrom = rel_path(from);
        let rto = rel_path(to);

        match at::renameat(from_fd, rfrom, to_fd, rto) {
            Ok(()) => return Ok(()),
            Err(Errno::EXDEV) => {}
            Err(e) => return Err(e),
        }
        debug!(from, to, "rename crossed references, copying");

        let st = at::fstatat(from_fd, rfrom, libc::AT_SYMLINK_NOFOLLOW)?;
        let kind = st.st_mode & libc::S_IFMT;

        match kind {
            libc::S_IFBLK | libc::S_IFCHR | libc::S_IFIFO | libc::S_IFSOCK => {
                at::mknodat(to_fd, rto, st.st_mode, st.st_rdev)?;
            }
            libc::S_IFLNK => {
                let target = at::readlinkat(from_fd, rfrom)?;
                let target = target.to_str().ok_or(Errno::EINVAL)?.to_string();
                at::symlinkat(&target, to_fd, rto)?;
            }
            libc::S_IFDIR => {
                // Children are not copied; deep moves are the caller's
                // business.
                at::mkdirat(to_fd, rto, st.st_mode & 0o7777)?;
            }
            _ => {
                let tid = unsafe { libc::syscall(libc::SYS_gettid) };
                let tmp_name = format!(".bedrock-tmpfile-{tid}");
                let _ = at::unlinkat(to_fd, &tmp_name, 0);
                let tmp = at::openat(
                    to_fd,
                    &tmp_name,
                    libc::O_NONBLOCK | libc::O_CREAT | libc::O_RDWR | libc::O_NOFOLLOW,
                    st.st_mode & 0o7777,
                )?;
                let src = at::openat(
                    from_fd,
                    rfrom,
                    libc::O_NONBLOCK | libc::O_RDONLY | libc::O_NOFOLLOW,
                    0,
                )?;
                let copy = (|| -> Result<(), Errno> {
                    at::ftruncate(tmp.as_fd(), st.st_size)?;
                    let mut src_file = std::fs::File::from(src);
                    let mut tmp_file = std::fs::File::from(tmp);
                    std::io::copy(&mut src_file, &mut tmp_file)
                        .map_err(|e| bedrock_core::io_errno(&e))?;
                    Ok(())
                })();
                if let Err(e) = copy {
                    let _ = at::unlinkat(to_fd, &tmp_name, 0);
                    return Err(e);
                }
                if let Err(e) = at::renameat(to_fd, &tmp_name, to_fd, rto) {
                    let _ = at::unlinkat(to_fd, &tmp_name, 0);
                    return Err(e);
                }
            }
        }

        at::fchownat(to_fd, rto, st.st_uid, st.st_gid, libc::AT_SYMLINK_NOFOLLOW)?;
        if kind != libc::S_IFLNK {
            at::fchmodat(to_fd, rto, st.st_mode & 0o7777, 0)?;
        }

        let unlink_flags = if kind == libc::S_IFDIR {
            libc::AT_REMOVEDIR
        } else {
            0
        };
        at::unlinkat(from_fd, rfrom, unlink_flags)?;
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn timespec_of(time: Option<TimeOrNow>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::SpecificTime(t)) => {
            let since = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
            libc::timespec {
                tv_sec: since.as_secs() as libc::time_t,
                tv_nsec: since.subsec_nanos() as libc::c_long,
            }
        }
    }
}

/// Absolute in-mount path of a directory entry.
fn join_path(dir: &str, name: &OsStr) -> Option<String> {
    let name = name.to_str()?;
    if dir == "/" {
        Some(format!("/{name}"))
    } else {
        Some(format!("{dir}/{name}"))
    }
}

/// If `candidate` is a direct child of `dir`, its final component.
fn direct_child<'a>(dir: &str, candidate: &'a str) -> Option<&'a str> {
    let rest = if dir == "/" {
        candidate.strip_prefix('/')?
    } else {
        candidate.strip_prefix(dir)?.strip_prefix('/')?
    };
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}

/// Entries of an open directory descriptor.  Consumes the descriptor.
fn list_dir(fd: OwnedFd) -> Vec<(OsString, EntryKind)> {
    let raw = fd.into_raw_fd();
    let dirp = unsafe { libc::fdopendir(raw) };
    if dirp.is_null() {
        unsafe { libc::close(raw) };
        return Vec::new();
    }
    let mut entries = Vec::new();
    loop {
        let ent = unsafe { libc::readdir(dirp) };
        if ent.is_null() {
            break;
        }
        let name = unsafe { CStr::from_ptr((*ent).d_name.as_ptr()) };
        let name = OsStr::from_bytes(name.to_bytes());
        if name == "." || name == ".." {
            continue;
        }
        let kind = match unsafe { (*ent).d_type } {
            libc::DT_DIR => EntryKind::Directory,
            libc::DT_LNK => EntryKind::Symlink,
            libc::DT_FIFO => EntryKind::Fifo,
            libc::DT_SOCK => EntryKind::Socket,
            libc::DT_CHR => EntryKind::CharDevice,
            libc::DT_BLK => EntryKind::BlockDevice,
            _ => EntryKind::Regular,
        };
        entries.push((name.to_os_string(), kind));
    }
    unsafe { libc::closedir(dirp) };
    entries
}

fn slice_at(data: &[u8], offset: i64, size: u32) -> &[u8] {
    if offset < 0 || offset as usize >= data.len() {
        return &[];
    }
    let start = offset as usize;
    let end = (start + size as usize).min(data.len());
    &data[start..end]
}

fn file_type(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::Regular => FileType::RegularFile,
        EntryKind::Symlink => FileType::Symlink,
        EntryKind::Fifo => FileType::NamedPipe,
        EntryKind::Socket => FileType::Socket,
        EntryKind::CharDevice => FileType::CharDevice,
        EntryKind::BlockDevice => FileType::BlockDevice,
    }
}

fn system_time(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    }
}

fn attr_from_stat(ino: u64, st: &libc::stat) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime),
        mtime: system_time(st.st_mtime),
        ctime: system_time(st.st_ctime),
        crtime: system_time(st.st_ctime),
        kind: match st.st_mode & libc::S_IFMT {
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            libc::S_IFIFO => FileType::NamedPipe,
            libc::S_IFSOCK => FileType::Socket,
            libc::S_IFCHR => FileType::CharDevice,
            libc::S_IFBLK => FileType::BlockDevice,
            _ => FileType::RegularFile,
        },
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_children_are_recognized() {
        assert_eq!(direct_child("/", "/hostname"), Some("hostname"));
        assert_eq!(direct_child("/", "/ssh/config"), None);
        assert_eq!(direct_child("/ssh", "/ssh/config"), Some("config"));
        assert_eq!(direct_child("/ssh", "/sshd/config"), None);
        assert_eq!(direct_child("/ssh", "/ssh"), None);
    }

    #[test]
    fn join_path_handles_root() {
        use std::ffi::OsString;
        assert_eq!(
            join_path("/", &OsString::from("resolv.conf")).unwrap(),
            "/resolv.conf"
        );
        assert_eq!(
            join_path("/ssh", &OsString::from("config")).unwrap(),
            "/ssh/config"
        );
    }

    #[test]
    fn slice_at_clamps() {
        assert_eq!(slice_at(b"global /x\n", 0, 6), b"global");
        assert_eq!(slice_at(b"abc", 3, 4), b"");
        assert_eq!(slice_at(b"abc", 1, 100), b"bc");
    }
}
