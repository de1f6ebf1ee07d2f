//! The crossfs FUSE server.
//!
//! Read-only except for the configuration pseudo-file.  Every request runs
//! with the caller's fsuid/fsgid so the kernel enforces the caller's
//! permissions against backing files, and resolves the caller's stratum so
//! `local` backing entries and the local-alias symlink point at the right
//! root.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::FileExt;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, ReplyOpen,
    ReplyWrite, ReplyXattr, Request,
};
use nix::errno::Errno;
use tracing::{debug, warn};
use xattr::FileExt as XattrFileExt;

use bedrock_core::identity::set_caller_fsids;
use bedrock_core::inode::{InodeTable, ROOT_INO};
use bedrock_core::{
    CFG_NAME, LPATH_XATTR, RESTRICT_VALUE, RESTRICT_XATTR, STRATA_ROOT, STRATUM_XATTR,
    VIRTUAL_STRATUM,
};
use bedrock_root::{at, EntryKind, RootResolver};

use crate::config::{
    CallerStratum, CfgEntry, Config, IpathClass, CFG_PATH, LOCAL_ALIAS_NAME,
};
use crate::filter::{self, Filter};
use crate::service::{ServiceCache, ServiceType};

const TTL: Duration = Duration::from_secs(1);

/// Everything crossfs exports is virtual; "/" is the only sensible lpath
/// for paths with no backing file.
const VIRTUAL_LPATH: &str = "/";

pub struct CrossFs {
    resolver: RootResolver,
    config: RwLock<Config>,
    inodes: InodeTable,
    init_root: OwnedFd,
    strata_root: OwnedFd,
    procfs: OwnedFd,
    bouncer: std::fs::File,
    bouncer_size: u64,
    services: ServiceCache,
    service_type: ServiceType,
    start: SystemTime,
}

impl CrossFs {
    pub fn new(
        init_root: OwnedFd,
        strata_root: OwnedFd,
        procfs: OwnedFd,
        bouncer: std::fs::File,
        service_type: ServiceType,
    ) -> Result<CrossFs, Errno> {
        let resolver = RootResolver::probe(init_root.as_fd());
        let bouncer_size = bedrock_root::at::fstat(bouncer.as_fd())?.st_size as u64;
        Ok(CrossFs {
            resolver,
            config: RwLock::new(Config::new()),
            inodes: InodeTable::new(),
            init_root,
            strata_root,
            procfs,
            bouncer,
            bouncer_size,
            services: ServiceCache::new(),
            service_type,
            start: SystemTime::now(),
        })
    }

    /// The calling process' stratum, from the xattr on its root directory.
    /// Kernel threads and sandboxed processes have no usable proc entry;
    /// they are treated as the virtual stratum.
    fn caller_stratum(&self, pid: u32) -> Result<CallerStratum, Errno> {
        if pid != 0 {
            if let Ok(root) = at::openat(
                self.procfs.as_fd(),
                &format!("{pid}/root"),
                libc::O_DIRECTORY,
                0,
            ) {
                let file = std::fs::File::from(root);
                if let Ok(Some(name)) = file.get_xattr(STRATUM_XATTR) {
                    return Ok(CallerStratum {
                        name: String::from_utf8_lossy(&name).into_owned(),
                        root: file.into(),
                    });
                }
            }
        }
        let root = self
            .resolver
            .open(self.strata_root.as_fd(), VIRTUAL_STRATUM, libc::O_DIRECTORY)
            .map_err(|_| Errno::ESRCH)?;
        Ok(CallerStratum {
            name: VIRTUAL_STRATUM.to_string(),
            root,
        })
    }

    fn setup(&self, req: &Request<'_>) -> Result<CallerStratum, Errno> {
        set_caller_fsids(req.uid(), req.gid());
        self.caller_stratum(req.pid())
    }

    fn dir_attr(&self, ino: u64) -> FileAttr {
        FileAttr {
            ino,
            size: 0,
            blocks: 0,
            atime: self.start,
            mtime: self.start,
            ctime: self.start,
            crtime: self.start,
            kind: FileType::Directory,
            perm: 0o555,
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn cfg_attr(&self, ino: u64, cfg: &Config) -> FileAttr {
        FileAttr {
            size: cfg.serialized_len(),
            kind: FileType::RegularFile,
            perm: 0o600,
            nlink: 1,
            ..self.dir_attr(ino)
        }
    }

    fn local_alias_attr(&self, ino: u64, local: &CallerStratum) -> FileAttr {
        FileAttr {
            size: (STRATA_ROOT.len() + local.name.len()) as u64,
            kind: FileType::Symlink,
            perm: 0o777,
            nlink: 1,
            ..self.dir_attr(ino)
        }
    }

    /// getattr for a backing-file classification, reshaped per filter.
    fn attr_back(
        &self,
        ino: u64,
        entry: &CfgEntry,
        ipath: &str,
        local: &CallerStratum,
    ) -> Result<FileAttr, Errno> {
        let st = entry.stat_first(&self.resolver, local, ipath)?;
        let mut attr = attr_from_stat(ino, &st);

        match entry.filter {
            Filter::Bin | Filter::BinRestrict => {
                if attr.kind != FileType::Directory {
                    // The bouncer must be able to read itself to find its
                    // redirect xattrs, even when the underlying binary is
                    // unreadable.  Only the bouncer's permissions change;
                    // it is world-readable at its canonical path anyway.
                    attr.size = self.bouncer_size;
                    attr.perm |= 0o444;
                }
            }
            Filter::Ini => {
                if attr.kind == FileType::RegularFile {
                    attr.size = self.ini_rewritten(entry, ipath, local)?.len() as u64;
                }
            }
            Filter::Service => {
                let (back, bpath) = entry.locate_first(&self.resolver, local, ipath)?;
                if bpath.contains("systemd") {
                    if attr.kind == FileType::RegularFile {
                        attr.size = self.ini_rewritten(entry, ipath, local)?.len() as u64;
                    }
                } else if bedrock_core::path::is_parent("/etc/sv", &bpath) {
                    let (stratum, _) = back.resolve(local);
                    let text = self.generated_unit(stratum, &bpath)?;
                    attr.kind = FileType::RegularFile;
                    attr.perm = 0o400;
                    attr.nlink = 1;
                    attr.size = text.len() as u64;
                }
            }
            Filter::Font => {
                if filter::is_font_merge_name(ipath) {
                    let inputs = entry.read_all(&self.resolver, local, ipath);
                    if inputs.is_empty() {
                        return Err(Errno::ENOENT);
                    }
                    let merged = filter::merge_font_kv(&inputs);
                    attr.size =
                        filter::render_font_merge(&merged, filter::font_wants_count(ipath)).len()
                            as u64;
                }
            }
            Filter::Pass => {}
        }

        // setuid/setgid would be an attack vector and gains nothing: the
        // underlying executable being redirected to retains its own bits.
        // Write bits are cleared because everything but the config
        // interface is read-only.
        attr.perm &= !0o7222;
        Ok(attr)
    }

    fn attr_for(
        &self,
        ino: u64,
        ipath: &str,
        local: &CallerStratum,
        cfg: &Config,
    ) -> Result<FileAttr, Errno> {
        match cfg.classify(ipath) {
            IpathClass::Back(entry) => self.attr_back(ino, entry, ipath, local),
            IpathClass::Vdir | IpathClass::Root => Ok(self.dir_attr(ino)),
            IpathClass::Cfg => Ok(self.cfg_attr(ino, cfg)),
            IpathClass::LocalAlias => Ok(self.local_alias_attr(ino, local)),
            IpathClass::Enoent => Err(Errno::ENOENT),
        }
    }

    fn ini_rewritten(
        &self,
        entry: &CfgEntry,
        ipath: &str,
        local: &CallerStratum,
    ) -> Result<Vec<u8>, Errno> {
        let (back, bpath) = entry.locate_first(&self.resolver, local, ipath)?;
        let (stratum, root) = back.resolve(local);
        let contents = self.resolver.read_to_vec(root, &bpath)?;
        Ok(filter::rewrite_ini(&contents, stratum))
    }

    /// Unit text for a runit-style service, translated to the init
    /// stratum's service manager and memoized by backing path.
    fn generated_unit(&self, stratum: &str, bpath: &str) -> Result<Vec<u8>, Errno> {
        let full_path = format!("{STRATA_ROOT}{stratum}{bpath}");
        let st = self.resolver.stat(self.init_root.as_fd(), &full_path)?;
        match self.service_type {
            ServiceType::Systemd => Ok(self.services.unit_for(&full_path, stratum, st.st_mtime)),
        }
    }

    fn read_back(
        &self,
        entry: &CfgEntry,
        ipath: &str,
        local: &CallerStratum,
        offset: i64,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        match entry.filter {
            Filter::Bin | Filter::BinRestrict => {
                let mut buf = vec![0u8; size as usize];
                let n = self
                    .bouncer
                    .read_at(&mut buf, offset as u64)
                    .map_err(|e| bedrock_core::io_errno(&e))?;
                buf.truncate(n);
                Ok(buf)
            }
            Filter::Ini => {
                let whole = self.ini_rewritten(entry, ipath, local)?;
                Ok(slice_at(&whole, offset, size))
            }
            Filter::Service => {
                let (back, bpath) = entry.locate_first(&self.resolver, local, ipath)?;
                if bpath.contains("systemd") {
                    let whole = self.ini_rewritten(entry, ipath, local)?;
                    Ok(slice_at(&whole, offset, size))
                } else if bedrock_core::path::is_parent("/etc/sv", &bpath) {
                    let (stratum, _) = back.resolve(local);
                    let whole = self.generated_unit(stratum, &bpath)?;
                    Ok(slice_at(&whole, offset, size))
                } else {
                    warn!(%bpath, "unknown service flavor");
                    Err(Errno::EBADF)
                }
            }
            Filter::Font => {
                if !filter::is_font_merge_name(ipath) {
                    return self.read_pass(entry, ipath, local, offset, size);
                }
                let inputs = entry.read_all(&self.resolver, local, ipath);
                if inputs.is_empty() {
                    return Err(Errno::ENOENT);
                }
                let merged = filter::merge_font_kv(&inputs);
                let whole = filter::render_font_merge(&merged, filter::font_wants_count(ipath));
                Ok(slice_at(&whole, offset, size))
            }
            Filter::Pass => self.read_pass(entry, ipath, local, offset, size),
        }
    }

    fn read_pass(
        &self,
        entry: &CfgEntry,
        ipath: &str,
        local: &CallerStratum,
        offset: i64,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        let fd = entry.open_first(&self.resolver, local, ipath, libc::O_RDONLY)?;
        let mut buf = vec![0u8; size as usize];
        let n = at::pread(fd.as_fd(), &mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Children of a virtual directory: the next path component of every
    /// deeper cpath.  Components with further depth are virtual
    /// directories; leaf components are listed only when some backing file
    /// exists.
    fn virt_entries(
        &self,
        cfg: &Config,
        local: &CallerStratum,
        prefix: &str,
        out: &mut BTreeMap<OsString, EntryKind>,
    ) {
        for entry in cfg.entries() {
            if !prefix.is_empty() && !bedrock_core::path::is_parent(prefix, &entry.cpath) {
                continue;
            }
            let rest = &entry.cpath[prefix.len() + 1..];
            if let Some(slash) = rest.find('/') {
                out.entry(OsString::from(&rest[..slash]))
                    .or_insert(EntryKind::Directory);
                continue;
            }
            for back in &entry.back {
                let (_, root) = back.resolve(local);
                if let Ok(st) = self.resolver.stat(root, &back.lpath) {
                    out.entry(OsString::from(rest))
                        .or_insert(EntryKind::from_mode(st.st_mode));
                    break;
                }
            }
        }
    }

    fn readdir_entries(
        &self,
        ipath: &str,
        local: &CallerStratum,
        cfg: &Config,
    ) -> Result<BTreeMap<OsString, EntryKind>, Errno> {
        let mut out = BTreeMap::new();
        match cfg.classify(ipath) {
            IpathClass::Back(entry) => {
                entry.filldir_all(&self.resolver, local, ipath, &mut out);
            }
            IpathClass::Root => {
                out.insert(OsString::from(CFG_NAME), EntryKind::Regular);
                out.insert(OsString::from(LOCAL_ALIAS_NAME), EntryKind::Symlink);
                self.virt_entries(cfg, local, "", &mut out);
            }
            IpathClass::Vdir => {
                self.virt_entries(cfg, local, ipath, &mut out);
            }
            IpathClass::Cfg | IpathClass::LocalAlias | IpathClass::Enoent => {
                return Err(Errno::ENOENT);
            }
        }
        Ok(out)
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
}

impl Filesystem for CrossFs {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let local = match self.setup(req) {
            Ok(l) => l,
            Err(e) => return reply.error(e as i32),
        };
        let ipath = match self.inodes.child_path(parent, name) {
            Some(p) => p,
            None => return reply.error(Errno::ENOENT as i32),
        };
        let ino = self.inodes.ino_for(&ipath);
        let cfg = self.config.read().unwrap();
        match self.attr_for(ino, &ipath, &local, &cfg) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(e as i32),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let local = match self.setup(req) {
            Ok(l) => l,
            Err(e) => return reply.error(e as i32),
        };
        let ipath = match self.inodes.path_of(ino) {
            Some(p) => p.to_string(),
            None => return reply.error(Errno::ENOENT as i32),
        };
        let cfg = self.config.read().unwrap();
        match self.attr_for(ino, &ipath, &local, &cfg) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e as i32),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let local = match self.setup(req) {
            Ok(l) => l,
            Err(e) => return reply.error(e as i32),
        };
        let ipath = match self.inodes.path_of(ino) {
            Some(p) => p.to_string(),
            None => return reply.error(Errno::ENOENT as i32),
        };
        let cfg = self.config.read().unwrap();
        match cfg.classify(&ipath) {
            IpathClass::LocalAlias => {
                let target = format!("{STRATA_ROOT}{}", local.name);
                reply.data(target.as_bytes());
            }
            IpathClass::Enoent => reply.error(Errno::ENOENT as i32),
            // Backing symlinks are flattened: getattr follows them, so
            // nothing this filesystem exports reads as a symlink except
            // the local alias.
            _ => reply.error(Errno::EINVAL as i32),
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
        let local = match self.setup(req) {
            Ok(l) => l,
            Err(e) => return reply.error(e as i32),
        };
        let ipath = match self.inodes.path_of(ino) {
            Some(p) => p.to_string(),
            None => return reply.error(Errno::ENOENT as i32),
        };
        let entries = {
            let cfg = self.config.read().unwrap();
            match self.readdir_entries(&ipath, &local, &cfg) {
                Ok(e) => e,
                Err(e) => return reply.error(e as i32),
            }
        };

        let parent_ino = match ipath.rfind('/') {
            Some(0) | None => ROOT_INO,
            Some(idx) => self.inodes.ino_for(&ipath[..idx]),
        };
        let mut listing: Vec<(u64, FileType, OsString)> = vec![
            (ino, FileType::Directory, OsString::from(".")),
            (parent_ino, FileType::Directory, OsString::from("..")),
        ];
        for (name, kind) in entries {
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

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let local = match self.setup(req) {
            Ok(l) => l,
            Err(e) => return reply.error(e as i32),
        };
        let ipath = match self.inodes.path_of(ino) {
            Some(p) => p.to_string(),
            None => return reply.error(Errno::ENOENT as i32),
        };
        let cfg = self.config.read().unwrap();
        let rv = match cfg.classify(&ipath) {
            IpathClass::Back(entry) => {
                let accmode = flags & libc::O_ACCMODE;
                match entry.open_first(&self.resolver, &local, &ipath, flags) {
                    Ok(_) if accmode != libc::O_RDONLY => Err(Errno::EROFS),
                    Ok(_) => Ok(()),
                    // The bouncer reads itself to find its redirect; serve
                    // it even when the underlying binary is unreadable.
                    Err(Errno::EACCES)
                        if matches!(entry.filter, Filter::Bin | Filter::BinRestrict)
                            && accmode == libc::O_RDONLY =>
                    {
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            IpathClass::Vdir | IpathClass::Root => Ok(()),
            IpathClass::Cfg => {
                if req.uid() == 0 {
                    Ok(())
                } else {
                    Err(Errno::EACCES)
                }
            }
            IpathClass::LocalAlias => Err(Errno::ELOOP),
            IpathClass::Enoent => Err(Errno::ENOENT),
        };
        match rv {
            Ok(()) => reply.opened(0, 0),
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
        let local = match self.setup(req) {
            Ok(l) => l,
            Err(e) => return reply.error(e as i32),
        };
        let ipath = match self.inodes.path_of(ino) {
            Some(p) => p.to_string(),
            None => return reply.error(Errno::ENOENT as i32),
        };
        let cfg = self.config.read().unwrap();
        let rv = match cfg.classify(&ipath) {
            IpathClass::Back(entry) => self.read_back(entry, &ipath, &local, offset, size),
            IpathClass::Cfg => {
                if req.uid() == 0 {
                    Ok(slice_at(cfg.serialize().as_bytes(), offset, size))
                } else {
                    Err(Errno::EACCES)
                }
            }
            IpathClass::Vdir | IpathClass::Root => Err(Errno::EISDIR),
            IpathClass::LocalAlias => Err(Errno::EBADF),
            IpathClass::Enoent => Err(Errno::ENOENT),
        };
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
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if let Err(e) = self.setup(req) {
            return reply.error(e as i32);
        }
        let ipath = match self.inodes.path_of(ino) {
            Some(p) => p.to_string(),
            None => return reply.error(Errno::ENOENT as i32),
        };
        if ipath != CFG_PATH {
            return reply.error(Errno::EROFS as i32);
        }
        if req.uid() != 0 {
            return reply.error(Errno::EACCES as i32);
        }
        let mut cfg = self.config.write().unwrap();
        match cfg.apply_command(data, &self.resolver, self.strata_root.as_fd()) {
            Ok(n) => {
                debug!(command = %String::from_utf8_lossy(data).trim_end(), "config updated");
                reply.written(n as u32)
            }
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
        let local = match self.setup(req) {
            Ok(l) => l,
            Err(e) => return reply.error(e as i32),
        };
        let ipath = match self.inodes.path_of(ino) {
            Some(p) => p.to_string(),
            None => return reply.error(Errno::ENOENT as i32),
        };
        let cfg = self.config.read().unwrap();

        // Consumers C-string these values; include the trailing NUL.
        let value: Result<Vec<u8>, Errno> = match cfg.classify(&ipath) {
            IpathClass::Back(entry) => {
                if name == STRATUM_XATTR {
                    entry
                        .locate_first(&self.resolver, &local, &ipath)
                        .map(|(back, _)| nul_terminated(back.resolve(&local).0))
                } else if name == LPATH_XATTR {
                    entry
                        .locate_first(&self.resolver, &local, &ipath)
                        .map(|(_, bpath)| nul_terminated(&bpath))
                } else if name == RESTRICT_XATTR && entry.filter == Filter::BinRestrict {
                    Ok(nul_terminated(RESTRICT_VALUE))
                } else {
                    Err(Errno::ENOTSUP)
                }
            }
            IpathClass::Vdir | IpathClass::Root | IpathClass::Cfg | IpathClass::LocalAlias => {
                if name == STRATUM_XATTR {
                    Ok(nul_terminated(VIRTUAL_STRATUM))
                } else if name == LPATH_XATTR {
                    Ok(nul_terminated(VIRTUAL_LPATH))
                } else {
                    Err(Errno::ENOTSUP)
                }
            }
            IpathClass::Enoent => Err(Errno::ENOENT),
        };

        match value {
            Ok(v) => Self::xattr_reply(reply, size, &v),
            Err(e) => reply.error(e as i32),
        }
    }

    fn destroy(&mut self) {
        // Profiling tools expect the process to end in the chroot it
        // started in.
        unsafe {
            libc::fchdir(std::os::fd::AsRawFd::as_raw_fd(&self.init_root));
            libc::chroot(c".".as_ptr());
        }
    }
}

fn nul_terminated(s: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(s.len() + 1);
    v.extend_from_slice(s.as_bytes());
    v.push(0);
    v
}

fn slice_at(data: &[u8], offset: i64, size: u32) -> Vec<u8> {
    if offset < 0 || offset as usize >= data.len() {
        return Vec::new();
    }
    let start = offset as usize;
    let end = (start + size as usize).min(data.len());
    data[start..end].to_vec()
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
    fn slice_at_handles_bounds() {
        let data = b"hello world";
        assert_eq!(slice_at(data, 0, 5), b"hello");
        assert_eq!(slice_at(data, 6, 100), b"world");
        assert_eq!(slice_at(data, 100, 5), b"");
        assert_eq!(slice_at(data, -1, 5), b"");
    }

    #[test]
    fn nul_termination_appends_exactly_one() {
        assert_eq!(nul_terminated("void"), b"void\0");
    }

    #[test]
    fn stat_conversion_maps_kind_and_perm() {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        st.st_mode = libc::S_IFREG | 0o4755;
        st.st_size = 42;
        let attr = attr_from_stat(7, &st);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o4755);
        assert_eq!(attr.size, 42);
    }
}
