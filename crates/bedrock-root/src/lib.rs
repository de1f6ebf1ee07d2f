//! # bedrock-root
//!
//! Answers "what does path P mean inside stratum S" for request-handling
//! threads.  Global process state (the root directory and cwd) fights this:
//! `chroot` is process-wide, so naive per-request chrooting is a data race.
//!
//! Two substrates are provided and selected once at startup:
//!
//! - A locking substrate: one installed chroot at a time, guarded by a
//!   mutex.  Re-chroots only when the target root changes.  Works on any
//!   kernel.
//! - A non-locking substrate using `openat2(2)` with `RESOLVE_IN_ROOT`
//!   (Linux 5.6+), which offloads the chrooted path walk to the kernel.
//!
//! Directory enumeration always uses the locking substrate: filtering out
//! dangling symlinks costs one `stat` per entry there, versus an
//! `openat2`+`close` pair in the non-locking one, and the chroot cost is
//! amortized over the whole directory.

pub mod at;
mod resolver;

pub use resolver::RootResolver;

/// Directory-entry kind, reduced from `st_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    Regular,
    Symlink,
    Fifo,
    Socket,
    CharDevice,
    BlockDevice,
}

impl EntryKind {
    pub fn from_mode(mode: libc::mode_t) -> EntryKind {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => EntryKind::Directory,
            libc::S_IFLNK => EntryKind::Symlink,
            libc::S_IFIFO => EntryKind::Fifo,
            libc::S_IFSOCK => EntryKind::Socket,
            libc::S_IFCHR => EntryKind::CharDevice,
            libc::S_IFBLK => EntryKind::BlockDevice,
            _ => EntryKind::Regular,
        }
    }
}
