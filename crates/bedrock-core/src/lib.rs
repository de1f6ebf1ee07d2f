//! # bedrock-core
//!
//! Shared plumbing for the Bedrock strata filesystems and exec wrappers:
//! path classification helpers, stratum alias handling, secure-path checks,
//! config-command tokenizing, and caller-identity switching.
//!
//! Paths come in four flavors throughout the workspace:
//!
//! - "ipath": the path a process asked a mounted filesystem about.
//! - "cpath": a configured path the filesystem knows how to fulfill.
//! - "lpath": a stratum-local absolute path, interpreted relative to that
//!   stratum's root directory.
//! - "bpath": a concrete backing path derived from (cpath, lpath, ipath).

pub mod cmd;
pub mod identity;
pub mod inode;
pub mod logging;
pub mod path;
pub mod secure;
pub mod stratum;

use nix::errno::Errno;

/// Directory containing the roots of the various strata.
pub const STRATA_ROOT: &str = "/bedrock/strata/";

/// Executable which runs a command in a named stratum.
pub const STRAT_PATH: &str = "/bedrock/bin/strat";

/// Executable whose xattrs redirect execution through strat.
pub const BOUNCER_PATH: &str = "/bedrock/libexec/bouncer";

/// The cross-stratum union mount.  Restricted execution strips this from
/// search paths.
pub const CROSS_DIR: &str = "/bedrock/cross";

/// Per-stratum readiness markers.  Presence-and-secure is what matters;
/// content is ignored.
pub const ENABLED_STRATA_DIR: &str = "/bedrock/run/enabled_strata/";

/// Per-command restriction markers, keyed by command basename.
pub const RESTRICTED_CMDS_DIR: &str = "/bedrock/run/restricted_cmds/";

/// xattr carrying a file's origin stratum.
pub const STRATUM_XATTR: &str = "user.bedrock.stratum";

/// xattr carrying a file's stratum-local path.
pub const LPATH_XATTR: &str = "user.bedrock.localpath";

/// Presence-indicator xattr for binaries requiring restricted execution.
pub const RESTRICT_XATTR: &str = "user.bedrock.restrict";

/// Value stored under [`RESTRICT_XATTR`].
pub const RESTRICT_VALUE: &str = "restrict";

/// Name of the configuration pseudo-file both filesystems expose.
pub const CFG_NAME: &str = ".bedrock-config-filesystem";

/// Alias resolving, per request, to the calling process' own stratum.
pub const LOCAL_ALIAS: &str = "local";

/// Alias naming the stratum that provides PID 1.
pub const INIT_ALIAS: &str = "init";

/// Stratum owning everything that is not crossed from elsewhere, including
/// virtual directories synthesized by crossfs.
pub const VIRTUAL_STRATUM: &str = "bedrock";

/// Map an [`std::io::Error`] onto the errno the kernel should relay.
pub fn io_errno(err: &std::io::Error) -> Errno {
    match err.raw_os_error() {
        Some(raw) => Errno::from_raw(raw),
        None => Errno::EIO,
    }
}
