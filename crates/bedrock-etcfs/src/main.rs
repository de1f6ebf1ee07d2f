//! # etcfs
//!
//! Filesystem mounted over a stratum's `/etc`.  Requests pass through to
//! either the global stratum's instance of a file or the calling process'
//! local instance, with configured content overrides enforced in between.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fuser::MountOption;
use tracing::info;

use bedrock_core::path::rel_path;
use bedrock_core::{logging, stratum, STRATUM_XATTR};
use bedrock_etcfs::fs::EtcFs;
use bedrock_root::at;

/// Root of the global stratum as seen from any mount namespace.
const GLOBAL_ROOT: &str = "/proc/1/root/bedrock/strata/bedrock";

/// Per-stratum /etc filesystem
#[derive(Parser)]
#[command(name = "etcfs", version, about)]
struct Cli {
    /// Stay in the foreground.  The server never daemonizes; this is
    /// accepted for mount-tool compatibility.
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Where to mount the filesystem (the stratum's /etc)
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,
}

fn main() -> Result<()> {
    logging::init_logging("info");
    let cli = Cli::parse();

    // Mimicking caller process permissions requires real root.
    if !nix::unistd::Uid::current().is_root() {
        bail!("etcfs: not running as root");
    }

    let mntpt = cli
        .mountpoint
        .to_str()
        .context("mount point is not valid UTF-8")?
        .to_string();

    // The local reference must be taken before the mount covers it.
    let local_ref: OwnedFd = std::fs::File::open(&cli.mountpoint)
        .with_context(|| format!("unable to open local mount point {mntpt}"))?
        .into();

    let global_root: OwnedFd = std::fs::File::open(GLOBAL_ROOT)
        .with_context(|| format!("unable to open global root {GLOBAL_ROOT}"))?
        .into();
    let global_ref = at::openat(
        std::os::fd::AsFd::as_fd(&global_root),
        rel_path(&mntpt),
        libc::O_NONBLOCK | libc::O_DIRECTORY,
        0,
    )
    .map_err(|e| anyhow::anyhow!("unable to open global mount point: {e}"))?;
    drop(global_root);

    let local_name = stratum::stratum_of("/")
        .context("reading stratum xattr from /")?
        .with_context(|| format!("no {STRATUM_XATTR} xattr on /"))?;
    info!(
        local_stratum = %local_name,
        global_root = GLOBAL_ROOT,
        "reference descriptors acquired"
    );

    // Created files must carry exactly the caller-requested modes.
    nix::sys::stat::umask(nix::sys::stat::Mode::empty());

    let fs = EtcFs::new(local_ref, global_ref, local_name, mntpt.clone());

    info!(
        mountpoint = %mntpt,
        foreground = cli.foreground,
        "mounting etcfs"
    );
    fuser::mount2(
        fs,
        &cli.mountpoint,
        &[
            MountOption::AllowOther,
            MountOption::FSName("etcfs".to_string()),
        ],
    )
    .context("mounting filesystem")?;
    Ok(())
}
