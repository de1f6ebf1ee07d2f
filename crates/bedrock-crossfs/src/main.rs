//! # crossfs
//!
//! Filesystem providing cross-stratum file access.  Requests are fulfilled
//! by forwarding the appropriate stratum's copy of a file, possibly
//! modifying it in transit.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fuser::MountOption;
use tracing::{info, warn};

use bedrock_core::{logging, BOUNCER_PATH, STRATA_ROOT};

use bedrock_crossfs::fs::CrossFs;
use bedrock_crossfs::service::ServiceType;

/// Cross-stratum union filesystem
#[derive(Parser)]
#[command(name = "crossfs", version, about)]
struct Cli {
    /// Stay in the foreground.  The server never daemonizes; this is
    /// accepted for mount-tool compatibility.
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Where to mount the filesystem
    #[arg(value_name = "MOUNTPOINT")]
    mountpoint: PathBuf,
}

fn main() -> Result<()> {
    logging::init_logging("info");
    let cli = Cli::parse();

    // setfsuid() to arbitrary users and chroot() both need real root.
    if !nix::unistd::Uid::current().is_root() {
        bail!("crossfs: not running as root");
    }

    let init_root: OwnedFd = std::fs::File::open("/")
        .context("unable to open \"/\"")?
        .into();
    let strata_root: OwnedFd = std::fs::File::open(STRATA_ROOT)
        .with_context(|| format!("unable to open \"{STRATA_ROOT}\""))?
        .into();
    let procfs: OwnedFd = std::fs::File::open("/proc")
        .context("unable to open \"/proc\"")?
        .into();
    let bouncer = std::fs::File::open(BOUNCER_PATH)
        .with_context(|| format!("unable to open \"{BOUNCER_PATH}\""))?;
    info!(
        strata_root = STRATA_ROOT,
        bouncer = BOUNCER_PATH,
        "reference descriptors acquired"
    );

    // Services crossed from other strata are translated to the init
    // stratum's service manager.
    let service_type = if std::path::Path::new("/lib/systemd/systemd").exists() {
        ServiceType::Systemd
    } else {
        warn!("unable to determine the init system type, assuming systemd");
        ServiceType::Systemd
    };

    let fs = CrossFs::new(init_root, strata_root, procfs, bouncer, service_type)
        .map_err(|e| anyhow::anyhow!("initializing filesystem state: {e}"))?;

    info!(
        mountpoint = %cli.mountpoint.display(),
        foreground = cli.foreground,
        "mounting crossfs"
    );
    fuser::mount2(
        fs,
        &cli.mountpoint,
        &[
            MountOption::AllowOther,
            MountOption::FSName("crossfs".to_string()),
        ],
    )
    .context("mounting filesystem")?;
    Ok(())
}
