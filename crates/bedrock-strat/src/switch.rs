//! Relocating the process into the target stratum's root.
//!
//! Two modes: plain chroot, or a mount-namespace pivot that rearranges the
//! namespace so the target stratum appears to have been the init stratum
//! all along.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use caps::{CapSet, Capability};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::stat::{lstat, stat};
use nix::unistd::{chdir, chroot, pivot_root};
use tracing::warn;

use bedrock_core::secure::{check_secure_path, SecureError};
use bedrock_core::stratum::{deref_alias, stratum_of, stratum_root};
use bedrock_core::{ENABLED_STRATA_DIR, LOCAL_ALIAS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootMode {
    Chroot,
    Namespace,
}

/// CAP_SYS_CHROOT must be permitted and effective, with inheritable
/// cleared.  A mismatch usually means ptrace across stratum boundaries.
fn check_capsyschroot() -> Result<()> {
    let permitted = caps::has_cap(None, CapSet::Permitted, Capability::CAP_SYS_CHROOT)?;
    let effective = caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_CHROOT)?;
    let inheritable = caps::has_cap(None, CapSet::Inheritable, Capability::CAP_SYS_CHROOT)?;
    if permitted && effective && !inheritable {
        Ok(())
    } else {
        bail!(
            "wrong cap_sys_chroot capability.\n\
             This may occur when using ptrace across stratum boundaries such as with\n\
             `strace` or `gdb`.  To remedy this install strace/gdb/etc from same stratum\n\
             as the traced program and use `strat` to specify appropriate strace/gdb/etc."
        );
    }
}

fn same_file(a: &libc::stat, b: &libc::stat) -> bool {
    a.st_dev == b.st_dev && a.st_ino == b.st_ino
}

/// Escape any chroot the process is currently inside.
///
/// After chrooting to a directory that does not contain the cwd, the cwd
/// can `chdir("..")` freely; the real root is reached when a directory and
/// its parent share device and inode numbers.
fn break_out_of_chroot(reference_dir: &str) -> Result<()> {
    let _ = chdir("/");
    chroot(reference_dir).context("chroot to reference directory")?;
    loop {
        chdir("..").context("walking out of chroot")?;
        let cwd = lstat(".").context("stat cwd")?;
        let parent = lstat("..").context("stat parent")?;
        if same_file(&cwd, &parent) {
            break;
        }
    }
    chroot(".").context("installing real root")?;
    Ok(())
}

fn chroot_to_stratum(stratum_path: &Path) -> Result<()> {
    // The init-providing stratum sits at the real root; chrooting there
    // again would be a needless nesting.
    if let (Ok(real_root), Ok(target)) = (stat("/"), stat(stratum_path)) {
        if same_file(&real_root, &target) {
            return Ok(());
        }
    }
    chdir(stratum_path).with_context(|| format!("chdir to {}", stratum_path.display()))?;
    chroot(".").context("chroot into stratum")?;
    Ok(())
}

/// Rearrange the mount namespace so the target stratum becomes the root
/// and the current one appears under /bedrock/strata/.
fn pivot_root_to_stratum(stratum_path: &Path, current_stratum: &str) -> Result<()> {
    unshare(CloneFlags::CLONE_NEWNS).context("unshare(CLONE_NEWNS)")?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .context("making / private")?;

    let put_old = stratum_path.join(format!("bedrock/strata/{current_stratum}"));
    pivot_root(stratum_path, &put_old).context("pivot_root")?;

    let moves = [
        (
            format!("/bedrock/strata/{current_stratum}/bedrock"),
            "/tmp".to_string(),
        ),
        (
            format!("/bedrock/strata/{current_stratum}"),
            format!("/tmp/strata/{current_stratum}"),
        ),
        (
            "/bedrock".to_string(),
            format!("/tmp/strata/{current_stratum}/bedrock"),
        ),
        ("/tmp".to_string(), "/bedrock".to_string()),
    ];
    for (src, dst) in &moves {
        mount(
            Some(src.as_str()),
            dst.as_str(),
            None::<&str>,
            MsFlags::MS_MOVE,
            None::<&str>,
        )
        .with_context(|| format!("move mount {src} -> {dst}"))?;
    }
    Ok(())
}

/// Relocate this process into the named stratum, preserving cwd when the
/// target has it.
pub fn switch_stratum(alias: &str, mode: RootMode) -> Result<()> {
    // local means the caller's own stratum; nothing to do.
    if alias == LOCAL_ALIAS {
        return Ok(());
    }

    let target =
        deref_alias(alias).map_err(|_| anyhow!("unable to find stratum \"{alias}\""))?;

    let current = stratum_of("/")
        .ok()
        .flatten()
        .ok_or_else(|| anyhow!("unable to determine current stratum"))?;
    if current == target {
        return Ok(());
    }

    // The early returns above keep ptrace-affected invocations of
    // same-stratum commands working; only an actual switch needs the
    // capability.
    check_capsyschroot()?;

    let cwd = std::env::current_dir().context("determining current working directory")?;

    let marker = format!("{ENABLED_STRATA_DIR}{target}");
    if let Err(err) = check_secure_path(Path::new(&marker)) {
        match err {
            SecureError::Insecure => bail!(
                "the state file for stratum\n    {target}\nat\n    {marker}\n\
                 is insecure, refusing to continue."
            ),
            SecureError::Symlink => bail!(
                "the path to the state file for stratum\n    {target}\nat\n    {marker}\n\
                 contains a symlink, refusing to continue."
            ),
            SecureError::Missing => bail!(
                "could not find state file for stratum\n    {target}\nat\n    {marker}\n\
                 Perhaps the stratum is disabled or typo'd?"
            ),
        }
    }

    break_out_of_chroot("/bedrock").context("unable to break out of chroot")?;

    let stratum_path = stratum_root(&target);
    match mode {
        RootMode::Chroot => chroot_to_stratum(&stratum_path)
            .with_context(|| format!("unable to chroot to {}", stratum_path.display()))?,
        RootMode::Namespace => pivot_root_to_stratum(&stratum_path, &current)
            .with_context(|| format!("unable to create namespace for stratum {target}"))?,
    }

    if let Err(err) = std::env::set_current_dir(&cwd) {
        warn!(
            cwd = %cwd.display(),
            stratum = %target,
            error = %err,
            "unable to restore working directory, falling back to /"
        );
        let _ = std::env::set_current_dir("/");
    }
    Ok(())
}
