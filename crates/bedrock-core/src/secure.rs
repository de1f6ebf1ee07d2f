//! Root-ownership checks for trust-carrying paths.
//!
//! Readiness markers and restriction markers only mean something if a
//! lower-privileged user cannot have planted them.  A root-owned file behind
//! a group-writable parent directory is still forgeable (`mv` a prepared
//! file over it), so every ancestor is checked, not just the file itself.

use std::path::Path;

use nix::errno::Errno;
use nix::sys::stat::{lstat, Mode};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SecureError {
    #[error("path does not exist")]
    Missing,
    #[error("path contains a symlink")]
    Symlink,
    #[error("path is not exclusively root-controlled")]
    Insecure,
}

impl SecureError {
    pub fn errno(&self) -> Errno {
        match self {
            SecureError::Missing => Errno::ENOENT,
            SecureError::Symlink => Errno::EMLINK,
            SecureError::Insecure => Errno::EACCES,
        }
    }
}

/// Check that `path` and every ancestor (excluding `/`) exists, is not a
/// symlink, is owned by root, and is writable by no one but root.
pub fn check_secure_path(path: &Path) -> Result<(), SecureError> {
    check_secure_below(path, Path::new("/"), 0)
}

/// As [`check_secure_path`], but stop the ancestor walk at `stop`
/// (exclusive) and trust `trusted_uid` instead of root.
fn check_secure_below(path: &Path, stop: &Path, trusted_uid: u32) -> Result<(), SecureError> {
    let loose = Mode::S_IWGRP.bits() | Mode::S_IWOTH.bits();
    for ancestor in path.ancestors() {
        if ancestor == stop || ancestor == Path::new("/") || ancestor.as_os_str().is_empty() {
            break;
        }
        let st = lstat(ancestor).map_err(|_| SecureError::Missing)?;
        // A symlink anywhere in the chain would mean checking its target's
        // chain too; disallowing them outright is the safe shortcut.
        if st.st_mode & libc::S_IFMT == libc::S_IFLNK {
            return Err(SecureError::Symlink);
        }
        if st.st_uid != trusted_uid {
            return Err(SecureError::Insecure);
        }
        if st.st_mode & loose != 0 {
            return Err(SecureError::Insecure);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, PermissionsExt};

    fn my_uid() -> u32 {
        nix::unistd::Uid::effective().as_raw()
    }

    #[test]
    fn missing_path_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("absent");
        assert_eq!(
            check_secure_below(&target, dir.path(), my_uid()),
            Err(SecureError::Missing)
        );
    }

    #[test]
    fn tight_permissions_pass() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("markers");
        std::fs::create_dir(&parent).unwrap();
        let target = parent.join("arch");
        std::fs::write(&target, "").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(check_secure_below(&target, dir.path(), my_uid()), Ok(()));
    }

    #[test]
    fn group_writable_file_is_insecure() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("marker");
        std::fs::write(&target, "").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o664)).unwrap();
        assert_eq!(
            check_secure_below(&target, dir.path(), my_uid()),
            Err(SecureError::Insecure)
        );
    }

    #[test]
    fn world_writable_parent_is_insecure() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("loose");
        std::fs::create_dir(&parent).unwrap();
        let target = parent.join("marker");
        std::fs::write(&target, "").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o600)).unwrap();
        std::fs::set_permissions(&parent, std::fs::Permissions::from_mode(0o777)).unwrap();
        assert_eq!(
            check_secure_below(&target, dir.path(), my_uid()),
            Err(SecureError::Insecure)
        );
    }

    #[test]
    fn symlink_component_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        std::fs::write(real.join("marker"), "").unwrap();
        symlink(&real, dir.path().join("link")).unwrap();
        assert_eq!(
            check_secure_below(&dir.path().join("link/marker"), dir.path(), my_uid()),
            Err(SecureError::Symlink)
        );
    }

    #[test]
    fn wrong_owner_is_insecure() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("marker");
        std::fs::write(&target, "").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert_eq!(
            check_secure_below(&target, dir.path(), my_uid().wrapping_add(1)),
            Err(SecureError::Insecure)
        );
    }
}
