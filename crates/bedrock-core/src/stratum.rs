//! Stratum naming and alias dereferencing.
//!
//! Strata aliases are symlinks in the strata root which (eventually) resolve
//! to directories in the strata root.  Dereferencing an alias is effectively
//! `basename "$(realpath "/bedrock/strata/$alias")"`, with the constraint
//! that the resolution must never leave the strata root.

use std::path::{Path, PathBuf};

use crate::{STRATA_ROOT, STRATUM_XATTR};

#[derive(Debug, thiserror::Error)]
pub enum AliasError {
    #[error("unable to resolve alias: {0}")]
    Resolve(#[from] std::io::Error),
    #[error("alias resolves outside the strata root")]
    OutsideStrataRoot,
}

/// Dereference a stratum alias to its canonical stratum name.
pub fn deref_alias(alias: &str) -> Result<String, AliasError> {
    deref_alias_in(Path::new(STRATA_ROOT), alias)
}

fn deref_alias_in(strata_root: &Path, alias: &str) -> Result<String, AliasError> {
    let root = strata_root.canonicalize()?;
    let resolved = strata_root.join(alias).canonicalize()?;
    let name = match resolved.strip_prefix(&root) {
        Ok(rest) => rest,
        Err(_) => return Err(AliasError::OutsideStrataRoot),
    };
    // A nested path means the "alias" points inside a stratum, not at one.
    let mut components = name.components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(first)), None) => {
            Ok(first.to_string_lossy().into_owned())
        }
        _ => Err(AliasError::OutsideStrataRoot),
    }
}

/// Filesystem path of a stratum's root directory.
pub fn stratum_root(name: &str) -> PathBuf {
    Path::new(STRATA_ROOT).join(name)
}

/// Read the stratum name recorded on a root directory via xattr.
pub fn stratum_of(root: impl AsRef<Path>) -> std::io::Result<Option<String>> {
    let value = xattr::get(root, STRATUM_XATTR)?;
    Ok(value.map(|v| String::from_utf8_lossy(&v).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn plain_directory_resolves_to_itself() {
        let strata = tempfile::tempdir().unwrap();
        std::fs::create_dir(strata.path().join("arch")).unwrap();
        assert_eq!(deref_alias_in(strata.path(), "arch").unwrap(), "arch");
    }

    #[test]
    fn symlink_alias_resolves_to_target() {
        let strata = tempfile::tempdir().unwrap();
        std::fs::create_dir(strata.path().join("arch")).unwrap();
        symlink("arch", strata.path().join("default")).unwrap();
        assert_eq!(deref_alias_in(strata.path(), "default").unwrap(), "arch");
    }

    #[test]
    fn transitive_aliases_resolve() {
        let strata = tempfile::tempdir().unwrap();
        std::fs::create_dir(strata.path().join("void")).unwrap();
        symlink("void", strata.path().join("init")).unwrap();
        symlink("init", strata.path().join("default")).unwrap();
        assert_eq!(deref_alias_in(strata.path(), "default").unwrap(), "void");
    }

    #[test]
    fn escape_is_rejected() {
        let strata = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        symlink(outside.path(), strata.path().join("evil")).unwrap();
        assert!(matches!(
            deref_alias_in(strata.path(), "evil"),
            Err(AliasError::OutsideStrataRoot)
        ));
    }

    #[test]
    fn nested_target_is_rejected() {
        let strata = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(strata.path().join("arch/usr")).unwrap();
        symlink("arch/usr", strata.path().join("evil")).unwrap();
        assert!(matches!(
            deref_alias_in(strata.path(), "evil"),
            Err(AliasError::OutsideStrataRoot)
        ));
    }

    #[test]
    fn missing_alias_is_io_error() {
        let strata = tempfile::tempdir().unwrap();
        assert!(matches!(
            deref_alias_in(strata.path(), "nope"),
            Err(AliasError::Resolve(_))
        ));
    }
}
