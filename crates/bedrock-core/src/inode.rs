//! Inode-number bookkeeping for path-oriented FUSE servers.
//!
//! The kernel speaks inode numbers; the filesystems here think in absolute
//! in-mount paths.  This table hands out stable inode numbers per path,
//! assigned lazily at lookup/listing time.  Inode 1 is always the mount
//! root.

use std::collections::HashMap;
use std::ffi::OsStr;

pub const ROOT_INO: u64 = 1;

pub struct InodeTable {
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> InodeTable {
        let mut table = InodeTable {
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            next: ROOT_INO + 1,
        };
        table.by_ino.insert(ROOT_INO, "/".to_string());
        table.by_path.insert("/".to_string(), ROOT_INO);
        table
    }

    /// The path a previously handed-out inode refers to.
    pub fn path_of(&self, ino: u64) -> Option<&str> {
        self.by_ino.get(&ino).map(String::as_str)
    }

    /// The inode for a path, assigning a fresh one on first sight.
    pub fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_string());
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    /// Absolute path of a directory entry, or None for names no in-mount
    /// path can carry.
    pub fn child_path(&self, parent_ino: u64, name: &OsStr) -> Option<String> {
        let parent = self.path_of(parent_ino)?;
        let name = name.to_str()?;
        if name.contains('/') || name == "." || name == ".." {
            return None;
        }
        if parent == "/" {
            Some(format!("/{name}"))
        } else {
            Some(format!("{parent}/{name}"))
        }
    }

    /// Rewrite the mapping after a rename: the path itself and, for
    /// directories, everything beneath it.
    pub fn rename(&mut self, from: &str, to: &str) {
        let mut moved: Vec<(u64, String)> = Vec::new();
        for (ino, path) in &self.by_ino {
            if path == from {
                moved.push((*ino, to.to_string()));
            } else if crate::path::is_parent(from, path) {
                moved.push((*ino, format!("{to}{}", &path[from.len()..])));
            }
        }
        for (ino, new_path) in moved {
            if let Some(old_path) = self.by_ino.insert(ino, new_path.clone()) {
                self.by_path.remove(&old_path);
            }
            self.by_path.insert(new_path, ino);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    #[test]
    fn root_is_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO), Some("/"));
    }

    #[test]
    fn assignment_is_stable() {
        let mut table = InodeTable::new();
        let a = table.ino_for("/bin/vim");
        let b = table.ino_for("/bin/vim");
        assert_eq!(a, b);
        assert_eq!(table.path_of(a), Some("/bin/vim"));
    }

    #[test]
    fn child_paths_compose() {
        let mut table = InodeTable::new();
        assert_eq!(
            table.child_path(ROOT_INO, &OsString::from("bin")).unwrap(),
            "/bin"
        );
        let bin = table.ino_for("/bin");
        assert_eq!(
            table.child_path(bin, &OsString::from("vim")).unwrap(),
            "/bin/vim"
        );
        assert_eq!(table.child_path(bin, &OsString::from("..")), None);
    }

    #[test]
    fn rename_remaps_subtree() {
        let mut table = InodeTable::new();
        let dir = table.ino_for("/dir");
        let file = table.ino_for("/dir/file");
        table.rename("/dir", "/other");
        assert_eq!(table.path_of(dir), Some("/other"));
        assert_eq!(table.path_of(file), Some("/other/file"));
        assert_eq!(table.ino_for("/other/file"), file);
    }
}
