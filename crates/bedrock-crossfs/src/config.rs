//! Live configuration: which user-facing paths exist and which strata back
//! them.
//!
//! The configuration is an ordered list of [`CfgEntry`], each owning an
//! ordered list of [`BackEntry`].  Entries are born on the first `add`
//! naming their cpath and die when their last backing entry is removed.
//! Stratum root descriptors are shared between backing entries through
//! `Arc`; the descriptor closes when the last entry referencing that
//! stratum goes away.  Local-alias entries hold no descriptor at all.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use nix::errno::Errno;

use bedrock_core::cmd;
use bedrock_core::path::{calc_bpath, is_equal_or_parent, is_parent};
use bedrock_core::LOCAL_ALIAS;
use bedrock_root::{EntryKind, RootResolver};

use crate::filter::Filter;

pub const CFG_PATH: &str = "/.bedrock-config-filesystem";
pub const LOCAL_ALIAS_NAME: &str = ".local-alias";
pub const LOCAL_ALIAS_PATH: &str = "/.local-alias";

/// A named stratum with an open root directory descriptor.
pub struct StratumHandle {
    name: String,
    root: OwnedFd,
}

impl StratumHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> BorrowedFd<'_> {
        self.root.as_fd()
    }
}

/// The calling process' stratum, resolved once per request.
pub struct CallerStratum {
    pub name: String,
    pub root: OwnedFd,
}

enum BackTarget {
    Stratum(Arc<StratumHandle>),
    Local,
}

/// One backing location which may fulfill requests on a configured path.
pub struct BackEntry {
    pub lpath: String,
    target: BackTarget,
}

impl BackEntry {
    /// The configured stratum/alias token, as written and as serialized.
    pub fn alias(&self) -> &str {
        match &self.target {
            BackTarget::Stratum(handle) => &handle.name,
            BackTarget::Local => LOCAL_ALIAS,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.target, BackTarget::Local)
    }

    /// Stratum name and root descriptor this entry resolves to for the
    /// current request.
    pub fn resolve<'a>(&'a self, local: &'a CallerStratum) -> (&'a str, BorrowedFd<'a>) {
        match &self.target {
            BackTarget::Stratum(handle) => (&handle.name, handle.root()),
            BackTarget::Local => (&local.name, local.root.as_fd()),
        }
    }
}

/// One user-facing file or directory family within the mount.
pub struct CfgEntry {
    pub filter: Filter,
    pub cpath: String,
    pub back: Vec<BackEntry>,
}

impl CfgEntry {
    /// stat() each backing path in order, accepting the first hit.  Errors
    /// other than ENOENT abort the search.
    pub fn stat_first(
        &self,
        resolver: &RootResolver,
        local: &CallerStratum,
        ipath: &str,
    ) -> Result<libc::stat, Errno> {
        let mut last = Errno::ENOENT;
        for back in &self.back {
            let bpath = match calc_bpath(&self.cpath, &back.lpath, ipath) {
                Some(p) => p,
                None => continue,
            };
            let (_, root) = back.resolve(local);
            match resolver.stat(root, &bpath) {
                Ok(st) => return Ok(st),
                Err(Errno::ENOENT) => last = Errno::ENOENT,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// open() each backing path in order, accepting the first hit.
    pub fn open_first(
        &self,
        resolver: &RootResolver,
        local: &CallerStratum,
        ipath: &str,
        flags: i32,
    ) -> Result<OwnedFd, Errno> {
        let mut last = Errno::ENOENT;
        for back in &self.back {
            let bpath = match calc_bpath(&self.cpath, &back.lpath, ipath) {
                Some(p) => p,
                None => continue,
            };
            let (_, root) = back.resolve(local);
            match resolver.open(root, &bpath, flags) {
                Ok(fd) => return Ok(fd),
                Err(Errno::ENOENT) => last = Errno::ENOENT,
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// The first backing entry whose path exists (dangling symlinks are not
    /// existence), along with the computed bpath.
    pub fn locate_first<'a>(
        &'a self,
        resolver: &RootResolver,
        local: &CallerStratum,
        ipath: &str,
    ) -> Result<(&'a BackEntry, String), Errno> {
        for back in &self.back {
            let bpath = match calc_bpath(&self.cpath, &back.lpath, ipath) {
                Some(p) => p,
                None => continue,
            };
            let (_, root) = back.resolve(local);
            if resolver.exists(root, &bpath) {
                return Ok((back, bpath));
            }
        }
        Err(Errno::ENOENT)
    }

    /// Contents of every backing file, in back order, for merge filters.
    pub fn read_all(
        &self,
        resolver: &RootResolver,
        local: &CallerStratum,
        ipath: &str,
    ) -> Vec<Vec<u8>> {
        let mut contents = Vec::new();
        for back in &self.back {
            let bpath = match calc_bpath(&self.cpath, &back.lpath, ipath) {
                Some(p) => p,
                None => continue,
            };
            let (_, root) = back.resolve(local);
            if let Ok(bytes) = resolver.read_to_vec(root, &bpath) {
                contents.push(bytes);
            }
        }
        contents
    }

    /// Merge every backing directory's entries into `out`.
    pub fn filldir_all(
        &self,
        resolver: &RootResolver,
        local: &CallerStratum,
        ipath: &str,
        out: &mut std::collections::BTreeMap<std::ffi::OsString, EntryKind>,
    ) {
        for back in &self.back {
            let bpath = match calc_bpath(&self.cpath, &back.lpath, ipath) {
                Some(p) => p,
                None => continue,
            };
            let (_, root) = back.resolve(local);
            let _ = resolver.dir_entries(root, &bpath, out);
        }
    }
}

/// Classification of an incoming path against the current configuration.
pub enum IpathClass<'a> {
    /// May be fulfilled by a backing file.
    Back(&'a CfgEntry),
    /// A virtual directory other than the root.
    Vdir,
    /// The mount root.
    Root,
    /// The configuration interface.
    Cfg,
    /// The symlink pointing at the calling process' stratum root.
    LocalAlias,
    /// No expected file path.
    Enoent,
}

#[derive(Default)]
pub struct Config {
    entries: Vec<CfgEntry>,
    serialized_len: u64,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn entries(&self) -> &[CfgEntry] {
        &self.entries
    }

    /// Total and disjoint: every ipath lands in exactly one class.  The
    /// backing-file case is the common one under load, so it is tried
    /// first.
    pub fn classify<'a>(&'a self, ipath: &str) -> IpathClass<'a> {
        for entry in &self.entries {
            if is_equal_or_parent(&entry.cpath, ipath) {
                return IpathClass::Back(entry);
            }
        }
        if self
            .entries
            .iter()
            .any(|entry| is_parent(ipath, &entry.cpath))
        {
            return IpathClass::Vdir;
        }
        if ipath == "/" {
            return IpathClass::Root;
        }
        if ipath == CFG_PATH {
            return IpathClass::Cfg;
        }
        if ipath == LOCAL_ALIAS_PATH {
            return IpathClass::LocalAlias;
        }
        IpathClass::Enoent
    }

    pub fn serialized_len(&self) -> u64 {
        self.serialized_len
    }

    /// Normal-form read-back: one line per backing entry, in declaration
    /// order.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.serialized_len as usize);
        for entry in &self.entries {
            for back in &entry.back {
                out.push_str(entry.filter.as_str());
                out.push(' ');
                out.push_str(&entry.cpath);
                out.push(' ');
                out.push_str(back.alias());
                out.push(':');
                out.push_str(&back.lpath);
                out.push('\n');
            }
        }
        out
    }

    /// Apply one newline-terminated command.  Returns the number of bytes
    /// consumed (the whole write) on success; partial application never
    /// happens.
    pub fn apply_command(
        &mut self,
        buf: &[u8],
        resolver: &RootResolver,
        strata_root: BorrowedFd,
    ) -> Result<usize, Errno> {
        let tokens = cmd::tokenize(buf)?;
        match tokens.as_slice() {
            ["clear"] => {
                self.clear();
                Ok(buf.len())
            }
            ["add", filter, cpath, pair] => {
                let filter = Filter::parse(filter).ok_or(Errno::EINVAL)?;
                let cpath = cmd::abs_path(cpath)?;
                let (stratum, lpath) = cmd::stratum_lpath(pair)?;
                self.add(filter, cpath, stratum, lpath, resolver, strata_root)?;
                Ok(buf.len())
            }
            ["rm", _filter, cpath, pair] => {
                let cpath = cmd::abs_path(cpath)?;
                let (stratum, lpath) = cmd::stratum_lpath(pair)?;
                self.rm(cpath, stratum, lpath)?;
                Ok(buf.len())
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.serialized_len = 0;
    }

    fn add(
        &mut self,
        filter: Filter,
        cpath: &str,
        stratum: &str,
        lpath: &str,
        resolver: &RootResolver,
        strata_root: BorrowedFd,
    ) -> Result<(), Errno> {
        let existing = self.entries.iter().position(|e| e.cpath == cpath);
        if let Some(idx) = existing {
            if self.entries[idx]
                .back
                .iter()
                .any(|b| b.alias() == stratum && b.lpath == lpath)
            {
                return Ok(());
            }
        }

        // Resolve the backing root before touching any state so a failed
        // add leaves the configuration untouched.
        let target = if stratum == LOCAL_ALIAS {
            BackTarget::Local
        } else {
            BackTarget::Stratum(self.stratum_handle(stratum, resolver, strata_root)?)
        };

        let entry_idx = match existing {
            Some(idx) => idx,
            None => {
                // The filter is fixed by the first add for a cpath and
                // ignored on subsequent adds.
                self.entries.push(CfgEntry {
                    filter,
                    cpath: cpath.to_string(),
                    back: Vec::new(),
                });
                self.entries.len() - 1
            }
        };

        let line_len = self.line_len(entry_idx, stratum, lpath);
        self.entries[entry_idx].back.push(BackEntry {
            lpath: lpath.to_string(),
            target,
        });
        self.serialized_len += line_len;
        Ok(())
    }

    fn rm(&mut self, cpath: &str, stratum: &str, lpath: &str) -> Result<(), Errno> {
        let entry_idx = self
            .entries
            .iter()
            .position(|e| e.cpath == cpath)
            .ok_or(Errno::EINVAL)?;
        let back_idx = self.entries[entry_idx]
            .back
            .iter()
            .position(|b| b.alias() == stratum && b.lpath == lpath)
            .ok_or(Errno::EINVAL)?;

        let line_len = self.line_len(entry_idx, stratum, lpath);
        self.entries[entry_idx].back.remove(back_idx);
        self.serialized_len -= line_len;

        if self.entries[entry_idx].back.is_empty() {
            self.entries.remove(entry_idx);
        }
        Ok(())
    }

    /// Reuse the already-open root descriptor for a stratum when any
    /// backing entry references it; open a fresh one otherwise.
    fn stratum_handle(
        &self,
        stratum: &str,
        resolver: &RootResolver,
        strata_root: BorrowedFd,
    ) -> Result<Arc<StratumHandle>, Errno> {
        for entry in &self.entries {
            for back in &entry.back {
                if let BackTarget::Stratum(handle) = &back.target {
                    if handle.name == stratum {
                        return Ok(Arc::clone(handle));
                    }
                }
            }
        }
        let root = resolver.open(strata_root, stratum, libc::O_DIRECTORY)?;
        Ok(Arc::new(StratumHandle {
            name: stratum.to_string(),
            root,
        }))
    }

    fn line_len(&self, entry_idx: usize, stratum: &str, lpath: &str) -> u64 {
        let entry = &self.entries[entry_idx];
        (entry.filter.as_str().len() + 1 + entry.cpath.len() + 1 + stratum.len() + 1 + lpath.len()
            + 1) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    struct Fixture {
        _strata: tempfile::TempDir,
        strata_fd: std::fs::File,
        resolver: RootResolver,
    }

    fn fixture() -> Fixture {
        let strata = tempfile::tempdir().unwrap();
        for name in ["void", "arch", "bedrock"] {
            std::fs::create_dir_all(strata.path().join(name).join("usr/bin")).unwrap();
        }
        let strata_fd = std::fs::File::open(strata.path()).unwrap();
        let resolver = RootResolver::probe(strata_fd.as_fd());
        Fixture {
            _strata: strata,
            strata_fd,
            resolver,
        }
    }

    fn apply(cfg: &mut Config, fx: &Fixture, line: &str) -> Result<usize, Errno> {
        cfg.apply_command(line.as_bytes(), &fx.resolver, fx.strata_fd.as_fd())
    }

    #[test]
    fn add_then_read_back_round_trips() {
        let fx = fixture();
        if !fx.resolver.openat2_available() {
            return;
        }
        let mut cfg = Config::new();
        apply(&mut cfg, &fx, "add bin /bin void:/usr/bin\n").unwrap();
        assert_eq!(cfg.serialize(), "bin /bin void:/usr/bin\n");
        assert_eq!(cfg.serialized_len(), cfg.serialize().len() as u64);
    }

    #[test]
    fn double_add_is_idempotent() {
        let fx = fixture();
        if !fx.resolver.openat2_available() {
            return;
        }
        let mut cfg = Config::new();
        apply(&mut cfg, &fx, "add bin /bin void:/usr/bin\n").unwrap();
        apply(&mut cfg, &fx, "add bin /bin void:/usr/bin\n").unwrap();
        assert_eq!(cfg.serialize(), "bin /bin void:/usr/bin\n");
    }

    #[test]
    fn filter_fixed_by_first_add() {
        let fx = fixture();
        if !fx.resolver.openat2_available() {
            return;
        }
        let mut cfg = Config::new();
        apply(&mut cfg, &fx, "add bin /bin void:/usr/bin\n").unwrap();
        apply(&mut cfg, &fx, "add pass /bin arch:/usr/bin\n").unwrap();
        assert_eq!(
            cfg.serialize(),
            "bin /bin void:/usr/bin\nbin /bin arch:/usr/bin\n"
        );
    }

    #[test]
    fn add_rm_restores_prior_state() {
        let fx = fixture();
        if !fx.resolver.openat2_available() {
            return;
        }
        let mut cfg = Config::new();
        apply(&mut cfg, &fx, "add bin /bin void:/usr/bin\n").unwrap();
        let before = cfg.serialize();
        apply(&mut cfg, &fx, "add bin /bin arch:/usr/bin\n").unwrap();
        apply(&mut cfg, &fx, "rm bin /bin arch:/usr/bin\n").unwrap();
        assert_eq!(cfg.serialize(), before);
        assert_eq!(cfg.serialized_len(), before.len() as u64);
    }

    #[test]
    fn rm_of_last_back_drops_entry() {
        let fx = fixture();
        if !fx.resolver.openat2_available() {
            return;
        }
        let mut cfg = Config::new();
        apply(&mut cfg, &fx, "add bin /bin void:/usr/bin\n").unwrap();
        apply(&mut cfg, &fx, "rm bin /bin void:/usr/bin\n").unwrap();
        assert!(cfg.entries().is_empty());
        assert_eq!(cfg.serialized_len(), 0);
        assert!(matches!(cfg.classify("/bin"), IpathClass::Enoent));
    }

    #[test]
    fn rm_of_unknown_entry_is_einval() {
        let fx = fixture();
        if !fx.resolver.openat2_available() {
            return;
        }
        let mut cfg = Config::new();
        assert_eq!(
            apply(&mut cfg, &fx, "rm bin /bin void:/usr/bin\n"),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn clear_empties_everything() {
        let fx = fixture();
        if !fx.resolver.openat2_available() {
            return;
        }
        let mut cfg = Config::new();
        apply(&mut cfg, &fx, "add bin /bin void:/usr/bin\n").unwrap();
        apply(&mut cfg, &fx, "add font /fonts arch:/usr/share/fonts\n").unwrap();
        apply(&mut cfg, &fx, "clear\n").unwrap();
        assert_eq!(cfg.serialize(), "");
        assert_eq!(cfg.serialized_len(), 0);
    }

    #[test]
    fn unknown_stratum_fails_add() {
        let fx = fixture();
        if !fx.resolver.openat2_available() {
            return;
        }
        let mut cfg = Config::new();
        assert!(apply(&mut cfg, &fx, "add bin /bin nope:/usr/bin\n").is_err());
        assert!(cfg.entries().is_empty());
    }

    #[test]
    fn malformed_commands_are_einval() {
        let fx = fixture();
        if !fx.resolver.openat2_available() {
            return;
        }
        let mut cfg = Config::new();
        for line in [
            "add bin /bin void/usr/bin\n",
            "add bogus /bin void:/usr/bin\n",
            "add bin bin void:/usr/bin\n",
            "frobnicate\n",
            "add bin /bin void:/usr/bin",
        ] {
            assert_eq!(apply(&mut cfg, &fx, line), Err(Errno::EINVAL), "{line:?}");
        }
    }

    #[test]
    fn classification_is_total_and_ordered() {
        let fx = fixture();
        if !fx.resolver.openat2_available() {
            return;
        }
        let mut cfg = Config::new();
        apply(&mut cfg, &fx, "add bin /pin/bin/sv void:/usr/bin/sv\n").unwrap();
        assert!(matches!(cfg.classify("/pin/bin/sv"), IpathClass::Back(_)));
        assert!(matches!(
            cfg.classify("/pin/bin/sv/deeper"),
            IpathClass::Back(_)
        ));
        assert!(matches!(cfg.classify("/pin"), IpathClass::Vdir));
        assert!(matches!(cfg.classify("/pin/bin"), IpathClass::Vdir));
        assert!(matches!(cfg.classify("/"), IpathClass::Root));
        assert!(matches!(
            cfg.classify("/.bedrock-config-filesystem"),
            IpathClass::Cfg
        ));
        assert!(matches!(cfg.classify("/.local-alias"), IpathClass::LocalAlias));
        assert!(matches!(cfg.classify("/nope"), IpathClass::Enoent));
    }

    #[test]
    fn local_alias_entries_hold_no_descriptor() {
        let fx = fixture();
        if !fx.resolver.openat2_available() {
            return;
        }
        let mut cfg = Config::new();
        apply(&mut cfg, &fx, "add bin /bin local:/usr/bin\n").unwrap();
        assert!(cfg.entries()[0].back[0].is_local());
        assert_eq!(cfg.serialize(), "bin /bin local:/usr/bin\n");
    }

    #[test]
    fn stat_first_prefers_earlier_backing() {
        let fx = fixture();
        if !fx.resolver.openat2_available() {
            return;
        }
        std::fs::write(
            fx._strata.path().join("void/usr/bin/sv"),
            b"void-sv",
        )
        .unwrap();
        std::fs::write(
            fx._strata.path().join("arch/usr/bin/sv"),
            b"arch-sv-longer",
        )
        .unwrap();

        let mut cfg = Config::new();
        apply(&mut cfg, &fx, "add pass /bin void:/usr/bin\n").unwrap();
        apply(&mut cfg, &fx, "add pass /bin arch:/usr/bin\n").unwrap();

        let local = CallerStratum {
            name: "bedrock".to_string(),
            root: bedrock_root::at::openat(
                fx.strata_fd.as_fd(),
                "bedrock",
                libc::O_DIRECTORY,
                0,
            )
            .unwrap(),
        };
        let entry = match cfg.classify("/bin/sv") {
            IpathClass::Back(e) => e,
            _ => panic!("expected backing classification"),
        };
        let st = entry.stat_first(&fx.resolver, &local, "/bin/sv").unwrap();
        assert_eq!(st.st_size, 7);

        let (back, bpath) = entry
            .locate_first(&fx.resolver, &local, "/bin/sv")
            .unwrap();
        assert_eq!(back.alias(), "void");
        assert_eq!(bpath, "/usr/bin/sv");
    }
}
