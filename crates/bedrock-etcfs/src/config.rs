//! Live configuration: global paths and content overrides.
//!
//! Globals route requests to the bedrock stratum's `/etc` instead of the
//! caller's.  Overrides pin content at a path: a symlink target, a
//! directory, or a byte sequence injected into a live file.  Inject bytes
//! are captured from the named source file at add time.

use std::os::fd::BorrowedFd;

use nix::errno::Errno;

use bedrock_core::cmd;
use bedrock_core::path::rel_path;

use crate::inject::uninject;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideType {
    Symlink,
    Directory,
    Inject,
}

impl OverrideType {
    pub fn parse(token: &str) -> Option<OverrideType> {
        match token {
            "symlink" => Some(OverrideType::Symlink),
            "directory" => Some(OverrideType::Directory),
            "inject" => Some(OverrideType::Inject),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideType::Symlink => "symlink",
            OverrideType::Directory => "directory",
            OverrideType::Inject => "inject",
        }
    }
}

pub struct Override {
    /// In-mount path the override enforces, with leading slash.
    pub path: String,
    pub otype: OverrideType,
    /// Symlink target, or (for inject) the source file the bytes were
    /// captured from.
    pub content: String,
    /// Captured bytes for inject overrides.
    pub inject: Vec<u8>,
    /// Unix seconds of the last enforcement, for debouncing.
    pub last_applied: i64,
}

#[derive(Default)]
pub struct EtcConfig {
    globals: Vec<String>,
    overrides: Vec<Override>,
    serialized_len: u64,
}

impl EtcConfig {
    pub fn new() -> EtcConfig {
        EtcConfig::default()
    }

    pub fn is_global(&self, path: &str) -> bool {
        self.globals.iter().any(|g| g == path)
    }

    pub fn globals(&self) -> &[String] {
        &self.globals
    }

    pub fn overrides(&self) -> &[Override] {
        &self.overrides
    }

    pub fn find_override_mut(&mut self, path: &str) -> Option<&mut Override> {
        self.overrides.iter_mut().find(|o| o.path == path)
    }

    pub fn serialized_len(&self) -> u64 {
        self.serialized_len
    }

    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.serialized_len as usize);
        for global in &self.globals {
            out.push_str("global ");
            out.push_str(global);
            out.push('\n');
        }
        for ov in &self.overrides {
            out.push_str("override ");
            out.push_str(ov.otype.as_str());
            out.push(' ');
            out.push_str(&ov.path);
            out.push(' ');
            out.push_str(&ov.content);
            out.push('\n');
        }
        out
    }

    /// Apply one newline-terminated command.  `local_ref` is needed
    /// because removing or replacing an inject override un-injects the old
    /// bytes from the live file.
    pub fn apply_command(&mut self, buf: &[u8], local_ref: BorrowedFd) -> Result<usize, Errno> {
        let tokens = cmd::tokenize(buf)?;
        match tokens.as_slice() {
            ["add_global", path] => {
                self.add_global(cmd::abs_path(path)?);
                Ok(buf.len())
            }
            ["rm_global", path] => {
                self.rm_global(cmd::abs_path(path)?);
                Ok(buf.len())
            }
            ["add_override", otype, path, content] => {
                let otype = OverrideType::parse(otype).ok_or(Errno::EINVAL)?;
                self.add_override(otype, cmd::abs_path(path)?, content, local_ref)?;
                Ok(buf.len())
            }
            ["rm_override", path] => {
                self.rm_override(cmd::abs_path(path)?, local_ref);
                Ok(buf.len())
            }
            _ => Err(Errno::EINVAL),
        }
    }

    fn add_global(&mut self, path: &str) {
        if self.is_global(path) {
            return;
        }
        self.serialized_len += ("global ".len() + path.len() + 1) as u64;
        self.globals.push(path.to_string());
    }

    fn rm_global(&mut self, path: &str) {
        if let Some(idx) = self.globals.iter().position(|g| g == path) {
            self.serialized_len -= ("global ".len() + path.len() + 1) as u64;
            self.globals.remove(idx);
        }
    }

    fn add_override(
        &mut self,
        otype: OverrideType,
        path: &str,
        content: &str,
        local_ref: BorrowedFd,
    ) -> Result<(), Errno> {
        let inject = if otype == OverrideType::Inject {
            // Capture the bytes now; the source file plays no further
            // role once the override exists.
            std::fs::read(content).map_err(|_| Errno::EINVAL)?
        } else {
            Vec::new()
        };

        if otype == OverrideType::Inject {
            if let Some(existing) = self
                .overrides
                .iter_mut()
                .find(|o| o.path == path && o.otype == OverrideType::Inject)
            {
                // Re-adding an inject replaces the captured bytes; the old
                // bytes are first removed from the live file.
                let _ = uninject(local_ref, rel_path(&existing.path), &existing.inject);
                self.serialized_len -= existing.content.len() as u64;
                self.serialized_len += content.len() as u64;
                existing.content = content.to_string();
                existing.inject = inject;
                return Ok(());
            }
        }

        if self.overrides.iter().any(|o| o.path == path) {
            return Ok(());
        }

        self.serialized_len += ("override ".len()
            + otype.as_str().len()
            + 1
            + path.len()
            + 1
            + content.len()
            + 1) as u64;
        self.overrides.push(Override {
            path: path.to_string(),
            otype,
            content: content.to_string(),
            inject,
            last_applied: 0,
        });
        Ok(())
    }

    fn rm_override(&mut self, path: &str, local_ref: BorrowedFd) {
        let idx = match self.overrides.iter().position(|o| o.path == path) {
            Some(idx) => idx,
            None => return,
        };
        let ov = &self.overrides[idx];
        if ov.otype == OverrideType::Inject {
            let _ = uninject(local_ref, rel_path(&ov.path), &ov.inject);
        }
        self.serialized_len -= ("override ".len()
            + ov.otype.as_str().len()
            + 1
            + ov.path.len()
            + 1
            + ov.content.len()
            + 1) as u64;
        self.overrides.remove(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    struct Fixture {
        dir: tempfile::TempDir,
        ref_file: std::fs::File,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ref_file = std::fs::File::open(dir.path()).unwrap();
        Fixture { dir, ref_file }
    }

    fn apply(cfg: &mut EtcConfig, fx: &Fixture, line: &str) -> Result<usize, Errno> {
        cfg.apply_command(line.as_bytes(), fx.ref_file.as_fd())
    }

    #[test]
    fn globals_round_trip() {
        let fx = fixture();
        let mut cfg = EtcConfig::new();
        apply(&mut cfg, &fx, "add_global /resolv.conf\n").unwrap();
        assert!(cfg.is_global("/resolv.conf"));
        assert_eq!(cfg.serialize(), "global /resolv.conf\n");
        assert_eq!(cfg.serialized_len(), cfg.serialize().len() as u64);

        apply(&mut cfg, &fx, "rm_global /resolv.conf\n").unwrap();
        assert!(!cfg.is_global("/resolv.conf"));
        assert_eq!(cfg.serialized_len(), 0);
    }

    #[test]
    fn double_add_global_is_idempotent() {
        let fx = fixture();
        let mut cfg = EtcConfig::new();
        apply(&mut cfg, &fx, "add_global /resolv.conf\n").unwrap();
        apply(&mut cfg, &fx, "add_global /resolv.conf\n").unwrap();
        assert_eq!(cfg.serialize(), "global /resolv.conf\n");
    }

    #[test]
    fn rm_of_absent_entries_is_silent() {
        let fx = fixture();
        let mut cfg = EtcConfig::new();
        apply(&mut cfg, &fx, "rm_global /resolv.conf\n").unwrap();
        apply(&mut cfg, &fx, "rm_override /login.conf\n").unwrap();
        assert_eq!(cfg.serialized_len(), 0);
    }

    #[test]
    fn symlink_override_round_trips() {
        let fx = fixture();
        let mut cfg = EtcConfig::new();
        apply(&mut cfg, &fx, "add_override symlink /localtime ../usr/share/zoneinfo/UTC\n")
            .unwrap();
        assert_eq!(
            cfg.serialize(),
            "override symlink /localtime ../usr/share/zoneinfo/UTC\n"
        );
        assert_eq!(cfg.serialized_len(), cfg.serialize().len() as u64);
    }

    #[test]
    fn inject_override_captures_source_bytes() {
        let fx = fixture();
        let source = fx.dir.path().join("payload");
        std::fs::write(&source, b"ZZZ").unwrap();

        let mut cfg = EtcConfig::new();
        apply(
            &mut cfg,
            &fx,
            &format!("add_override inject /login.conf {}\n", source.display()),
        )
        .unwrap();
        assert_eq!(cfg.overrides()[0].inject, b"ZZZ");
    }

    #[test]
    fn inject_re_add_replaces_bytes_and_uninjects_old() {
        let fx = fixture();
        std::fs::write(fx.dir.path().join("login.conf"), b"base\nOLD").unwrap();
        let source = fx.dir.path().join("payload");
        std::fs::write(&source, b"OLD").unwrap();

        let mut cfg = EtcConfig::new();
        let line = format!("add_override inject /login.conf {}\n", source.display());
        apply(&mut cfg, &fx, &line).unwrap();

        std::fs::write(&source, b"NEW").unwrap();
        apply(&mut cfg, &fx, &line).unwrap();

        assert_eq!(cfg.overrides().len(), 1);
        assert_eq!(cfg.overrides()[0].inject, b"NEW");
        assert_eq!(
            std::fs::read(fx.dir.path().join("login.conf")).unwrap(),
            b"base\n"
        );
    }

    #[test]
    fn rm_inject_override_uninjects_live_file() {
        let fx = fixture();
        std::fs::write(fx.dir.path().join("login.conf"), b"base\nZZZ").unwrap();
        let source = fx.dir.path().join("payload");
        std::fs::write(&source, b"ZZZ").unwrap();

        let mut cfg = EtcConfig::new();
        apply(
            &mut cfg,
            &fx,
            &format!("add_override inject /login.conf {}\n", source.display()),
        )
        .unwrap();
        apply(&mut cfg, &fx, "rm_override /login.conf\n").unwrap();

        assert!(cfg.overrides().is_empty());
        assert_eq!(
            std::fs::read(fx.dir.path().join("login.conf")).unwrap(),
            b"base\n"
        );
        assert_eq!(cfg.serialized_len(), 0);
    }

    #[test]
    fn unknown_override_type_is_einval() {
        let fx = fixture();
        let mut cfg = EtcConfig::new();
        assert_eq!(
            apply(&mut cfg, &fx, "add_override hardlink /a /b\n"),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn missing_inject_source_is_einval() {
        let fx = fixture();
        let mut cfg = EtcConfig::new();
        assert_eq!(
            apply(&mut cfg, &fx, "add_override inject /login.conf /nonexistent-source\n"),
            Err(Errno::EINVAL)
        );
        assert!(cfg.overrides().is_empty());
    }

    #[test]
    fn mixed_serialization_lists_globals_then_overrides() {
        let fx = fixture();
        let mut cfg = EtcConfig::new();
        apply(&mut cfg, &fx, "add_override directory /mnt/shared unused\n").unwrap();
        apply(&mut cfg, &fx, "add_global /resolv.conf\n").unwrap();
        assert_eq!(
            cfg.serialize(),
            "global /resolv.conf\noverride directory /mnt/shared unused\n"
        );
        assert_eq!(cfg.serialized_len(), cfg.serialize().len() as u64);
    }
}
