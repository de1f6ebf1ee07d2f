//! Round-trip tests for the crossfs configuration protocol.

use std::os::fd::AsFd;

use bedrock_crossfs::config::Config;
use bedrock_root::RootResolver;

struct Strata {
    _dir: tempfile::TempDir,
    fd: std::fs::File,
    resolver: RootResolver,
}

fn strata(names: &[&str]) -> Strata {
    let dir = tempfile::tempdir().unwrap();
    for name in names {
        std::fs::create_dir_all(dir.path().join(name).join("usr/bin")).unwrap();
    }
    let fd = std::fs::File::open(dir.path()).unwrap();
    let resolver = RootResolver::probe(fd.as_fd());
    Strata {
        _dir: dir,
        fd,
        resolver,
    }
}

fn apply(cfg: &mut Config, strata: &Strata, line: &str) {
    cfg.apply_command(line.as_bytes(), &strata.resolver, strata.fd.as_fd())
        .unwrap_or_else(|e| panic!("command {line:?} failed: {e}"));
}

#[test]
fn serialization_parses_back_to_the_same_config() {
    let fx = strata(&["void", "solus"]);
    if !fx.resolver.openat2_available() {
        return;
    }
    let mut cfg = Config::new();
    apply(&mut cfg, &fx, "add bin /pin/bin/sv void:/usr/bin/sv\n");
    apply(&mut cfg, &fx, "add ini /applications solus:/usr/share/applications\n");
    apply(&mut cfg, &fx, "add bin /pin/bin/sv solus:/usr/bin/sv\n");

    let serialized = cfg.serialize();

    // Feed every serialized line back through `add` into a fresh config;
    // the result must serialize identically.
    let mut replay = Config::new();
    for line in serialized.lines() {
        apply(&mut replay, &fx, &format!("add {line}\n"));
    }
    assert_eq!(replay.serialize(), serialized);
    assert_eq!(replay.serialized_len(), serialized.len() as u64);
}

#[test]
fn reported_size_tracks_every_mutation() {
    let fx = strata(&["void", "solus"]);
    if !fx.resolver.openat2_available() {
        return;
    }
    let mut cfg = Config::new();
    let check = |cfg: &Config| {
        assert_eq!(cfg.serialized_len(), cfg.serialize().len() as u64);
    };
    check(&cfg);
    apply(&mut cfg, &fx, "add font /fonts void:/usr/share/fonts/X11\n");
    check(&cfg);
    apply(&mut cfg, &fx, "add font /fonts solus:/usr/share/fonts/X11\n");
    check(&cfg);
    apply(&mut cfg, &fx, "rm font /fonts void:/usr/share/fonts/X11\n");
    check(&cfg);
    apply(&mut cfg, &fx, "clear\n");
    check(&cfg);
    assert_eq!(cfg.serialized_len(), 0);
}

#[test]
fn rm_uses_cpath_and_backing_not_filter() {
    let fx = strata(&["void"]);
    if !fx.resolver.openat2_available() {
        return;
    }
    let mut cfg = Config::new();
    apply(&mut cfg, &fx, "add bin /bin void:/usr/bin\n");
    // The filter token on rm is grammatical only; a mismatched one still
    // removes the entry.
    apply(&mut cfg, &fx, "rm pass /bin void:/usr/bin\n");
    assert_eq!(cfg.serialize(), "");
}
