//! # bouncer
//!
//! Redirects to the specified executable in the specified stratum via
//! strat.  The target stratum and executable come from the
//! `user.bedrock.stratum` and `user.bedrock.localpath` xattrs on
//! /proc/self/exe, with `user.bedrock.restrict` marking restricted
//! commands.
//!
//! This is preferable to a script such as
//!
//!     #!/bin/sh
//!     exec strat <stratum> <local-path> "$@"
//!
//! as it can pass its own argv[0] on, where a hashbang loses it.

use std::ffi::CString;

use nix::errno::Errno;
use nix::unistd::execv;
use tracing::warn;

use bedrock_core::{logging, LPATH_XATTR, RESTRICT_XATTR, STRATUM_XATTR, STRAT_PATH};

const SELF_EXE: &str = "/proc/self/exe";

fn self_xattr(name: &str) -> Option<String> {
    let value = xattr::get(SELF_EXE, name).ok()??;
    // Values may arrive NUL-terminated; argv entries must not embed NULs.
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    Some(String::from_utf8_lossy(&value[..end]).into_owned())
}

/// argv handed to strat: `strat --arg0 <argv0> [--restrict] <stratum>
/// <localpath> <args...>`.
fn strat_argv(
    argv0: &str,
    stratum: &str,
    localpath: &str,
    restricted: bool,
    args: &[String],
) -> Vec<String> {
    let mut argv = vec![STRAT_PATH.to_string(), "--arg0".to_string(), argv0.to_string()];
    if restricted {
        argv.push("--restrict".to_string());
    }
    argv.push(stratum.to_string());
    argv.push(localpath.to_string());
    argv.extend(args.iter().cloned());
    argv
}

fn main() {
    logging::init_logging("warn");
    let args: Vec<String> = std::env::args().collect();
    let argv0 = args.first().map(String::as_str).unwrap_or(STRAT_PATH);

    let stratum = match self_xattr(STRATUM_XATTR) {
        Some(s) => s,
        None => {
            warn!(xattr = STRATUM_XATTR, "missing redirect xattr on own image");
            eprintln!("bouncer: unable to determine target stratum");
            std::process::exit(Errno::last() as i32);
        }
    };
    let localpath = match self_xattr(LPATH_XATTR) {
        Some(p) => p,
        None => {
            warn!(xattr = LPATH_XATTR, "missing redirect xattr on own image");
            eprintln!("bouncer: unable to determine target path");
            std::process::exit(Errno::last() as i32);
        }
    };
    let restricted = self_xattr(RESTRICT_XATTR).is_some();

    let argv = strat_argv(argv0, &stratum, &localpath, restricted, &args[1..]);
    let cargv: Vec<CString> = argv
        .into_iter()
        .map(|a| CString::new(a).unwrap_or_default())
        .collect();
    let strat = CString::new(STRAT_PATH).unwrap();
    let errno = match execv(&strat, &cargv) {
        Err(e) => e,
        Ok(_) => unreachable!("execv returned without error"),
    };

    warn!(strat = STRAT_PATH, error = %errno, "exec failed");
    eprintln!("bouncer: could not execute\n    {STRAT_PATH}");
    match errno {
        Errno::EACCES => eprintln!("due to: permission denied (EACCES)."),
        Errno::ENOENT => eprintln!("due to: unable to find file (ENOENT)."),
        e => eprintln!("due to: execv: {e}"),
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_shape_without_restrict() {
        let argv = strat_argv("/bin/vim", "void", "/usr/bin/vim", false, &[]);
        assert_eq!(
            argv,
            vec!["/bedrock/bin/strat", "--arg0", "/bin/vim", "void", "/usr/bin/vim"]
        );
    }

    #[test]
    fn argv_shape_with_restrict_and_args() {
        let argv = strat_argv(
            "makepkg",
            "arch",
            "/usr/bin/makepkg",
            true,
            &["-si".to_string()],
        );
        assert_eq!(
            argv,
            vec![
                "/bedrock/bin/strat",
                "--arg0",
                "makepkg",
                "--restrict",
                "arch",
                "/usr/bin/makepkg",
                "-si"
            ]
        );
    }
}
