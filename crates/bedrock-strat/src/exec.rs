//! execvp-alike that skips chosen PATH entries.
//!
//! Resolving a command through the cross mount would bounce right back
//! into strat; candidate PATH entries under the skip prefix are never
//! tried.

use std::ffi::CString;

use nix::errno::Errno;
use nix::unistd::execv;

/// Candidate absolute paths for `file`, in PATH order, skipping entries
/// under `skip_prefix`.
pub fn search_candidates(path_var: &str, file: &str, skip_prefix: &str) -> Vec<String> {
    path_var
        .split(':')
        .filter(|entry| !entry.starts_with(skip_prefix))
        .map(|entry| format!("{entry}/{file}"))
        .collect()
}

fn cstring(s: &str) -> Result<CString, Errno> {
    CString::new(s).map_err(|_| Errno::EINVAL)
}

/// Attempt to exec `file` with `argv`.  Only returns on failure, with the
/// most recent exec errno.
pub fn execv_skip(file: &str, argv: &[String], skip_prefix: &str) -> Errno {
    if file.is_empty() {
        return Errno::ENOENT;
    }

    let cargv: Vec<CString> = match argv.iter().map(|a| cstring(a)).collect() {
        Ok(v) => v,
        Err(e) => return e,
    };

    // A slash means a concrete location; PATH is not searched.
    if file.contains('/') {
        let cfile = match cstring(file) {
            Ok(f) => f,
            Err(e) => return e,
        };
        return match execv(&cfile, &cargv) {
            Err(e) => e,
            Ok(_) => unreachable!("execv returned without error"),
        };
    }

    let path_var = std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string());
    let mut last = Errno::ENOENT;
    for candidate in search_candidates(&path_var, file, skip_prefix) {
        let cfile = match cstring(&candidate) {
            Ok(f) => f,
            Err(_) => continue,
        };
        // If this succeeds, execution hands off and this program ends.
        if let Err(e) = execv(&cfile, &cargv) {
            last = e;
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_follow_path_order() {
        assert_eq!(
            search_candidates("/usr/local/bin:/usr/bin:/bin", "ls", "/bedrock/cross"),
            vec!["/usr/local/bin/ls", "/usr/bin/ls", "/bin/ls"]
        );
    }

    #[test]
    fn cross_entries_are_never_tried() {
        assert_eq!(
            search_candidates("/bedrock/cross/bin:/bin", "ls", "/bedrock/cross"),
            vec!["/bin/ls"]
        );
    }

    #[test]
    fn exec_of_missing_absolute_path_reports_enoent() {
        assert_eq!(
            execv_skip("/definitely/not/a/real/file", &["x".to_string()], "/bedrock/cross"),
            Errno::ENOENT
        );
    }
}
