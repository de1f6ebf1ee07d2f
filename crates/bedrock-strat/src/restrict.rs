//! Environment restriction: suppress cross-stratum hooks.

use std::path::Path;

use bedrock_core::secure::check_secure_path;
use bedrock_core::{CROSS_DIR, RESTRICTED_CMDS_DIR};

/// Drop colon-delimited entries that reach into the cross mount.
pub fn strip_cross_entries(value: &str) -> String {
    value
        .split(':')
        .filter(|entry| !entry.starts_with(CROSS_DIR))
        .collect::<Vec<_>>()
        .join(":")
}

/// Environment tweaks that keep a process within its own stratum: search
/// paths lose their cross-mount entries, SHELL is pinned to /bin/sh, and
/// BEDROCK_RESTRICT marks the session.
///
/// TERMINFO_DIRS arguably belongs here too, but restricting it confuses
/// users more often than it helps.
pub fn restrict_env() {
    for var in ["PATH", "MANPATH", "INFOPATH", "XDG_DATA_DIRS"] {
        if let Ok(value) = std::env::var(var) {
            std::env::set_var(var, strip_cross_entries(&value));
        }
    }
    std::env::set_var("SHELL", "/bin/sh");
    std::env::set_var("BEDROCK_RESTRICT", "1");
}

/// Whether a command is marked for restriction by default.  The marker
/// only counts if no lower-privileged user could have planted it.
pub fn cmd_is_restricted(command: Option<&str>) -> bool {
    let command = match command {
        Some(c) if !c.is_empty() => c,
        _ => return false,
    };
    let basename = command.rsplit('/').next().unwrap_or(command);
    if basename.is_empty() {
        return false;
    }
    let marker = format!("{RESTRICTED_CMDS_DIR}{basename}");
    check_secure_path(Path::new(&marker)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_entries_are_stripped() {
        assert_eq!(
            strip_cross_entries("/usr/bin:/bedrock/cross/bin:/bin"),
            "/usr/bin:/bin"
        );
        assert_eq!(
            strip_cross_entries("/bedrock/cross/bin:/usr/bin"),
            "/usr/bin"
        );
        assert_eq!(strip_cross_entries("/usr/bin:/bin"), "/usr/bin:/bin");
        assert_eq!(strip_cross_entries("/bedrock/cross"), "");
    }

    #[test]
    fn stripping_matches_by_prefix() {
        assert_eq!(
            strip_cross_entries("/bedrock/cross/share:/usr/share"),
            "/usr/share"
        );
    }

    #[test]
    fn empty_and_absent_commands_are_unrestricted() {
        assert!(!cmd_is_restricted(None));
        assert!(!cmd_is_restricted(Some("")));
    }

    #[test]
    fn unmarked_commands_are_unrestricted() {
        assert!(!cmd_is_restricted(Some("definitely-not-a-real-command")));
        assert!(!cmd_is_restricted(Some("/usr/bin/definitely-not-a-real-command")));
    }
}
