//! Tokenizing for the config pseudo-file command protocol.
//!
//! Both filesystems mutate their live configuration through single-write,
//! newline-terminated ASCII commands.  A command must arrive in one write of
//! at most [`MAX_CMD_LEN`] bytes, tokens are separated by exactly one space,
//! and path tokens must be absolute.

use nix::errno::Errno;

/// One command per write, sized so a well-behaved writer's write is atomic.
pub const MAX_CMD_LEN: usize = 4096;

/// Split a raw command write into tokens.
///
/// Enforces the line discipline shared by both filesystems: bounded size,
/// valid UTF-8, exactly one trailing newline, single-space separators, no
/// empty tokens.
pub fn tokenize(buf: &[u8]) -> Result<Vec<&str>, Errno> {
    if buf.len() > MAX_CMD_LEN {
        return Err(Errno::ENAMETOOLONG);
    }
    let text = std::str::from_utf8(buf).map_err(|_| Errno::EINVAL)?;
    let line = text.strip_suffix('\n').ok_or(Errno::EINVAL)?;
    if line.contains('\n') || line.is_empty() {
        return Err(Errno::EINVAL);
    }
    let tokens: Vec<&str> = line.split(' ').collect();
    if tokens.iter().any(|t| t.is_empty()) {
        return Err(Errno::EINVAL);
    }
    Ok(tokens)
}

/// Validate a token that must be an absolute path.
pub fn abs_path(token: &str) -> Result<&str, Errno> {
    if token.starts_with('/') {
        Ok(token)
    } else {
        Err(Errno::EINVAL)
    }
}

/// Validate a token that must be a stratum or alias name.
pub fn stratum_name(token: &str) -> Result<&str, Errno> {
    if token.is_empty() || token.contains('/') {
        Err(Errno::EINVAL)
    } else {
        Ok(token)
    }
}

/// Split a `stratum:lpath` token into its validated halves.
pub fn stratum_lpath(token: &str) -> Result<(&str, &str), Errno> {
    let (stratum, lpath) = token.split_once(':').ok_or(Errno::EINVAL)?;
    Ok((stratum_name(stratum)?, abs_path(lpath)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_well_formed_line() {
        let tokens = tokenize(b"add bin /bin void:/usr/bin\n").unwrap();
        assert_eq!(tokens, vec!["add", "bin", "/bin", "void:/usr/bin"]);
    }

    #[test]
    fn rejects_missing_newline() {
        assert_eq!(tokenize(b"add bin /bin void:/usr/bin"), Err(Errno::EINVAL));
    }

    #[test]
    fn rejects_double_space() {
        assert_eq!(tokenize(b"add  bin /bin x:/y\n"), Err(Errno::EINVAL));
    }

    #[test]
    fn rejects_embedded_newline() {
        assert_eq!(tokenize(b"add bin\n/bin x:/y\n"), Err(Errno::EINVAL));
    }

    #[test]
    fn rejects_oversized_command() {
        let mut line = vec![b'a'; MAX_CMD_LEN + 1];
        *line.last_mut().unwrap() = b'\n';
        assert_eq!(tokenize(&line), Err(Errno::ENAMETOOLONG));
    }

    #[test]
    fn validates_stratum_lpath_pairs() {
        assert_eq!(stratum_lpath("void:/usr/bin").unwrap(), ("void", "/usr/bin"));
        assert_eq!(stratum_lpath("void/usr/bin"), Err(Errno::EINVAL));
        assert_eq!(stratum_lpath("void:usr"), Err(Errno::EINVAL));
        assert_eq!(stratum_lpath(":/usr"), Err(Errno::EINVAL));
    }

    #[test]
    fn validates_path_tokens() {
        assert!(abs_path("/etc").is_ok());
        assert_eq!(abs_path("etc"), Err(Errno::EINVAL));
        assert_eq!(stratum_name("a/b"), Err(Errno::EINVAL));
    }
}
