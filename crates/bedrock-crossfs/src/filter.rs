//! Content filters.
//!
//! A configured path carries one filter describing how backing content is
//! reshaped on the way out: executables become the bouncer, ini-style files
//! get strat injected into executable references, font indices are merged
//! across strata, service definitions are translated for the init stratum,
//! and everything else passes through untouched.

use std::collections::BTreeMap;

use bedrock_core::{STRATA_ROOT, STRAT_PATH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Executables.  Return the bouncer.
    Bin,
    /// Executables.  Return the bouncer with the restrict marker set.
    BinRestrict,
    /// ini-format files.  Inject strat calls and stratum-qualify paths.
    Ini,
    /// Combine fonts.dir and fonts.alias files across strata.
    Font,
    /// Init-system service definitions, translated to the init stratum's
    /// service manager.
    Service,
    /// Pass through unaltered.
    Pass,
}

impl Filter {
    pub fn parse(token: &str) -> Option<Filter> {
        match token {
            "bin" => Some(Filter::Bin),
            "bin-restrict" => Some(Filter::BinRestrict),
            "ini" => Some(Filter::Ini),
            "font" => Some(Filter::Font),
            "service" => Some(Filter::Service),
            "pass" => Some(Filter::Pass),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Filter::Bin => "bin",
            Filter::BinRestrict => "bin-restrict",
            Filter::Ini => "ini",
            Filter::Font => "font",
            Filter::Service => "service",
            Filter::Pass => "pass",
        }
    }
}

/// Keys whose values are commands to run.  `Exec=/usr/bin/vim` becomes
/// `Exec=/bedrock/bin/strat opensuse /usr/bin/vim`.
const INI_INJECT_STRAT: [&[u8]; 7] = [
    b"Exec=",
    b"ExecReload=",
    b"ExecStart=",
    b"ExecStartPost=",
    b"ExecStartPre=",
    b"ExecStop=",
    b"ExecStopPost=",
];

/// Keys whose absolute-path values refer to in-stratum files.
/// `TryExec=/usr/bin/vim` becomes
/// `TryExec=/bedrock/strata/opensuse/usr/bin/vim`.  Non-absolute values are
/// left alone.
const INI_EXPAND_PATH: [&[u8]; 3] = [b"Icon=", b"Path=", b"TryExec="];

/// Rewrite ini-style content so executable and path references re-enter
/// `stratum`.
pub fn rewrite_ini(content: &[u8], stratum: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + content.len() / 4);
    for line in content.split_inclusive(|&b| b == b'\n') {
        if let Some(prefix) = INI_INJECT_STRAT.iter().find(|p| line.starts_with(p)) {
            out.extend_from_slice(prefix);
            out.extend_from_slice(STRAT_PATH.as_bytes());
            out.push(b' ');
            out.extend_from_slice(stratum.as_bytes());
            out.push(b' ');
            out.extend_from_slice(&line[prefix.len()..]);
        } else if let Some(prefix) = INI_EXPAND_PATH
            .iter()
            .find(|p| line.starts_with(p) && line.get(p.len()) == Some(&b'/'))
        {
            out.extend_from_slice(prefix);
            out.extend_from_slice(STRATA_ROOT.as_bytes());
            out.extend_from_slice(stratum.as_bytes());
            out.extend_from_slice(&line[prefix.len()..]);
        } else {
            out.extend_from_slice(line);
        }
    }
    out
}

/// The two font-index files that need cross-strata merging.
pub fn is_font_merge_name(ipath: &str) -> bool {
    matches!(
        ipath.rsplit('/').next(),
        Some("fonts.dir") | Some("fonts.alias")
    )
}

/// Whether the merged output carries a leading entry-count line.
pub fn font_wants_count(ipath: &str) -> bool {
    ipath.rsplit('/').next() == Some("fonts.dir")
}

/// Merge key/value lines from each backing file.  Comment lines (leading
/// `!`) are dropped, the separator is a run of spaces and tabs, and on key
/// collisions the earliest backing file wins.
pub fn merge_font_kv(inputs: &[Vec<u8>]) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut kvs = BTreeMap::new();
    for input in inputs {
        for line in input.split_inclusive(|&b| b == b'\n') {
            if line.first() == Some(&b'!') {
                continue;
            }
            let sep = match line.iter().position(|&b| b == b' ' || b == b'\t') {
                Some(i) => i,
                None => continue,
            };
            let key = &line[..sep];
            let mut value_start = sep;
            while line.get(value_start) == Some(&b' ') || line.get(value_start) == Some(&b'\t') {
                value_start += 1;
            }
            kvs.entry(key.to_vec())
                .or_insert_with(|| line[value_start..].to_vec());
        }
    }
    kvs
}

/// Render a merged font map, sorted by key, tab-separated, optionally
/// preceded by the entry count expected at the top of `fonts.dir`.
pub fn render_font_merge(kvs: &BTreeMap<Vec<u8>, Vec<u8>>, with_count: bool) -> Vec<u8> {
    let mut out = Vec::new();
    if with_count {
        out.extend_from_slice(format!("{}\n", kvs.len()).as_bytes());
    }
    for (key, value) in kvs {
        out.extend_from_slice(key);
        out.push(b'\t');
        out.extend_from_slice(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_tokens_round_trip() {
        for token in ["bin", "bin-restrict", "ini", "font", "service", "pass"] {
            assert_eq!(Filter::parse(token).unwrap().as_str(), token);
        }
        assert_eq!(Filter::parse("frobnicate"), None);
    }

    #[test]
    fn ini_exec_gets_strat_injected() {
        let rewritten = rewrite_ini(b"Exec=/usr/bin/vim %F\n", "solus");
        assert_eq!(
            rewritten,
            b"Exec=/bedrock/bin/strat solus /usr/bin/vim %F\n"
        );
    }

    #[test]
    fn ini_absolute_paths_get_stratum_qualified() {
        let rewritten = rewrite_ini(b"TryExec=/usr/bin/vim\n", "solus");
        assert_eq!(rewritten, b"TryExec=/bedrock/strata/solus/usr/bin/vim\n");
    }

    #[test]
    fn ini_relative_icon_left_alone() {
        let rewritten = rewrite_ini(b"Icon=vim\n", "solus");
        assert_eq!(rewritten, b"Icon=vim\n");
    }

    #[test]
    fn ini_other_lines_copied() {
        let input: &[u8] = b"[Desktop Entry]\nName=Vim\nExec=/usr/bin/vim %F\nIcon=vim\n";
        let rewritten = rewrite_ini(input, "solus");
        assert_eq!(
            rewritten,
            b"[Desktop Entry]\nName=Vim\nExec=/bedrock/bin/strat solus /usr/bin/vim %F\nIcon=vim\n"
                .to_vec()
        );
    }

    #[test]
    fn ini_exec_reload_variant_matched() {
        let rewritten = rewrite_ini(b"ExecReload=/bin/kill -HUP $MAINPID\n", "void");
        assert_eq!(
            rewritten,
            b"ExecReload=/bedrock/bin/strat void /bin/kill -HUP $MAINPID\n"
        );
    }

    #[test]
    fn font_merge_first_wins_and_sorts() {
        let a = b"alias1 value1\n".to_vec();
        let b = b"alias2 value2\nalias1 WRONG\n".to_vec();
        let merged = merge_font_kv(&[a, b]);
        assert_eq!(
            render_font_merge(&merged, false),
            b"alias1\tvalue1\nalias2\tvalue2\n"
        );
    }

    #[test]
    fn font_merge_skips_comments_and_separator_runs() {
        let input = b"! comment\nkey \t  value here\n".to_vec();
        let merged = merge_font_kv(&[input]);
        assert_eq!(render_font_merge(&merged, false), b"key\tvalue here\n");
    }

    #[test]
    fn fonts_dir_gets_count_line() {
        let merged = merge_font_kv(&[b"a 1\nb 2\n".to_vec()]);
        assert_eq!(render_font_merge(&merged, true), b"2\na\t1\nb\t2\n");
    }

    #[test]
    fn merge_names_recognized() {
        assert!(is_font_merge_name("/fonts/misc/fonts.dir"));
        assert!(is_font_merge_name("/fonts/misc/fonts.alias"));
        assert!(!is_font_merge_name("/fonts/misc/helvetica.pcf"));
        assert!(font_wants_count("/fonts/fonts.dir"));
        assert!(!font_wants_count("/fonts/fonts.alias"));
    }
}
