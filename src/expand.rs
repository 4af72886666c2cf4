use std::env;
use std::fs;
use std::path::Path;

use crate::exec::sys;

/// Expands `~` or `~user` (plus an optional trailing path) into a home
/// directory. An explicit user that cannot be found in the user database
/// leaves the expression unchanged.
pub fn expand_tilde(expression: &str) -> String {
    let rest = expression.strip_prefix('~').unwrap_or(expression);
    let (login_name, tail) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, ""),
    };

    if login_name.is_empty() {
        let home = env::var("HOME")
            .ok()
            .or_else(|| sys::home_directory_for_uid(sys::current_uid()));
        return match home {
            Some(home) => format!("{home}{tail}"),
            None => expression.to_string(),
        };
    }

    match sys::home_directory_for_user(login_name) {
        Some(home) => format!("{home}{tail}"),
        None => expression.to_string(),
    }
}

pub fn is_glob(text: &str) -> bool {
    text.contains(['*', '?'])
}

fn split_path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

/// Matches `name` against a pattern where `*` is any run of characters and
/// `?` is exactly one. Matching is case-sensitive.
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    fn matches(pattern: &[u8], name: &[u8]) -> bool {
        match (pattern.first(), name.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&pattern[1..], name)
                    || (!name.is_empty() && matches(pattern, &name[1..]))
            }
            (Some(b'?'), Some(_)) => matches(&pattern[1..], &name[1..]),
            (Some(p), Some(c)) if p == c => matches(&pattern[1..], &name[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

/// Expands a glob pattern against a base directory, returning matches
/// lexicographically sorted. Relative patterns yield paths relative to the
/// base; absolute patterns yield absolute paths.
pub fn expand_globs(path: &str, base: &str) -> Vec<String> {
    let absolute = path.starts_with('/');
    let base = if absolute { "/" } else { base };

    let segments = split_path_segments(path);

    let Ok(metadata) = fs::symlink_metadata(base) else {
        return Vec::new();
    };
    let mut resolved_base = match fs::canonicalize(base) {
        Ok(resolved) => resolved.to_string_lossy().into_owned(),
        Err(_) => return Vec::new(),
    };
    if metadata.is_dir() && !resolved_base.ends_with('/') {
        resolved_base.push('/');
    }

    let mut results = expand_glob_segments(&segments, &resolved_base);

    for entry in &mut results {
        let mut relative = entry[resolved_base.len()..].to_string();
        if relative.is_empty() {
            relative = ".".to_string();
        }
        if absolute {
            relative.insert(0, '/');
        }
        *entry = relative;
    }

    results.sort();
    results
}

fn expand_glob_segments(segments: &[&str], base: &str) -> Vec<String> {
    let Some((first, rest)) = segments.split_first() else {
        // A terminal base that exists contributes one result.
        if Path::new(base).exists() {
            return vec![base.to_string()];
        }
        return Vec::new();
    };

    if is_glob(first) {
        let Ok(entries) = fs::read_dir(base) else {
            return Vec::new();
        };
        let mut results = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            // Dotfiles have to be explicitly requested.
            if name.starts_with('.') && !first.starts_with('.') {
                continue;
            }

            if glob_matches(first, name) {
                results.extend(expand_glob_segments(rest, &child_path(base, name)));
            }
        }
        results
    } else {
        expand_glob_segments(rest, &child_path(base, first))
    }
}

fn child_path(base: &str, name: &str) -> String {
    if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    }
}

const ESCAPED_CHARS: &[char] = &['\'', '"', '$', '|', '>', '<', '&', '\\', ' '];

/// Backslash-escapes the characters the parser treats specially.
pub fn escape_token(token: &str) -> String {
    let mut result = String::with_capacity(token.len());
    for c in token.chars() {
        if ESCAPED_CHARS.contains(&c) {
            result.push('\\');
        }
        result.push(c);
    }
    result
}

pub fn unescape_token(token: &str) -> String {
    let mut result = String::with_capacity(token.len());
    let mut escaped = false;
    for c in token.chars() {
        if escaped {
            result.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            result.push(c);
        }
    }
    // A trailing lone backslash survives untouched.
    if escaped {
        result.push('\\');
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;

    #[test]
    fn glob_matching_basics() {
        assert!(glob_matches("*", "anything"));
        assert!(glob_matches("*.txt", "notes.txt"));
        assert!(!glob_matches("*.txt", "notes.txt.bak"));
        assert!(glob_matches("a?c", "abc"));
        assert!(!glob_matches("a?c", "ac"));
        assert!(!glob_matches("ABC", "abc"));
        assert!(glob_matches("*", ""));
    }

    #[test]
    fn glob_results_are_sorted_and_relative() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.txt", "a.txt", "c.log"] {
            File::create(dir.path().join(name)).unwrap();
        }

        let base = dir.path().to_string_lossy().into_owned();
        let results = expand_globs("*.txt", &base);
        assert_eq!(results, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn dotfiles_need_an_explicit_leading_dot() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join(".hidden")).unwrap();
        File::create(dir.path().join("visible")).unwrap();

        let base = dir.path().to_string_lossy().into_owned();
        assert_eq!(expand_globs("*", &base), vec!["visible"]);
        assert_eq!(expand_globs(".*", &base), vec![".hidden"]);
    }

    #[test]
    fn literal_pattern_resolves_iff_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("real")).unwrap();

        let base = dir.path().to_string_lossy().into_owned();
        assert_eq!(expand_globs("real", &base), vec!["real"]);
        assert!(expand_globs("imaginary", &base).is_empty());
    }

    #[test]
    fn absolute_literal_stays_absolute() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("real")).unwrap();

        let pattern = dir.path().join("real").to_string_lossy().into_owned();
        let results = expand_globs(&pattern, "/irrelevant-base");
        assert_eq!(results.len(), 1);
        assert!(results[0].ends_with("/real"));
        assert!(results[0].starts_with('/'));
    }

    #[test]
    fn globbing_intermediate_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        File::create(dir.path().join("sub").join("inner.txt")).unwrap();

        let base = dir.path().to_string_lossy().into_owned();
        assert_eq!(expand_globs("s*/inner.txt", &base), vec!["sub/inner.txt"]);
    }

    #[test]
    fn escape_round_trip() {
        for token in ["plain", "with space", "a|b&c", "quote'this\"", "tail\\", ""] {
            assert_eq!(unescape_token(&escape_token(token)), token);
        }
    }

    #[test]
    fn tilde_expansion_uses_home() {
        let home = env::var("HOME").unwrap_or_else(|_| "/root".into());
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/sub/dir"), format!("{home}/sub/dir"));
    }

    #[test]
    fn tilde_with_unknown_user_is_left_alone() {
        assert_eq!(
            expand_tilde("~no-such-user-here/x"),
            "~no-such-user-here/x"
        );
    }
}
