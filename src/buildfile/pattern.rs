//! Name Pattern Expansion
//!
//! The three pattern flavors a name can carry: path patterns (wildcards
//! expanded against the filesystem), regex patterns (`~/re/flags`), and
//! regex substitutions (`^/sub/flags`). Path patterns are expanded
//! against the pattern base directory honoring inclusion (`+{...}`) and
//! exclusion (`-{...}`) groups, `.buildignore` directory markers, and
//! dot-file visibility.

use std::path::{Path, PathBuf};

use crate::names::{Name, PatternKind};

/// A directory containing this marker file is excluded from pattern
/// expansion wholesale.
pub const BUILDIGNORE_FILE: &str = ".buildignore";

/// True if an unquoted word should be treated as a path pattern.
///
/// In curly-brace context a leading `+` also marks a pattern (inclusion
/// group member without wildcards).
pub fn is_path_pattern(value: &str, curly: bool) -> bool {
    if curly && value.starts_with('+') {
        return true;
    }
    value.contains(['*', '?']) || (value.contains('[') && value.contains(']'))
}

/// True for the regex pattern flavor (`~/re/flags`).
pub fn is_regex_pattern(value: &str) -> bool {
    value.starts_with("~/")
}

/// True for the regex substitution flavor (`^/sub/flags`).
pub fn is_regex_subst(value: &str) -> bool {
    value.starts_with("^/")
}

pub fn classify(value: &str, curly: bool) -> Option<PatternKind> {
    if is_regex_pattern(value) {
        Some(PatternKind::Regex)
    } else if is_regex_subst(value) {
        Some(PatternKind::RegexSubst)
    } else if is_path_pattern(value, curly) {
        Some(PatternKind::Path)
    } else {
        None
    }
}

/// An inclusion or exclusion group member attached to a pattern.
#[derive(Debug, Clone)]
pub struct PatternGroup {
    pub include: bool,
    pub patterns: Vec<String>,
}

/// Expand a path pattern against the base directory.
///
/// The primary pattern decides the candidate set; inclusion groups add,
/// exclusion groups remove (exclusions are applied last). An expansion
/// that matches nothing is not an error and yields no names. Dot files
/// are only matched by patterns whose leaf explicitly starts with a dot.
/// Directories containing `.buildignore` are skipped entirely.
pub fn expand_path_pattern(
    base: &Path,
    pattern: &str,
    groups: &[PatternGroup],
    ty: &str,
) -> Vec<Name> {
    let mut matches: Vec<PathBuf> = Vec::new();

    let mut add_matches = |pat: &str, into: &mut Vec<PathBuf>| {
        // A leading `+` in a group member is the inclusion marker, not
        // part of the pattern.
        let pat = pat.strip_prefix('+').unwrap_or(pat);
        let full = base.join(pat);
        let Some(full) = full.to_str().map(str::to_string) else {
            return;
        };
        if let Ok(paths) = glob::glob(&full) {
            for p in paths.flatten() {
                if visible(&p, pat) && !ignored(base, &p) {
                    into.push(p);
                }
            }
        }
    };

    add_matches(pattern, &mut matches);

    for g in groups.iter().filter(|g| g.include) {
        for p in &g.patterns {
            add_matches(p, &mut matches);
        }
    }

    matches.sort();
    matches.dedup();

    for g in groups.iter().filter(|g| !g.include) {
        for pat in &g.patterns {
            let compiled = glob::Pattern::new(pat).ok();
            matches.retain(|p| {
                let rel = p.strip_prefix(base).unwrap_or(p);
                let rel = rel.to_str().unwrap_or_default();
                let leaf = p.file_name().and_then(|s| s.to_str()).unwrap_or_default();
                match &compiled {
                    Some(c) => !c.matches(rel) && !c.matches(leaf),
                    None => rel != pat.as_str(),
                }
            });
        }
    }

    matches
        .into_iter()
        .map(|p| {
            let rel = p.strip_prefix(base).unwrap_or(&p);
            let mut n = Name::typed(ty, "");
            if let Some(d) = rel.parent() {
                if !d.as_os_str().is_empty() {
                    n.dir = d.to_path_buf();
                }
            }
            n.value = rel
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            n
        })
        .collect()
}

/// Dot-file visibility: a dotted leaf only matches a pattern whose own
/// leaf starts with a dot.
fn visible(path: &Path, pattern: &str) -> bool {
    let leaf = match path.file_name().and_then(|s| s.to_str()) {
        Some(l) => l,
        None => return false,
    };
    if !leaf.starts_with('.') {
        return true;
    }
    let pat_leaf = pattern.rsplit('/').next().unwrap_or(pattern);
    pat_leaf.starts_with('.')
}

/// True if any directory between base and path carries `.buildignore`.
fn ignored(base: &Path, path: &Path) -> bool {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d.join(BUILDIGNORE_FILE).exists() {
            return true;
        }
        if d == base {
            break;
        }
        dir = d.parent();
    }
    false
}

/// Parse `~/re/flags` into (expression, flags).
pub fn split_regex(value: &str) -> Option<(&str, &str)> {
    let body = value.get(2..)?;
    let end = body.rfind('/')?;
    Some((&body[..end], &body[end + 1..]))
}

/// Match a regex pattern name against a string.
pub fn regex_match(value: &str, target: &str) -> bool {
    let Some((re, flags)) = split_regex(value) else {
        return false;
    };
    let re = if flags.contains('i') {
        format!("(?i){}", re)
    } else {
        re.to_string()
    };
    match regex_lite::Regex::new(&format!("^(?:{})$", re)) {
        Ok(r) => r.is_match(target),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_classify() {
        assert_eq!(classify("*.cxx", false), Some(PatternKind::Path));
        assert_eq!(classify("foo.cxx", false), None);
        assert_eq!(classify("+foo", true), Some(PatternKind::Path));
        assert_eq!(classify("+foo", false), None);
        assert_eq!(classify("~/.*\\.hxx/", false), Some(PatternKind::Regex));
        assert_eq!(classify("^/\\1.o/", false), Some(PatternKind::RegexSubst));
    }

    #[test]
    fn test_expand_simple() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.cxx"), "").unwrap();
        fs::write(dir.path().join("b.cxx"), "").unwrap();
        fs::write(dir.path().join("c.hxx"), "").unwrap();

        let ns = expand_path_pattern(dir.path(), "*.cxx", &[], "cxx");
        let vs: Vec<_> = ns.iter().map(|n| n.value.as_str()).collect();
        assert_eq!(vs, ["a.cxx", "b.cxx"]);
        assert!(ns.iter().all(|n| n.ty == "cxx"));
    }

    #[test]
    fn test_expand_empty_is_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let ns = expand_path_pattern(dir.path(), "*.nothing", &[], "file");
        assert!(ns.is_empty());
    }

    #[test]
    fn test_inclusion_exclusion() {
        let dir = tempfile::tempdir().unwrap();
        for f in ["a.txt", "b.txt", "c.md"] {
            fs::write(dir.path().join(f), "").unwrap();
        }

        let groups = vec![
            PatternGroup {
                include: true,
                patterns: vec!["+c.md".into()],
            },
            PatternGroup {
                include: false,
                patterns: vec!["b.txt".into()],
            },
        ];
        let ns = expand_path_pattern(dir.path(), "*.txt", &groups, "file");
        let vs: Vec<_> = ns.iter().map(|n| n.value.as_str()).collect();
        assert_eq!(vs, ["a.txt", "c.md"]);
    }

    #[test]
    fn test_dot_files_hidden_by_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden.txt"), "").unwrap();
        fs::write(dir.path().join("seen.txt"), "").unwrap();

        let ns = expand_path_pattern(dir.path(), "*.txt", &[], "file");
        let vs: Vec<_> = ns.iter().map(|n| n.value.as_str()).collect();
        assert_eq!(vs, ["seen.txt"]);

        let ns = expand_path_pattern(dir.path(), ".*.txt", &[], "file");
        let vs: Vec<_> = ns.iter().map(|n| n.value.as_str()).collect();
        assert_eq!(vs, [".hidden.txt"]);
    }

    #[test]
    fn test_buildignore() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("skip");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join(BUILDIGNORE_FILE), "").unwrap();
        fs::write(sub.join("x.txt"), "").unwrap();
        fs::write(dir.path().join("y.txt"), "").unwrap();

        let ns = expand_path_pattern(dir.path(), "*/*.txt", &[], "file");
        assert!(ns.is_empty());
        let ns = expand_path_pattern(dir.path(), "*.txt", &[], "file");
        assert_eq!(ns.len(), 1);
    }

    #[test]
    fn test_subdir_match_keeps_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("src");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("m.cxx"), "").unwrap();

        let ns = expand_path_pattern(dir.path(), "src/*.cxx", &[], "cxx");
        assert_eq!(ns.len(), 1);
        assert_eq!(ns[0].dir, PathBuf::from("src"));
        assert_eq!(ns[0].value, "m.cxx");
    }

    #[test]
    fn test_regex_match() {
        assert!(regex_match("~/.*\\.cxx/", "foo.cxx"));
        assert!(!regex_match("~/.*\\.cxx/", "foo.hxx"));
        assert!(regex_match("~/FOO/i", "foo"));
    }
}
