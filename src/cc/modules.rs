//! Module Resolution
//!
//! Pairing the imports of a translation unit with BMI prerequisites by
//! fuzzy filename matching, re-export flattening, and the resolved-set
//! fingerprint.
//!
//! The match scoring packs primary and sub-scores in a decimal
//! representation, PPPPABBBB, where PPPP is the number of module-name
//! characters matched from the right, A the strength of separation
//! between the matched and unmatched part of the filename, and BBBB the
//! shortness of the unmatched prefix. Decimal instead of binary packing
//! keeps the fields legible in trace output.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::cc::types::{sha256_hex, ImportKind, ModuleImport};
use crate::target::Target;

/// Maximum score a resolution to the exact module name can have.
pub fn match_max(module: &str) -> u64 {
    module.chars().count() as u64 * 100_000 + 99_999
}

fn char_sep(c: char) -> Option<char> {
    match c {
        '_' | '-' | '.' => Some(c),
        '/' | '\\' => Some('/'),
        _ => None,
    }
}

fn case_sep(c1: char, c2: char) -> bool {
    c1.is_ascii_alphabetic()
        && c2.is_ascii_alphabetic()
        && (c1.is_ascii_uppercase() != c2.is_ascii_uppercase())
}

fn mod_sep(c: char) -> bool {
    c == '.' || c == ':'
}

/// Score a filename against a module name.
///
/// Scans backwards while the two match, treating all separators as
/// equal and a character case change as an imaginary separator. The
/// last module (or partition) component must be fully consumed for the
/// match to count. Returns 0 for no match.
pub fn match_score(file: &str, module: &str) -> u64 {
    let f: Vec<char> = file.chars().collect();
    let m: Vec<char> = module.chars().collect();

    let fn_ = f.len();
    let mn = m.len();
    let mut fi = fn_;
    let mut mi = mn;

    // Whether the previous character was counted as a real (that is,
    // non-case-change) separator.
    let mut fsep = false;
    let mut msep = false;

    // Complete match of at least the last module component.
    let mut matched = false;

    let mut fp = '\0';
    let mut mp = '\0';

    while fi != 0 && mi != 0 {
        let fc = f[fi - 1];
        let mc = m[mi - 1];

        if fc.to_ascii_lowercase() == mc.to_ascii_lowercase() {
            fsep = false;
            msep = false;
            fp = fc;
            mp = mc;
            fi -= 1;
            mi -= 1;
            continue;
        }

        let fs = char_sep(fc).is_some();
        let ms = mod_sep(mc) || mc == '_';

        if fs && ms {
            fsep = true;
            msep = true;
            matched = matched || mod_sep(mc);
            fp = fc;
            mp = mc;
            fi -= 1;
            mi -= 1;
            continue;
        }

        // Only if one side has a real separator do we consider a case
        // change on the other.
        if fs || ms {
            let fa = !fs && case_sep(fp, fc);
            let ma = !ms && case_sep(mp, mc);
            if (fs || fa) && (ms || ma) {
                // Stay on this character for the imaginary separator
                // side (cannot be both).
                if fa {
                    fi += 1;
                    msep = true;
                }
                if ma {
                    mi += 1;
                    fsep = true;
                }
                matched = matched || mod_sep(mc);
                fp = fc;
                mp = mc;
                fi -= 1;
                mi -= 1;
                continue;
            }
        }

        break; // No match.
    }

    // Complete module match or complete file match against a component
    // boundary.
    matched = matched || mi == 0 || (fi == 0 && mod_sep(m[mi - 1]));

    if !matched {
        return 0;
    }

    // "Uncount" real separators.
    if fsep {
        fi += 1;
    }
    if msep {
        mi += 1;
    }

    // Characters matched in the module name (may differ from the file
    // side because of imaginary separators).
    let ps = (mn - mi) as u64;

    // Separation strength.
    let as_ = if fi == 0 {
        9
    } else if let Some(c) = char_sep(f[fi - 1]) {
        if c == '/' {
            8
        } else {
            7
        }
    } else if fi != fn_ && case_sep(f[fi], f[fi - 1]) {
        7
    } else {
        0
    };

    // Shortness of the unmatched prefix.
    let bs = 9_999u64.saturating_sub(fi as u64);

    ps * 100_000 + as_ * 10_000 + bs
}

/// Module information recorded for a resolved BMI target.
#[derive(Debug, Clone, Default)]
pub struct BmiInfo {
    pub name: String,
    /// BMIs this module re-exports (`export import`).
    pub reexports: Vec<Arc<Target>>,
}

/// Per-rule registry of what module each BMI target provides.
#[derive(Debug, Default)]
pub struct ModuleMap {
    map: RwLock<HashMap<usize, BmiInfo>>,
}

impl ModuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(t: &Arc<Target>) -> usize {
        Arc::as_ptr(t) as usize
    }

    pub fn record(&self, t: &Arc<Target>, info: BmiInfo) {
        self.map.write().unwrap().insert(Self::key(t), info);
    }

    pub fn get(&self, t: &Arc<Target>) -> Option<BmiInfo> {
        self.map.read().unwrap().get(&Self::key(t)).cloned()
    }
}

/// A BMI candidate for import resolution.
#[derive(Debug, Clone)]
pub struct ModuleCandidate {
    /// File stem the BMI is built from (`foo-core` for foo-core.mxx).
    pub file_stem: String,
    /// Module name when known up front (installed-library metadata).
    pub known_name: Option<String>,
    pub bmi: Arc<Target>,
}

/// Offsets into the prerequisite-target vector after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOffsets {
    /// First module entry.
    pub start: usize,
    /// First re-export-only entry.
    pub exported: usize,
    /// First indirect (copied) entry.
    pub copied: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unable to resolve module {0}")]
    Unresolved(String),

    #[error("failed to guess module {guess} (actual module name is {actual})")]
    WrongGuess { guess: String, actual: String },
}

/// Resolve the (non-header) imports of a translation unit against the
/// candidate set, appending the chosen BMI targets as a contiguous tail
/// of `pts` and flattening re-exports.
///
/// `std.*` imports never fuzzy-match; an unresolved `std.*` import is
/// left for the compiler's own search (its entry stays None).
pub fn resolve_modules(
    imports: &mut Vec<ModuleImport>,
    candidates: &[ModuleCandidate],
    module_map: &ModuleMap,
    pts: &mut Vec<Option<Arc<Target>>>,
) -> Result<(ResolvedOffsets, String), ResolveError> {
    // Re-exported imports go to the back so that [start, exported) are
    // plain imports and [exported, copied) re-exports.
    imports.sort_by_key(|i| i.exported);

    let start = pts.len();
    let exported = start
        + imports
            .iter()
            .filter(|i| !i.exported && i.kind != ImportKind::ModuleHeader)
            .count();

    for i in imports.iter_mut() {
        if i.kind == ImportKind::ModuleHeader {
            continue; // The mapper owns header units.
        }

        let std = i.name == "std" || i.name.starts_with("std.");
        let max = match_max(&i.name);
        let mut best: Option<(&ModuleCandidate, u64)> = None;

        for c in candidates {
            let score = match &c.known_name {
                Some(n) if *n == i.name => max + 1,
                Some(_) => 0,
                None if std => 0, // std.* never fuzzy-matches.
                None => match_score(&c.file_stem, &i.name),
            };
            if score != 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((c, score));
            }
        }

        match best {
            Some((c, score)) => {
                // A resolution through the module map must name the
                // right module; a fuzzy guess is verified by the caller
                // once the BMI's unit has been scanned.
                if let Some(info) = module_map.get(&c.bmi) {
                    if !info.name.is_empty() && info.name != i.name {
                        return Err(ResolveError::WrongGuess {
                            guess: i.name.clone(),
                            actual: info.name,
                        });
                    }
                }
                i.score = score;
                tracing::debug!(import = %i.name, file = %c.file_stem, score, "resolved module");
                pts.push(Some(c.bmi.clone()));
            }
            None if std => {
                // Pre-built; found by the compiler's own means.
                pts.push(None);
            }
            None => return Err(ResolveError::Unresolved(i.name.clone())),
        }
    }

    let copied = pts.len();

    // Flatten re-exports of everything we import, recursively. The
    // copies land in a contiguous tail with stable indices.
    let mut queue: Vec<Arc<Target>> = pts[start..copied]
        .iter()
        .flatten()
        .cloned()
        .collect();
    let mut seen: Vec<usize> = queue.iter().map(|t| Arc::as_ptr(t) as usize).collect();

    while let Some(t) = queue.pop() {
        if let Some(info) = module_map.get(&t) {
            for re in info.reexports {
                let k = Arc::as_ptr(&re) as usize;
                if !seen.contains(&k) {
                    seen.push(k);
                    pts.push(Some(re.clone()));
                    queue.push(re);
                }
            }
        }
    }

    // Fingerprint over all resolved BMI paths; a change here forces a
    // rebuild even if no direct prerequisite changed.
    let mut data = String::new();
    for t in pts[start..].iter().flatten() {
        if let Some(p) = t.path() {
            data.push_str(&p.display().to_string());
            data.push('\0');
        }
    }
    let fingerprint = sha256_hex(data.as_bytes());

    Ok((
        ResolvedOffsets {
            start,
            exported,
            copied,
        },
        fingerprint,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{DeclKind, TargetSet, BMI};

    #[test]
    fn test_exact_match_is_max() {
        assert_eq!(match_score("foo", "foo"), match_max("foo"));
        assert_eq!(match_score("hello-core", "hello.core"), match_max("hello.core"));
        assert_eq!(match_score("hello_core", "hello.core"), match_max("hello.core"));
    }

    #[test]
    fn test_partial_match_scores() {
        // Last component matched; prefix unmatched but separated.
        let s = match_score("foo-bar", "bar");
        assert_eq!(s, 3 * 100_000 + 7 * 10_000 + (9_999 - 4));

        // Directory separator scores higher than punctuation.
        let s_dir = match_score("foo/bar", "bar");
        assert_eq!(s_dir, 3 * 100_000 + 8 * 10_000 + (9_999 - 4));
        assert!(s_dir > s);

        // Matching more components beats a shorter match.
        assert!(match_score("hello-core", "hello.core") > match_score("core", "hello.core"));
    }

    #[test]
    fn test_last_component_must_be_consumed() {
        // "ore" does not fully consume "core".
        assert_eq!(match_score("ore", "hello.core"), 0);
        // Unrelated names do not match.
        assert_eq!(match_score("printer", "hello.core"), 0);
    }

    #[test]
    fn test_case_change_separator() {
        let s = match_score("helloCore", "hello.core");
        assert!(s > 0);
        assert_eq!(s, match_max("hello.core"));
    }

    #[test]
    fn test_partition_components() {
        // ':' and '.' are treated the same for matching.
        assert_eq!(
            match_score("foo-intf", "foo:intf"),
            match_max("foo:intf")
        );
    }

    fn bmi(ts: &TargetSet, name: &str) -> Arc<Target> {
        let (t, _) = ts.insert(&BMI, "/out", "", name, Some("gcm".into()), DeclKind::Real);
        t.derive_path(None);
        t
    }

    #[test]
    fn test_resolve_simple() {
        let ts = TargetSet::new();
        let map = ModuleMap::new();
        let core = bmi(&ts, "hello-core");

        let mut imports = vec![ModuleImport::new(ImportKind::ModuleIntf, "hello.core", false)];
        let cands = vec![ModuleCandidate {
            file_stem: "hello-core".into(),
            known_name: None,
            bmi: core.clone(),
        }];

        let mut pts = Vec::new();
        let (off, fp) = resolve_modules(&mut imports, &cands, &map, &mut pts).unwrap();
        assert_eq!(off.start, 0);
        assert_eq!(off.exported, 1);
        assert_eq!(off.copied, 1);
        assert_eq!(pts.len(), 1);
        assert!(Arc::ptr_eq(pts[0].as_ref().unwrap(), &core));
        assert_eq!(fp.len(), 64);
    }

    #[test]
    fn test_resolve_prefers_better_score() {
        let ts = TargetSet::new();
        let map = ModuleMap::new();
        let a = bmi(&ts, "core");
        let b = bmi(&ts, "hello-core");

        let mut imports = vec![ModuleImport::new(ImportKind::ModuleIntf, "hello.core", false)];
        let cands = vec![
            ModuleCandidate {
                file_stem: "core".into(),
                known_name: None,
                bmi: a,
            },
            ModuleCandidate {
                file_stem: "hello-core".into(),
                known_name: None,
                bmi: b.clone(),
            },
        ];

        let mut pts = Vec::new();
        resolve_modules(&mut imports, &cands, &map, &mut pts).unwrap();
        assert!(Arc::ptr_eq(pts[0].as_ref().unwrap(), &b));
    }

    #[test]
    fn test_std_unresolved_is_left_to_compiler() {
        let ts = TargetSet::new();
        let map = ModuleMap::new();
        let c = bmi(&ts, "core");

        let mut imports = vec![ModuleImport::new(ImportKind::ModuleIntf, "std.core", false)];
        let cands = vec![ModuleCandidate {
            // A fuzzy match that must NOT be taken for std.*.
            file_stem: "core".into(),
            known_name: None,
            bmi: c,
        }];

        let mut pts = Vec::new();
        let (off, _) = resolve_modules(&mut imports, &cands, &map, &mut pts).unwrap();
        assert_eq!(pts.len(), 1);
        assert!(pts[off.start].is_none());
    }

    #[test]
    fn test_unresolved_module_fails() {
        let map = ModuleMap::new();
        let mut imports = vec![ModuleImport::new(ImportKind::ModuleIntf, "nowhere", false)];
        let mut pts = Vec::new();
        let e = resolve_modules(&mut imports, &[], &map, &mut pts).unwrap_err();
        assert_eq!(e, ResolveError::Unresolved("nowhere".into()));
    }

    #[test]
    fn test_wrong_guess_diagnosed() {
        let ts = TargetSet::new();
        let map = ModuleMap::new();
        let b = bmi(&ts, "core");
        map.record(
            &b,
            BmiInfo {
                name: "other.core".into(),
                reexports: vec![],
            },
        );

        let mut imports = vec![ModuleImport::new(ImportKind::ModuleIntf, "core", false)];
        let cands = vec![ModuleCandidate {
            file_stem: "core".into(),
            known_name: None,
            bmi: b,
        }];

        let mut pts = Vec::new();
        let e = resolve_modules(&mut imports, &cands, &map, &mut pts).unwrap_err();
        match e {
            ResolveError::WrongGuess { actual, .. } => assert_eq!(actual, "other.core"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reexport_flattening() {
        let ts = TargetSet::new();
        let map = ModuleMap::new();
        let base = bmi(&ts, "base");
        let mid = bmi(&ts, "mid");
        map.record(
            &mid,
            BmiInfo {
                name: "mid".into(),
                reexports: vec![base.clone()],
            },
        );

        let mut imports = vec![ModuleImport::new(ImportKind::ModuleIntf, "mid", false)];
        let cands = vec![ModuleCandidate {
            file_stem: "mid".into(),
            known_name: Some("mid".into()),
            bmi: mid.clone(),
        }];

        let mut pts = Vec::new();
        let (off, _) = resolve_modules(&mut imports, &cands, &map, &mut pts).unwrap();
        assert_eq!(off.copied, 1);
        assert_eq!(pts.len(), 2);
        assert!(Arc::ptr_eq(pts[1].as_ref().unwrap(), &base));
    }

    #[test]
    fn test_exported_imports_ordered_last() {
        let ts = TargetSet::new();
        let map = ModuleMap::new();
        let a = bmi(&ts, "a");
        let b = bmi(&ts, "b");

        let mut imports = vec![
            ModuleImport::new(ImportKind::ModuleIntf, "a", true),
            ModuleImport::new(ImportKind::ModuleIntf, "b", false),
        ];
        let cands = vec![
            ModuleCandidate {
                file_stem: "a".into(),
                known_name: Some("a".into()),
                bmi: a.clone(),
            },
            ModuleCandidate {
                file_stem: "b".into(),
                known_name: Some("b".into()),
                bmi: b.clone(),
            },
        ];

        let mut pts = Vec::new();
        let (off, _) = resolve_modules(&mut imports, &cands, &map, &mut pts).unwrap();
        assert_eq!(off.start, 0);
        assert_eq!(off.exported, 1);
        // Non-exported b first, re-exported a at the back.
        assert!(Arc::ptr_eq(pts[0].as_ref().unwrap(), &b));
        assert!(Arc::ptr_eq(pts[1].as_ref().unwrap(), &a));
    }
}
