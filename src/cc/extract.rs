//! Header Dependency Extraction
//!
//! Runs the preprocessor and turns its dependency output into header
//! prerequisites, updating each and recording it in the dependency
//! database. Missing headers that turn out to be generated trigger the
//! yo-yo restart loop:
//!
//! 1. Run without missing-header-as-generated and with diagnostics
//!    suppressed.
//! 2. On success, process the dependency stream; a header whose update
//!    changed it and which did not previously exist restarts the loop
//!    (the new header may include yet-unknown headers).
//! 3. On failure with headers updated, restart.
//! 4. On failure without progress, flip to `-MG` mode with diagnostics
//!    enabled to either discover generatable headers or surface the real
//!    error.
//!
//! Restart bookkeeping uses a skip count: prerequisites processed on a
//! prior pass are skipped by index, which is sound because dependency
//! output is deterministic in input order up to the first missing file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lazy_static::lazy_static;
use regex_lite::Regex;

use crate::action::{Action, TargetState};
use crate::cc::msvc;
use crate::cc::types::{CompilerClass, CompilerInfo, Lang};
use crate::context::Context;
use crate::depdb::DepDb;
use crate::diag::{fail, Failed};
use crate::names::normalize;
use crate::process::ProcessCommand;
use crate::scope::Scope;
use crate::target::{self, DeclKind, Mtime, Target};

lazy_static! {
    /// GCC/Clang missing include diagnostic.
    static ref MISSING_INCLUDE: Regex =
        Regex::new(r"(?:fatal error|error): ([^:]+): No such file").unwrap();
}

/// Parse make-style dependency output (`out: dep dep \` continuations).
pub fn parse_make_deps(text: &str) -> Vec<String> {
    let mut deps = Vec::new();
    let joined = text.replace("\\\n", " ");
    for line in joined.lines() {
        let rest = match line.find(':') {
            // A colon inside a drive letter (C:\...) is not the rule
            // separator.
            Some(i) if i > 1 || !line.as_bytes().first().map(|c| c.is_ascii_alphabetic()).unwrap_or(false) => &line[i + 1..],
            _ => line,
        };
        for w in rest.split_whitespace() {
            if w != "\\" {
                deps.push(w.replace("\\ ", " "));
            }
        }
    }
    deps
}

/// Header search/remap environment.
pub struct HeaderSearch<'a> {
    pub ctx: &'a Context,
    pub scope: &'a Arc<Scope>,
    /// Include-prefix to out-directory mapping for auto-generated
    /// headers.
    pub prefix_map: &'a [(PathBuf, PathBuf)],
}

impl<'a> HeaderSearch<'a> {
    /// Enter a header path as a target, applying src-out remapping.
    pub fn enter_header(&self, path: &Path, cwd: &Path) -> Arc<Target> {
        let abs = if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&cwd.join(path))
        };

        // If the src-tree header has an out-tree variant, the out one
        // wins (it shadows the src one for generated headers).
        let effective = match self.scope.src_to_out(&abs) {
            Some(out) if out.exists() => out,
            _ => abs,
        };

        let leaf = effective
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let (name, ext) = target::split_name(leaf);
        let ty = ext
            .as_deref()
            .and_then(target::type_for_ext)
            .filter(|t| target::is_header(t))
            .unwrap_or(&target::H);

        let dir = effective.parent().unwrap_or(Path::new("/")).to_path_buf();
        let (t, _) = self
            .ctx
            .targets
            .insert(ty, dir, "", name, ext, DeclKind::Implied);
        t.set_path(effective);
        t
    }

    /// Find the target for a not-yet-existing generated header via the
    /// prefix map. The header must be declared (so a rule can match).
    pub fn find_generated(&self, name: &str) -> Option<Arc<Target>> {
        for (prefix, dir) in self.prefix_map {
            let rel = if prefix.as_os_str().is_empty() {
                Some(Path::new(name))
            } else {
                Path::new(name).strip_prefix(prefix).ok()
            };
            let Some(rel) = rel else { continue };

            let full = dir.join(rel);
            let leaf = full.file_name().and_then(|s| s.to_str())?;
            let (nm, ext) = target::split_name(leaf);
            let ty = ext
                .as_deref()
                .and_then(target::type_for_ext)
                .filter(|t| target::is_header(t))
                .unwrap_or(&target::H);
            let key = crate::target::TargetKey::new(
                ty,
                full.parent()?.to_path_buf(),
                "",
                nm,
                ext,
            );
            if let Some(t) = self.ctx.targets.find(&key) {
                return Some(t);
            }
        }
        None
    }

    /// Update a header target. Returns (changed, existed-before).
    pub fn update_header(&self, a: Action, t: &Arc<Target>) -> Result<(bool, bool), Failed> {
        let existed = t.mtime().exists();

        // A plain existing header with no matching rule needs no work.
        let has_rule = self.has_rule(a, t);
        if !has_rule {
            if existed {
                return Ok((false, true));
            }
            return Err(fail(format_args!(
                "header {} does not exist and no rule to generate it",
                t.path().unwrap_or_default().display()
            )));
        }

        self.ctx.match_target(a, t)?;
        let state = self.ctx.execute_target(a, t)?;
        t.invalidate_mtime();
        Ok((state == TargetState::Changed, existed))
    }

    fn has_rule(&self, a: Action, t: &Arc<Target>) -> bool {
        if t.matched(a) {
            return true;
        }
        let mut cur = self.ctx.scope_for(t.out_dir());
        while let Some(s) = cur {
            for r in s.rules_for(a.op) {
                if r.matches(self.ctx, a, t) {
                    return true;
                }
            }
            cur = s.parent.as_ref().and_then(|p| p.upgrade());
        }
        false
    }
}

/// Result of a header extraction run.
#[derive(Debug, Default)]
pub struct ExtractedHeaders {
    pub headers: Vec<Arc<Target>>,
    /// Some header was (re)generated; the unit must be (re)compiled.
    pub updated: bool,
    pub restarts: usize,
}

/// Build the preprocessor command for dependency extraction.
fn depcmd(
    ci: &CompilerInfo,
    lang: Lang,
    src: &Path,
    poptions: &[String],
    generated: bool,
) -> ProcessCommand {
    let mut c = ProcessCommand::new(ci.path.display().to_string());
    match ci.class {
        CompilerClass::Gcc => {
            c = c.arg("-x").arg(match lang {
                Lang::C => "c",
                Lang::Cxx => "c++",
            });
            c = c.args(poptions.iter().cloned());
            c = c.arg("-M").arg("-MQ").arg("^");
            if generated {
                c = c.arg("-MG");
            }
            c = c.arg(src.display().to_string());
        }
        CompilerClass::Msvc => {
            c = c.arg("/nologo");
            c = c.args(poptions.iter().cloned());
            c = c.arg("/showIncludes").arg("/Zs");
            c = c.arg(src.display().to_string());
        }
    }
    c
}

/// Run the yo-yo extraction loop for one translation unit.
///
/// Each discovered header is updated and recorded in the dep-db as an
/// absolute normalized path.
#[allow(clippy::too_many_arguments)]
pub fn extract_headers(
    search: &HeaderSearch<'_>,
    ci: &CompilerInfo,
    lang: Lang,
    a: Action,
    src: &Path,
    poptions: &[String],
    dd: &mut DepDb,
    target_mtime: Mtime,
) -> Result<ExtractedHeaders, Failed> {
    let ctx = search.ctx;
    let cwd = search.scope.out_path.clone();
    let mut out = ExtractedHeaders::default();
    let mut skip_count = 0usize;

    // Safety valve: generated headers can cascade but not forever.
    const MAX_RESTARTS: usize = 64;

    'restart: loop {
        if out.restarts > MAX_RESTARTS {
            return Err(fail("header extraction did not converge"));
        }

        let cmd = depcmd(ci, lang, src, poptions, false);
        tracing::trace!(cmd = %cmd, "extracting headers");
        let r = ctx
            .spawner
            .run(&cmd)
            .map_err(|e| fail(format_args!("{}", e)))?;

        let (deps, good_error, missing) = match ci.class {
            CompilerClass::Gcc => {
                let deps = parse_make_deps(&r.stdout);
                let missing = MISSING_INCLUDE
                    .captures(&r.stderr)
                    .map(|c| c.get(1).unwrap().as_str().to_string());
                (deps, missing.is_some(), missing)
            }
            CompilerClass::Msvc => {
                let si = msvc::parse_show_includes(&r.stdout);
                (
                    si.headers
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect(),
                    si.good_error,
                    si.missing,
                )
            }
        };

        if r.status == 0 || good_error {
            // Process the dependency stream, skipping what earlier
            // passes already handled.
            let mut index = 0usize;
            for dep in &deps {
                let p = Path::new(dep);
                if p == src {
                    continue;
                }
                // Relative non-existent entries are generated-header
                // names (the -MG form); handle below via the prefix map.
                let is_missing_name = !p.is_absolute() && !cwd.join(p).exists();

                if index < skip_count {
                    index += 1;
                    continue;
                }

                if is_missing_name {
                    match search.find_generated(dep) {
                        Some(ht) => {
                            let (_, _) = search.update_header(a, &ht)?;
                            out.updated = true;
                            out.restarts += 1;
                            skip_count = index;
                            continue 'restart;
                        }
                        None => {
                            return Err(fail(format_args!(
                                "header {} not found and no rule to generate it",
                                dep
                            )));
                        }
                    }
                }

                let ht = search.enter_header(p, &cwd);
                let (changed, existed) = search.update_header(a, &ht)?;

                let hp = ht.path().expect("header path");
                dd.expect(&hp.display().to_string());

                // Header newer than the target: the unit recompiles.
                match (ht.mtime(), target_mtime) {
                    (Mtime::At(h), Mtime::At(t)) if h > t => out.updated = true,
                    (_, Mtime::Nonexistent) => out.updated = true,
                    _ => {}
                }

                out.headers.push(ht);
                index += 1;

                if changed && !existed {
                    // A generated header materialized: it may include
                    // yet-unknown headers.
                    out.updated = true;
                    out.restarts += 1;
                    skip_count = index;
                    continue 'restart;
                }
            }

            if r.status == 0 {
                return Ok(out);
            }

            // good_error: the named missing header terminates this pass.
            if let Some(m) = &missing {
                match search.find_generated(m) {
                    Some(ht) => {
                        search.update_header(a, &ht)?;
                        out.updated = true;
                        out.restarts += 1;
                        skip_count = out.headers.len();
                        continue 'restart;
                    }
                    None => {
                        return Err(fail(format_args!(
                            "header {} not found and no rule to generate it",
                            m
                        )));
                    }
                }
            }
            return Err(fail("preprocessor failed"));
        }

        // Failure without dependency progress: re-run in generated mode
        // with diagnostics enabled to surface the real error (or the
        // generatable header names).
        let cmd = depcmd(ci, lang, src, poptions, true);
        let r2 = ctx
            .spawner
            .run(&cmd)
            .map_err(|e| fail(format_args!("{}", e)))?;

        if r2.status == 0 {
            // -MG succeeded: some dependency names are generated
            // headers; restart in strict mode after updating them.
            let mut progressed = false;
            for dep in parse_make_deps(&r2.stdout) {
                let p = Path::new(&dep);
                if p == src {
                    continue;
                }
                let abs_exists = if p.is_absolute() {
                    p.exists()
                } else {
                    cwd.join(p).exists()
                };
                if abs_exists {
                    continue;
                }
                if let Some(ht) = search.find_generated(&dep) {
                    search.update_header(a, &ht)?;
                    progressed = true;
                    out.updated = true;
                }
            }
            if progressed {
                out.restarts += 1;
                continue 'restart;
            }
        }

        // The real error, with the compiler's diagnostics.
        return Err(fail(format_args!(
            "unable to extract header dependencies of {}:\n{}",
            src.display(),
            if r2.stderr.is_empty() { &r.stderr } else { &r2.stderr }
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_make_deps() {
        let text = "^: /src/main.cxx /usr/include/a.h \\\n  /usr/include/b.h\n";
        let deps = parse_make_deps(text);
        assert_eq!(
            deps,
            vec!["/src/main.cxx", "/usr/include/a.h", "/usr/include/b.h"]
        );
    }

    #[test]
    fn test_parse_make_deps_generated_name() {
        let text = "^: main.cxx gen.h\n";
        let deps = parse_make_deps(text);
        assert_eq!(deps, vec!["main.cxx", "gen.h"]);
    }
}
