//! Ad Hoc Rule Execution
//!
//! Adapter between the ad hoc pattern rules a buildfile registers on
//! its scope and the rule machinery: targets are matched against the
//! registered patterns and their buildscript recipe bodies run through
//! the command interpreter with `$>`/`$<` bound to the target and its
//! synthesized prerequisite.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::action::{Action, Operation, TargetState};
use crate::context::Context;
use crate::diag::{fail, Failed};
use crate::names::PatternKind;
use crate::rule::{AdhocPatternRule, Recipe, Rule};
use crate::target::Target;
use crate::testscript::runner::run_command_text;

pub struct AdhocRuleAdapter;

/// The target's file leaf (name plus extension) used for pattern
/// matching.
fn target_leaf(t: &Arc<Target>) -> String {
    let mut leaf = t.name.clone();
    if let Some(e) = t.ext.read().unwrap().as_ref() {
        leaf.push('.');
        leaf.push_str(e);
    }
    leaf
}

/// Find the registered rule matching the target, walking the scope
/// chain up from the target's directory.
fn find_rule(ctx: &Context, t: &Arc<Target>) -> Option<Arc<AdhocPatternRule>> {
    let leaf = target_leaf(t);
    let mut cur = ctx.scope_for(t.out_dir());
    while let Some(s) = cur {
        for r in s.adhoc_rules.read().unwrap().iter() {
            for (ty, pattern) in &r.targets {
                if !std::ptr::eq(*ty, t.ty) {
                    continue;
                }
                let m = match crate::buildfile::pattern::classify(pattern, true) {
                    Some(PatternKind::Regex) => {
                        crate::buildfile::pattern::regex_match(pattern, &leaf)
                    }
                    _ => crate::scope::glob_match(pattern, &leaf),
                };
                if m {
                    return Some(r.clone());
                }
            }
        }
        cur = s.parent.as_ref().and_then(|p| p.upgrade());
    }
    None
}

/// Derive the prerequisite path for a matched target: the wildcard
/// portion of the target pattern substitutes into the prerequisite
/// pattern.
fn derive_prereq(rule: &AdhocPatternRule, t: &Arc<Target>) -> Option<PathBuf> {
    let leaf = target_leaf(t);
    let (_, target_pat) = rule.targets.first()?;
    let stem = pattern_stem(target_pat, &leaf)?;

    let p = rule.prereqs.first()?;
    let prereq_leaf = p.value.replace('*', &stem);
    Some(t.out_dir().join(p.dir.join(prereq_leaf)))
}

/// The part of `leaf` that the pattern's `*` matched.
fn pattern_stem(pattern: &str, leaf: &str) -> Option<String> {
    let star = pattern.find('*')?;
    let prefix = &pattern[..star];
    let suffix = &pattern[star + 1..];
    let rest = leaf.strip_prefix(prefix)?;
    let stem = rest.strip_suffix(suffix)?;
    Some(stem.to_string())
}

impl Rule for AdhocRuleAdapter {
    fn name(&self) -> &'static str {
        "adhoc"
    }

    fn matches(&self, ctx: &Context, _a: Action, t: &Arc<Target>) -> bool {
        find_rule(ctx, t).is_some()
    }

    fn apply(self: Arc<Self>, ctx: &Context, a: Action, t: &Arc<Target>) -> Result<Recipe, Failed> {
        let rule = find_rule(ctx, t)
            .ok_or_else(|| fail(format_args!("lost ad hoc rule for {}", t)))?;

        match a.op {
            Operation::Update => Ok(Arc::new(move |ctx, _a, t| {
                perform_update(ctx, &rule, t)
            })),
            Operation::Clean => Ok(Arc::new(|_, _, t| {
                let p = t.derive_path(None);
                match std::fs::remove_file(&p) {
                    Ok(()) => Ok(TargetState::Changed),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        Ok(TargetState::Unchanged)
                    }
                    Err(e) => Err(fail(format_args!(
                        "unable to remove {}: {}",
                        p.display(),
                        e
                    ))),
                }
            })),
            Operation::Test => Ok(crate::rule::noop_recipe()),
        }
    }
}

fn perform_update(
    ctx: &Context,
    rule: &AdhocPatternRule,
    t: &Arc<Target>,
) -> Result<TargetState, Failed> {
    let out = t.derive_path(None);
    let prereq = derive_prereq(rule, t);

    // Out of date when missing or older than the prerequisite.
    let out_mtime = std::fs::metadata(&out).and_then(|m| m.modified()).ok();
    let up_to_date = match (&out_mtime, &prereq) {
        (Some(om), Some(p)) => match std::fs::metadata(p).and_then(|m| m.modified()) {
            Ok(pm) => pm <= *om,
            Err(_) => false,
        },
        (Some(_), None) => true,
        _ => false,
    };
    if up_to_date {
        return Ok(TargetState::Unchanged);
    }

    let mut vars = HashMap::new();
    vars.insert(">".to_string(), out.display().to_string());
    if let Some(p) = &prereq {
        vars.insert("<".to_string(), p.display().to_string());
    }

    // The recipe bodies run in the target's output directory. The
    // adapter only understands buildscript recipes; C++ recipes would
    // need a separate build of their own.
    for r in rule.recipes.iter().filter(|r| r.applies_to(Operation::Update)) {
        match &r.lang {
            crate::rule::RecipeLang::Buildscript => {
                run_command_text(ctx, t.out_dir(), vars.clone(), &r.text).map_err(|e| {
                    fail(format_args!("{}: recipe: {}", rule.location, e))
                })?;
            }
            crate::rule::RecipeLang::Cxx { .. } => {
                return Err(fail(format_args!(
                    "{}: c++ recipes are not supported by the buildscript runner",
                    rule.location
                )));
            }
        }
    }

    t.invalidate_mtime();
    Ok(TargetState::Changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildfile::parser::Parser;
    use crate::process::ScriptedSpawner;
    use crate::target::{self, DeclKind};

    #[test]
    fn test_pattern_stem() {
        assert_eq!(pattern_stem("*.txt.gz", "a.txt.gz").as_deref(), Some("a"));
        assert_eq!(pattern_stem("lib*.so", "libfoo.so").as_deref(), Some("foo"));
        assert_eq!(pattern_stem("*.txt.gz", "a.txt"), None);
    }

    #[test]
    fn test_pattern_rule_runs_per_matched_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "beta\n").unwrap();

        let ctx = Context::new(Arc::new(ScriptedSpawner::new()));
        let root = ctx.new_root_scope(dir.path(), None);

        let text = "file{*.txt.gz}: file{*.txt}\n{{\n  cp $< $>\n}}\n";
        Parser::new(&ctx, root, dir.path().join("buildfile"), text)
            .parse()
            .unwrap();

        // Two matching targets: the recipe runs once for each.
        for stem in ["a", "b"] {
            let (t, _) = ctx.targets.insert(
                &target::FILE,
                dir.path(),
                "",
                format!("{}.txt", stem),
                Some("gz".into()),
                DeclKind::Real,
            );
            let s = ctx.update(&t).unwrap();
            assert_eq!(s, TargetState::Changed);
        }

        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt.gz")).unwrap(),
            "alpha\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("b.txt.gz")).unwrap(),
            "beta\n"
        );

        // Up to date on the next pass.
        let ctx2 = Context::new(Arc::new(ScriptedSpawner::new()));
        let root2 = ctx2.new_root_scope(dir.path(), None);
        Parser::new(&ctx2, root2, dir.path().join("buildfile"), text)
            .parse()
            .unwrap();
        let (t, _) = ctx2.targets.insert(
            &target::FILE,
            dir.path(),
            "",
            "a.txt",
            Some("gz".into()),
            DeclKind::Real,
        );
        assert_eq!(ctx2.update(&t).unwrap(), TargetState::Unchanged);
    }

    #[test]
    fn test_clean_recipe() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), "data\n").unwrap();

        let ctx = Context::new(Arc::new(ScriptedSpawner::new()));
        let root = ctx.new_root_scope(dir.path(), None);
        Parser::new(
            &ctx,
            root,
            dir.path().join("buildfile"),
            "file{*.txt.gz}: file{*.txt}\n% update clean\n{{\n  cp $< $>\n}}\n",
        )
        .parse()
        .unwrap();

        let (t, _) = ctx.targets.insert(
            &target::FILE,
            dir.path(),
            "",
            "x.txt",
            Some("gz".into()),
            DeclKind::Real,
        );
        ctx.update(&t).unwrap();
        assert!(dir.path().join("x.txt.gz").exists());

        let a = Action::clean();
        ctx.match_target(a, &t).unwrap();
        assert_eq!(ctx.execute_target(a, &t).unwrap(), TargetState::Changed);
        assert!(!dir.path().join("x.txt.gz").exists());
    }
}
