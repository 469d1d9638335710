//! Build Context
//!
//! The global context owns the shared pools (variables, targets, file
//! cache), the scheduler and phase machinery, and the match/execute
//! drivers that walk the target graph.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::action::{Action, TargetState};
use crate::diag::{fail, Failed};
use crate::filecache::FileCache;
use crate::process::Spawner;
use crate::rule::Recipe;
use crate::scheduler::{Phase, PhaseGuard, PhaseMutex, Scheduler, TaskCount, WaitGuard};
use crate::scope::Scope;
use crate::target::{Target, TargetSet};
use crate::variable::VarPool;

pub struct Context {
    pub var_pool: VarPool,
    pub targets: TargetSet,
    pub scheduler: Scheduler,
    pub phase: PhaseMutex,
    /// Keep running after a failure and collect the results.
    pub keep_going: bool,
    pub dry_run: bool,
    pub spawner: Arc<dyn Spawner>,
    pub file_cache: Arc<FileCache>,
    roots: RwLock<Vec<Arc<Scope>>>,
    side_build: Mutex<Option<Arc<Scope>>>,
}

impl Context {
    pub fn new(spawner: Arc<dyn Spawner>) -> Arc<Self> {
        Arc::new(Self {
            var_pool: VarPool::new(),
            targets: TargetSet::new(),
            scheduler: Scheduler::new(),
            phase: PhaseMutex::default(),
            keep_going: true,
            dry_run: false,
            spawner,
            file_cache: FileCache::new(),
            roots: RwLock::new(Vec::new()),
            side_build: Mutex::new(None),
        })
    }

    pub fn new_with(spawner: Arc<dyn Spawner>, keep_going: bool) -> Arc<Self> {
        let mut ctx = Self::new(spawner);
        Arc::get_mut(&mut ctx).unwrap().keep_going = keep_going;
        ctx
    }

    /// Create and register a new project root scope.
    pub fn new_root_scope(
        &self,
        out_path: impl Into<PathBuf>,
        src_path: Option<PathBuf>,
    ) -> Arc<Scope> {
        let s = Scope::new_root(out_path, src_path);
        self.roots.write().unwrap().push(s.clone());
        s
    }

    pub fn root_scopes(&self) -> Vec<Arc<Scope>> {
        self.roots.read().unwrap().clone()
    }

    /// The deepest scope containing the given out directory.
    pub fn scope_for(&self, dir: &Path) -> Option<Arc<Scope>> {
        let mut best: Option<Arc<Scope>> = None;
        for r in self.roots.read().unwrap().iter() {
            if r.contains(dir)
                && best
                    .as_ref()
                    .map(|b| r.out_path.components().count() > b.out_path.components().count())
                    .unwrap_or(true)
            {
                best = Some(r.clone());
            }
        }

        let mut cur = best?;
        loop {
            let next = cur
                .children
                .read()
                .unwrap()
                .values()
                .find(|c| c.contains(dir))
                .cloned();
            match next {
                Some(c) => cur = c,
                None => return Some(cur),
            }
        }
    }

    /// The `modules` side-build subproject, created on first use.
    /// Creation is serialized and idempotent; the result is cached.
    /// (Callers reach this mid-match; the creation lock stands in for
    /// an exclusive load phase, which a match-phase holder could not
    /// enter without quiescing itself.)
    pub fn ensure_side_build(&self, amalgamation_out: &Path) -> Arc<Scope> {
        let mut sb = self.side_build.lock().unwrap();
        if let Some(s) = sb.as_ref() {
            return s.clone();
        }
        let out = amalgamation_out.join("modules");
        let s = Scope::new_root(out, None);
        self.roots.write().unwrap().push(s.clone());
        *sb = Some(s.clone());
        s
    }

    // -- Match ------------------------------------------------------------

    /// Match a rule to the target and synthesize its recipe.
    ///
    /// Serialized per target via the construction mutex; concurrent calls
    /// for the same target block and then observe the matched state.
    pub fn match_target(&self, a: Action, t: &Arc<Target>) -> Result<TargetState, Failed> {
        if t.matched(a) {
            return match t.state(a) {
                TargetState::Failed => Err(Failed),
                s => Ok(s),
            };
        }

        let mutex = t.build_mutex();
        let _lock = mutex.lock().unwrap();

        if t.matched(a) {
            return match t.state(a) {
                TargetState::Failed => Err(Failed),
                s => Ok(s),
            };
        }

        let scope = self.scope_for(t.out_dir());
        let rule = scope.and_then(|s| {
            let mut cur = Some(s);
            while let Some(sc) = cur {
                for r in sc.rules_for(a.op) {
                    if r.matches(self, a, t) {
                        tracing::debug!(target_name = %t, rule = r.name(), "matched");
                        return Some(r);
                    }
                }
                cur = sc.parent.as_ref().and_then(|p| p.upgrade());
            }
            None
        });

        let rule = match rule {
            Some(r) => r,
            None => {
                t.set_state(a, TargetState::Failed);
                return Err(fail(format_args!("no rule to {} target {}", a.op.name(), t)));
            }
        };

        match rule.apply(self, a, t) {
            Ok(recipe) => {
                t.with_action_data(a, |d| {
                    d.recipe = Some(recipe);
                    d.state = Some(TargetState::Matched);
                });
                Ok(TargetState::Matched)
            }
            Err(e) => {
                t.set_state(a, TargetState::Failed);
                Err(e)
            }
        }
    }

    /// Match a set of targets in parallel, in declaration order of
    /// dispatch. Failures are collected; the first is reported after all
    /// tasks finish.
    pub fn match_async(
        self: &Arc<Self>,
        a: Action,
        ts: impl IntoIterator<Item = Arc<Target>>,
    ) -> Result<(), Failed> {
        let count = TaskCount::new();
        let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        for t in ts {
            let ctx = self.clone();
            let failed = failed.clone();
            self.scheduler.spawn(&count, move || {
                if ctx.match_target(a, &t).is_err() {
                    failed.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            });
        }

        WaitGuard::new(count).wait();
        if failed.load(std::sync::atomic::Ordering::SeqCst) {
            Err(Failed)
        } else {
            Ok(())
        }
    }

    // -- Execute ----------------------------------------------------------

    /// Execute the target's recipe for the action, once.
    pub fn execute_target(&self, a: Action, t: &Arc<Target>) -> Result<TargetState, Failed> {
        // Claim execution atomically; the loser waits on the build mutex
        // of the winner via the state check loop below.
        enum Claim {
            Ours(Option<Recipe>),
            Done(TargetState),
            Busy,
        }

        loop {
            let claim = t.with_action_data(a, |d| match d.state {
                Some(s) if s.executed() => Claim::Done(s),
                Some(TargetState::Executing) => Claim::Busy,
                Some(TargetState::Matched) => {
                    d.state = Some(TargetState::Executing);
                    Claim::Ours(d.recipe.clone())
                }
                _ => Claim::Done(TargetState::Unmatched),
            });

            match claim {
                Claim::Done(TargetState::Unmatched) => {
                    return Err(fail(format_args!("unmatched target {} executed", t)))
                }
                Claim::Done(TargetState::Failed) => return Err(Failed),
                Claim::Done(s) => return Ok(s),
                Claim::Busy => {
                    // Another thread is running the recipe; spin-wait on
                    // its completion (bounded by recipe runtime).
                    std::thread::yield_now();
                    continue;
                }
                Claim::Ours(recipe) => {
                    let recipe = recipe.expect("matched target without recipe");
                    let r = recipe(self, a, t);
                    let s = match &r {
                        Ok(s) => *s,
                        Err(_) => TargetState::Failed,
                    };
                    t.set_state(a, s);
                    return r;
                }
            }
        }
    }

    /// Execute targets in parallel; under `keep_going` all run to
    /// completion and the first failure is reported afterwards.
    pub fn execute_async(
        self: &Arc<Self>,
        a: Action,
        ts: impl IntoIterator<Item = Arc<Target>>,
    ) -> Result<bool, Failed> {
        let count = TaskCount::new();
        let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let changed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        for t in ts {
            let ctx = self.clone();
            let failed_inner = failed.clone();
            let changed = changed.clone();
            self.scheduler.spawn(&count, move || {
                match ctx.execute_target(a, &t) {
                    Ok(TargetState::Changed) => {
                        changed.store(true, std::sync::atomic::Ordering::SeqCst)
                    }
                    Ok(_) => {}
                    Err(_) => failed_inner.store(true, std::sync::atomic::Ordering::SeqCst),
                }
            });
            if !self.keep_going && failed.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
        }

        WaitGuard::new(count).wait();
        if failed.load(std::sync::atomic::Ordering::SeqCst) {
            Err(Failed)
        } else {
            Ok(changed.load(std::sync::atomic::Ordering::SeqCst))
        }
    }

    /// Match and execute a target directly while in the match phase
    /// (used to force an update of a generated header).
    pub fn update_during_match(
        &self,
        guard: &PhaseGuard<'_>,
        a: Action,
        t: &Arc<Target>,
    ) -> Result<TargetState, Failed> {
        self.match_target(a, t)?;
        let _sw = guard.switch(Phase::Execute);
        self.execute_target(a, t)
    }

    /// Bring a target up to date: match under the match phase, then
    /// execute under the execute phase.
    pub fn update(self: &Arc<Self>, t: &Arc<Target>) -> Result<TargetState, Failed> {
        let a = Action::update();
        {
            let _m = self.phase.lock(Phase::Match);
            self.match_target(a, t)?;
        }
        let _e = self.phase.lock(Phase::Execute);
        self.execute_target(a, t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ScriptedSpawner;
    use crate::rule::Rule;
    use crate::target::{DeclKind, FILE};

    struct TouchRule;

    impl Rule for TouchRule {
        fn name(&self) -> &'static str {
            "test.touch"
        }

        fn matches(&self, _: &Context, _: Action, t: &Arc<Target>) -> bool {
            std::ptr::eq(t.ty, &FILE)
        }

        fn apply(self: Arc<Self>, _: &Context, _: Action, _: &Arc<Target>) -> Result<Recipe, Failed> {
            Ok(Arc::new(|_, _, t| {
                let p = t.derive_path(None);
                std::fs::write(&p, "x").map_err(|_| Failed)?;
                Ok(TargetState::Changed)
            }))
        }
    }

    #[test]
    fn test_match_and_execute() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(Arc::new(ScriptedSpawner::new()));
        let root = ctx.new_root_scope(dir.path(), None);
        root.register_rule(None, Arc::new(TouchRule));

        let (t, _) = ctx
            .targets
            .insert(&FILE, dir.path(), "", "out.txt", None, DeclKind::Real);

        let s = ctx.update(&t).unwrap();
        assert_eq!(s, TargetState::Changed);
        assert!(dir.path().join("out.txt").exists());

        // Re-executing reports the cached state without re-running.
        let s = ctx.execute_target(Action::update(), &t).unwrap();
        assert_eq!(s, TargetState::Changed);
    }

    #[test]
    fn test_no_rule_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(Arc::new(ScriptedSpawner::new()));
        let _root = ctx.new_root_scope(dir.path(), None);

        let (t, _) = ctx
            .targets
            .insert(&FILE, dir.path(), "", "x", None, DeclKind::Real);
        assert!(ctx.match_target(Action::update(), &t).is_err());
        assert_eq!(t.state(Action::update()), TargetState::Failed);
    }

    #[test]
    fn test_scope_for_picks_deepest() {
        let ctx = Context::new(Arc::new(ScriptedSpawner::new()));
        let root = ctx.new_root_scope("/p/out", None);
        let sub = root.child("/p/out/lib");

        let s = ctx.scope_for(Path::new("/p/out/lib/deep")).unwrap();
        assert!(Arc::ptr_eq(&s, &sub));
        let s = ctx.scope_for(Path::new("/p/out/other")).unwrap();
        assert!(Arc::ptr_eq(&s, &root));
    }

    #[test]
    fn test_side_build_idempotent() {
        let ctx = Context::new(Arc::new(ScriptedSpawner::new()));
        let a = ctx.ensure_side_build(Path::new("/p/out"));
        let b = ctx.ensure_side_build(Path::new("/p/out"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.out_path, PathBuf::from("/p/out/modules"));
    }
}
