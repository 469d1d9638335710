//! Scopes
//!
//! A scope is a node in the directory-aligned tree that holds variables,
//! registered rules, target-type/pattern-specific variable overrides, and
//! ad hoc pattern rules. Root scopes additionally track the project
//! metadata, the set of loaded buildfiles, and per-operation callbacks.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};

use crate::action::Operation;
use crate::names::Value;
use crate::rule::{AdhocPatternRule, Rule};
use crate::target::TargetType;
use crate::variable::{Variable, VariableMap, Visibility};

/// Target-type/pattern-specific variable override block:
/// `cxx{*-test}: var = value`.
#[derive(Debug)]
pub struct TypePatternVars {
    pub ty: &'static TargetType,
    pub pattern: String,
    pub vars: VariableMap,
}

/// Per-operation callback registered by recipes that need scope-level
/// cleanup.
pub type OperationCallback = Arc<dyn Fn(&crate::context::Context) + Send + Sync>;

/// Root-scope-only data.
#[derive(Default)]
pub struct RootData {
    pub project: RwLock<Option<String>>,
    /// Buildfiles already sourced into this root (for `include`
    /// deduplication).
    pub buildfiles: RwLock<HashSet<PathBuf>>,
    callbacks: RwLock<Vec<(Operation, String, OperationCallback)>>,
}

impl RootData {
    /// Register a callback once per (operation, key). Returns true if the
    /// callback was registered by this call.
    pub fn register_callback_once(
        &self,
        op: Operation,
        key: impl Into<String>,
        cb: OperationCallback,
    ) -> bool {
        let key = key.into();
        let mut cbs = self.callbacks.write().unwrap();
        if cbs.iter().any(|(o, k, _)| *o == op && *k == key) {
            return false;
        }
        cbs.push((op, key, cb));
        true
    }

    pub fn callbacks_for(&self, op: Operation) -> Vec<OperationCallback> {
        self.callbacks
            .read()
            .unwrap()
            .iter()
            .filter(|(o, _, _)| *o == op)
            .map(|(_, _, cb)| cb.clone())
            .collect()
    }
}

pub struct Scope {
    pub out_path: PathBuf,
    pub src_path: RwLock<Option<PathBuf>>,
    pub parent: Option<Weak<Scope>>,
    pub vars: RwLock<VariableMap>,
    pub children: RwLock<BTreeMap<PathBuf, Arc<Scope>>>,
    rules: RwLock<Vec<(Option<Operation>, Arc<dyn Rule>)>>,
    pub type_vars: RwLock<Vec<TypePatternVars>>,
    pub adhoc_rules: RwLock<Vec<Arc<AdhocPatternRule>>>,
    /// Present on root scopes only.
    pub root: Option<RootData>,
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("out_path", &self.out_path)
            .field("root", &self.root.is_some())
            .finish()
    }
}

impl Scope {
    pub fn new_root(out_path: impl Into<PathBuf>, src_path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            out_path: out_path.into(),
            src_path: RwLock::new(src_path),
            parent: None,
            vars: RwLock::new(VariableMap::new()),
            children: RwLock::new(BTreeMap::new()),
            rules: RwLock::new(Vec::new()),
            type_vars: RwLock::new(Vec::new()),
            adhoc_rules: RwLock::new(Vec::new()),
            root: Some(RootData::default()),
        })
    }

    /// Find or create the child scope for the given out directory.
    pub fn child(self: &Arc<Self>, out_path: impl Into<PathBuf>) -> Arc<Scope> {
        let out_path = out_path.into();
        if out_path == self.out_path {
            return self.clone();
        }
        let mut children = self.children.write().unwrap();
        if let Some(c) = children.get(&out_path) {
            return c.clone();
        }
        let c = Arc::new(Scope {
            out_path: out_path.clone(),
            src_path: RwLock::new(None),
            parent: Some(Arc::downgrade(self)),
            vars: RwLock::new(VariableMap::new()),
            children: RwLock::new(BTreeMap::new()),
            rules: RwLock::new(Vec::new()),
            type_vars: RwLock::new(Vec::new()),
            adhoc_rules: RwLock::new(Vec::new()),
            root: None,
        });
        children.insert(out_path, c.clone());
        c
    }

    pub fn is_root(&self) -> bool {
        self.root.is_some()
    }

    /// The enclosing root scope (or this scope if it is one).
    pub fn root_scope(self: &Arc<Self>) -> Option<Arc<Scope>> {
        let mut cur = self.clone();
        loop {
            if cur.is_root() {
                return Some(cur);
            }
            cur = cur.parent.as_ref()?.upgrade()?;
        }
    }

    /// Look up a variable value, walking up the scope tree and honoring
    /// the variable's visibility.
    pub fn find_value(self: &Arc<Self>, var: &Arc<Variable>) -> Option<Value> {
        let mut cur = Some(self.clone());
        let mut crossed_root = false;

        while let Some(s) = cur {
            if let Some(v) = s.vars.read().unwrap().get(&var.name) {
                return Some(v.clone());
            }

            match var.visibility {
                Visibility::Target | Visibility::Prereq => return None,
                Visibility::Scope => {}
                Visibility::Project => {
                    if crossed_root {
                        return None;
                    }
                    if s.is_root() {
                        crossed_root = true;
                    }
                }
                Visibility::Global => {}
            }

            cur = s.parent.as_ref().and_then(|p| p.upgrade());
        }
        None
    }

    /// Look up a target-type/pattern-specific value for the given target
    /// type and name, from this scope up.
    pub fn find_type_pattern_value(
        self: &Arc<Self>,
        ty: &'static TargetType,
        target_name: &str,
        var_name: &str,
    ) -> Option<Value> {
        let mut cur = Some(self.clone());
        while let Some(s) = cur {
            for tv in s.type_vars.read().unwrap().iter() {
                if std::ptr::eq(tv.ty, ty)
                    && glob_match(&tv.pattern, target_name)
                {
                    if let Some(v) = tv.vars.get(var_name) {
                        return Some(v.clone());
                    }
                }
            }
            cur = s.parent.as_ref().and_then(|p| p.upgrade());
        }
        None
    }

    pub fn register_rule(&self, op: Option<Operation>, rule: Arc<dyn Rule>) {
        self.rules.write().unwrap().push((op, rule));
    }

    /// Rules registered on this scope (not walking up; the caller walks).
    pub fn rules_for(&self, op: Operation) -> Vec<Arc<dyn Rule>> {
        self.rules
            .read()
            .unwrap()
            .iter()
            .filter(|(o, _)| o.is_none() || *o == Some(op))
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn register_adhoc_rule(&self, rule: Arc<AdhocPatternRule>) {
        self.adhoc_rules.write().unwrap().push(rule);
    }

    /// Is `dir` within this scope (lexically)?
    pub fn contains(&self, dir: &Path) -> bool {
        dir.starts_with(&self.out_path)
    }

    /// Translate an out-tree path to the corresponding src-tree path, if
    /// this scope has a separate src tree.
    pub fn out_to_src(self: &Arc<Self>, p: &Path) -> Option<PathBuf> {
        let root = self.root_scope()?;
        let src = root.src_path.read().unwrap().clone()?;
        let rel = p.strip_prefix(&root.out_path).ok()?;
        Some(src.join(rel))
    }

    /// Translate a src-tree path to the corresponding out-tree path.
    pub fn src_to_out(self: &Arc<Self>, p: &Path) -> Option<PathBuf> {
        let root = self.root_scope()?;
        let src = root.src_path.read().unwrap().clone()?;
        let rel = p.strip_prefix(&src).ok()?;
        Some(root.out_path.join(rel))
    }
}

/// Shell-style pattern match for target-name patterns (`*`, `?`).
pub fn glob_match(pattern: &str, name: &str) -> bool {
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(name),
        Err(_) => pattern == name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::Name;
    use crate::variable::VarPool;

    #[test]
    fn test_scope_variable_lookup() {
        let pool = VarPool::new();
        let var = pool.insert("cxx.std", Visibility::Project, true, None);

        let root = Scope::new_root("/p/out", Some(PathBuf::from("/p/src")));
        let sub = root.child("/p/out/tests");

        root.vars
            .write()
            .unwrap()
            .assign(&var, Value::from_names(vec![Name::simple("20")]))
            .unwrap();

        let v = sub.find_value(&var).unwrap();
        assert_eq!(v.names[0].value, "20");
    }

    #[test]
    fn test_project_visibility_stops_at_root() {
        let pool = VarPool::new();
        let var = pool.insert("config.test", Visibility::Project, true, None);

        let outer = Scope::new_root("/outer", None);
        let inner = outer.child("/outer/inner");
        // Make the inner scope a root of its own project.
        let inner_root = Scope::new_root("/outer/inner/sub", None);

        outer
            .vars
            .write()
            .unwrap()
            .assign(&var, Value::from_bool(true))
            .unwrap();

        // Lookup within the same project finds it.
        assert!(inner.find_value(&var).is_some());
        // An unrelated root does not.
        assert!(inner_root.find_value(&var).is_none());
    }

    #[test]
    fn test_type_pattern_vars() {
        let pool = VarPool::new();
        let var = pool.insert_scoped("test");

        let root = Scope::new_root("/p", None);
        let mut vars = VariableMap::new();
        vars.assign(&var, Value::from_bool(true)).unwrap();
        root.type_vars.write().unwrap().push(TypePatternVars {
            ty: &crate::target::EXE,
            pattern: "*-test".into(),
            vars,
        });

        assert!(root
            .find_type_pattern_value(&crate::target::EXE, "foo-test", "test")
            .is_some());
        assert!(root
            .find_type_pattern_value(&crate::target::EXE, "foo", "test")
            .is_none());
    }

    #[test]
    fn test_callback_registered_once() {
        let root = Scope::new_root("/p", None);
        let data = root.root.as_ref().unwrap();
        let cb: OperationCallback = Arc::new(|_| {});
        assert!(data.register_callback_once(Operation::Clean, "adhoc", cb.clone()));
        assert!(!data.register_callback_once(Operation::Clean, "adhoc", cb));
        assert_eq!(data.callbacks_for(Operation::Clean).len(), 1);
    }

    #[test]
    fn test_out_src_translation() {
        let root = Scope::new_root("/p/out", Some(PathBuf::from("/p/src")));
        let s = root.child("/p/out/lib");
        assert_eq!(
            s.out_to_src(Path::new("/p/out/lib/a.h")).unwrap(),
            PathBuf::from("/p/src/lib/a.h")
        );
        assert_eq!(
            s.src_to_out(Path::new("/p/src/lib/a.h")).unwrap(),
            PathBuf::from("/p/out/lib/a.h")
        );
    }
}
