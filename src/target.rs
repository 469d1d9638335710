//! Targets and Prerequisites
//!
//! A target is identified by its (type, dir, out-dir, name, ext) tuple.
//! Targets are inserted into a process-wide keyed set and are never moved
//! afterwards; everything else holds `Arc` (or `Weak` for back-references)
//! into that set. Per-action state (match data, recipe, prerequisite
//! targets) hangs off the target keyed by action.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::SystemTime;

use crate::action::{Action, TargetState};
use crate::rule::Recipe;
use crate::variable::VariableMap;

/// A target type.
///
/// The set of types is closed within the core; each is a static entry and
/// identity is by address.
#[derive(Debug, PartialEq, Eq)]
pub struct TargetType {
    pub name: &'static str,
    /// True if targets of this type are files on disk.
    pub file: bool,
    /// True if targets of this type are directories.
    pub dir: bool,
}

macro_rules! target_types {
    ($($ident:ident => ($name:literal, $file:literal, $dir:literal);)*) => {
        $(pub static $ident: TargetType = TargetType {
            name: $name,
            file: $file,
            dir: $dir,
        };)*

        impl TargetType {
            /// Look up a target type by its buildfile name.
            pub fn find(name: &str) -> Option<&'static TargetType> {
                match name {
                    $($name => Some(&$ident),)*
                    _ => defined_types()
                        .lock()
                        .unwrap()
                        .iter()
                        .find(|t| t.name == name)
                        .copied(),
                }
            }

            /// Define a derived target type (the `define` directive).
            /// The entry is leaked so its address is stable like the
            /// static ones.
            pub fn define(name: &str, base: &'static TargetType) -> &'static TargetType {
                if let Some(t) = Self::find(name) {
                    return t;
                }
                let t: &'static TargetType = Box::leak(Box::new(TargetType {
                    name: Box::leak(name.to_string().into_boxed_str()),
                    file: base.file,
                    dir: base.dir,
                }));
                defined_types().lock().unwrap().push(t);
                t
            }
        }
    };
}

fn defined_types() -> &'static Mutex<Vec<&'static TargetType>> {
    static DEFINED: std::sync::OnceLock<Mutex<Vec<&'static TargetType>>> = std::sync::OnceLock::new();
    DEFINED.get_or_init(|| Mutex::new(Vec::new()))
}

target_types! {
    DIR => ("dir", false, true);
    FSDIR => ("fsdir", false, true);
    FILE => ("file", true, false);
    DOC => ("doc", true, false);
    EXE => ("exe", true, false);
    OBJ => ("obj", true, false);
    BMI => ("bmi", true, false);
    HBMI => ("hbmi", true, false);
    LIB => ("lib", false, false);
    LIBA => ("liba", true, false);
    LIBS => ("libs", true, false);
    C => ("c", true, false);
    H => ("h", true, false);
    CXX => ("cxx", true, false);
    HXX => ("hxx", true, false);
    IXX => ("ixx", true, false);
    TXX => ("txx", true, false);
    MXX => ("mxx", true, false);
    BUILDFILE => ("buildfile", true, false);
    TESTSCRIPT => ("testscript", true, false);
}

/// Map a source file extension to its target type. Used when a plain
/// file name appears in a prerequisite position. An ambiguous mapping is
/// resolvable only via an explicit target type.
pub fn type_for_ext(ext: &str) -> Option<&'static TargetType> {
    Some(match ext {
        "c" => &C,
        "h" => &H,
        "cxx" | "cpp" | "cc" => &CXX,
        "hxx" | "hpp" | "hh" => &HXX,
        "ixx" => &IXX,
        "txx" => &TXX,
        "mxx" | "cppm" | "mpp" => &MXX,
        "testscript" => &TESTSCRIPT,
        _ => return None,
    })
}

/// True if `t` is a C/C++ header type that the compile rule may enter as
/// an auto-discovered prerequisite.
pub fn is_header(t: &'static TargetType) -> bool {
    std::ptr::eq(t, &H) || std::ptr::eq(t, &HXX) || std::ptr::eq(t, &IXX) || std::ptr::eq(t, &TXX)
}

/// True if `t` is a module interface source type.
pub fn is_module_source(t: &'static TargetType) -> bool {
    std::ptr::eq(t, &MXX)
}

/// How a target came to be declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeclKind {
    /// Implied by something else (for example entered as a header
    /// dependency before ever being mentioned).
    Implied,
    /// Declared real in a buildfile dependency declaration.
    Real,
    /// Entered as a prerequisite of an existing file.
    PrereqFile,
    /// Entered as a prerequisite that does not exist yet.
    PrereqNew,
}

/// Cached file modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mtime {
    /// Not queried yet.
    Unknown,
    /// The file does not exist.
    Nonexistent,
    At(SystemTime),
}

impl Mtime {
    pub fn exists(self) -> bool {
        matches!(self, Self::At(_))
    }

    pub fn time(self) -> Option<SystemTime> {
        match self {
            Self::At(t) => Some(t),
            _ => None,
        }
    }
}

/// Target identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    /// Type identity is by static address.
    pub ty: usize,
    pub dir: PathBuf,
    pub out: PathBuf,
    pub name: String,
    pub ext: Option<String>,
}

impl TargetKey {
    pub fn new(
        ty: &'static TargetType,
        dir: impl Into<PathBuf>,
        out: impl Into<PathBuf>,
        name: impl Into<String>,
        ext: Option<String>,
    ) -> Self {
        Self {
            ty: ty as *const TargetType as usize,
            dir: dir.into(),
            out: out.into(),
            name: name.into(),
            ext,
        }
    }
}

/// A prerequisite as written: not yet resolved to a target.
#[derive(Debug, Clone)]
pub struct Prerequisite {
    pub proj: Option<String>,
    pub ty: &'static TargetType,
    pub dir: PathBuf,
    pub out: PathBuf,
    pub name: String,
    pub ext: Option<String>,
    pub vars: VariableMap,
}

impl Prerequisite {
    pub fn new(ty: &'static TargetType, dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            proj: None,
            ty,
            dir: dir.into(),
            out: PathBuf::new(),
            name: name.into(),
            ext: None,
            vars: VariableMap::new(),
        }
    }

    pub fn key(&self) -> TargetKey {
        TargetKey::new(
            self.ty,
            self.dir.clone(),
            self.out.clone(),
            self.name.clone(),
            self.ext.clone(),
        )
    }
}

impl fmt::Display for Prerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.ty.name, self.name)
    }
}

/// Per-action target data.
#[derive(Default)]
pub struct ActionData {
    pub state: Option<TargetState>,
    pub recipe: Option<Recipe>,
    /// Rule match data (the data-pad pattern): the matching rule stores
    /// whatever it needs to carry from apply to execute.
    pub match_data: Option<Box<dyn Any + Send + Sync>>,
    /// Targets resolved from prerequisites, in declaration order. Entries
    /// are None for prerequisites skipped by the rule. Rules append
    /// synthesized prerequisites (modules, discovered headers) at the
    /// tail; indices are stable for the rest of the action.
    pub prerequisite_targets: Vec<Option<Arc<Target>>>,
}

impl fmt::Debug for ActionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionData")
            .field("state", &self.state)
            .field("recipe", &self.recipe.as_ref().map(|_| "<recipe>"))
            .field("prerequisite_targets", &self.prerequisite_targets.len())
            .finish()
    }
}

/// A target.
#[derive(Debug)]
pub struct Target {
    pub ty: &'static TargetType,
    pub dir: PathBuf,
    /// Out-of-source directory; empty when the target is in out.
    pub out: PathBuf,
    pub name: String,
    pub ext: RwLock<Option<String>>,
    pub decl: RwLock<DeclKind>,
    /// Derived file path, once assigned.
    path: RwLock<Option<PathBuf>>,
    mtime: RwLock<Mtime>,
    pub prerequisites: RwLock<Vec<Prerequisite>>,
    /// Group this target is an ad hoc member of.
    pub group: RwLock<Option<Weak<Target>>>,
    /// Next ad hoc member in the chain.
    pub adhoc_member: RwLock<Option<Arc<Target>>>,
    pub vars: RwLock<VariableMap>,
    /// Ad hoc recipes attached by the buildfile.
    pub adhoc_recipes: RwLock<Vec<crate::rule::AdhocRecipe>>,
    actions: Mutex<HashMap<Action, ActionData>>,
    /// Serializes recipe synthesis for this target.
    build_mutex: Arc<Mutex<()>>,
}

impl Target {
    fn new(key: TargetKey, ty: &'static TargetType, decl: DeclKind) -> Self {
        Self {
            ty,
            dir: key.dir,
            out: key.out,
            name: key.name,
            ext: RwLock::new(key.ext),
            decl: RwLock::new(decl),
            path: RwLock::new(None),
            mtime: RwLock::new(Mtime::Unknown),
            prerequisites: RwLock::new(Vec::new()),
            group: RwLock::new(None),
            adhoc_member: RwLock::new(None),
            vars: RwLock::new(VariableMap::new()),
            adhoc_recipes: RwLock::new(Vec::new()),
            actions: Mutex::new(HashMap::new()),
            build_mutex: Arc::new(Mutex::new(())),
        }
    }

    pub fn key(&self) -> TargetKey {
        TargetKey {
            ty: self.ty as *const TargetType as usize,
            dir: self.dir.clone(),
            out: self.out.clone(),
            name: self.name.clone(),
            ext: self.ext.read().unwrap().clone(),
        }
    }

    /// The directory the target's file lives in (out if set, dir
    /// otherwise).
    pub fn out_dir(&self) -> &Path {
        if self.out.as_os_str().is_empty() {
            &self.dir
        } else {
            &self.out
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.read().unwrap().clone()
    }

    /// Assign the file path. The first assignment wins; re-assigning to a
    /// different path is a bug in the rule.
    pub fn set_path(&self, p: impl Into<PathBuf>) {
        let p = p.into();
        let mut cur = self.path.write().unwrap();
        if let Some(old) = cur.as_ref() {
            assert_eq!(*old, p, "target path reassigned");
            return;
        }
        *cur = Some(p);
    }

    /// Derive the path from dir/name.ext if not yet assigned.
    pub fn derive_path(&self, default_ext: Option<&str>) -> PathBuf {
        if let Some(p) = self.path() {
            return p;
        }
        let mut leaf = self.name.clone();
        let ext = self.ext.read().unwrap().clone();
        let e = ext.as_deref().or(default_ext);
        if let Some(e) = e {
            if !e.is_empty() {
                leaf.push('.');
                leaf.push_str(e);
            }
        }
        let p = self.out_dir().join(leaf);
        self.set_path(p.clone());
        p
    }

    /// Cached mtime, querying the filesystem on first use.
    pub fn mtime(&self) -> Mtime {
        {
            let m = self.mtime.read().unwrap();
            if *m != Mtime::Unknown {
                return *m;
            }
        }
        let m = match self.path() {
            Some(p) => match std::fs::metadata(&p) {
                Ok(md) => match md.modified() {
                    Ok(t) => Mtime::At(t),
                    Err(_) => Mtime::Nonexistent,
                },
                Err(_) => Mtime::Nonexistent,
            },
            None => Mtime::Unknown,
        };
        if m != Mtime::Unknown {
            *self.mtime.write().unwrap() = m;
        }
        m
    }

    /// Record a new mtime (after the recipe wrote the file).
    pub fn set_mtime(&self, m: Mtime) {
        *self.mtime.write().unwrap() = m;
    }

    /// Drop the cached mtime so the next query re-stats.
    pub fn invalidate_mtime(&self) {
        *self.mtime.write().unwrap() = Mtime::Unknown;
    }

    /// Promote the declaration kind (Implied < Real etc. is not a strict
    /// order; Real always wins).
    pub fn promote_decl(&self, decl: DeclKind) {
        let mut d = self.decl.write().unwrap();
        if decl == DeclKind::Real || *d == DeclKind::Implied {
            *d = decl;
        }
    }

    /// Run `f` with this target's per-action data.
    pub fn with_action_data<R>(&self, a: Action, f: impl FnOnce(&mut ActionData) -> R) -> R {
        let mut m = self.actions.lock().unwrap();
        f(m.entry(a).or_default())
    }

    pub fn state(&self, a: Action) -> TargetState {
        self.with_action_data(a, |d| d.state.unwrap_or(TargetState::Unmatched))
    }

    pub fn set_state(&self, a: Action, s: TargetState) {
        self.with_action_data(a, |d| d.state = Some(s));
    }

    pub fn matched(&self, a: Action) -> bool {
        self.state(a) != TargetState::Unmatched
    }

    /// The per-target recipe-synthesis lock.
    pub fn build_mutex(&self) -> Arc<Mutex<()>> {
        self.build_mutex.clone()
    }

    /// Append an ad hoc member to the chain, linking its group pointer
    /// back to this target.
    pub fn add_adhoc_member(self: &Arc<Self>, member: Arc<Target>) {
        *member.group.write().unwrap() = Some(Arc::downgrade(self));
        let mut tail = self.clone();
        loop {
            let next = tail.adhoc_member.read().unwrap().clone();
            match next {
                Some(n) => tail = n,
                None => break,
            }
        }
        *tail.adhoc_member.write().unwrap() = Some(member);
    }

    /// Find an ad hoc member of the given type.
    pub fn find_adhoc_member(self: &Arc<Self>, ty: &'static TargetType) -> Option<Arc<Target>> {
        let mut cur = self.adhoc_member.read().unwrap().clone();
        while let Some(m) = cur {
            if std::ptr::eq(m.ty, ty) {
                return Some(m);
            }
            cur = m.adhoc_member.read().unwrap().clone();
        }
        None
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{{}}}", self.ty.name, self.name)
    }
}

/// The process-wide target set.
///
/// Insertion returns a stable `Arc`; with `insert_locked` the caller also
/// receives the per-target construction mutex so that recipe synthesis is
/// race-free.
#[derive(Debug, Default)]
pub struct TargetSet {
    map: RwLock<HashMap<TargetKey, Arc<Target>>>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find or insert. Returns the target and whether it was inserted.
    pub fn insert(
        &self,
        ty: &'static TargetType,
        dir: impl Into<PathBuf>,
        out: impl Into<PathBuf>,
        name: impl Into<String>,
        ext: Option<String>,
        decl: DeclKind,
    ) -> (Arc<Target>, bool) {
        let key = TargetKey::new(ty, dir, out, name, ext);

        if let Some(t) = self.map.read().unwrap().get(&key) {
            t.promote_decl(decl);
            return (t.clone(), false);
        }

        let mut map = self.map.write().unwrap();
        if let Some(t) = map.get(&key) {
            t.promote_decl(decl);
            return (t.clone(), false);
        }
        let t = Arc::new(Target::new(key.clone(), ty, decl));
        map.insert(key, t.clone());
        (t, true)
    }

    /// Find or insert, also returning the construction mutex.
    pub fn insert_locked(
        &self,
        ty: &'static TargetType,
        dir: impl Into<PathBuf>,
        out: impl Into<PathBuf>,
        name: impl Into<String>,
        ext: Option<String>,
        decl: DeclKind,
    ) -> (Arc<Target>, bool, Arc<Mutex<()>>) {
        let (t, new) = self.insert(ty, dir, out, name, ext, decl);
        let m = t.build_mutex();
        (t, new, m)
    }

    pub fn find(&self, key: &TargetKey) -> Option<Arc<Target>> {
        self.map.read().unwrap().get(key).cloned()
    }

    /// Resolve a prerequisite to its target, inserting if necessary.
    pub fn search(&self, p: &Prerequisite) -> Arc<Target> {
        let decl = if p.ty.file {
            DeclKind::PrereqFile
        } else {
            DeclKind::PrereqNew
        };
        self.insert(
            p.ty,
            p.dir.clone(),
            p.out.clone(),
            p.name.clone(),
            p.ext.clone(),
            decl,
        )
        .0
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split a file name into (name, ext) the way target insertion expects.
pub fn split_name(leaf: &str) -> (String, Option<String>) {
    match leaf.rfind('.') {
        Some(i) if i > 0 => (leaf[..i].to_string(), Some(leaf[i + 1..].to_string())),
        _ => (leaf.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_lookup() {
        assert!(std::ptr::eq(TargetType::find("exe").unwrap(), &EXE));
        assert!(TargetType::find("nonesuch").is_none());
    }

    #[test]
    fn test_insert_identity() {
        let ts = TargetSet::new();
        let (a, new_a) = ts.insert(&OBJ, "/p/out", "", "main", Some("o".into()), DeclKind::Real);
        let (b, new_b) = ts.insert(&OBJ, "/p/out", "", "main", Some("o".into()), DeclKind::Implied);
        assert!(new_a);
        assert!(!new_b);
        assert!(Arc::ptr_eq(&a, &b));
        // Real declaration is not demoted by a later implied insert.
        assert_eq!(*a.decl.read().unwrap(), DeclKind::Real);
    }

    #[test]
    fn test_derive_path() {
        let ts = TargetSet::new();
        let (t, _) = ts.insert(&OBJ, "/p/out", "", "main", Some("o".into()), DeclKind::Real);
        assert_eq!(t.derive_path(None), PathBuf::from("/p/out/main.o"));
        // Idempotent.
        assert_eq!(t.derive_path(Some("obj")), PathBuf::from("/p/out/main.o"));
    }

    #[test]
    fn test_adhoc_member_chain() {
        let ts = TargetSet::new();
        let (bmi, _) = ts.insert(&BMI, "/o", "", "foo", None, DeclKind::Real);
        let (obj, _) = ts.insert(&OBJ, "/o", "", "foo", None, DeclKind::Real);
        bmi.add_adhoc_member(obj.clone());

        let found = bmi.find_adhoc_member(&OBJ).unwrap();
        assert!(Arc::ptr_eq(&found, &obj));
        // The member's group points back at the chain head.
        let g = obj.group.read().unwrap().as_ref().unwrap().upgrade().unwrap();
        assert!(Arc::ptr_eq(&g, &bmi));
    }

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("main.cxx"), ("main".into(), Some("cxx".into())));
        assert_eq!(split_name("Makefile"), ("Makefile".into(), None));
        assert_eq!(split_name(".hidden"), (".hidden".into(), None));
    }

    #[test]
    fn test_action_state() {
        let ts = TargetSet::new();
        let (t, _) = ts.insert(&FILE, "/o", "", "x", None, DeclKind::Real);
        let a = Action::update();
        assert_eq!(t.state(a), TargetState::Unmatched);
        t.set_state(a, TargetState::Matched);
        assert_eq!(t.state(a), TargetState::Matched);
        // Clean state is tracked independently.
        assert_eq!(t.state(Action::clean()), TargetState::Unmatched);
    }
}
