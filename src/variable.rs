//! Variables
//!
//! Variables are pooled: a name maps to exactly one `Variable` entry for
//! the lifetime of the process and the entry's address (Arc identity) is
//! stable. The pool is shared between threads; insertion takes a write
//! lock (the testscript `set` builtin inserts during execution), lookup a
//! read lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use crate::names::{Value, ValueType};

/// Variable visibility: how far down the scope hierarchy a value set at
/// some level is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Visibility {
    /// Visible everywhere.
    Global,
    /// Visible in the project and its subprojects.
    Project,
    /// Visible in this scope and below.
    Scope,
    /// Visible in target-specific maps only.
    Target,
    /// Visible in prerequisite-specific maps only.
    Prereq,
}

/// A pooled variable declaration.
#[derive(Debug)]
pub struct Variable {
    pub name: String,
    pub visibility: Visibility,
    /// Whether command-line/config overrides may apply to this variable.
    pub overridable: bool,
    /// Optional type; typed variables convert on assignment.
    pub ty: RwLock<Option<ValueType>>,
}

impl Variable {
    pub fn ty(&self) -> Option<ValueType> {
        *self.ty.read().unwrap()
    }
}

/// The process-wide variable pool.
#[derive(Debug, Default)]
pub struct VarPool {
    map: RwLock<HashMap<String, Arc<Variable>>>,
}

impl VarPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a variable, returning the existing entry if already pooled.
    ///
    /// An existing entry keeps its visibility and overridability; a type
    /// may be refined from untyped to typed but never changed between
    /// types (the caller diagnoses the conflict).
    pub fn insert(
        &self,
        name: impl Into<String>,
        visibility: Visibility,
        overridable: bool,
        ty: Option<ValueType>,
    ) -> Arc<Variable> {
        let name = name.into();
        let mut map = self.map.write().unwrap();
        if let Some(v) = map.get(&name) {
            if let Some(t) = ty {
                let mut vt = v.ty.write().unwrap();
                if vt.is_none() {
                    *vt = Some(t);
                }
            }
            return v.clone();
        }

        let v = Arc::new(Variable {
            name: name.clone(),
            visibility,
            overridable,
            ty: RwLock::new(ty),
        });
        map.insert(name, v.clone());
        v
    }

    /// Insert with the default (scope) visibility.
    pub fn insert_scoped(&self, name: impl Into<String>) -> Arc<Variable> {
        self.insert(name, Visibility::Scope, false, None)
    }

    pub fn find(&self, name: &str) -> Option<Arc<Variable>> {
        self.map.read().unwrap().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A variable-to-value map in declaration order.
///
/// Scopes, targets, and prerequisites each own one.
#[derive(Debug, Default, Clone)]
pub struct VariableMap {
    map: IndexMap<String, (Arc<Variable>, Value)>,
}

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign, converting to the variable's type if it has one.
    pub fn assign(
        &mut self,
        var: &Arc<Variable>,
        mut value: Value,
    ) -> Result<(), crate::names::ConvertError> {
        if let Some(t) = var.ty() {
            if value.ty != Some(t) {
                value.convert_to(t)?;
            }
        }
        self.map.insert(var.name.clone(), (var.clone(), value));
        Ok(())
    }

    /// Append to an existing value (the `+=` form); assigns if unset.
    pub fn append(
        &mut self,
        var: &Arc<Variable>,
        value: Value,
    ) -> Result<(), crate::names::ConvertError> {
        match self.map.get_mut(&var.name) {
            Some((_, v)) => {
                v.append_names(value.names);
                if let Some(t) = var.ty() {
                    v.convert_to(t)?;
                }
                Ok(())
            }
            None => self.assign(var, value),
        }
    }

    /// Prepend to an existing value (the `=+` form); assigns if unset.
    pub fn prepend(
        &mut self,
        var: &Arc<Variable>,
        mut value: Value,
    ) -> Result<(), crate::names::ConvertError> {
        match self.map.get_mut(&var.name) {
            Some((_, v)) => {
                value.names.extend(std::mem::take(&mut v.names));
                v.names = value.names;
                v.null = false;
                if let Some(t) = var.ty() {
                    v.convert_to(t)?;
                }
                Ok(())
            }
            None => self.assign(var, value),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name).map(|(_, v)| v)
    }

    pub fn get_entry(&self, name: &str) -> Option<(&Arc<Variable>, &Value)> {
        self.map.get(name).map(|(var, v)| (var, v))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<Variable>, &Value)> {
        self.map.values().map(|(var, v)| (var, v))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::Name;

    #[test]
    fn test_pool_pointer_stability() {
        let pool = VarPool::new();
        let a = pool.insert("cxx.std", Visibility::Project, true, None);
        let b = pool.find("cxx.std").unwrap();
        let c = pool.insert("cxx.std", Visibility::Scope, false, None);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        // The original declaration wins.
        assert_eq!(c.visibility, Visibility::Project);
        assert!(c.overridable);
    }

    #[test]
    fn test_pool_type_refinement() {
        let pool = VarPool::new();
        let v = pool.insert("verbose", Visibility::Global, false, None);
        assert_eq!(v.ty(), None);
        pool.insert("verbose", Visibility::Global, false, Some(ValueType::Bool));
        assert_eq!(v.ty(), Some(ValueType::Bool));
    }

    #[test]
    fn test_map_assign_converts() {
        let pool = VarPool::new();
        let var = pool.insert("jobs", Visibility::Global, false, Some(ValueType::U64));
        let mut m = VariableMap::new();
        m.assign(&var, Value::from_names(vec![Name::simple("8")]))
            .unwrap();
        assert_eq!(m.get("jobs").unwrap().as_u64(), Ok(8));

        let r = m.assign(&var, Value::from_names(vec![Name::simple("many")]));
        assert!(r.is_err());
    }

    #[test]
    fn test_map_append_prepend() {
        let pool = VarPool::new();
        let var = pool.insert_scoped("cxx.poptions");
        let mut m = VariableMap::new();
        m.assign(&var, Value::from_names(vec![Name::simple("-DA")]))
            .unwrap();
        m.append(&var, Value::from_names(vec![Name::simple("-DB")]))
            .unwrap();
        m.prepend(&var, Value::from_names(vec![Name::simple("-DZ")]))
            .unwrap();
        let v = m.get("cxx.poptions").unwrap();
        let s: Vec<_> = v.names.iter().map(|n| n.value.as_str()).collect();
        assert_eq!(s, ["-DZ", "-DA", "-DB"]);
    }
}
