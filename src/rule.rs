//! Rules and Recipes
//!
//! A rule is a capability set: it can decide whether it matches a target
//! for an action and, when it does, produce a recipe. A recipe operates on
//! the target and reports the resulting state. Both are open enumerations
//! and therefore traits; ad hoc (buildfile-defined) recipes are data that
//! an adapter rule turns into recipes.

use std::fmt;
use std::sync::Arc;

use crate::action::{Action, Operation, TargetState};
use crate::context::Context;
use crate::diag::{Failed, Location};
use crate::target::Target;

/// A recipe: brings the target to the requested state for the action it
/// was synthesized for.
pub type Recipe =
    Arc<dyn Fn(&Context, Action, &Arc<Target>) -> Result<TargetState, Failed> + Send + Sync>;

/// A recipe that does nothing (for example clean of a source file).
pub fn noop_recipe() -> Recipe {
    Arc::new(|_, _, _| Ok(TargetState::Unchanged))
}

pub trait Rule: Send + Sync {
    /// Rule id as recorded in dependency databases and diagnostics.
    fn name(&self) -> &'static str;

    fn matches(&self, ctx: &Context, a: Action, t: &Arc<Target>) -> bool;

    /// Synthesize the recipe. Takes the shared handle so the recipe can
    /// capture the rule.
    fn apply(self: Arc<Self>, ctx: &Context, a: Action, t: &Arc<Target>) -> Result<Recipe, Failed>;
}

/// Language of an ad hoc recipe block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipeLang {
    /// The default build language.
    Buildscript,
    /// A C++ recipe with the language version and optional fragment
    /// separator from the lang tag line.
    Cxx {
        version: String,
        separator: Option<String>,
    },
}

/// An ad hoc recipe block attached to a dependency declaration.
#[derive(Debug, Clone)]
pub struct AdhocRecipe {
    /// Operations this recipe applies to; empty means the default
    /// (update) operation.
    pub actions: Vec<Operation>,
    pub lang: RecipeLang,
    /// The raw block text, braces excluded.
    pub text: String,
    pub location: Location,
}

impl AdhocRecipe {
    pub fn applies_to(&self, op: Operation) -> bool {
        if self.actions.is_empty() {
            op == Operation::Update
        } else {
            self.actions.contains(&op)
        }
    }
}

/// An ad hoc pattern rule: a dependency declaration whose primary targets
/// are all patterns and which carries a body. Registered on the enclosing
/// scope and consulted during rule matching.
#[derive(Debug)]
pub struct AdhocPatternRule {
    /// Pattern names of the primary targets (type, glob pattern).
    pub targets: Vec<(&'static crate::target::TargetType, String)>,
    /// Prerequisite patterns/names as written.
    pub prereqs: Vec<crate::names::Name>,
    pub recipes: Vec<AdhocRecipe>,
    pub location: Location,
}

impl fmt::Display for AdhocPatternRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "adhoc pattern rule at {}", self.location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adhoc_recipe_action_filter() {
        let r = AdhocRecipe {
            actions: vec![],
            lang: RecipeLang::Buildscript,
            text: "echo hi".into(),
            location: Location::default(),
        };
        assert!(r.applies_to(Operation::Update));
        assert!(!r.applies_to(Operation::Clean));

        let r = AdhocRecipe {
            actions: vec![Operation::Clean],
            ..r
        };
        assert!(r.applies_to(Operation::Clean));
        assert!(!r.applies_to(Operation::Update));
    }
}
