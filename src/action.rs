//! Actions
//!
//! An action is a meta-operation/operation pair. The core recognizes the
//! `perform` meta-operation with the `update`, `clean`, and `test`
//! operations; the data model leaves room for more without presupposing
//! them.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaOperation {
    Perform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Update,
    Clean,
    Test,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Clean => "clean",
            Self::Test => "test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "update" => Self::Update,
            "clean" => Self::Clean,
            "test" => Self::Test,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action {
    pub meta: MetaOperation,
    pub op: Operation,
}

impl Action {
    pub const fn new(meta: MetaOperation, op: Operation) -> Self {
        Self { meta, op }
    }

    pub const fn update() -> Self {
        Self::new(MetaOperation::Perform, Operation::Update)
    }

    pub const fn clean() -> Self {
        Self::new(MetaOperation::Perform, Operation::Clean)
    }

    pub const fn test() -> Self {
        Self::new(MetaOperation::Perform, Operation::Test)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "perform({})", self.op.name())
    }
}

/// Per-target, per-action state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// No rule has been matched yet.
    Unmatched,
    /// A rule matched and applied; a recipe is available.
    Matched,
    /// The recipe is running.
    Executing,
    /// The recipe ran and changed the target.
    Changed,
    /// The recipe ran and found the target up to date.
    Unchanged,
    /// The recipe (or a prerequisite) failed.
    Failed,
}

impl TargetState {
    /// True for the terminal execution states.
    pub fn executed(self) -> bool {
        matches!(self, Self::Changed | Self::Unchanged | Self::Failed)
    }
}
