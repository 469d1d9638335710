//! Testscript Data Model
//!
//! The pre-parsed form of a testscript: a tree of group and test scopes
//! whose lines are saved token sequences replayed at execution time.

use std::collections::HashSet;
use std::path::PathBuf;

use indexmap::IndexMap;

use crate::testscript::lexer::Token;

/// Classified line type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineType {
    /// Variable assignment.
    Var,
    /// A command (pipeline expression).
    Cmd,
    CmdIf,
    CmdIfn,
    CmdElif,
    CmdElifn,
    CmdElse,
    CmdEnd,
    CmdWhile,
    /// `for x <stream` (elements read from a stream).
    CmdForStream,
    /// `for x: a b c` (elements from a value).
    CmdForArgs,
}

/// One pre-parsed line: its type and the replay token sequence.
#[derive(Debug, Clone)]
pub struct Line {
    pub ty: LineType,
    pub tokens: Vec<Token>,
    /// For Var lines, the variable name.
    pub var: Option<String>,
    pub line: u64,
}

/// Test/group description from leading (`: id`, `: summary`, further
/// `: details`) or trailing (`cmd : one-liner`) comments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    pub id: Option<String>,
    pub summary: Option<String>,
    pub details: Vec<String>,
}

impl Description {
    pub fn empty(&self) -> bool {
        self.id.is_none() && self.summary.is_none() && self.details.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Group,
    Test,
}

/// Result state of an executed scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    NotRun,
    Passed,
    Failed,
}

/// A testscript scope: a group (setup + child scopes + teardown) or a
/// test (command lines).
#[derive(Debug)]
pub struct TestScope {
    pub kind: ScopeKind,
    /// Id path component (explicit from description or synthesized from
    /// the line number, possibly include-prefixed).
    pub id: String,
    pub desc: Description,
    pub start_line: u64,
    pub end_line: u64,

    /// Group: setup lines. Test: the command lines.
    pub setup: Vec<Line>,
    /// Group only.
    pub children: Vec<TestScope>,
    pub teardown: Vec<Line>,

    /// Scope-if condition line; the scope only runs if it holds.
    pub if_cond: Option<Line>,
    /// Negate the condition (`if!`/`elif!`).
    pub if_negated: bool,
    /// Next branch in the if-else chain (owned by the same parent; the
    /// chain is a run of consecutive children).
    pub if_chain: bool,
}

impl TestScope {
    pub fn new(kind: ScopeKind, id: impl Into<String>, start_line: u64) -> Self {
        Self {
            kind,
            id: id.into(),
            desc: Description::default(),
            start_line,
            end_line: start_line,
            setup: Vec::new(),
            children: Vec::new(),
            teardown: Vec::new(),
            if_cond: None,
            if_negated: false,
            if_chain: false,
        }
    }

    /// True if this group-shaped scope can be demoted to a test
    /// (syntax-1 `{ ... }` block containing exactly one test with no
    /// non-variable setup, no teardown, and no description or condition
    /// on the inner test).
    pub fn demotable(&self) -> bool {
        self.kind == ScopeKind::Group
            && self.children.len() == 1
            && self.children[0].kind == ScopeKind::Test
            && self.children[0].desc.empty()
            && self.children[0].if_cond.is_none()
            && self.teardown.is_empty()
            && self.setup.iter().all(|l| l.ty == LineType::Var)
    }
}

/// A parsed testscript file.
#[derive(Debug)]
pub struct Script {
    pub path: PathBuf,
    /// Language dialect (`testscript.syntax`), 1 or 2.
    pub syntax: u32,
    pub root: TestScope,
}

/// Per-group id bookkeeping with collision detection.
#[derive(Debug, Default)]
pub struct IdMap {
    ids: IndexMap<String, u64>,
}

impl IdMap {
    pub fn insert(&mut self, id: &str, line: u64) -> Result<(), u64> {
        if let Some(prev) = self.ids.get(id) {
            return Err(*prev);
        }
        self.ids.insert(id.to_string(), line);
        Ok(())
    }
}

/// Per-group include set for `.include --once`.
#[derive(Debug, Default)]
pub struct IncludeSet {
    seen: HashSet<PathBuf>,
}

impl IncludeSet {
    /// Returns false if the file was already included once.
    pub fn enter(&mut self, p: PathBuf) -> bool {
        self.seen.insert(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_map_collision() {
        let mut m = IdMap::default();
        m.insert("basics", 3).unwrap();
        assert_eq!(m.insert("basics", 9), Err(3));
        m.insert("10", 10).unwrap();
    }

    #[test]
    fn test_include_once() {
        let mut s = IncludeSet::default();
        assert!(s.enter(PathBuf::from("common.testscript")));
        assert!(!s.enter(PathBuf::from("common.testscript")));
    }

    #[test]
    fn test_demotable() {
        let mut g = TestScope::new(ScopeKind::Group, "1", 1);
        let t = TestScope::new(ScopeKind::Test, "2", 2);
        g.children.push(t);
        assert!(g.demotable());

        g.children[0].desc.id = Some("named".into());
        assert!(!g.demotable());
    }
}
