//! mason - a build system core for C/C++
//!
//! This library provides the hard core of a build system: the buildfile
//! language (lexer, parser, name expansion), an incremental C/C++ compile
//! rule with first-class module and header-unit support backed by
//! per-target dependency databases, and a testscript language with a
//! parallel executor.

pub mod action;
pub mod buildfile;
pub mod cc;
pub mod context;
pub mod depdb;
pub mod diag;
pub mod filecache;
pub mod names;
pub mod process;
pub mod rule;
pub mod scheduler;
pub mod scope;
pub mod target;
pub mod testscript;
pub mod variable;

pub use action::{Action, Operation, TargetState};
pub use context::Context;
pub use diag::{Failed, Location};
pub use names::{Name, Names, Value, ValueType};
pub use scope::Scope;
pub use target::{Target, TargetSet, TargetType};
pub use variable::{VarPool, Variable, VariableMap};
