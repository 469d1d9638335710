//! The testscript language
//!
//! Two-phase interpretation: a pre-parse pass builds the scope tree out
//! of saved token lines, and the runner walks it, dispatching child
//! scopes in parallel.

pub mod lexer;
pub mod parser;
pub mod runner;
pub mod script;

pub use parser::Parser;
pub use runner::{Runner, TestConfig};
pub use script::{Description, Line, LineType, ScopeKind, ScopeState, Script, TestScope};
