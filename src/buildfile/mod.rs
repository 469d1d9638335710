//! The buildfile language
//!
//! Mode-driven lexer, evaluating parser, name pattern expansion, and the
//! builtin function table.

pub mod adhoc;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod pattern;

pub use lexer::{Lexer, LexerError, Mode, QuoteType, Token, TokenType};
pub use parser::{Attributes, Parser};
