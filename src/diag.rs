//! Diagnostics
//!
//! Source locations, located error types, and the `Failed` sentinel that
//! propagates across scope and rule boundaries once a diagnostic has been
//! issued. Recovery paths (for example the header-extraction restart loop)
//! use their own error types and never reuse the sentinel.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// A position in an input file.
///
/// Lines and columns are 1-based; zero means "unknown" and is not printed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Location {
    pub path: Option<Arc<PathBuf>>,
    pub line: u64,
    pub column: u64,
}

impl Location {
    pub fn new(path: Arc<PathBuf>, line: u64, column: u64) -> Self {
        Self {
            path: Some(path),
            line,
            column,
        }
    }

    /// A location with a path but no line information.
    pub fn path_only(path: Arc<PathBuf>) -> Self {
        Self {
            path: Some(path),
            line: 0,
            column: 0,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => {
                write!(f, "{}", p.display())?;
                if self.line != 0 {
                    write!(f, ":{}", self.line)?;
                    if self.column != 0 {
                        write!(f, ":{}", self.column)?;
                    }
                }
                Ok(())
            }
            None => write!(f, "<unknown>"),
        }
    }
}

/// Sentinel raised after a diagnostic has been issued.
///
/// By the time this error is observed the user has already seen the real
/// message; callers unwind without printing anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed")]
pub struct Failed;

/// Issue an error diagnostic and return the `Failed` sentinel.
pub fn fail(msg: impl fmt::Display) -> Failed {
    tracing::error!("error: {}", msg);
    Failed
}

/// Issue a located error diagnostic and return the `Failed` sentinel.
pub fn fail_at(loc: &Location, msg: impl fmt::Display) -> Failed {
    tracing::error!("{}: error: {}", loc, msg);
    Failed
}

/// Issue a warning diagnostic.
pub fn warn(msg: impl fmt::Display) {
    tracing::warn!("warning: {}", msg);
}

/// Located parse error.
///
/// Unlike `Failed`, this carries the message so that callers replaying
/// saved tokens (testscript lines, for loops) can re-issue it with an
/// adjusted location.
#[derive(Debug, Clone, Error)]
#[error("{location}: error: {message}")]
pub struct ParseError {
    pub location: Location,
    pub message: String,
}

impl ParseError {
    pub fn new(location: Location, message: impl Into<String>) -> Self {
        Self {
            location,
            message: message.into(),
        }
    }
}

/// I/O failure with the originating path.
#[derive(Debug, Error)]
#[error("unable to {operation} {path}: {source}")]
pub struct IoError {
    pub operation: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl IoError {
    pub fn new(operation: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self {
            operation,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display() {
        let p = Arc::new(PathBuf::from("dir/buildfile"));
        let l = Location::new(p.clone(), 12, 3);
        assert_eq!(l.to_string(), "dir/buildfile:12:3");

        let l = Location::path_only(p);
        assert_eq!(l.to_string(), "dir/buildfile");

        let l = Location::default();
        assert_eq!(l.to_string(), "<unknown>");
    }

    #[test]
    fn test_parse_error_message() {
        let p = Arc::new(PathBuf::from("t"));
        let e = ParseError::new(Location::new(p, 1, 2), "unexpected '}'");
        assert_eq!(e.to_string(), "t:1:2: error: unexpected '}'");
    }
}
