//! MSVC Output Parsing
//!
//! Header dependency extraction from `/showIncludes` output. Include
//! notes yield header paths; a C1083 "cannot open include file" line
//! identifies the missing header and makes the non-zero compiler exit
//! tolerable (`good_error`): the missing header may well be generated.

use std::path::PathBuf;

use lazy_static::lazy_static;
use regex_lite::Regex;

lazy_static! {
    /// `Note: including file:   <path>` (indentation encodes depth).
    static ref INCLUDE_NOTE: Regex =
        Regex::new(r"^Note: including file:\s+(.+?)\s*$").unwrap();

    /// `...: fatal error C1083: Cannot open include file: 'x.h': ...`
    static ref MISSING_INCLUDE: Regex =
        Regex::new(r"fatal error C1083: [^:]*: '([^']+)'").unwrap();
}

/// Parsed `/showIncludes` output.
#[derive(Debug, Default)]
pub struct ShowIncludes {
    pub headers: Vec<PathBuf>,
    /// Header named by a C1083 error, if any.
    pub missing: Option<String>,
    /// The compiler failed only because of the missing include; the
    /// caller may treat the non-zero exit as recoverable.
    pub good_error: bool,
}

/// Parse `/showIncludes` diagnostics.
///
/// The first line echoes the source file name; command-line warnings
/// (D9xxx) on the leading lines are tolerated. Parsing stops at the
/// first C1083 error.
pub fn parse_show_includes(output: &str) -> ShowIncludes {
    let mut r = ShowIncludes::default();
    let mut first = true;

    for line in output.lines() {
        if let Some(c) = INCLUDE_NOTE.captures(line) {
            r.headers.push(PathBuf::from(c.get(1).unwrap().as_str()));
            first = false;
            continue;
        }
        if let Some(c) = MISSING_INCLUDE.captures(line) {
            r.missing = Some(c.get(1).unwrap().as_str().to_string());
            r.good_error = true;
            break;
        }
        if first {
            // Source name echo or a command-line warning.
            first = false;
            continue;
        }
        if line.contains("warning D") {
            continue;
        }
        // Any other diagnostic line: a real error may follow; keep
        // scanning for C1083 but remember nothing.
    }

    r
}
