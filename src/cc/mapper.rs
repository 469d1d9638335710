//! Dynamic Module Mapper
//!
//! The GCC module mapper protocol served during preprocessing. Requests
//! and responses are line-oriented and batched with `;` separators:
//!
//! ```text
//! > HELLO <ver> <compiler> <ident>
//! < HELLO 1 mason
//! > MODULE-REPO
//! < PATHNAME .
//! > MODULE-IMPORT <name-or-path> [<flags>]
//! < PATHNAME <bmi>
//! > INCLUDE-TRANSLATE <path> [<flags>]
//! < BOOL TRUE|FALSE | PATHNAME <bmi>
//! ```
//!
//! When active, the mapper is the only source of header updates: every
//! included header passes through `INCLUDE-TRANSLATE`, is updated as a
//! prerequisite, and may be promoted to a header-unit import. A
//! malformed request is answered with `ERROR '<reason>'` and fails the
//! session at exit.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

/// The decision tables for include-to-import promotion.
#[derive(Debug, Default)]
pub struct TranslatableHeaders {
    /// Explicit per-header decisions.
    pub headers: IndexMap<PathBuf, bool>,
    /// Enabled groups: `all`, `all-importable`, `std-importable`.
    pub groups: Vec<String>,
    /// Headers known to be importable.
    pub importable: HashSet<PathBuf>,
    /// The std-importable subset.
    pub std_importable: HashSet<PathBuf>,
}

impl TranslatableHeaders {
    /// Should an include of this header be translated to an import?
    pub fn translate(&self, p: &Path) -> bool {
        if let Some(&t) = self.headers.get(p) {
            return t;
        }
        for g in &self.groups {
            let t = match g.as_str() {
                "all" => true,
                "all-importable" => self.importable.contains(p),
                "std-importable" => self.std_importable.contains(p),
                _ => false,
            };
            if t {
                return true;
            }
        }
        false
    }
}

/// What the mapper needs from the surrounding rule.
pub trait MapperWorld {
    /// Enter, remap, and update the header as a prerequisite; returns
    /// the effective (remapped) path.
    fn update_header(&mut self, path: &Path) -> Result<PathBuf, String>;

    /// Decide include-to-import promotion.
    fn translate(&mut self, path: &Path) -> bool;

    /// Synthesize (and update) the header-unit BMI side-build for the
    /// header; returns the BMI path.
    fn header_bmi(&mut self, path: &Path) -> Result<PathBuf, String>;

    /// Resolve a named module import to its BMI path.
    fn module_bmi(&mut self, name: &str) -> Option<PathBuf>;

    /// Record a header-unit/module mapping (an `@`-line in the dep-db).
    fn record(&mut self, name: &str, bmi: &Path);
}

/// One mapper session (per preprocessor run).
pub struct MapperSession<'w> {
    world: &'w mut dyn MapperWorld,
    failed: Option<String>,
}

impl<'w> MapperSession<'w> {
    pub fn new(world: &'w mut dyn MapperWorld) -> Self {
        Self {
            world,
            failed: None,
        }
    }

    /// The first protocol error, if any; the session must fail at exit.
    pub fn failure(&self) -> Option<&str> {
        self.failed.as_deref()
    }

    /// Serve one (possibly batched) request line.
    pub fn serve_line(&mut self, line: &str) -> String {
        let mut responses = Vec::new();
        for req in line.split(';') {
            responses.push(self.serve_one(req.trim()));
        }
        responses.join(";")
    }

    fn error(&mut self, reason: impl Into<String>) -> String {
        let reason = reason.into();
        if self.failed.is_none() {
            self.failed = Some(reason.clone());
        }
        format!("ERROR '{}'", reason)
    }

    fn serve_one(&mut self, req: &str) -> String {
        let mut parts = req.split_whitespace();
        let verb = match parts.next() {
            Some(v) => v,
            None => return self.error("empty request"),
        };

        match verb {
            "HELLO" => {
                // HELLO <ver> <compiler> <ident>
                match parts.next().map(|v| v.parse::<u32>()) {
                    Some(Ok(_)) => "HELLO 1 mason".to_string(),
                    _ => self.error("malformed HELLO request"),
                }
            }
            "MODULE-REPO" => "PATHNAME .".to_string(),
            "MODULE-IMPORT" => {
                let arg = match parts.next() {
                    Some(a) => unquote(a),
                    None => return self.error("malformed MODULE-IMPORT request"),
                };
                if is_header_ref(&arg) {
                    let p = PathBuf::from(arg);
                    match self.import_header(&p) {
                        Ok(bmi) => format!("PATHNAME {}", bmi.display()),
                        Err(e) => self.error(e),
                    }
                } else {
                    match self.world.module_bmi(&arg) {
                        Some(bmi) => format!("PATHNAME {}", bmi.display()),
                        None => self.error(format!("unable to resolve module {}", arg)),
                    }
                }
            }
            "INCLUDE-TRANSLATE" => {
                let arg = match parts.next() {
                    Some(a) => unquote(a),
                    None => return self.error("malformed INCLUDE-TRANSLATE request"),
                };
                let p = PathBuf::from(arg);
                let p = match self.world.update_header(&p) {
                    Ok(p) => p,
                    Err(e) => return self.error(e),
                };
                if self.world.translate(&p) {
                    match self.import_header(&p) {
                        Ok(bmi) => format!("PATHNAME {}", bmi.display()),
                        Err(e) => self.error(e),
                    }
                } else {
                    "BOOL FALSE".to_string()
                }
            }
            other => self.error(format!("unrecognized request {}", other)),
        }
    }

    fn import_header(&mut self, p: &Path) -> Result<PathBuf, String> {
        let bmi = self.world.header_bmi(p)?;
        let name = p.display().to_string();
        self.world.record(&format!("'{}'", name), &bmi);
        tracing::debug!(header = %name, bmi = %bmi.display(), "include translated");
        Ok(bmi)
    }
}

/// Header-unit references are quoted or absolute paths.
fn is_header_ref(s: &str) -> bool {
    s.contains('/') || s.contains('\\') || s.ends_with(".h") || s.ends_with(".hxx")
}

fn unquote(s: &str) -> String {
    s.trim_matches('"').trim_matches('\'').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct World {
        translate_all: bool,
        std_set: HashSet<PathBuf>,
        updated: Vec<PathBuf>,
        recorded: Vec<(String, PathBuf)>,
        missing: bool,
    }

    impl MapperWorld for World {
        fn update_header(&mut self, path: &Path) -> Result<PathBuf, String> {
            if self.missing {
                return Err(format!("unable to update header {}", path.display()));
            }
            self.updated.push(path.to_path_buf());
            Ok(path.to_path_buf())
        }

        fn translate(&mut self, path: &Path) -> bool {
            self.translate_all || self.std_set.contains(path)
        }

        fn header_bmi(&mut self, path: &Path) -> Result<PathBuf, String> {
            let stem = path.file_name().unwrap().to_string_lossy();
            Ok(PathBuf::from(format!("/side/{}-abc123.gcm", stem)))
        }

        fn module_bmi(&mut self, name: &str) -> Option<PathBuf> {
            (name == "hello.core").then(|| PathBuf::from("/out/hello-core.gcm"))
        }

        fn record(&mut self, name: &str, bmi: &Path) {
            self.recorded.push((name.to_string(), bmi.to_path_buf()));
        }
    }

    #[test]
    fn test_hello_and_repo() {
        let mut w = World::default();
        let mut s = MapperSession::new(&mut w);
        assert_eq!(s.serve_line("HELLO 1 GCC ident"), "HELLO 1 mason");
        assert_eq!(s.serve_line("MODULE-REPO"), "PATHNAME .");
        assert!(s.failure().is_none());
    }

    #[test]
    fn test_include_not_translated() {
        let mut w = World::default();
        let mut s = MapperSession::new(&mut w);
        let r = s.serve_line("INCLUDE-TRANSLATE /usr/include/plain.h");
        assert_eq!(r, "BOOL FALSE");
        drop(s);
        assert_eq!(w.updated, vec![PathBuf::from("/usr/include/plain.h")]);
    }

    #[test]
    fn test_include_translated_to_header_unit() {
        let mut w = World {
            std_set: [PathBuf::from("/usr/include/c++/vector")].into(),
            ..Default::default()
        };
        let mut s = MapperSession::new(&mut w);
        let r = s.serve_line("INCLUDE-TRANSLATE /usr/include/c++/vector");
        assert_eq!(r, "PATHNAME /side/vector-abc123.gcm");
        drop(s);
        assert_eq!(w.recorded.len(), 1);
        assert_eq!(w.recorded[0].0, "'/usr/include/c++/vector'");
    }

    #[test]
    fn test_module_import() {
        let mut w = World::default();
        let mut s = MapperSession::new(&mut w);
        let r = s.serve_line("MODULE-IMPORT hello.core");
        assert_eq!(r, "PATHNAME /out/hello-core.gcm");

        let r = s.serve_line("MODULE-IMPORT no.such.module");
        assert!(r.starts_with("ERROR '"));
        assert!(s.failure().is_some());
    }

    #[test]
    fn test_batched_requests() {
        let mut w = World::default();
        let mut s = MapperSession::new(&mut w);
        let r = s.serve_line("HELLO 1 GCC x;MODULE-REPO");
        assert_eq!(r, "HELLO 1 mason;PATHNAME .");
    }

    #[test]
    fn test_protocol_violation() {
        let mut w = World::default();
        let mut s = MapperSession::new(&mut w);
        let r = s.serve_line("FROBNICATE x");
        assert_eq!(r, "ERROR 'unrecognized request FROBNICATE'");
        assert_eq!(s.failure(), Some("unrecognized request FROBNICATE"));
    }

    #[test]
    fn test_failed_header_update() {
        let mut w = World {
            missing: true,
            ..Default::default()
        };
        let mut s = MapperSession::new(&mut w);
        let r = s.serve_line("INCLUDE-TRANSLATE /gen/missing.h");
        assert!(r.starts_with("ERROR 'unable to update header"));
    }

    #[test]
    fn test_translatable_groups() {
        let mut th = TranslatableHeaders::default();
        let v = PathBuf::from("/usr/include/c++/vector");
        let m = PathBuf::from("/my/own.h");
        th.importable.insert(v.clone());
        th.std_importable.insert(v.clone());

        assert!(!th.translate(&v));
        th.groups.push("std-importable".into());
        assert!(th.translate(&v));
        assert!(!th.translate(&m));

        th.groups.push("all".into());
        assert!(th.translate(&m));

        // Explicit per-header decision wins.
        th.headers.insert(m.clone(), false);
        assert!(!th.translate(&m));
    }
}
