//! Translation Unit and Compiler Types
//!
//! Unit classification, module information, and the serialized form of
//! both in the dependency database. The compiler itself is described by
//! a fixed `CompilerInfo` record produced by toolchain probing outside
//! the core.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Translation unit classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnitType {
    #[default]
    NonModular,
    /// `module foo;`
    ModuleImpl,
    /// `export module foo;`
    ModuleIntf,
    /// `export module foo:part;`
    ModuleIntfPart,
    /// `module foo:part;`
    ModuleImplPart,
    /// A header compiled as a module (identified by absolute path).
    ModuleHeader,
}

impl UnitType {
    pub fn modular(self) -> bool {
        self != Self::NonModular
    }

    /// True for units that produce a binary module interface.
    pub fn produces_bmi(self) -> bool {
        matches!(
            self,
            Self::ModuleIntf | Self::ModuleIntfPart | Self::ModuleHeader
        )
    }
}

/// Kind of an import declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    /// `import foo;`
    ModuleIntf,
    /// `import :part;` (resolved against the importing module).
    ModulePart,
    /// `import "header"` / `import <header>`.
    ModuleHeader,
}

/// One import of a translation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImport {
    pub kind: ImportKind,
    /// Module name, or the absolute header path for header units.
    pub name: String,
    /// `export import`.
    pub exported: bool,
    /// Fuzzy-match score filled in during resolution.
    pub score: u64,
}

impl ModuleImport {
    pub fn new(kind: ImportKind, name: impl Into<String>, exported: bool) -> Self {
        Self {
            kind,
            name: name.into(),
            exported,
            score: 0,
        }
    }
}

/// Module information of a translation unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Module name (absolute path for header units); empty for
    /// non-modular units.
    pub name: String,
    pub imports: Vec<ModuleImport>,
}

/// A classified translation unit.
#[derive(Debug, Clone, Default)]
pub struct TranslationUnit {
    pub ty: UnitType,
    pub module_info: ModuleInfo,
    /// Content checksum (hex SHA-256).
    pub checksum: String,
}

// The module type/info string stored in the dependency database. The
// grammar is a space-separated list:
//
//   tu       := [unit] [imports]
//   unit     := name marker        ; '!' interface/partition/header-unit,
//                                  ; '+' implementation (partition)
//   imports  := (SP import)*
//   import   := name ['*']         ; '*' = re-exported
//   name     := WORD | '"' PATH '"'
//
// Header-unit names are quoted absolute paths. Imported header units are
// omitted: the module mapper owns those mappings and re-resolving an
// import declaration to an absolute path would require real work.

/// Encode unit type and module info into the dep-db string form.
pub fn to_module_string(ut: UnitType, mi: &ModuleInfo) -> String {
    let mut s = String::new();

    if ut != UnitType::NonModular {
        if ut == UnitType::ModuleHeader {
            s.push('"');
            s.push_str(&mi.name);
            s.push('"');
        } else {
            s.push_str(&mi.name);
        }
        s.push(match ut {
            UnitType::ModuleImpl | UnitType::ModuleImplPart => '+',
            _ => '!',
        });
    }

    for i in &mi.imports {
        if i.kind == ImportKind::ModuleHeader {
            continue; // See the grammar note above.
        }
        if !s.is_empty() {
            s.push(' ');
        }
        s.push_str(&i.name);
        if i.exported {
            s.push('*');
        }
    }

    s
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid module info string: {reason}")]
pub struct ModuleStringError {
    pub reason: String,
}

/// Decode the dep-db string form back into unit type and module info.
pub fn from_module_string(s: &str) -> Result<(UnitType, ModuleInfo), ModuleStringError> {
    let mut ut = UnitType::NonModular;
    let mut mi = ModuleInfo::default();

    let mut rest = s.trim();
    while !rest.is_empty() {
        let (word, quoted, tail) = if let Some(r) = rest.strip_prefix('"') {
            let end = r.find('"').ok_or_else(|| ModuleStringError {
                reason: "unterminated quoted name".into(),
            })?;
            (&r[..end], true, r[end + 1..].trim_start())
        } else {
            match rest.find(' ') {
                Some(i) => (&rest[..i], false, rest[i + 1..].trim_start()),
                None => (rest, false, ""),
            }
        };

        // The marker may trail the word (unquoted) or the closing quote.
        let (word, marker, tail) = if quoted {
            match tail.chars().next() {
                Some(c @ ('!' | '+' | '*')) => (word, Some(c), tail[1..].trim_start()),
                _ => (word, None, tail),
            }
        } else {
            match word.chars().last() {
                Some(c @ ('!' | '+' | '*')) => (&word[..word.len() - 1], Some(c), tail),
                _ => (word, None, tail),
            }
        };

        if word.is_empty() {
            return Err(ModuleStringError {
                reason: "empty name".into(),
            });
        }

        match marker {
            Some(m @ ('!' | '+')) => {
                if ut != UnitType::NonModular || !mi.name.is_empty() || !mi.imports.is_empty() {
                    return Err(ModuleStringError {
                        reason: "unit marker after imports".into(),
                    });
                }
                ut = if quoted {
                    UnitType::ModuleHeader
                } else if word.contains(':') {
                    if m == '!' {
                        UnitType::ModuleIntfPart
                    } else {
                        UnitType::ModuleImplPart
                    }
                } else if m == '!' {
                    UnitType::ModuleIntf
                } else {
                    UnitType::ModuleImpl
                };
                mi.name = word.to_string();
            }
            Some('*') | None => {
                let kind = if quoted {
                    ImportKind::ModuleHeader
                } else if word.starts_with(':') {
                    ImportKind::ModulePart
                } else {
                    ImportKind::ModuleIntf
                };
                mi.imports
                    .push(ModuleImport::new(kind, word, marker == Some('*')));
            }
            _ => unreachable!(),
        }

        rest = tail;
    }

    Ok((ut, mi))
}

// -- Compiler description -------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerId {
    Gcc,
    Clang,
    Msvc,
}

/// Compiler "class": what the command-line dialect looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilerClass {
    Gcc,
    Msvc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetOs {
    Linux,
    Bsd,
    Macos,
    Windows,
}

/// The language being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    C,
    Cxx,
}

impl fmt::Display for Lang {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::C => "c",
            Self::Cxx => "c++",
        })
    }
}

/// Fixed record describing the configured compiler; produced by the
/// toolchain probe outside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerInfo {
    pub id: CompilerId,
    pub class: CompilerClass,
    pub version_major: u32,
    pub version_minor: u32,
    /// Path to the compiler binary.
    pub path: PathBuf,
    /// Checksum identifying the compiler build.
    pub checksum: String,
    /// Checksum over the compiler-relevant environment variables.
    pub env_checksum: String,
    pub target_os: TargetOs,
    /// The compiler supports C++ modules.
    pub modules: bool,
    /// GCC-style dynamic module mapper support.
    pub module_mapper: bool,
    /// Separate preprocessing is usable for dependency extraction.
    pub separate_preprocess: bool,
    /// MSVC: std modules directory for /module:stdIfcDir.
    #[serde(default)]
    pub std_ifc_dir: Option<PathBuf>,
}

impl CompilerInfo {
    /// A plausible GCC description for tests.
    pub fn test_gcc() -> Self {
        Self {
            id: CompilerId::Gcc,
            class: CompilerClass::Gcc,
            version_major: 12,
            version_minor: 2,
            path: PathBuf::from("g++"),
            checksum: "gcc-12.2-checksum".into(),
            env_checksum: "env-checksum".into(),
            target_os: TargetOs::Linux,
            modules: true,
            module_mapper: true,
            separate_preprocess: true,
            std_ifc_dir: None,
        }
    }

    pub fn test_msvc() -> Self {
        Self {
            id: CompilerId::Msvc,
            class: CompilerClass::Msvc,
            version_major: 19,
            version_minor: 29,
            path: PathBuf::from("cl"),
            checksum: "msvc-19.29-checksum".into(),
            env_checksum: "env-checksum".into(),
            target_os: TargetOs::Windows,
            modules: true,
            module_mapper: false,
            separate_preprocess: true,
            std_ifc_dir: Some(PathBuf::from("C:/VC/ifc")),
        }
    }

    /// Object file extension for the target OS.
    pub fn obj_ext(&self) -> &'static str {
        match self.target_os {
            TargetOs::Windows => "obj",
            _ => "o",
        }
    }

    /// BMI extension for the compiler flavor.
    pub fn bmi_ext(&self) -> &'static str {
        match self.id {
            CompilerId::Gcc => "gcm",
            CompilerId::Clang => "pcm",
            CompilerId::Msvc => "ifc",
        }
    }
}

/// Hex SHA-256 over a byte stream.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    h.update(data);
    let d = h.finalize();
    let mut s = String::with_capacity(64);
    for b in d {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(ut: UnitType, mi: &ModuleInfo) -> (UnitType, ModuleInfo) {
        let s = to_module_string(ut, mi);
        from_module_string(&s).unwrap()
    }

    #[test]
    fn test_non_modular_empty() {
        let (ut, mi) = roundtrip(UnitType::NonModular, &ModuleInfo::default());
        assert_eq!(ut, UnitType::NonModular);
        assert!(mi.name.is_empty());
        assert!(mi.imports.is_empty());
    }

    #[test]
    fn test_interface_with_imports() {
        let mi = ModuleInfo {
            name: "foo".into(),
            imports: vec![
                ModuleImport::new(ImportKind::ModuleIntf, "foo.core", true),
                ModuleImport::new(ImportKind::ModuleIntf, "foo.base", false),
                ModuleImport::new(ImportKind::ModulePart, ":intf", false),
            ],
        };
        let s = to_module_string(UnitType::ModuleIntf, &mi);
        assert_eq!(s, "foo! foo.core* foo.base :intf");

        let (ut, got) = from_module_string(&s).unwrap();
        assert_eq!(ut, UnitType::ModuleIntf);
        assert_eq!(got, mi);
    }

    #[test]
    fn test_impl_partition() {
        let mi = ModuleInfo {
            name: "foo:impl".into(),
            imports: vec![],
        };
        let s = to_module_string(UnitType::ModuleImplPart, &mi);
        assert_eq!(s, "foo:impl+");
        let (ut, got) = from_module_string(&s).unwrap();
        assert_eq!(ut, UnitType::ModuleImplPart);
        assert_eq!(got.name, "foo:impl");
    }

    #[test]
    fn test_header_unit_quoted() {
        let mi = ModuleInfo {
            name: "/usr/include/stdio.h".into(),
            imports: vec![],
        };
        let s = to_module_string(UnitType::ModuleHeader, &mi);
        assert_eq!(s, "\"/usr/include/stdio.h\"!");
        let (ut, got) = from_module_string(&s).unwrap();
        assert_eq!(ut, UnitType::ModuleHeader);
        assert_eq!(got.name, "/usr/include/stdio.h");
    }

    #[test]
    fn test_header_imports_dropped() {
        // Round trip is modulo header-unit import dropping.
        let mi = ModuleInfo {
            name: "foo".into(),
            imports: vec![
                ModuleImport::new(ImportKind::ModuleHeader, "/usr/include/vector", false),
                ModuleImport::new(ImportKind::ModuleIntf, "bar", false),
            ],
        };
        let s = to_module_string(UnitType::ModuleIntf, &mi);
        assert_eq!(s, "foo! bar");
        let (_, got) = from_module_string(&s).unwrap();
        assert_eq!(got.imports.len(), 1);
        assert_eq!(got.imports[0].name, "bar");
    }

    #[test]
    fn test_path_with_spaces() {
        let mi = ModuleInfo {
            name: "/usr/my include/a.h".into(),
            imports: vec![],
        };
        let s = to_module_string(UnitType::ModuleHeader, &mi);
        let (ut, got) = from_module_string(&s).unwrap();
        assert_eq!(ut, UnitType::ModuleHeader);
        assert_eq!(got.name, "/usr/my include/a.h");
    }

    #[test]
    fn test_compiler_info_serde() {
        let ci = CompilerInfo::test_gcc();
        let j = serde_json::to_string(&ci).unwrap();
        let back: CompilerInfo = serde_json::from_str(&j).unwrap();
        assert_eq!(back.id, CompilerId::Gcc);
        assert_eq!(back.bmi_ext(), "gcm");
        assert_eq!(back.obj_ext(), "o");
    }

    #[test]
    fn test_sha256_hex() {
        let h = sha256_hex(b"");
        assert_eq!(
            h,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
