//! Translation Unit Scanning
//!
//! Classifies a translation unit and collects its module declaration and
//! imports. The scan operates on preprocessed (or plain) source text:
//! comments are skipped, string literals respected, and only
//! module/import declarations at file scope are considered.

use crate::cc::types::{
    sha256_hex, ImportKind, ModuleImport, ModuleInfo, TranslationUnit, UnitType,
};

/// Scan source text into a classified translation unit.
pub fn scan_unit(text: &str) -> TranslationUnit {
    let mut ty = UnitType::NonModular;
    let mut mi = ModuleInfo::default();

    for line in logical_lines(text) {
        let l = line.trim();

        let (exported, rest) = match l.strip_prefix("export ") {
            Some(r) => (true, r.trim_start()),
            None => (false, l),
        };

        if let Some(r) = rest.strip_prefix("module") {
            // Require a token boundary ("modules" is not a declaration).
            if !r.starts_with([' ', '\t', ';']) {
                continue;
            }
            let r = r.trim_start();
            if let Some(name) = decl_name(r) {
                if name.is_empty() {
                    continue; // Global module fragment: `module;`.
                }
                ty = match (exported, name.contains(':')) {
                    (true, true) => UnitType::ModuleIntfPart,
                    (true, false) => UnitType::ModuleIntf,
                    (false, true) => UnitType::ModuleImplPart,
                    (false, false) => UnitType::ModuleImpl,
                };
                mi.name = name;
            }
            continue;
        }

        if let Some(r) = rest.strip_prefix("import") {
            if !r.starts_with([' ', '\t', '"', '<', ':']) {
                continue;
            }
            let r = r.trim_start();
            if let Some((kind, name)) = import_name(r) {
                mi.imports.push(ModuleImport::new(kind, name, exported));
            }
        }
    }

    TranslationUnit {
        ty,
        module_info: mi,
        checksum: sha256_hex(text.as_bytes()),
    }
}

/// Split into logical lines with comments stripped.
fn logical_lines(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = text.chars().peekable();
    let mut in_block_comment = false;

    while let Some(c) = chars.next() {
        if in_block_comment {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                in_block_comment = false;
            }
            continue;
        }
        match c {
            '/' if chars.peek() == Some(&'/') => {
                while let Some(&n) = chars.peek() {
                    if n == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                in_block_comment = true;
            }
            '"' => {
                cur.push('"');
                while let Some(n) = chars.next() {
                    cur.push(n);
                    if n == '\\' {
                        if let Some(e) = chars.next() {
                            cur.push(e);
                        }
                    } else if n == '"' {
                        break;
                    }
                }
            }
            '\n' | ';' => {
                if c == ';' {
                    cur.push(';');
                }
                if !cur.trim().is_empty() {
                    out.push(std::mem::take(&mut cur));
                } else {
                    cur.clear();
                }
            }
            _ => cur.push(c),
        }
    }
    if !cur.trim().is_empty() {
        out.push(cur);
    }
    out
}

/// Extract the name from a `module ...;` declaration tail.
fn decl_name(rest: &str) -> Option<String> {
    let rest = rest.trim();
    let end = rest.find(';')?;
    let name = rest[..end].trim();
    // Attributes after the name are not part of it.
    let name = name.split_whitespace().next().unwrap_or("");
    if name.chars().all(|c| {
        c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == ':'
    }) {
        Some(name.to_string())
    } else {
        None
    }
}

/// Extract kind and name from an `import ...;` declaration tail.
fn import_name(rest: &str) -> Option<(ImportKind, String)> {
    let rest = rest.trim();

    if let Some(r) = rest.strip_prefix('"') {
        let end = r.find('"')?;
        return Some((ImportKind::ModuleHeader, r[..end].to_string()));
    }
    if let Some(r) = rest.strip_prefix('<') {
        let end = r.find('>')?;
        return Some((ImportKind::ModuleHeader, r[..end].to_string()));
    }

    let end = rest.find(';')?;
    let name = rest[..end].trim();
    if name.is_empty() {
        return None;
    }
    let kind = if name.starts_with(':') {
        ImportKind::ModulePart
    } else {
        ImportKind::ModuleIntf
    };
    if name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == ':')
    {
        Some((kind, name.to_string()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_modular() {
        let tu = scan_unit("#include <stdio.h>\nint main() { return 0; }\n");
        assert_eq!(tu.ty, UnitType::NonModular);
        assert!(tu.module_info.imports.is_empty());
        assert_eq!(tu.checksum.len(), 64);
    }

    #[test]
    fn test_module_interface() {
        let tu = scan_unit("export module hello;\nexport void say();\n");
        assert_eq!(tu.ty, UnitType::ModuleIntf);
        assert_eq!(tu.module_info.name, "hello");
    }

    #[test]
    fn test_module_implementation() {
        let tu = scan_unit("module hello;\nvoid say() {}\n");
        assert_eq!(tu.ty, UnitType::ModuleImpl);
        assert_eq!(tu.module_info.name, "hello");
    }

    #[test]
    fn test_partitions() {
        let tu = scan_unit("export module foo:intf;\n");
        assert_eq!(tu.ty, UnitType::ModuleIntfPart);
        assert_eq!(tu.module_info.name, "foo:intf");

        let tu = scan_unit("module foo:impl;\n");
        assert_eq!(tu.ty, UnitType::ModuleImplPart);
    }

    #[test]
    fn test_global_module_fragment() {
        let tu = scan_unit("module;\n#include <cstdio>\nexport module app;\n");
        assert_eq!(tu.ty, UnitType::ModuleIntf);
        assert_eq!(tu.module_info.name, "app");
    }

    #[test]
    fn test_imports() {
        let tu = scan_unit(
            "export module app;\nimport core;\nexport import util.strings;\nimport :detail;\nimport <vector>;\nimport \"local.h\";\n",
        );
        let is = &tu.module_info.imports;
        assert_eq!(is.len(), 5);
        assert_eq!(is[0].kind, ImportKind::ModuleIntf);
        assert_eq!(is[0].name, "core");
        assert!(!is[0].exported);
        assert!(is[1].exported);
        assert_eq!(is[2].kind, ImportKind::ModulePart);
        assert_eq!(is[3].kind, ImportKind::ModuleHeader);
        assert_eq!(is[3].name, "vector");
        assert_eq!(is[4].name, "local.h");
    }

    #[test]
    fn test_comments_ignored() {
        let tu = scan_unit("// import fake;\n/* module nope; */\nimport real;\n");
        assert_eq!(tu.module_info.imports.len(), 1);
        assert_eq!(tu.module_info.imports[0].name, "real");
    }

    #[test]
    fn test_string_literal_not_confused() {
        let tu = scan_unit("const char* s = \"import bogus;\";\n");
        assert!(tu.module_info.imports.is_empty());
    }
}
