//! Names and Values
//!
//! The fundamental value type of the build language is a sequence of names.
//! A name is a (project, dir, type, value) tuple where any component other
//! than the value may be empty, optionally paired with the following
//! element. A value is a names-sequence with an optional typed
//! representation and a distinguished null state.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Pattern flavor carried by a name that was recognized as a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// Path pattern with wildcard characters (`*`, `?`, `[...]`).
    Path,
    /// Regex pattern: `~/re/flags`.
    Regex,
    /// Regex substitution: `^/sub/flags`.
    RegexSubst,
}

/// A single name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Name {
    /// Project qualification (`proj%name`).
    pub proj: Option<String>,
    /// Directory component; empty if none.
    pub dir: PathBuf,
    /// Target type qualification (`type{name}`); empty if none.
    pub ty: String,
    /// The value proper.
    pub value: String,
    /// Set if this name is a pattern.
    pub pattern: Option<PatternKind>,
    /// Pair character (`@`, `:`, `/`) if this element is paired with the
    /// next one in the sequence.
    pub pair: Option<char>,
}

impl Name {
    /// A simple (untyped, undirected) name.
    pub fn simple(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    /// A directory name.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn typed(ty: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// True if all the components are empty.
    pub fn is_empty(&self) -> bool {
        self.proj.is_none() && self.dir.as_os_str().is_empty() && self.ty.is_empty()
            && self.value.is_empty()
    }

    /// True if this is a directory name (no value, non-empty dir).
    pub fn is_dir(&self) -> bool {
        self.value.is_empty() && !self.dir.as_os_str().is_empty()
    }

    /// True if this is a simple name (value only).
    pub fn is_simple(&self) -> bool {
        self.proj.is_none() && self.dir.as_os_str().is_empty() && self.ty.is_empty()
    }

    pub fn is_pattern(&self) -> bool {
        self.pattern.is_some()
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.proj {
            write!(f, "{}%", p)?;
        }

        let d = !self.dir.as_os_str().is_empty();
        let t = !self.ty.is_empty();

        if t {
            if d {
                write!(f, "{}/", self.dir.display())?;
            }
            write!(f, "{}{{{}}}", self.ty, self.value)
        } else if d {
            if self.value.is_empty() {
                write!(f, "{}/", self.dir.display())
            } else {
                write!(f, "{}/{}", self.dir.display(), self.value)
            }
        } else {
            write!(f, "{}", self.value)
        }
    }
}

/// A sequence of names.
pub type Names = Vec<Name>;

/// Render a names-sequence the way it would be written in a buildfile.
pub fn to_string(ns: &[Name]) -> String {
    let mut s = String::new();
    for (i, n) in ns.iter().enumerate() {
        if i != 0 && ns[i - 1].pair.is_none() {
            s.push(' ');
        }
        s.push_str(&n.to_string());
        if let Some(c) = n.pair {
            s.push(c);
        }
    }
    s
}

/// Value types that a variable or value can be qualified with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    U64,
    String,
    Path,
    DirPath,
    Name,
    Strings,
    Paths,
    Names,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::U64 => "uint64",
            Self::String => "string",
            Self::Path => "path",
            Self::DirPath => "dir_path",
            Self::Name => "name",
            Self::Strings => "strings",
            Self::Paths => "paths",
            Self::Names => "names",
        }
    }

    /// Parse a type name as written in an attribute.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "bool" => Self::Bool,
            "uint64" => Self::U64,
            "string" => Self::String,
            "path" => Self::Path,
            "dir_path" => Self::DirPath,
            "name" => Self::Name,
            "strings" => Self::Strings,
            "paths" => Self::Paths,
            "names" => Self::Names,
            _ => return None,
        })
    }

    /// True for container types that accept any number of elements.
    pub fn container(self) -> bool {
        matches!(self, Self::Strings | Self::Paths | Self::Names)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConvertError {
    #[error("invalid {ty} value '{value}'")]
    Invalid { ty: &'static str, value: String },

    #[error("{ty} value expected instead of {count} names")]
    Count { ty: &'static str, count: usize },

    #[error("null value in non-null context")]
    Null,
}

/// A value: a names-sequence with an optional type and a null state.
///
/// Typed values are stored in normalized names form; the type tag is
/// validated on conversion and interpreted on access.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Value {
    pub names: Names,
    pub ty: Option<ValueType>,
    pub null: bool,
}

impl Value {
    pub fn null() -> Self {
        Self {
            null: true,
            ..Default::default()
        }
    }

    pub fn from_names(names: Names) -> Self {
        Self {
            names,
            ty: None,
            null: false,
        }
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self {
            names: vec![Name::simple(s)],
            ty: Some(ValueType::String),
            null: false,
        }
    }

    pub fn from_bool(b: bool) -> Self {
        Self {
            names: vec![Name::simple(if b { "true" } else { "false" })],
            ty: Some(ValueType::Bool),
            null: false,
        }
    }

    pub fn from_u64(v: u64) -> Self {
        Self {
            names: vec![Name::simple(v.to_string())],
            ty: Some(ValueType::U64),
            null: false,
        }
    }

    pub fn from_dir(d: impl Into<PathBuf>) -> Self {
        Self {
            names: vec![Name::from_dir(d)],
            ty: Some(ValueType::DirPath),
            null: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Number of logical elements, counting a pair as one.
    pub fn element_count(&self) -> usize {
        let mut n = 0;
        let mut i = 0;
        while i < self.names.len() {
            if self.names[i].pair.is_some() {
                i += 1; // Skip the second half.
            }
            i += 1;
            n += 1;
        }
        n
    }

    /// Convert (and validate) to the given type.
    pub fn convert_to(&mut self, ty: ValueType) -> Result<(), ConvertError> {
        if self.null {
            self.ty = Some(ty);
            return Ok(());
        }

        if !ty.container() && self.names.len() > 1 {
            return Err(ConvertError::Count {
                ty: ty.name(),
                count: self.names.len(),
            });
        }

        match ty {
            ValueType::Bool => {
                let s = self.single_simple(ty)?;
                if s != "true" && s != "false" {
                    return Err(ConvertError::Invalid {
                        ty: ty.name(),
                        value: s,
                    });
                }
            }
            ValueType::U64 => {
                let s = self.single_simple(ty)?;
                if s.parse::<u64>().is_err() {
                    return Err(ConvertError::Invalid {
                        ty: ty.name(),
                        value: s,
                    });
                }
            }
            ValueType::DirPath => {
                // Re-represent a simple name as a directory.
                if let Some(n) = self.names.first_mut() {
                    if n.dir.as_os_str().is_empty() {
                        n.dir = PathBuf::from(std::mem::take(&mut n.value));
                    }
                }
            }
            _ => {}
        }

        self.ty = Some(ty);
        Ok(())
    }

    fn single_simple(&self, ty: ValueType) -> Result<String, ConvertError> {
        match self.names.as_slice() {
            [n] if n.is_simple() => Ok(n.value.clone()),
            ns => Err(ConvertError::Count {
                ty: ty.name(),
                count: ns.len(),
            }),
        }
    }

    /// Interpret as a boolean (used by `if` and friends).
    pub fn as_bool(&self) -> Result<bool, ConvertError> {
        if self.null {
            return Err(ConvertError::Null);
        }
        match self.names.as_slice() {
            [n] if n.is_simple() && n.value == "true" => Ok(true),
            [n] if n.is_simple() && n.value == "false" => Ok(false),
            [n] if n.is_simple() => Err(ConvertError::Invalid {
                ty: "bool",
                value: n.value.clone(),
            }),
            ns => Err(ConvertError::Count {
                ty: "bool",
                count: ns.len(),
            }),
        }
    }

    pub fn as_u64(&self) -> Result<u64, ConvertError> {
        if self.null {
            return Err(ConvertError::Null);
        }
        let s = self.single_simple(ValueType::U64)?;
        s.parse::<u64>().map_err(|_| ConvertError::Invalid {
            ty: "uint64",
            value: s,
        })
    }

    pub fn as_string(&self) -> Result<String, ConvertError> {
        if self.null {
            return Err(ConvertError::Null);
        }
        match self.names.as_slice() {
            [] => Ok(String::new()),
            [n] if n.is_simple() => Ok(n.value.clone()),
            [n] if n.is_dir() => Ok(n.dir.display().to_string()),
            ns => Err(ConvertError::Count {
                ty: "string",
                count: ns.len(),
            }),
        }
    }

    pub fn as_dir(&self) -> Result<PathBuf, ConvertError> {
        if self.null {
            return Err(ConvertError::Null);
        }
        match self.names.as_slice() {
            [n] if n.is_dir() => Ok(n.dir.clone()),
            [n] if n.is_simple() => Ok(PathBuf::from(&n.value)),
            ns => Err(ConvertError::Count {
                ty: "dir_path",
                count: ns.len(),
            }),
        }
    }

    /// Flatten to a list of simple strings (directories rendered as paths).
    pub fn to_strings(&self) -> Vec<String> {
        self.names
            .iter()
            .map(|n| {
                if n.is_dir() {
                    n.dir.display().to_string()
                } else {
                    n.to_string()
                }
            })
            .collect()
    }

    /// Value subscript.
    ///
    /// Returns NULL for an out-of-range index or a subscript on NULL. For
    /// untyped sequences a pair counts as one element and both halves are
    /// returned.
    pub fn subscript(&self, index: u64) -> Value {
        if self.null {
            return Value::null();
        }

        let index = index as usize;

        if self.ty.is_none() {
            let mut i = 0;
            let mut e = 0;
            while i < self.names.len() {
                let pair = self.names[i].pair.is_some();
                if e == index {
                    let mut ns = vec![self.names[i].clone()];
                    if pair {
                        ns.push(self.names[i + 1].clone());
                    }
                    return Value::from_names(ns);
                }
                i += if pair { 2 } else { 1 };
                e += 1;
            }
            Value::null()
        } else {
            match self.names.get(index) {
                Some(n) => Value {
                    names: vec![n.clone()],
                    ty: self.ty.and_then(element_type),
                    null: false,
                },
                None => Value::null(),
            }
        }
    }

    /// Append names, inserting no separators (list semantics).
    pub fn append_names(&mut self, ns: Names) {
        self.null = false;
        self.names.extend(ns);
    }
}

/// The element type of a container type.
pub fn element_type(ty: ValueType) -> Option<ValueType> {
    match ty {
        ValueType::Strings => Some(ValueType::String),
        ValueType::Paths => Some(ValueType::Path),
        ValueType::Names => Some(ValueType::Name),
        other => Some(other),
    }
}

/// Normalize a directory path: collapse `.` components and parent
/// references where possible. Purely lexical.
pub fn normalize(p: &Path) -> PathBuf {
    let mut r = PathBuf::new();
    for c in p.components() {
        use std::path::Component::*;
        match c {
            CurDir => {}
            ParentDir => {
                if !r.pop() {
                    r.push("..");
                }
            }
            other => r.push(other),
        }
    }
    if r.as_os_str().is_empty() {
        r.push(".");
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_display() {
        assert_eq!(Name::simple("foo").to_string(), "foo");
        assert_eq!(Name::typed("exe", "foo").to_string(), "exe{foo}");
        assert_eq!(Name::from_dir("dir").to_string(), "dir/");

        let n = Name {
            proj: Some("libhello".into()),
            dir: PathBuf::from("src"),
            ty: "cxx".into(),
            value: "hello".into(),
            ..Default::default()
        };
        assert_eq!(n.to_string(), "libhello%src/cxx{hello}");
    }

    #[test]
    fn test_names_to_string_pairs() {
        let mut a = Name::simple("a");
        a.pair = Some('@');
        let ns = vec![a, Name::simple("b"), Name::simple("c")];
        assert_eq!(to_string(&ns), "a@b c");
    }

    #[test]
    fn test_convert_bool() {
        let mut v = Value::from_names(vec![Name::simple("true")]);
        v.convert_to(ValueType::Bool).unwrap();
        assert_eq!(v.as_bool(), Ok(true));

        let mut v = Value::from_names(vec![Name::simple("yes")]);
        assert!(v.convert_to(ValueType::Bool).is_err());
    }

    #[test]
    fn test_convert_u64() {
        let mut v = Value::from_names(vec![Name::simple("42")]);
        v.convert_to(ValueType::U64).unwrap();
        assert_eq!(v.as_u64(), Ok(42));
    }

    #[test]
    fn test_subscript_out_of_range_is_null() {
        let v = Value::from_names(vec![Name::simple("a"), Name::simple("b")]);
        assert!(!v.subscript(1).null);
        assert!(v.subscript(2).null);
        assert!(Value::null().subscript(0).null);
    }

    #[test]
    fn test_subscript_pair_aware() {
        let mut a = Name::simple("a");
        a.pair = Some('@');
        let v = Value::from_names(vec![a, Name::simple("b"), Name::simple("c")]);

        // Element 0 is the a@b pair, element 1 is c.
        let e0 = v.subscript(0);
        assert_eq!(e0.names.len(), 2);
        let e1 = v.subscript(1);
        assert_eq!(e1.names.len(), 1);
        assert_eq!(e1.names[0].value, "c");
        assert_eq!(v.element_count(), 2);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(normalize(Path::new("./")), PathBuf::from("."));
        assert_eq!(normalize(Path::new("../x")), PathBuf::from("../x"));
    }
}
