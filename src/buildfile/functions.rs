//! Buildfile Functions
//!
//! The builtin function table consulted by `$fn(args)` expansion and by
//! `switch ... : fn` match expressions, plus the typed-concatenation hook
//! used when a typed value meets adjacent text in a name.

use std::collections::HashMap;
use std::path::PathBuf;

use lazy_static::lazy_static;

use crate::names::{Name, Value, ValueType};

/// A builtin function: values in, value out, message on misuse.
pub type Function = fn(&[Value]) -> Result<Value, String>;

fn fn_empty(args: &[Value]) -> Result<Value, String> {
    match args {
        [v] => Ok(Value::from_bool(v.null || v.names.is_empty())),
        _ => Err("empty() expects one argument".into()),
    }
}

fn fn_size(args: &[Value]) -> Result<Value, String> {
    match args {
        [v] if v.null => Err("size() of null value".into()),
        [v] => Ok(Value::from_u64(v.element_count() as u64)),
        _ => Err("size() expects one argument".into()),
    }
}

fn fn_null(args: &[Value]) -> Result<Value, String> {
    match args {
        [v] => Ok(Value::from_bool(v.null)),
        _ => Err("null() expects one argument".into()),
    }
}

fn fn_string(args: &[Value]) -> Result<Value, String> {
    match args {
        [v] => Ok(Value::from_string(crate::names::to_string(&v.names))),
        _ => Err("string() expects one argument".into()),
    }
}

fn fn_type(args: &[Value]) -> Result<Value, String> {
    match args {
        [v] => Ok(Value::from_string(
            v.ty.map(|t| t.name()).unwrap_or(""),
        )),
        _ => Err("type() expects one argument".into()),
    }
}

fn fn_identity(args: &[Value]) -> Result<Value, String> {
    match args {
        [v] => Ok(v.clone()),
        _ => Err("identity() expects one argument".into()),
    }
}

fn fn_path_match(args: &[Value]) -> Result<Value, String> {
    match args {
        [entry, pattern] => {
            let e = entry.as_string().map_err(|e| e.to_string())?;
            let p = pattern.as_string().map_err(|e| e.to_string())?;
            let m = glob::Pattern::new(&p)
                .map(|c| c.matches(&e))
                .unwrap_or(false);
            Ok(Value::from_bool(m))
        }
        _ => Err("path.match() expects an entry and a pattern".into()),
    }
}

fn fn_regex_match(args: &[Value]) -> Result<Value, String> {
    match args {
        [value, regex] => {
            let v = value.as_string().map_err(|e| e.to_string())?;
            let r = regex.as_string().map_err(|e| e.to_string())?;
            let re = regex_lite::Regex::new(&format!("^(?:{})$", r))
                .map_err(|e| format!("invalid regex: {}", e))?;
            Ok(Value::from_bool(re.is_match(&v)))
        }
        _ => Err("regex.match() expects a value and a regex".into()),
    }
}

fn fn_regex_replace(args: &[Value]) -> Result<Value, String> {
    match args {
        [value, regex, fmt] => {
            let v = value.as_string().map_err(|e| e.to_string())?;
            let r = regex.as_string().map_err(|e| e.to_string())?;
            let f = fmt.as_string().map_err(|e| e.to_string())?;
            let re = regex_lite::Regex::new(&r).map_err(|e| format!("invalid regex: {}", e))?;
            // Regex replacement references use $N; the buildfile form
            // uses \N.
            let f = f.replace('\\', "$");
            Ok(Value::from_string(re.replace_all(&v, f.as_str()).into_owned()))
        }
        _ => Err("regex.replace() expects a value, a regex, and a format".into()),
    }
}

fn fn_dir_path(args: &[Value]) -> Result<Value, String> {
    match args {
        [v] => {
            let d = v.as_dir().map_err(|e| e.to_string())?;
            Ok(Value::from_dir(d))
        }
        _ => Err("dir_path() expects one argument".into()),
    }
}

lazy_static! {
    static ref FUNCTIONS: HashMap<&'static str, Function> = {
        let mut m: HashMap<&'static str, Function> = HashMap::new();
        m.insert("empty", fn_empty);
        m.insert("size", fn_size);
        m.insert("null", fn_null);
        m.insert("string", fn_string);
        m.insert("type", fn_type);
        m.insert("identity", fn_identity);
        m.insert("path.match", fn_path_match);
        m.insert("regex.match", fn_regex_match);
        m.insert("regex.replace", fn_regex_replace);
        m.insert("dir_path", fn_dir_path);
        m
    };
}

pub fn find(name: &str) -> Option<Function> {
    FUNCTIONS.get(name).copied()
}

/// The `builtin.concat` hook: concatenate a typed value with adjacent
/// text. Returns None for type combinations that cannot concatenate (the
/// caller diagnoses with the force-untyped hint).
pub fn concat_typed(lhs: &Value, rhs: &str) -> Option<Value> {
    match lhs.ty? {
        ValueType::String => {
            let s = lhs.as_string().ok()?;
            Some(Value::from_string(format!("{}{}", s, rhs)))
        }
        ValueType::DirPath => {
            let d = lhs.as_dir().ok()?;
            // dir_path ++ string = path (the result names a file). The
            // text often starts with the separator; joining with it
            // would discard the directory.
            let joined = d.join(rhs.trim_start_matches('/'));
            let mut v = Value {
                names: vec![Name::simple(joined.display().to_string())],
                ty: Some(ValueType::Path),
                null: false,
            };
            v.ty = Some(ValueType::Path);
            Some(v)
        }
        ValueType::Path => {
            let p = lhs.as_string().ok()?;
            Some(Value {
                names: vec![Name::simple(format!("{}{}", p, rhs))],
                ty: Some(ValueType::Path),
                null: false,
            })
        }
        ValueType::U64 => {
            let n = lhs.as_u64().ok()?;
            Some(Value::from_string(format!("{}{}", n, rhs)))
        }
        _ => None,
    }
}
