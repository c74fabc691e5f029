//! Deterministic fingerprints of task identities.
//!
//! A fingerprint hashes the task name together with a canonical encoding
//! of its arguments. The canonical encoding is compact JSON with object
//! keys sorted at every depth, so two mappings with the same entries
//! always produce the same key regardless of insertion order.

mod finite;

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::{Kwargs, LockKey, TaskDefinition, UniqueOn};

/// Default prefix for lock keys.
pub const DEFAULT_KEY_PREFIX: &str = "SINGLETONLOCK_";

/// Compute the lock key for a task name and its arguments.
pub fn fingerprint(name: &str, args: &[Value], kwargs: &Kwargs, prefix: &str) -> Result<LockKey> {
    let mut canonical = String::with_capacity(name.len() + 64);
    canonical.push_str(name);
    write_array(&mut canonical, args)?;
    write_object(&mut canonical, kwargs.iter())?;

    let digest = Sha256::digest(canonical.as_bytes());
    Ok(LockKey(format!("{prefix}{}", hex_encode(&digest))))
}

/// Convert a caller value into an argument. Values that have no JSON
/// form (maps with non-string keys, NaN, infinities) are rejected here
/// rather than coerced.
pub fn to_argument<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    finite::check(value).map_err(|e| Error::Fingerprint(format!("argument not serializable: {e}")))?;
    serde_json::to_value(value).map_err(|e| Error::Fingerprint(format!("argument not serializable: {e}")))
}

/// Narrow arguments down to the ones the definition deduplicates on.
///
/// Returns the positional and keyword arguments that feed [`fingerprint`].
pub fn select_arguments(
    definition: &TaskDefinition,
    args: &[Value],
    kwargs: &Kwargs,
) -> Result<(Vec<Value>, Kwargs)> {
    let names = match &definition.unique_on {
        UniqueOn::All => return Ok((args.to_vec(), kwargs.clone())),
        UniqueOn::Only(names) => names,
    };
    // Blank names select nothing.
    let names: Vec<&String> = names.iter().filter(|n| !n.trim().is_empty()).collect();
    if names.is_empty() {
        return Ok((Vec::new(), Kwargs::new()));
    }

    let bound = match &definition.signature {
        Some(signature) => signature.bind(args, kwargs)?,
        None => kwargs.clone(),
    };

    let mut selected = Kwargs::new();
    for name in names {
        let value = bound.get(name).ok_or_else(|| {
            Error::Fingerprint(format!(
                "argument `{name}` selected for uniqueness of `{}` was not supplied",
                definition.name
            ))
        })?;
        selected.insert(name.clone(), value.clone());
    }
    Ok((Vec::new(), selected))
}

// ---------------------------------------------------------------------------
// Signature binding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
struct Param {
    name: String,
    default: Option<Value>,
}

/// Ordered parameter list of a task, used to bind positional arguments
/// to names so a uniqueness selector can pick them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a required parameter.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: None,
        });
        self
    }

    /// Append a parameter with a default value.
    pub fn param_with_default(mut self, name: impl Into<String>, default: Value) -> Self {
        self.params.push(Param {
            name: name.into(),
            default: Some(default),
        });
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    /// Bind positional and keyword arguments to parameter names, filling
    /// in defaults.
    pub fn bind(&self, args: &[Value], kwargs: &Kwargs) -> Result<Kwargs> {
        if args.len() > self.params.len() {
            return Err(Error::Fingerprint(format!(
                "takes {} positional arguments but {} were given",
                self.params.len(),
                args.len()
            )));
        }

        let mut bound = Kwargs::new();
        for (param, value) in self.params.iter().zip(args) {
            bound.insert(param.name.clone(), value.clone());
        }

        for (name, value) in kwargs {
            if !self.contains(name) {
                return Err(Error::Fingerprint(format!(
                    "got an unexpected keyword argument `{name}`"
                )));
            }
            if bound.insert(name.clone(), value.clone()).is_some() {
                return Err(Error::Fingerprint(format!(
                    "got multiple values for argument `{name}`"
                )));
            }
        }

        for param in &self.params {
            if bound.contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(default) => {
                    bound.insert(param.name.clone(), default.clone());
                }
                None => {
                    return Err(Error::Fingerprint(format!(
                        "missing required argument `{}`",
                        param.name
                    )));
                }
            }
        }

        Ok(bound)
    }
}

impl TaskDefinition {
    /// Check the definition once at setup: every selected name must be a
    /// parameter of the signature, and names must not repeat. Blank names
    /// are ignored.
    pub fn validate(&self) -> Result<()> {
        let UniqueOn::Only(names) = &self.unique_on else {
            return Ok(());
        };
        let mut seen = HashSet::new();
        for name in names.iter().filter(|n| !n.trim().is_empty()) {
            if !seen.insert(name.as_str()) {
                return Err(Error::Config(format!(
                    "`{}` selects argument `{name}` twice",
                    self.name
                )));
            }
            let known = self.signature.as_ref().is_none_or(|sig| sig.contains(name));
            if !known {
                return Err(Error::Config(format!(
                    "`{}` selects unknown argument `{name}`",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Canonical encoding
// ---------------------------------------------------------------------------

fn write_value(out: &mut String, value: &Value) -> Result<()> {
    match value {
        Value::Array(items) => write_array(out, items),
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            write_object(out, entries.into_iter())
        }
        Value::String(s) => write_string(out, s),
        // null, booleans and numbers have a single compact rendering
        scalar => {
            out.push_str(&scalar.to_string());
            Ok(())
        }
    }
}

fn write_array(out: &mut String, items: &[Value]) -> Result<()> {
    out.push('[');
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_value(out, item)?;
    }
    out.push(']');
    Ok(())
}

/// Entries must already be in key order.
fn write_object<'a>(out: &mut String, entries: impl Iterator<Item = (&'a String, &'a Value)>) -> Result<()> {
    out.push('{');
    for (i, (key, value)) in entries.enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, key)?;
        out.push(':');
        write_value(out, value)?;
    }
    out.push('}');
    Ok(())
}

fn write_string(out: &mut String, s: &str) -> Result<()> {
    let quoted = serde_json::to_string(s).map_err(|e| Error::Fingerprint(e.to_string()))?;
    out.push_str(&quoted);
    Ok(())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kwargs(value: Value) -> Kwargs {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => Kwargs::new(),
        }
    }

    #[test]
    fn canonical_form_sorts_nested_keys() {
        let mut out = String::new();
        write_value(&mut out, &json!({"b": {"y": 1, "x": [true, null]}, "a": "s"})).unwrap();
        assert_eq!(out, r#"{"a":"s","b":{"x":[true,null],"y":1}}"#);
    }

    #[test]
    fn key_is_prefix_plus_sha256_hex() {
        let key = fingerprint("t", &[], &Kwargs::new(), "P_").unwrap();
        let hex = key.as_str().strip_prefix("P_").unwrap();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn type_tags_are_distinguished() {
        let keys: HashSet<_> = [json!(1), json!(1.0), json!("1"), json!(true), json!([1])]
            .into_iter()
            .map(|v| fingerprint("t", &[v], &Kwargs::new(), "").unwrap())
            .collect();
        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn bind_rejects_surplus_and_unknown_arguments() {
        let sig = Signature::new().param("a").param("b");
        assert!(sig.bind(&[json!(1), json!(2), json!(3)], &Kwargs::new()).is_err());
        assert!(sig.bind(&[json!(1)], &kwargs(json!({"b": 2, "z": 0}))).is_err());
        assert!(sig.bind(&[json!(1)], &kwargs(json!({"a": 2, "b": 0}))).is_err());
        assert!(sig.bind(&[json!(1)], &Kwargs::new()).is_err());
    }

    #[test]
    fn bind_applies_defaults() {
        let sig = Signature::new()
            .param("a")
            .param_with_default("b", json!(2));
        let bound = sig.bind(&[json!(1)], &Kwargs::new()).unwrap();
        assert_eq!(bound, kwargs(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn validate_rejects_selector_outside_signature() {
        let def = TaskDefinition::new("t")
            .signature(Signature::new().param("a"))
            .unique_on(["a", "b"]);
        assert!(matches!(def.validate(), Err(Error::Config(_))));

        let def = TaskDefinition::new("t").unique_on(["a", "a"]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn blank_selector_names_key_on_name_only() {
        let blank = TaskDefinition::new("t").unique_on([""]);
        blank.validate().unwrap();
        let (args, kw) = select_arguments(&blank, &[json!(1)], &kwargs(json!({"a": 2}))).unwrap();
        assert!(args.is_empty());
        assert!(kw.is_empty());

        let mixed = TaskDefinition::new("t").unique_on(["", "a"]);
        let (_, kw) = select_arguments(&mixed, &[], &kwargs(json!({"a": 2, "b": 3}))).unwrap();
        assert_eq!(kw, kwargs(json!({"a": 2})));
    }

    #[test]
    fn missing_selected_argument_is_an_error() {
        let def = TaskDefinition::new("t").unique_on(["a"]);
        let err = select_arguments(&def, &[], &kwargs(json!({"b": 1}))).unwrap_err();
        assert!(matches!(err, Error::Fingerprint(_)));
    }

    #[test]
    fn non_string_map_keys_are_rejected() {
        let mut map = std::collections::HashMap::new();
        map.insert((1, 2), "x");
        assert!(matches!(to_argument(&map), Err(Error::Fingerprint(_))));
    }
}
