//! YAML parsing utilities
//!
//! Manifests are kept as untyped `serde_yaml::Value` trees, which preserve
//! mapping key order. The accessors here are null-safe: a missing key and an
//! explicit `null` both yield the empty value of the expected shape, because
//! conditionally-templated manifests routinely render `annotations:`,
//! `ports:` or `data:` as null.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::error::Error;

static NULL: Value = Value::Null;

/// Parse a YAML string into a single `Value`.
///
/// For multi-document input, returns only the first document.
/// Returns `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value, Error> {
    Ok(parse_yaml_multi(input)?.into_iter().next().unwrap_or(Value::Null))
}

/// Parse a multi-document YAML string into a Vec of `Value`s.
///
/// Each document separated by `---` becomes a separate value. Empty
/// documents are dropped.
pub fn parse_yaml_multi(input: &str) -> Result<Vec<Value>, Error> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(input) {
        let doc = Value::deserialize(de).map_err(|e| Error::yaml(e.to_string()))?;
        if !doc.is_null() {
            docs.push(doc);
        }
    }
    Ok(docs)
}

/// Null-safe mapping lookup: returns `Value::Null` when the value is not a
/// mapping or the key is absent.
pub fn field<'a>(value: &'a Value, key: &str) -> &'a Value {
    value.get(key).unwrap_or(&NULL)
}

/// Null-safe nested lookup along a key path.
pub fn field_path<'a>(value: &'a Value, path: &[&str]) -> &'a Value {
    let mut current = value;
    for key in path {
        current = field(current, key);
    }
    current
}

/// Null-safe string read: absent, null, and non-string all yield `""`.
pub fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    field(value, key).as_str().unwrap_or("")
}

/// Null-safe sequence read: absent, null, and non-sequence all yield `&[]`.
pub fn seq_field<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    field(value, key).as_sequence().map(Vec::as_slice).unwrap_or(&[])
}

/// Null-safe mapping read: absent, null, and non-mapping all yield an empty
/// iterator.
pub fn map_field<'a>(value: &'a Value, key: &str) -> impl Iterator<Item = (&'a Value, &'a Value)> {
    field(value, key).as_mapping().into_iter().flatten()
}

/// Collect a string→string mapping (labels, annotations, ConfigMap data),
/// stringifying scalar values along the way.
pub fn string_map(value: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(mapping) = value.as_mapping() {
        for (k, v) in mapping {
            if let Some(key) = k.as_str() {
                if let Some(s) = scalar_to_string(v) {
                    out.insert(key.to_string(), s);
                }
            }
        }
    }
    out
}

/// Render a scalar value as a string; returns `None` for null and
/// non-scalar values.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Read a port-like number, tolerating YAML's habit of widening integers.
pub fn port_field(value: &Value, key: &str) -> Option<u16> {
    field(value, key).as_u64().and_then(|n| u16::try_from(n).ok())
}

/// Build a mapping in place from string keys and values.
pub fn mapping_from<I, K, V>(entries: I) -> Mapping
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    let mut m = Mapping::new();
    for (k, v) in entries {
        m.insert(Value::String(k.into()), v.into());
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_simple() {
        let result = parse_yaml("name: test\nvalue: 42").unwrap();
        assert_eq!(str_field(&result, "name"), "test");
        assert_eq!(field(&result, "value").as_u64(), Some(42));
    }

    #[test]
    fn test_parse_yaml_multi_doc() {
        let yaml = "name: first\n---\nname: second\n---\nname: third\n";
        let results = parse_yaml_multi(yaml).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(str_field(&results[1], "name"), "second");
    }

    #[test]
    fn test_parse_yaml_multi_drops_empty_documents() {
        let yaml = "---\n---\nname: only\n---\n";
        let results = parse_yaml_multi(yaml).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_parse_yaml_empty() {
        assert_eq!(parse_yaml("").unwrap(), Value::Null);
    }

    #[test]
    fn test_parse_yaml_invalid() {
        assert!(parse_yaml("not: valid: yaml: {{").is_err());
    }

    #[test]
    fn test_field_null_safety() {
        let doc = parse_yaml("metadata:\n  annotations: null\n").unwrap();
        // Explicit null and absent key behave identically
        assert!(field_path(&doc, &["metadata", "annotations"]).is_null());
        assert!(field_path(&doc, &["metadata", "labels"]).is_null());
        assert!(field_path(&doc, &["spec", "template", "spec"]).is_null());
        assert_eq!(seq_field(field(&doc, "metadata"), "annotations"), &[] as &[Value]);
        assert_eq!(str_field(field(&doc, "metadata"), "annotations"), "");
    }

    #[test]
    fn test_string_map_stringifies_scalars() {
        let doc = parse_yaml("data:\n  PORT: 8080\n  DEBUG: true\n  NAME: app\n").unwrap();
        let map = string_map(field(&doc, "data"));
        assert_eq!(map.get("PORT"), Some(&"8080".to_string()));
        assert_eq!(map.get("DEBUG"), Some(&"true".to_string()));
        assert_eq!(map.get("NAME"), Some(&"app".to_string()));
    }

    #[test]
    fn test_mapping_preserves_key_order() {
        let doc = parse_yaml("z: 1\na: 2\nm: 3\n").unwrap();
        let keys: Vec<&str> = doc
            .as_mapping()
            .unwrap()
            .iter()
            .filter_map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_port_field() {
        let doc = parse_yaml("port: 8080\nbad: http\n").unwrap();
        assert_eq!(port_field(&doc, "port"), Some(8080));
        assert_eq!(port_field(&doc, "bad"), None);
        assert_eq!(port_field(&doc, "absent"), None);
    }
}
