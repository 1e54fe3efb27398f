//! Field paths into Kubernetes objects
//!
//! Supports the subset of JSONPath that object lookups actually use: a
//! chain of field names and array indices. All of these are equivalent:
//!
//! ```text
//! $.metadata.labels['app.kubernetes.io/name']
//! .metadata.labels['app.kubernetes.io/name']
//! {.metadata.labels['app.kubernetes.io/name']}
//! ```

use std::fmt;

use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(name) => write!(f, ".{name}"),
            Segment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// A parsed field path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        let mut body = raw.trim();
        if let Some(inner) = body.strip_prefix('{') {
            body = inner
                .strip_suffix('}')
                .ok_or_else(|| invalid("unterminated '{'"))?;
        }
        body = body.strip_prefix('$').unwrap_or(body);

        let chars: Vec<char> = body.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    i += 1;
                    let start = i;
                    while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                        i += 1;
                    }
                    if start == i {
                        return Err(invalid("empty field name"));
                    }
                    segments.push(Segment::Field(chars[start..i].iter().collect()));
                }
                '[' => {
                    i += 1;
                    match chars.get(i) {
                        Some(&q) if q == '\'' || q == '"' => {
                            i += 1;
                            let start = i;
                            while i < chars.len() && chars[i] != q {
                                i += 1;
                            }
                            if i >= chars.len() {
                                return Err(invalid("unterminated quoted key"));
                            }
                            let key: String = chars[start..i].iter().collect();
                            i += 1;
                            if chars.get(i) != Some(&']') {
                                return Err(invalid("expected ']' after quoted key"));
                            }
                            i += 1;
                            segments.push(Segment::Field(key));
                        }
                        _ => {
                            let start = i;
                            while i < chars.len() && chars[i] != ']' {
                                i += 1;
                            }
                            if i >= chars.len() {
                                return Err(invalid("unterminated '['"));
                            }
                            let text: String = chars[start..i].iter().collect();
                            let index = text
                                .trim()
                                .parse::<usize>()
                                .map_err(|_| invalid("array index must be a non-negative integer"))?;
                            i += 1;
                            segments.push(Segment::Index(index));
                        }
                    }
                }
                _ => return Err(invalid("expected '.' or '['")),
            }
        }

        if segments.is_empty() {
            return Err(invalid("path selects nothing"));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Walk `value` along the path
    pub fn select<'a>(&self, value: &'a Value) -> Result<&'a Value> {
        let mut current = value;
        for (depth, segment) in self.segments.iter().enumerate() {
            let next = match segment {
                Segment::Field(name) => current.get(name.as_str()),
                Segment::Index(i) => current.as_array().and_then(|a| a.get(*i)),
            };
            current = next.ok_or_else(|| Error::InvalidPath {
                path: self.raw.clone(),
                reason: format!(
                    "no value at {}",
                    self.segments[..=depth]
                        .iter()
                        .map(ToString::to_string)
                        .collect::<String>()
                ),
            })?;
        }
        Ok(current)
    }

    /// Select and render the leaf: strings raw, anything else as compact JSON
    pub fn extract(&self, value: &Value) -> Result<String> {
        match self.select(value)? {
            Value::String(s) => Ok(s.clone()),
            Value::Null => Err(Error::InvalidPath {
                path: self.raw.clone(),
                reason: "value is null".to_string(),
            }),
            other => Ok(serde_json::to_string(other)?),
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_map() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "kube-root-ca.crt",
                "namespace": "default",
                "uid": "6f1c0c4e-2b6e-4c38-9d4f-0a1b2c3d4e5f",
                "labels": { "app.kubernetes.io/name": "root-ca" },
                "ownerReferences": [{ "name": "first" }, { "name": "second" }]
            },
            "data": { "ca.crt": "-----BEGIN CERTIFICATE-----" }
        })
    }

    #[test]
    fn test_dollar_dot_path() {
        let path = FieldPath::parse("$.metadata.uid").unwrap();
        assert_eq!(
            path.extract(&config_map()).unwrap(),
            "6f1c0c4e-2b6e-4c38-9d4f-0a1b2c3d4e5f"
        );
    }

    #[test]
    fn test_kubectl_style_paths() {
        let doc = config_map();
        assert_eq!(
            FieldPath::parse("{.metadata.name}").unwrap().extract(&doc).unwrap(),
            "kube-root-ca.crt"
        );
        assert_eq!(
            FieldPath::parse(".metadata.namespace").unwrap().extract(&doc).unwrap(),
            "default"
        );
    }

    #[test]
    fn test_quoted_keys_and_indices() {
        let doc = config_map();
        assert_eq!(
            FieldPath::parse("$.metadata.labels['app.kubernetes.io/name']")
                .unwrap()
                .extract(&doc)
                .unwrap(),
            "root-ca"
        );
        assert_eq!(
            FieldPath::parse("$.data[\"ca.crt\"]").unwrap().extract(&doc).unwrap(),
            "-----BEGIN CERTIFICATE-----"
        );
        assert_eq!(
            FieldPath::parse("$.metadata.ownerReferences[1].name")
                .unwrap()
                .extract(&doc)
                .unwrap(),
            "second"
        );
    }

    #[test]
    fn test_non_string_leaf_is_json() {
        let path = FieldPath::parse("$.metadata.labels").unwrap();
        assert_eq!(
            path.extract(&config_map()).unwrap(),
            r#"{"app.kubernetes.io/name":"root-ca"}"#
        );
    }

    #[test]
    fn test_missing_field_is_invalid_path() {
        let path = FieldPath::parse("$.metadata.missing.deeper").unwrap();
        let err = path.extract(&config_map()).unwrap_err();
        match err {
            Error::InvalidPath { reason, .. } => assert_eq!(reason, "no value at .metadata.missing"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_paths() {
        for raw in ["", "$", "$.", "$.a..b", "$.a[", "$.a[x]", "$.a['b", "{.a", "metadata"] {
            assert!(
                matches!(FieldPath::parse(raw), Err(Error::InvalidPath { .. })),
                "expected {raw:?} to be rejected"
            );
        }
    }
}
