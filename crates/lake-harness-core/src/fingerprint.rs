//! Scope fingerprints.
//!
//! A fingerprint is the canonical JSON encoding of the options that identify
//! *what* a run collects (connection id plus scope ids such as a project or
//! repository). It partitions raw, tool and domain rows: every stage deletes
//! and rewrites only the rows carrying the active fingerprint.
//!
//! Canonical means object keys sorted at every depth and no insignificant
//! whitespace, so two structs with the same values always produce the same
//! string regardless of field declaration order.

use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of a set of scope options.
    ///
    /// # Errors
    ///
    /// Fails when the options serialize to `null` or an empty object, since
    /// such a fingerprint would match every scope.
    pub fn from_params<T: Serialize + ?Sized>(params: &T) -> Result<Self> {
        let value = serde_json::to_value(params)?;
        match &value {
            Value::Null => bail!("scope params must not be null"),
            Value::Object(map) if map.is_empty() => bail!("scope params must not be empty"),
            _ => {}
        }
        Ok(Self(serde_json::to_string(&canonicalize(value))?))
    }

    /// Wrap a fingerprint string previously produced by [`from_params`](Self::from_params).
    pub fn from_canonical(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the fingerprint back into its JSON form.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.0)?)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, v) in entries {
                sorted.insert(key, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    #[serde(rename_all = "PascalCase")]
    struct ProjectScope {
        project_id: u64,
        connection_id: u64,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "PascalCase")]
    struct ProjectScopeReordered {
        connection_id: u64,
        project_id: u64,
    }

    #[test]
    fn field_order_does_not_matter() {
        let a = Fingerprint::from_params(&ProjectScope {
            project_id: 5,
            connection_id: 1,
        })
        .unwrap();
        let b = Fingerprint::from_params(&ProjectScopeReordered {
            connection_id: 1,
            project_id: 5,
        })
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), r#"{"ConnectionId":1,"ProjectId":5}"#);
    }

    #[test]
    fn nested_objects_are_sorted() {
        let fp = Fingerprint::from_params(&json!({"b": {"z": 1, "a": 2}, "a": [ {"y": 1, "x": 2} ]}))
            .unwrap();
        assert_eq!(fp.as_str(), r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#);
    }

    #[test]
    fn empty_params_are_rejected() {
        assert!(Fingerprint::from_params(&json!({})).is_err());
        assert!(Fingerprint::from_params(&Value::Null).is_err());
    }

    #[test]
    fn different_scopes_differ() {
        let a = Fingerprint::from_params(&json!({"ConnectionId": 1, "ProductId": 1})).unwrap();
        let b = Fingerprint::from_params(&json!({"ConnectionId": 1, "ProductId": 2})).unwrap();
        assert_ne!(a, b);
    }
}
