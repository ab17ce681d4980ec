//! Canonical cache keys for read operations.
//!
//! A [`QueryKey`] is the pair `(base, params)` where `params` is the
//! key-sorted JSON encoding of a filter object with `null` entries removed.
//! Two filter objects holding the same key-value pairs in any insertion
//! order produce equal keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Canonical identifier of a cached read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    base: String,
    params: Option<String>,
}

impl QueryKey {
    /// A key with no parameters, e.g. `notes` or `notes/7f3e...`.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            params: None,
        }
    }

    /// Build a key from any serializable parameter object.
    pub fn with_params<P>(base: impl Into<String>, params: &P) -> Result<Self, serde_json::Error>
    where
        P: Serialize + ?Sized,
    {
        let value = serde_json::to_value(params)?;
        Ok(Self::from_value(base, &value))
    }

    /// Build a key from an already-encoded parameter value.
    pub fn from_value(base: impl Into<String>, params: &Value) -> Self {
        Self {
            base: base.into(),
            params: canonical_params(params),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn params(&self) -> Option<&str> {
        self.params.as_deref()
    }

    /// First path segment of the base, i.e. the resource name.
    pub fn resource(&self) -> &str {
        self.base.split('/').next().unwrap_or(&self.base)
    }

    /// True when this key belongs to `resource` (any sub-path, any params).
    pub fn is_for(&self, resource: &str) -> bool {
        self.resource() == resource
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.params {
            Some(params) => write!(f, "{}:{}", self.base, params),
            None => f.write_str(&self.base),
        }
    }
}

/// Sorted, null-free JSON encoding of `params`, or `None` if nothing remains.
pub fn canonical_params(params: &Value) -> Option<String> {
    match params {
        Value::Null => None,
        Value::Object(map) if map.values().all(Value::is_null) => None,
        other => {
            let mut out = String::new();
            write_canonical(other, &mut out);
            Some(out)
        }
    }
}

// Object keys are sorted explicitly so the encoding does not depend on
// whether serde_json was built with `preserve_order`.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> =
                map.iter().filter(|(_, v)| !v.is_null()).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, inner)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(inner, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
