//! Attribute values carried by account and connector objects.

use std::fmt;

use idm_secrets::GuardedString;
use serde::{Deserialize, Serialize};

/// Opaque key standing in for a secret kept in the confidential storage.
///
/// Keys have the shape `prefix:property:index`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfidentialReference(String);

impl ConfidentialReference {
    /// Build the reference for element `index` of `property` under `prefix`.
    #[must_use]
    pub fn new(prefix: &str, property: &str, index: usize) -> Self {
        Self(format!("{prefix}:{property}:{index}"))
    }

    /// Wrap a key read back from storage.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The storage key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfidentialReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value for an attribute, single or multi-valued.
///
/// `Guarded` holds a plaintext secret in memory only. Before an operation is
/// persisted every guarded value is replaced by a `Confidential` reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    /// No value.
    #[default]
    Null,
    /// A string.
    String(String),
    /// An integer.
    Integer(i64),
    /// A boolean.
    Boolean(bool),
    /// Binary data.
    Binary(Vec<u8>),
    /// Multiple values, order preserved.
    Array(Vec<AttributeValue>),
    /// A secret held in memory.
    Guarded(GuardedString),
    /// Reference to a secret in the confidential storage.
    Confidential(ConfidentialReference),
}

impl AttributeValue {
    /// Check if this is a null value.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Get as a string if this is a single string value.
    #[must_use]
    pub fn as_string(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value or any nested element is a plaintext secret.
    #[must_use]
    pub fn contains_guarded(&self) -> bool {
        match self {
            AttributeValue::Guarded(_) => true,
            AttributeValue::Array(values) => values.iter().any(Self::contains_guarded),
            _ => false,
        }
    }

    /// Whether this value or any nested element is a confidential reference.
    #[must_use]
    pub fn contains_confidential(&self) -> bool {
        match self {
            AttributeValue::Confidential(_) => true,
            AttributeValue::Array(values) => values.iter().any(Self::contains_confidential),
            _ => false,
        }
    }

    /// Flatten into non-null scalar values, descending into nested arrays.
    #[must_use]
    pub fn flatten(self) -> Vec<AttributeValue> {
        match self {
            AttributeValue::Null => Vec::new(),
            AttributeValue::Array(values) => {
                values.into_iter().flat_map(AttributeValue::flatten).collect()
            }
            other => vec![other],
        }
    }

    /// Human-readable type name used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::Null => "null",
            AttributeValue::String(_) => "string",
            AttributeValue::Integer(_) => "integer",
            AttributeValue::Boolean(_) => "boolean",
            AttributeValue::Binary(_) => "binary",
            AttributeValue::Array(_) => "array",
            AttributeValue::Guarded(_) => "guarded string",
            AttributeValue::Confidential(_) => "confidential reference",
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Integer(i)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        AttributeValue::Boolean(b)
    }
}

impl From<GuardedString> for AttributeValue {
    fn from(g: GuardedString) -> Self {
        AttributeValue::Guarded(g)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(values: Vec<T>) -> Self {
        AttributeValue::Array(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(AttributeValue::Null, Into::into)
    }
}
