//! Connector-level object sent to a target system.

use serde::{Deserialize, Serialize};

use crate::value::AttributeValue;

/// A named attribute with its values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorAttribute {
    /// Schema attribute name on the target.
    pub name: String,
    /// Values, empty meaning "clear".
    pub values: Vec<AttributeValue>,
    /// Only write when the target currently holds no value.
    #[serde(default)]
    pub only_if_empty: bool,
}

impl ConnectorAttribute {
    /// Create an attribute from a value, flattening arrays into the value list.
    pub fn new(name: impl Into<String>, value: AttributeValue) -> Self {
        let values = match value {
            AttributeValue::Null => Vec::new(),
            AttributeValue::Array(values) => values,
            other => vec![other],
        };
        Self {
            name: name.into(),
            values,
            only_if_empty: false,
        }
    }

    /// Mark the attribute as write-if-empty.
    #[must_use]
    pub fn only_if_empty(mut self) -> Self {
        self.only_if_empty = true;
        self
    }
}

/// Object handed to a connector: object class, target UID and attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorObject {
    /// Object class on the target (e.g. `__ACCOUNT__`).
    pub object_class: String,
    /// UID of the object on the target, when known.
    pub uid: Option<String>,
    /// Attributes in mapping order.
    pub attributes: Vec<ConnectorAttribute>,
}

impl ConnectorObject {
    /// Create an empty object.
    pub fn new(object_class: impl Into<String>, uid: Option<String>) -> Self {
        Self {
            object_class: object_class.into(),
            uid,
            attributes: Vec::new(),
        }
    }

    /// Add or replace an attribute.
    pub fn set(&mut self, attribute: ConnectorAttribute) {
        match self.attributes.iter_mut().find(|a| a.name == attribute.name) {
            Some(existing) => *existing = attribute,
            None => self.attributes.push(attribute),
        }
    }

    /// Look up an attribute by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ConnectorAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Whether the object carries no attributes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}
