//! Target schema attributes.

use idm_core::SchemaAttributeId;
use serde::{Deserialize, Serialize};

/// Name of the attribute carrying an object's primary name.
pub const NAME_ATTRIBUTE: &str = "__NAME__";

/// Name of the canonical password attribute.
pub const PASSWORD_ATTRIBUTE: &str = "__PASSWORD__";

/// An attribute of a target system object class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaAttribute {
    /// Unique identifier.
    pub id: SchemaAttributeId,
    /// Attribute name on the target.
    pub name: String,
    /// Object class the attribute belongs to.
    pub object_class: String,
    /// Value type on the target (e.g. `java.lang.String`, `GuardedString`).
    pub class_type: String,
    /// Whether the attribute holds several values.
    #[serde(default)]
    pub multivalued: bool,
    /// Whether the attribute may be set on create.
    #[serde(default = "default_true")]
    pub createable: bool,
    /// Whether the attribute may be changed on update.
    #[serde(default = "default_true")]
    pub updateable: bool,
    /// Whether the attribute is readable.
    #[serde(default = "default_true")]
    pub readable: bool,
    /// Whether the attribute must be present on create.
    #[serde(default)]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

impl SchemaAttribute {
    /// Create a single-valued, read-write string attribute.
    pub fn new(name: impl Into<String>, object_class: impl Into<String>) -> Self {
        Self {
            id: SchemaAttributeId::new(),
            name: name.into(),
            object_class: object_class.into(),
            class_type: "java.lang.String".to_string(),
            multivalued: false,
            createable: true,
            updateable: true,
            readable: true,
            required: false,
        }
    }

    /// Mark as multi-valued.
    #[must_use]
    pub fn multivalued(mut self) -> Self {
        self.multivalued = true;
        self
    }

    /// Mark as not updateable.
    #[must_use]
    pub fn create_only(mut self) -> Self {
        self.updateable = false;
        self
    }

    /// Set the class type.
    #[must_use]
    pub fn with_class_type(mut self, class_type: impl Into<String>) -> Self {
        self.class_type = class_type.into();
        self
    }

    /// Mark as the write-only, guarded password attribute.
    #[must_use]
    pub fn password(mut self) -> Self {
        self.class_type = "GuardedString".to_string();
        self.readable = false;
        self
    }

    /// Whether this is the canonical password attribute.
    #[must_use]
    pub fn is_password(&self) -> bool {
        self.name == PASSWORD_ATTRIBUTE
    }
}
