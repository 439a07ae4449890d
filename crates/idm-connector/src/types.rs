//! Operation type of a provisioning request.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of change requested on a target system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// Create the object on the target.
    Create,
    /// Update an existing object.
    Update,
    /// Delete the object.
    Delete,
}

impl OperationType {
    /// All operation types in canonical order.
    pub const ALL: [OperationType; 3] = [
        OperationType::Create,
        OperationType::Update,
        OperationType::Delete,
    ];

    /// String representation used in storage and configuration keys.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`OperationType`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid operation type: {0}")]
pub struct ParseOperationTypeError(pub String);

impl FromStr for OperationType {
    type Err = ParseOperationTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(OperationType::Create),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            _ => Err(ParseOperationTypeError(s.to_string())),
        }
    }
}
