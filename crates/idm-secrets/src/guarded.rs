//! Guarded (secret) string values.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Placeholder emitted wherever a guarded value would be rendered.
pub const MASK: &str = "********";

/// A credential-like string that must never be logged or persisted in plaintext.
///
/// `Debug` and `Display` print `[REDACTED]`, and serialization emits a fixed
/// mask. The plaintext is reachable only through [`GuardedString::expose_secret`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GuardedString(String);

impl GuardedString {
    /// Wrap a plaintext value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the plaintext.
    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// Whether the wrapped value is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for GuardedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GuardedString([REDACTED])")
    }
}

impl fmt::Display for GuardedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for GuardedString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for GuardedString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Serialize for GuardedString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(MASK)
    }
}

impl<'de> Deserialize<'de> for GuardedString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}
