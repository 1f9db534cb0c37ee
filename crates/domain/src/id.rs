//! Typed identifier for dice.
//!
//! Unlike device UUIDs, a die id is a host-chosen string (by default the die's
//! advertised name), so it is stable across restarts.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Unique identifier of a die session, used as the fan-out key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DieId(String);

impl DieId {
    /// Wrap a non-empty identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyId`] when `value` is empty or blank.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        Ok(Self(value))
    }

    /// Access the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DieId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DieId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DieId> for String {
    fn from(id: DieId) -> Self {
        id.0
    }
}

impl AsRef<str> for DieId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
