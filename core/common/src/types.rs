//! Common types used throughout Tether.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of an entity type (e.g. "task", "project").
///
/// Entity types key the adapter registry and name directories in the
/// filesystem store, so they are restricted to a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityType(String);

impl EntityType {
    /// Create a new EntityType from a string.
    ///
    /// # Preconditions
    /// - `name` must be non-empty
    /// - `name` must not contain path separators or start with a dot
    ///
    /// # Errors
    /// - Returns error if the name violates a precondition
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "EntityType cannot be empty".to_string(),
            ));
        }
        if name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(crate::Error::InvalidInput(format!(
                "EntityType '{}' must be a single path component",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for EntityType {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.0
    }
}

impl FromStr for EntityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

macro_rules! sequence_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw sequence number.
            pub const fn new(seq: u64) -> Self {
                Self(seq)
            }

            /// Raw sequence number.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl FromStr for $name {
            type Err = crate::Error;

            /// Accepts both the display form (`op-7`) and the bare number (`7`).
            fn from_str(s: &str) -> crate::Result<Self> {
                let digits = s
                    .strip_prefix(concat!($prefix, "-"))
                    .unwrap_or(s);
                digits.parse::<u64>().map(Self).map_err(|_| {
                    crate::Error::InvalidInput(format!(
                        "'{}' is not a valid {} id",
                        s, $prefix
                    ))
                })
            }
        }
    };
}

sequence_id!(
    /// Identifier of a queued operation, ordered by generation.
    OperationId,
    "op"
);

sequence_id!(
    /// Identifier of a recorded conflict, ordered by generation.
    ConflictId,
    "conflict"
);
