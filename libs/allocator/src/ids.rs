//! Typed IDs for agents and frameworks.
//!
//! IDs are assigned by the master and are opaque here; the newtypes exist
//! to keep the two id spaces from mixing. Both are ordered so they can key
//! `BTreeMap`s and provide deterministic iteration in tests.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors from parsing an ID string.
#[derive(Debug, Error)]
pub enum IdError {
    #[error("id must not be empty")]
    Empty,

    #[error("id must not contain whitespace: '{0}'")]
    Whitespace(String),
}

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw id string without validation.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Parses and validates an id string.
            pub fn parse(s: &str) -> Result<Self, IdError> {
                if s.is_empty() {
                    return Err(IdError::Empty);
                }
                if s.chars().any(char::is_whitespace) {
                    return Err(IdError::Whitespace(s.to_string()));
                }
                Ok(Self(s.to_string()))
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

define_id!(
    /// Identifies an agent (a node contributing resources).
    AgentId
);

define_id!(
    /// Identifies a framework (a scheduler consuming offers).
    FrameworkId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let id = AgentId::parse("agent-7").unwrap();
        assert_eq!(id.to_string(), "agent-7");
        assert_eq!(id, AgentId::new("agent-7"));
    }

    #[test]
    fn test_parse_rejects_empty_and_whitespace() {
        assert!(matches!(AgentId::parse(""), Err(IdError::Empty)));
        assert!(matches!(
            FrameworkId::parse("fw 1"),
            Err(IdError::Whitespace(_))
        ));
    }

    #[test]
    fn test_ids_are_ordered() {
        assert!(FrameworkId::new("fw-1") < FrameworkId::new("fw-2"));
    }

    #[test]
    fn test_json_roundtrip() {
        let id = FrameworkId::new("fw-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"fw-1\"");
        let parsed: FrameworkId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
