//! Entity identity, handles and field values

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identity of a saved record in the tracking system: `(type, id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: i64,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, id: i64) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// Errors parsing a `Type:id` reference
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("expected TYPE:ID, got '{0}'")]
    InvalidFormat(String),

    #[error("entity type must not be empty")]
    EmptyType,

    #[error("invalid entity id '{0}'")]
    InvalidId(String),
}

impl FromStr for EntityKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_type, id) = s
            .split_once(':')
            .ok_or_else(|| KeyParseError::InvalidFormat(s.to_string()))?;

        let entity_type = entity_type.trim();
        if entity_type.is_empty() {
            return Err(KeyParseError::EmptyType);
        }

        let id = id
            .trim()
            .parse::<i64>()
            .map_err(|_| KeyParseError::InvalidId(id.to_string()))?;

        Ok(Self::new(entity_type, id))
    }
}

/// Handle to a canonical entity owned by a [`Session`](crate::core::Session)
///
/// Handles are cheap to copy. Two handles compare equal exactly when they
/// name the same canonical entity in the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    session: u64,
    index: usize,
}

impl Entity {
    pub(crate) fn new(session: u64, index: usize) -> Self {
        Self { session, index }
    }

    /// The id of the session that owns this entity
    pub fn session_id(&self) -> u64 {
        self.session
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }
}

/// A field value held by an entity
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Entity(Entity),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<Entity> {
        match self {
            Value::Entity(e) => Some(*e),
            _ => None,
        }
    }

    /// Name of the value's kind, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Entity(_) => "entity",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Truthiness used by schema conditions
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Entity(_) => true,
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parse() {
        let key: EntityKey = "Shot:42".parse().unwrap();
        assert_eq!(key, EntityKey::new("Shot", 42));
        assert_eq!(key.to_string(), "Shot:42");
    }

    #[test]
    fn test_key_parse_errors() {
        assert_eq!(
            "Shot".parse::<EntityKey>(),
            Err(KeyParseError::InvalidFormat("Shot".to_string()))
        );
        assert_eq!(":4".parse::<EntityKey>(), Err(KeyParseError::EmptyType));
        assert!(matches!(
            "Shot:abc".parse::<EntityKey>(),
            Err(KeyParseError::InvalidId(_))
        ));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(Value::Str("x".into()).truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::List(vec![Value::Null]).truthy());
    }
}
