//! Facts (triples) and the identifiers they are keyed by.
//!
//! A fact is the atomic record of the log:
//! ```text
//! [ entityId, attributePath, value ]
//!   "p1"      "name"         "Mycelial"
//!   "p1"      ["todo","id"]  "a-todo-item"
//! ```
//!
//! Attribute paths with a single token travel as a bare string, deeper paths
//! as an array of tokens. Values are opaque leaves: arrays are never split.

use std::fmt;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity of one writer. Must be unique per writer; collisions are not detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Draw a fresh identifier from a v4 UUID.
    pub fn random() -> Self {
        let (hi, lo) = Uuid::new_v4().as_u64_pair();
        Self(hi ^ lo)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ReplicaId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered tokens addressing a leaf inside an entity's nested object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AttributePath(Vec<String>);

impl AttributePath {
    pub fn new(tokens: Vec<String>) -> Self {
        Self(tokens)
    }

    pub fn single(key: impl Into<String>) -> Self {
        Self(vec![key.into()])
    }

    /// Extend the path by one key.
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut tokens = self.0.clone();
        tokens.push(key.into());
        Self(tokens)
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for AttributePath {
    fn from(key: &str) -> Self {
        Self::single(key)
    }
}

impl<const N: usize> From<[&str; N]> for AttributePath {
    fn from(tokens: [&str; N]) -> Self {
        Self(tokens.iter().map(|t| t.to_string()).collect())
    }
}

impl fmt::Display for AttributePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl Serialize for AttributePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.as_slice() {
            [single] => serializer.serialize_str(single),
            tokens => tokens.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for AttributePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flat(String),
            Nested(Vec<String>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Flat(key) => Ok(Self::single(key)),
            Repr::Nested(tokens) if tokens.is_empty() => {
                Err(de::Error::custom("attribute path must not be empty"))
            }
            Repr::Nested(tokens) => Ok(Self(tokens)),
        }
    }
}

/// One `(entityId, attributePath, value)` record.
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub entity: String,
    pub path: AttributePath,
    pub value: Value,
}

impl Fact {
    pub fn new(entity: impl Into<String>, path: impl Into<AttributePath>, value: impl Into<Value>) -> Self {
        Self {
            entity: entity.into(),
            path: path.into(),
            value: value.into(),
        }
    }
}

impl Serialize for Fact {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.entity)?;
        tuple.serialize_element(&self.path)?;
        tuple.serialize_element(&self.value)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for Fact {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FactVisitor;

        impl<'de> Visitor<'de> for FactVisitor {
            type Value = Fact;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a [entityId, attributePath, value] triple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Fact, A::Error> {
                let entity = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let path = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                Ok(Fact { entity, path, value })
            }
        }

        deserializer.deserialize_tuple(3, FactVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_token_path_is_flat_key() {
        let fact = Fact::new("p1", "name", "Mycelial");
        let encoded = serde_json::to_value(&fact).unwrap();
        assert_eq!(encoded, json!(["p1", "name", "Mycelial"]));
    }

    #[test]
    fn test_nested_path_is_array() {
        let fact = Fact::new("item-0", ["todo", "title"], "A todo item");
        let encoded = serde_json::to_value(&fact).unwrap();
        assert_eq!(encoded, json!(["item-0", ["todo", "title"], "A todo item"]));
    }

    #[test]
    fn test_decode_accepts_both_path_forms() {
        let flat: Fact = serde_json::from_value(json!(["a", "x", 1])).unwrap();
        assert_eq!(flat.path, AttributePath::single("x"));

        let nested: Fact = serde_json::from_value(json!(["a", ["x", "y"], [1, 2]])).unwrap();
        assert_eq!(nested.path, AttributePath::from(["x", "y"]));
        assert_eq!(nested.value, json!([1, 2]));
    }

    #[test]
    fn test_decode_rejects_short_tuple() {
        assert!(serde_json::from_value::<Fact>(json!(["a", "x"])).is_err());
    }

    #[test]
    fn test_decode_rejects_empty_path() {
        assert!(serde_json::from_value::<Fact>(json!(["a", [], 1])).is_err());
    }

    #[test]
    fn test_path_child() {
        let path = AttributePath::single("todo").child("title");
        assert_eq!(path.tokens(), &["todo".to_string(), "title".to_string()]);
        assert_eq!(path.to_string(), "todo.title");
    }

    #[test]
    fn test_replica_id_display_is_decimal() {
        assert_eq!(ReplicaId(42).to_string(), "42");
    }

    #[test]
    fn test_random_replica_ids_differ() {
        assert_ne!(ReplicaId::random(), ReplicaId::random());
    }
}
