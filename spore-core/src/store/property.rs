//! Properties: facts with an identity hash, and the flattening that produces them.
//!
//! ```text
//! flatten("item-0", { todo: { title: "t", tags: ["a","b"] } })
//!   → ["item-0", ["todo","title"], "t"]
//!   → ["item-0", ["todo","tags"],  ["a","b"]]     arrays are leaves
//! ```

use serde_json::Value;

use crate::fact::{AttributePath, Fact};

/// A fact plus its identity hash and position in its entity's history.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub fact: Fact,
    /// Hash over `(entity, path, value)`; equal hashes mean a value-identical write
    pub hash: u64,
    /// Later ranks win when materializing
    pub rank: u64,
}

impl Property {
    pub fn new(fact: Fact, rank: u64) -> Self {
        let hash = identity_hash(&fact);
        Self { fact, hash, rank }
    }

    pub fn path(&self) -> &AttributePath {
        &self.fact.path
    }

    pub fn value(&self) -> &Value {
        &self.fact.value
    }

    /// Same entity, path and value as `other`.
    pub fn same_as(&self, other: &Property) -> bool {
        self.hash == other.hash && self.fact == other.fact
    }
}

/// FNV-1a over the entity id, each path token and the canonical JSON of the value.
fn identity_hash(fact: &Fact) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    fn mix(mut hash: u64, bytes: &[u8]) -> u64 {
        for byte in bytes {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(PRIME);
        }
        // Field separator so ("ab","c") and ("a","bc") differ
        hash ^= 0xff;
        hash.wrapping_mul(PRIME)
    }

    let mut hash = mix(OFFSET, fact.entity.as_bytes());
    for token in fact.path.tokens() {
        hash = mix(hash, token.as_bytes());
    }
    mix(hash, fact.value.to_string().as_bytes())
}

/// Decompose a nested object into one property per leaf.
///
/// Only plain objects are recursed into. A non-object `value` has no
/// attribute path to live at and yields nothing, and neither does an empty
/// nested object: it has no leaf to become a fact.
pub fn flatten(id: &str, value: &Value) -> Vec<Property> {
    let mut out = Vec::new();
    if let Value::Object(map) = value {
        for (key, child) in map {
            walk(id, AttributePath::single(key.clone()), child, &mut out);
        }
    }
    out
}

fn walk(id: &str, path: AttributePath, value: &Value, out: &mut Vec<Property>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                walk(id, path.child(key.clone()), child, out);
            }
        }
        leaf => {
            let rank = out.len() as u64;
            out.push(Property::new(Fact::new(id, path, leaf.clone()), rank));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_nested() {
        let props = flatten(
            "item-0",
            &json!({ "kind": "item", "todo": { "title": "t", "projectId": "project-1" } }),
        );
        let paths: Vec<String> = props.iter().map(|p| p.path().to_string()).collect();
        assert_eq!(paths, vec!["kind", "todo.projectId", "todo.title"]);
        assert!(props.iter().all(|p| p.fact.entity == "item-0"));
    }

    #[test]
    fn test_arrays_are_leaves() {
        let props = flatten("a", &json!({ "deeper": ["l", "i", "s", "t"] }));
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].value(), &json!(["l", "i", "s", "t"]));
    }

    #[test]
    fn test_arrays_of_objects_are_leaves() {
        let props = flatten("a", &json!({ "items": [{ "x": 1 }] }));
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].path(), &AttributePath::single("items"));
    }

    #[test]
    fn test_empty_nested_object_yields_nothing() {
        let props = flatten("a", &json!({ "a": {}, "b": { "c": {} }, "d": 1 }));
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].path(), &AttributePath::single("d"));
    }

    #[test]
    fn test_flatten_scalar_yields_nothing() {
        assert!(flatten("a", &json!(5)).is_empty());
    }

    #[test]
    fn test_identity_hash_detects_value_change() {
        let a = Property::new(Fact::new("e", "x", 1), 0);
        let b = Property::new(Fact::new("e", "x", 1), 7);
        let c = Property::new(Fact::new("e", "x", 2), 0);
        assert!(a.same_as(&b));
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn test_identity_hash_separates_fields() {
        let a = Property::new(Fact::new("ab", "c", 1), 0);
        let b = Property::new(Fact::new("a", "bc", 1), 0);
        assert_ne!(a.hash, b.hash);
    }
}
