//! Immutable entities with a pending changeset and a lazily built nested view.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use serde_json::{Map, Value};

use super::property::{flatten, Property};
use crate::fact::AttributePath;

#[derive(Debug)]
struct EntityState {
    id: String,
    attributes: BTreeMap<AttributePath, Property>,
    /// Properties not yet committed to the log
    changeset: Vec<Property>,
    next_rank: u64,
    view: OnceLock<Value>,
}

/// An entity value. `update` returns a new instance and leaves `self` untouched.
///
/// Cloning is cheap and clones share the materialized view.
#[derive(Debug, Clone)]
pub struct Entity {
    inner: Arc<EntityState>,
}

impl Entity {
    /// An entity with no attributes.
    pub fn new(id: impl Into<String>) -> Self {
        Self::from_parts(id.into(), BTreeMap::new(), Vec::new())
    }

    /// A fresh entity whose changeset holds every leaf of `traits`.
    pub fn from(id: impl Into<String>, traits: Value) -> Self {
        Self::new(id).update(traits)
    }

    pub(crate) fn from_parts(
        id: String,
        attributes: BTreeMap<AttributePath, Property>,
        changeset: Vec<Property>,
    ) -> Self {
        let next_rank = attributes
            .values()
            .map(|p| p.rank + 1)
            .max()
            .unwrap_or(0);
        Self {
            inner: Arc::new(EntityState {
                id,
                attributes,
                changeset,
                next_rank,
                view: OnceLock::new(),
            }),
        }
    }

    /// Merge `traits` into a new entity.
    ///
    /// Leaves whose value is identical to the current one are dropped, so
    /// re-applying the same input adds nothing to the changeset.
    pub fn update(&self, traits: Value) -> Entity {
        let state = &self.inner;
        let mut attributes = state.attributes.clone();
        let mut changeset = state.changeset.clone();
        let mut next_rank = state.next_rank;

        for mut property in flatten(&state.id, &traits) {
            let unchanged = attributes
                .get(property.path())
                .is_some_and(|current| current.same_as(&property));
            if unchanged {
                continue;
            }
            property.rank = next_rank;
            next_rank += 1;
            changeset.push(property.clone());
            attributes.insert(property.path().clone(), property);
        }

        Self {
            inner: Arc::new(EntityState {
                id: state.id.clone(),
                attributes,
                changeset,
                next_rank,
                view: OnceLock::new(),
            }),
        }
    }

    /// Same attributes, empty changeset.
    pub(crate) fn committed(&self) -> Entity {
        Self::from_parts(
            self.inner.id.clone(),
            self.inner.attributes.clone(),
            Vec::new(),
        )
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn get(&self, path: &AttributePath) -> Option<&Value> {
        self.inner.attributes.get(path).map(|p| p.value())
    }

    pub fn attributes(&self) -> &BTreeMap<AttributePath, Property> {
        &self.inner.attributes
    }

    pub fn changeset(&self) -> &[Property] {
        &self.inner.changeset
    }

    /// Nested object view, built on first access and cached for this instance.
    pub fn properties(&self) -> &Value {
        self.inner
            .view
            .get_or_init(|| materialize(self.inner.attributes.values()))
    }
}

/// Fold properties into a nested object, later ranks overwriting earlier ones.
pub fn materialize<'a>(properties: impl IntoIterator<Item = &'a Property>) -> Value {
    let mut ordered: Vec<&Property> = properties.into_iter().collect();
    ordered.sort_by_key(|p| p.rank);

    let mut root = Map::new();
    for property in ordered {
        assign(&mut root, property.path().tokens(), property.value().clone());
    }
    Value::Object(root)
}

fn assign(root: &mut Map<String, Value>, tokens: &[String], value: Value) {
    let Some((last, parents)) = tokens.split_last() else {
        return;
    };

    let mut node = root;
    for token in parents {
        let slot = node
            .entry(token.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        node = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }
    node.insert(last.clone(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::Fact;
    use serde_json::json;

    #[test]
    fn test_from_puts_everything_in_changeset() {
        let entity = Entity::from("p1", json!({ "kind": "project", "name": "Mycelial" }));
        assert_eq!(entity.id(), "p1");
        assert_eq!(entity.changeset().len(), 2);
        assert_eq!(entity.get(&"name".into()), Some(&json!("Mycelial")));
    }

    #[test]
    fn test_update_leaves_original_untouched() {
        let original = Entity::from("p1", json!({ "name": "a" }));
        let updated = original.update(json!({ "name": "b" }));
        assert_eq!(original.get(&"name".into()), Some(&json!("a")));
        assert_eq!(updated.get(&"name".into()), Some(&json!("b")));
    }

    #[test]
    fn test_identical_update_adds_nothing() {
        let committed = Entity::from("p1", json!({ "name": "a", "n": { "x": 1 } })).committed();
        let again = committed.update(json!({ "name": "a", "n": { "x": 1 } }));
        assert!(again.changeset().is_empty());
    }

    #[test]
    fn test_partial_update_only_tracks_changes() {
        let committed = Entity::from("p1", json!({ "name": "a", "kind": "project" })).committed();
        let updated = committed.update(json!({ "name": "b", "kind": "project" }));
        assert_eq!(updated.changeset().len(), 1);
        assert_eq!(updated.changeset()[0].value(), &json!("b"));
    }

    #[test]
    fn test_changeset_accumulates_across_updates() {
        let entity = Entity::new("p1")
            .update(json!({ "a": 1 }))
            .update(json!({ "b": 2 }));
        assert_eq!(entity.changeset().len(), 2);
    }

    #[test]
    fn test_properties_round_trip() {
        let object = json!({
            "kind": "item",
            "todo": {
                "title": "A todo item",
                "actually": { "deeper": ["l", "i", "s", "t"] },
                "done": false
            },
            "count": 3
        });
        let entity = Entity::from("item-0", object.clone());
        assert_eq!(entity.properties(), &object);
    }

    #[test]
    fn test_empty_nested_object_does_not_round_trip() {
        let entity = Entity::from("p1", json!({ "a": {}, "name": "x" }));
        assert_eq!(entity.changeset().len(), 1);
        assert_eq!(entity.properties(), &json!({ "name": "x" }));
        assert!(Entity::from("p2", json!({ "a": {} })).changeset().is_empty());
    }

    #[test]
    fn test_properties_cached_per_instance() {
        let entity = Entity::from("p1", json!({ "name": "a" }));
        let first = entity.properties() as *const Value;
        let second = entity.properties() as *const Value;
        assert_eq!(first, second);
    }

    #[test]
    fn test_later_leaf_replaces_scalar_parent() {
        let entity = Entity::new("e")
            .update(json!({ "todo": "plain" }))
            .update(json!({ "todo": { "title": "t" } }));
        assert_eq!(entity.properties(), &json!({ "todo": { "title": "t" } }));
    }

    #[test]
    fn test_later_scalar_replaces_object() {
        let entity = Entity::new("e")
            .update(json!({ "todo": { "title": "t" } }))
            .update(json!({ "todo": "plain" }));
        assert_eq!(entity.properties(), &json!({ "todo": "plain" }));
    }

    #[test]
    fn test_materialize_orders_by_rank() {
        let props = vec![
            Property::new(Fact::new("e", "x", 2), 5),
            Property::new(Fact::new("e", ["x", "y"], 1), 1),
        ];
        assert_eq!(materialize(&props), json!({ "x": 2 }));
    }
}
