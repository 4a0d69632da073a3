use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde_json::Value;

use super::entity::Entity;
use super::property::Property;
use crate::fact::{AttributePath, Fact};

/// Entity id → entity, derived from the log alone.
#[derive(Debug, Clone, Default)]
pub struct Index {
    entities: FxHashMap<String, Entity>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a full snapshot; the last fact per attribute path wins.
    pub fn fold(snapshot: impl IntoIterator<Item = Fact>) -> Self {
        let mut grouped: FxHashMap<String, BTreeMap<AttributePath, Property>> =
            FxHashMap::default();
        for (rank, fact) in snapshot.into_iter().enumerate() {
            let attributes = grouped.entry(fact.entity.clone()).or_default();
            attributes.insert(fact.path.clone(), Property::new(fact, rank as u64));
        }

        let entities = grouped
            .into_iter()
            .map(|(id, attributes)| {
                let entity = Entity::from_parts(id.clone(), attributes, Vec::new());
                (id, entity)
            })
            .collect();
        Self { entities }
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn insert(&mut self, entity: Entity) {
        self.entities.insert(entity.id().to_string(), entity);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Entities ordered by id.
    pub fn sorted(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.id().cmp(b.id()));
        entities
    }

    /// Nested view of every entity, keyed by id.
    pub fn materialize(&self) -> BTreeMap<String, Value> {
        self.entities
            .iter()
            .map(|(id, entity)| (id.clone(), entity.properties().clone()))
            .collect()
    }
}
