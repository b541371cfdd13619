//! Per-type lookup tables: by id, and by each declared lookup key.

use super::handle::Entity;
use rolodex_core::{EntityId, Fields, LookupKey};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Default)]
pub(crate) struct LookupTables {
    by_id: HashMap<EntityId, Entity>,
    /// Non-id keys, each with a table from composite key value to handle.
    by_key: Vec<(LookupKey, HashMap<String, Entity>)>,
}

impl LookupTables {
    pub(crate) fn new(keys: &[LookupKey]) -> Self {
        Self {
            by_id: HashMap::new(),
            by_key: keys
                .iter()
                .filter(|k| !k.is_id())
                .map(|k| (k.clone(), HashMap::new()))
                .collect(),
        }
    }

    pub(crate) fn by_id(&self, id: EntityId) -> Option<&Entity> {
        self.by_id.get(&id)
    }

    /// Is this exact handle the cached one for its id?
    pub(crate) fn holds(&self, entity: &Entity) -> bool {
        self.by_id
            .get(&entity.id())
            .map(|cached| cached.same_handle(entity))
            .unwrap_or(false)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Cached handles in id order.
    pub(crate) fn entities(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self.by_id.values().cloned().collect();
        entities.sort_by_key(Entity::id);
        entities
    }

    /// Index a handle under its id and every key it has a full value for.
    /// A different entity already holding a key value loses that entry.
    pub(crate) fn insert(&mut self, entity: &Entity, fields: &Fields) {
        self.by_id.insert(entity.id(), entity.clone());
        for (key, table) in &mut self.by_key {
            if let Some(value) = key.value_of(Some(entity.id()), fields) {
                if let Some(displaced) = table.insert(value.clone(), entity.clone()) {
                    if displaced.id() != entity.id() {
                        warn!(
                            entity_type = %entity.entity_type(),
                            key = key.name(),
                            value = %value,
                            displaced = displaced.id(),
                            id = entity.id(),
                            "Lookup key value now held by another entity"
                        );
                    }
                }
            }
        }
    }

    /// Id of the handle cached under one key value, if any.
    #[cfg(test)]
    fn held_by(&self, key: &str, value: &str) -> Option<EntityId> {
        self.by_key
            .iter()
            .find(|(k, _)| k.name() == key)
            .and_then(|(_, table)| table.get(value))
            .map(Entity::id)
    }

    /// Remove a handle from every table under the values `fields` give it.
    /// Entries held by some other handle are left alone.
    pub(crate) fn remove(&mut self, entity: &Entity, fields: &Fields) {
        if self.holds(entity) {
            self.by_id.remove(&entity.id());
        }
        for (key, table) in &mut self.by_key {
            if let Some(value) = key.value_of(Some(entity.id()), fields) {
                if table.get(&value).map(|e| e.same_handle(entity)).unwrap_or(false) {
                    table.remove(&value);
                }
            }
        }
    }

    /// Look up by the first lookup key (id first) whose fields are exactly
    /// the parameter names. `None` when no key matches or nothing is cached
    /// under it.
    pub(crate) fn find(&self, id_key: &LookupKey, params: &Fields) -> Option<Entity> {
        if id_key.matches_params(params) {
            return params
                .get("id")
                .and_then(|v| v.as_int())
                .and_then(|id| self.by_id.get(&id).cloned());
        }
        let (key, table) = self.by_key.iter().find(|(key, _)| key.matches_params(params))?;
        let value = key.value_of(None, params)?;
        table.get(&value).cloned()
    }

    pub(crate) fn clear(&mut self) {
        self.by_id.clear();
        for (_, table) in &mut self.by_key {
            table.clear();
        }
    }
}
