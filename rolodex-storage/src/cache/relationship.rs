//! Parent to children index for one declared relationship.
//!
//! A parent id is either absent (children never loaded) or present with the
//! complete set of its children. Children are reachable in position order
//! and by each secondary key; string keys match case-insensitively.

use super::handle::Entity;
use rolodex_core::{
    ConsistencyError, EntityId, EntityTypeSpec, Fields, ParentSpec, RolodexResult,
    ValidationError, Value,
};
use std::collections::HashMap;

#[derive(Debug, Default)]
struct ParentSlot {
    ordered: Vec<Entity>,
    by_key: HashMap<String, HashMap<String, Entity>>,
}

#[derive(Debug)]
pub(crate) struct RelationshipIndex {
    name: String,
    children_name: String,
    parent_type: String,
    child_type: String,
    parent_table: String,
    parent_id_field: String,
    parent_table_field: Option<String>,
    int_key: String,
    string_key: Option<String>,
    keys: Vec<String>,
    position_field: Option<String>,
    slots: HashMap<EntityId, ParentSlot>,
}

impl RelationshipIndex {
    pub(crate) fn new(child: &EntityTypeSpec, parent: &ParentSpec, parent_table: String) -> Self {
        let int_key = parent.int_lookup.clone().unwrap_or_else(|| "id".to_string());
        let mut keys = vec!["id".to_string()];
        for key in std::iter::once(&int_key)
            .chain(parent.string_lookup.iter())
            .chain(parent.extra_lookups.iter())
        {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        Self {
            name: parent.name.clone(),
            children_name: parent.children.clone(),
            parent_type: parent.parent.clone(),
            child_type: child.name.clone(),
            parent_table,
            parent_id_field: parent.parent_id_field.clone(),
            parent_table_field: parent.parent_table_field.clone(),
            int_key,
            string_key: parent.string_lookup.clone(),
            keys,
            position_field: child.position_field.clone(),
            slots: HashMap::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn children_name(&self) -> &str {
        &self.children_name
    }

    pub(crate) fn parent_type(&self) -> &str {
        &self.parent_type
    }

    pub(crate) fn child_type(&self) -> &str {
        &self.child_type
    }

    pub(crate) fn parent_table(&self) -> &str {
        &self.parent_table
    }

    pub(crate) fn parent_id_field(&self) -> &str {
        &self.parent_id_field
    }

    pub(crate) fn parent_table_field(&self) -> Option<&str> {
        self.parent_table_field.as_deref()
    }

    /// Fields a child can be looked up by within one parent.
    pub(crate) fn keys(&self) -> &[String] {
        &self.keys
    }

    pub(crate) fn cached_parent_count(&self) -> usize {
        self.slots.len()
    }

    /// Id of the parent a child with these fields belongs to, if any.
    pub(crate) fn parent_id_of(&self, fields: &Fields) -> Option<EntityId> {
        if let Some(table_field) = &self.parent_table_field {
            let table = fields.get(table_field).and_then(Value::as_str)?;
            if !table.eq_ignore_ascii_case(&self.parent_table) {
                return None;
            }
        }
        fields.get(&self.parent_id_field).and_then(Value::as_int)
    }

    pub(crate) fn is_parent_cached(&self, parent_id: EntityId) -> bool {
        self.slots.contains_key(&parent_id)
    }

    pub(crate) fn cache_parent(&mut self, parent_id: EntityId) -> Result<(), ConsistencyError> {
        if self.slots.contains_key(&parent_id) {
            return Err(ConsistencyError::ParentAlreadyCached {
                parent_type: self.parent_type.clone(),
                parent_id,
            });
        }
        let mut slot = ParentSlot::default();
        for key in &self.keys {
            slot.by_key.insert(key.clone(), HashMap::new());
        }
        self.slots.insert(parent_id, slot);
        Ok(())
    }

    pub(crate) fn uncache_parent(&mut self, parent_id: EntityId) -> Result<(), ConsistencyError> {
        self.slots
            .remove(&parent_id)
            .map(|_| ())
            .ok_or_else(|| self.parent_not_cached(parent_id))
    }

    fn parent_not_cached(&self, parent_id: EntityId) -> ConsistencyError {
        ConsistencyError::ParentNotCached {
            parent_type: self.parent_type.clone(),
            parent_id,
        }
    }

    fn key_value(&self, key: &str, child: &Entity, fields: &Fields) -> Option<String> {
        if key == "id" {
            Some(child.id().to_string())
        } else {
            fields.get(key).and_then(Value::lookup_fragment)
        }
    }

    fn position(&self, fields: &Fields) -> Option<i64> {
        let field = self.position_field.as_ref()?;
        fields.get(field).and_then(Value::as_int)
    }

    /// Is this exact handle indexed under the parent?
    pub(crate) fn contains_child(&self, parent_id: EntityId, child: &Entity) -> bool {
        self.slots
            .get(&parent_id)
            .map(|slot| slot.ordered.iter().any(|c| c.same_handle(child)))
            .unwrap_or(false)
    }

    /// Index a child under its parent, whose slot must exist.
    pub(crate) fn cache_child(&mut self, child: &Entity, fields: &Fields) -> RolodexResult<()> {
        if child.entity_type() != self.child_type {
            return Err(ConsistencyError::WrongEntityType {
                entity: child.to_string(),
                expected: self.child_type.clone(),
            }
            .into());
        }
        let parent_id = self.parent_id_of(fields).ok_or_else(|| ValidationError::NoParent {
            entity: child.to_string(),
            parent_type: self.parent_type.clone(),
        })?;
        let slot = self
            .slots
            .get(&parent_id)
            .ok_or_else(|| self.parent_not_cached(parent_id))?;

        let mut entries = Vec::new();
        for key in &self.keys {
            if let Some(value) = self.key_value(key, child, fields) {
                if slot.by_key.get(key).map(|t| t.contains_key(&value)).unwrap_or(false) {
                    return Err(ConsistencyError::DuplicateChildKey {
                        parent_type: self.parent_type.clone(),
                        parent_id,
                        child_type: self.child_type.clone(),
                        field: key.clone(),
                        value,
                    }
                    .into());
                }
                entries.push((key.clone(), value));
            }
        }

        // Siblings without a position sort after every positioned one.
        let insert_at = match self.position(fields) {
            None => slot.ordered.len(),
            Some(own) => {
                let mut at = slot.ordered.len();
                for (i, sibling) in slot.ordered.iter().enumerate() {
                    let theirs = self.position(&sibling.fields_unchecked()?);
                    if theirs.map(|p| p > own).unwrap_or(true) {
                        at = i;
                        break;
                    }
                }
                at
            }
        };

        let slot = self
            .slots
            .get_mut(&parent_id)
            .ok_or_else(|| ConsistencyError::ParentNotCached {
                parent_type: self.parent_type.clone(),
                parent_id,
            })?;
        slot.ordered.insert(insert_at, child.clone());
        for (key, value) in entries {
            slot.by_key.entry(key).or_default().insert(value, child.clone());
        }
        Ok(())
    }

    /// Exact inverse of [`cache_child`](Self::cache_child); `fields` must be
    /// the values the child was indexed under.
    pub(crate) fn uncache_child(&mut self, child: &Entity, fields: &Fields) -> RolodexResult<()> {
        let missing = |field: &str, value: String| ConsistencyError::ChildKeyMissing {
            parent_type: self.parent_type.clone(),
            parent_id: self.parent_id_of(fields).unwrap_or_default(),
            child_type: self.child_type.clone(),
            field: field.to_string(),
            value,
        };
        let parent_id = self
            .parent_id_of(fields)
            .ok_or_else(|| missing(&self.parent_id_field, "NULL".to_string()))?;
        let slot = self
            .slots
            .get(&parent_id)
            .ok_or_else(|| self.parent_not_cached(parent_id))?;

        let position = slot
            .ordered
            .iter()
            .position(|c| c.same_handle(child))
            .ok_or_else(|| missing("id", child.id().to_string()))?;
        let mut entries = Vec::new();
        for key in &self.keys {
            if let Some(value) = self.key_value(key, child, fields) {
                let held = slot
                    .by_key
                    .get(key)
                    .and_then(|t| t.get(&value))
                    .map(|c| c.same_handle(child))
                    .unwrap_or(false);
                if !held {
                    return Err(missing(key, value).into());
                }
                entries.push((key.clone(), value));
            }
        }

        if let Some(slot) = self.slots.get_mut(&parent_id) {
            slot.ordered.remove(position);
            for (key, value) in entries {
                if let Some(table) = slot.by_key.get_mut(&key) {
                    table.remove(&value);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn get_children(&self, parent_id: EntityId) -> Option<Vec<Entity>> {
        self.slots.get(&parent_id).map(|slot| slot.ordered.clone())
    }

    /// Find one child by key. With no explicit key, integers use the integer
    /// key and strings the string key.
    pub(crate) fn get_child(
        &self,
        parent_id: EntityId,
        key: Option<&str>,
        value: &Value,
    ) -> RolodexResult<Option<Entity>> {
        if value.is_empty() {
            return Err(ValidationError::EmptyChildLookup {
                entity_type: self.child_type.clone(),
            }
            .into());
        }
        let key = match key {
            Some(key) => key.to_string(),
            None => match value {
                Value::Int(_) | Value::Ref(_) => self.int_key.clone(),
                Value::String(_) => self.string_key.clone().ok_or_else(|| {
                    ValidationError::UnusableLookup {
                        entity_type: self.child_type.clone(),
                        value: value.to_string(),
                    }
                })?,
                other => {
                    return Err(ValidationError::UnusableLookup {
                        entity_type: self.child_type.clone(),
                        value: other.to_string(),
                    }
                    .into())
                }
            },
        };
        let slot = self
            .slots
            .get(&parent_id)
            .ok_or_else(|| self.parent_not_cached(parent_id))?;
        let table = slot.by_key.get(&key).ok_or_else(|| ValidationError::NotIndexed {
            entity_type: self.child_type.clone(),
            field: key.clone(),
        })?;
        Ok(value.lookup_fragment().and_then(|v| table.get(&v).cloned()))
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}
