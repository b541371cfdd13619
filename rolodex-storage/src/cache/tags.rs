//! Tags on taggable entity types.

use super::handle::Entity;
use super::read::LookupArg;
use super::registry::EntityCache;
use crate::RemoteBoundary;
use rolodex_core::{EntityId, EntityTypeDescriptor, RawRecord, RolodexResult, ValidationError};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Entity type of tags.
pub const TAG_ENTITY: &str = "Tag";

/// Link entity attaching a tag to an entity.
pub const ENTITY_TAG_ENTITY: &str = "EntityTag";

fn link_params(descriptor: &EntityTypeDescriptor, id: EntityId) -> RawRecord {
    let mut params = RawRecord::new();
    params.insert("entity_table".to_string(), JsonValue::from(descriptor.table()));
    params.insert("entity_id".to_string(), JsonValue::from(id));
    params
}

fn json_int(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

impl<R: RemoteBoundary> EntityCache<R> {
    fn taggable_descriptor(&self, entity_type: &str) -> RolodexResult<Arc<EntityTypeDescriptor>> {
        let descriptor = self.descriptor(entity_type)?;
        if !descriptor.taggable() {
            return Err(ValidationError::Unsupported {
                entity_type: entity_type.to_string(),
                operation: "tags".to_string(),
            }
            .into());
        }
        Ok(descriptor)
    }

    /// Apply `update` to the cached tag set of an entity, if one is loaded.
    fn update_cached_tags(
        &self,
        entity_type: &str,
        id: EntityId,
        update: impl FnOnce(&mut BTreeSet<EntityId>),
    ) -> RolodexResult<()> {
        let mut state = self.lock()?;
        if let Some(tags) = state.type_cache_mut(entity_type)?.tags.get_mut(&id) {
            update(tags);
        }
        Ok(())
    }

    pub fn tag(&self, entity: &Entity, tag: impl Into<LookupArg>) -> RolodexResult<()> {
        if entity.is_deleted() {
            return Err(entity.deleted_error());
        }
        self.tag_id(entity.entity_type(), entity.id(), tag)
    }

    pub fn tag_id(&self, entity_type: &str, id: EntityId, tag: impl Into<LookupArg>) -> RolodexResult<()> {
        let descriptor = self.taggable_descriptor(entity_type)?;
        let tag_id = self.resolve_id(TAG_ENTITY, tag)?;
        let mut params = link_params(&descriptor, id);
        params.insert("tag_id".to_string(), JsonValue::from(tag_id));
        self.remote_write(ENTITY_TAG_ENTITY, "create", &params)?;
        self.update_cached_tags(entity_type, id, |tags| {
            tags.insert(tag_id);
        })?;
        info!(entity_type, id, tag_id, "Tag added");
        Ok(())
    }

    pub fn untag(&self, entity: &Entity, tag: impl Into<LookupArg>) -> RolodexResult<()> {
        if entity.is_deleted() {
            return Err(entity.deleted_error());
        }
        self.untag_id(entity.entity_type(), entity.id(), tag)
    }

    /// Remove a tag. Removing a tag the entity does not carry is a no-op.
    pub fn untag_id(&self, entity_type: &str, id: EntityId, tag: impl Into<LookupArg>) -> RolodexResult<()> {
        let descriptor = self.taggable_descriptor(entity_type)?;
        let tag_id = self.resolve_id(TAG_ENTITY, tag)?;
        let mut params = link_params(&descriptor, id);
        params.insert("tag_id".to_string(), JsonValue::from(tag_id));
        for link in self.remote_read(ENTITY_TAG_ENTITY, &params)? {
            if let Some(link_id) = link.get("id").and_then(json_int) {
                self.remote_remove(ENTITY_TAG_ENTITY, link_id, true)?;
            }
        }
        self.update_cached_tags(entity_type, id, |tags| {
            tags.remove(&tag_id);
        })?;
        info!(entity_type, id, tag_id, "Tag removed");
        Ok(())
    }

    pub fn has_tag(&self, entity: &Entity, tag: impl Into<LookupArg>) -> RolodexResult<bool> {
        let tag_id = self.resolve_id(TAG_ENTITY, tag)?;
        Ok(self.tag_ids(entity)?.contains(&tag_id))
    }

    /// Ids of the tags an entity carries, in id order. Fetched once and kept
    /// while the entity is cached.
    pub fn tag_ids(&self, entity: &Entity) -> RolodexResult<Vec<EntityId>> {
        if entity.is_deleted() {
            return Err(entity.deleted_error());
        }
        self.id_tag_ids(entity.entity_type(), entity.id())
    }

    pub fn id_tag_ids(&self, entity_type: &str, id: EntityId) -> RolodexResult<Vec<EntityId>> {
        let descriptor = self.taggable_descriptor(entity_type)?;
        {
            let state = self.lock()?;
            if let Some(tags) = state.type_cache(entity_type)?.tags.get(&id) {
                return Ok(tags.iter().copied().collect());
            }
        }

        let tag_ids: BTreeSet<EntityId> = self
            .remote_read(ENTITY_TAG_ENTITY, &link_params(&descriptor, id))?
            .iter()
            .filter_map(|link| link.get("tag_id").and_then(json_int))
            .collect();

        let mut state = self.lock()?;
        if state.cached(entity_type, id)?.is_some() {
            debug!(entity_type, id, count = tag_ids.len(), "Tags cached");
            state.type_cache_mut(entity_type)?.tags.insert(id, tag_ids.clone());
        }
        Ok(tag_ids.into_iter().collect())
    }
}
