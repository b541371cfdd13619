//! Relationship traversal between declared parent and child types.
//!
//! A parent's children are loaded from the remote boundary in one read the
//! first time they are asked for, and served from the relationship index
//! from then on.

use super::handle::Entity;
use super::registry::{EntityCache, PendingLoad};
use crate::RemoteBoundary;
use rolodex_core::{
    ConsistencyError, NotFoundError, RawRecord, RecordSource, RolodexResult, ValidationError,
    Value,
};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

impl<R: RemoteBoundary> EntityCache<R> {
    /// Run child loads queued while the state lock was held. Loading may
    /// queue further loads for autoloading child types.
    pub(crate) fn run_pending(&self, mut pending: Vec<PendingLoad>) -> RolodexResult<()> {
        while let Some(load) = pending.pop() {
            pending.extend(self.load_children(load.relationship, &load.parent)?);
        }
        Ok(())
    }

    fn load_children(&self, relationship: usize, parent: &Entity) -> RolodexResult<Vec<PendingLoad>> {
        let not_cached = || ConsistencyError::NotCached {
            entity_type: parent.entity_type().to_string(),
            id: parent.id(),
        };
        let (child_type, params) = {
            let state = self.lock()?;
            let index = &state.relationships[relationship];
            if index.is_parent_cached(parent.id()) {
                return Ok(Vec::new());
            }
            if !state.type_cache(parent.entity_type())?.lookups.holds(parent) {
                return Err(not_cached().into());
            }
            let mut params = RawRecord::new();
            params.insert(index.parent_id_field().to_string(), JsonValue::from(parent.id()));
            if let Some(table_field) = index.parent_table_field() {
                params.insert(table_field.to_string(), JsonValue::from(index.parent_table()));
            }
            (index.child_type().to_string(), params)
        };

        let descriptor = self.descriptor(&child_type)?;
        let records = self.remote_read(&child_type, &params)?;
        let snapshots = records
            .iter()
            .map(|raw| descriptor.snapshot_from_raw(raw, RecordSource::Read))
            .collect::<Result<Vec<_>, _>>()?;

        let mut pending = Vec::new();
        let mut state = self.lock()?;
        if state.relationships[relationship].is_parent_cached(parent.id()) {
            return Ok(pending);
        }
        if !state.type_cache(parent.entity_type())?.lookups.holds(parent) {
            return Err(not_cached().into());
        }
        state.relationships[relationship].cache_parent(parent.id())?;

        let mut populate = || -> RolodexResult<()> {
            for snapshot in &snapshots {
                let child = state.object_from_snapshot(&descriptor, snapshot, true, &mut pending)?;
                let fields = child.fields_unchecked()?;
                let index = &mut state.relationships[relationship];
                if index.parent_id_of(&fields) == Some(parent.id()) && !index.contains_child(parent.id(), &child) {
                    index.cache_child(&child, &fields)?;
                }
            }
            Ok(())
        };
        if let Err(err) = populate() {
            // Never leave a partially loaded parent behind.
            if let Err(rollback) = state.relationships[relationship].uncache_parent(parent.id()) {
                warn!(
                    parent_type = %parent.entity_type(),
                    parent_id = parent.id(),
                    error = %rollback,
                    "Failed to drop partially loaded children"
                );
            }
            return Err(err);
        }
        debug!(
            parent_type = %parent.entity_type(),
            parent_id = parent.id(),
            child_type = %child_type,
            count = snapshots.len(),
            "Children loaded"
        );
        Ok(pending)
    }

    /// The handle the cache holds for `entity`'s id, caching `entity` when
    /// there is none.
    fn canonical(&self, entity: &Entity) -> RolodexResult<Entity> {
        if entity.is_deleted() {
            return Err(entity.deleted_error());
        }
        let mut pending = Vec::new();
        let canonical = {
            let mut state = self.lock()?;
            match state.cached(entity.entity_type(), entity.id())? {
                Some(cached) => cached,
                None => {
                    state.cache_object(entity, true, &mut pending)?;
                    entity.clone()
                }
            }
        };
        self.run_pending(pending)?;
        Ok(canonical)
    }

    /// Index of the named child relationship of `parent`, with its children loaded.
    fn loaded(&self, parent: &Entity, relationship: &str) -> RolodexResult<(usize, Entity)> {
        let index = self.lock()?.child_relationship(parent.entity_type(), relationship)?;
        let parent = self.canonical(parent)?;
        let pending = self.load_children(index, &parent)?;
        self.run_pending(pending)?;
        Ok((index, parent))
    }

    /// Every child of `parent` in the named relationship, in position order.
    pub fn children(&self, parent: &Entity, relationship: &str) -> RolodexResult<Vec<Entity>> {
        let (index, parent) = self.loaded(parent, relationship)?;
        Ok(self.lock()?.relationships[index]
            .get_children(parent.id())
            .unwrap_or_default())
    }

    /// One child of `parent`, by `key` or, when `key` is `None`, by the
    /// relationship's integer or string key depending on `value`.
    pub fn child(
        &self,
        parent: &Entity,
        relationship: &str,
        key: Option<&str>,
        value: impl Into<Value>,
        required: bool,
    ) -> RolodexResult<Option<Entity>> {
        let value = value.into();
        let (index, parent) = self.loaded(parent, relationship)?;
        let state = self.lock()?;
        let rel = &state.relationships[index];
        let found = rel.get_child(parent.id(), key, &value)?;
        if found.is_none() && required {
            return Err(NotFoundError {
                entity_type: rel.child_type().to_string(),
                params: format!("{} of {} with {} = {}", relationship, parent, key.unwrap_or("key"), value),
            }
            .into());
        }
        Ok(found)
    }

    /// The parent of `child` in the named relationship.
    pub fn parent(&self, child: &Entity, relationship: &str, required: bool) -> RolodexResult<Option<Entity>> {
        let (parent_type, parent_id) = {
            let state = self.lock()?;
            let index = &state.relationships[state.parent_relationship(child.entity_type(), relationship)?];
            let fields = state.latest(child)?;
            (index.parent_type().to_string(), index.parent_id_of(&fields))
        };
        match parent_id {
            Some(id) => self.get_by_id(&parent_type, id, required),
            None if required => Err(ValidationError::NoParent {
                entity: child.to_string(),
                parent_type,
            }
            .into()),
            None => Ok(None),
        }
    }

    /// Create a child of `parent`; the parent key fields are filled in.
    pub fn create_child(
        &self,
        parent: &Entity,
        relationship: &str,
        params: &JsonValue,
        cache: Option<bool>,
    ) -> RolodexResult<Entity> {
        if parent.is_deleted() {
            return Err(parent.deleted_error());
        }
        let (child_type, mut raw) = {
            let state = self.lock()?;
            let index = &state.relationships[state.child_relationship(parent.entity_type(), relationship)?];
            let mut raw = match params {
                JsonValue::Null => RawRecord::new(),
                JsonValue::Object(map) => map.clone(),
                other => {
                    return Err(ValidationError::NotAParameterMap {
                        value: other.to_string(),
                    }
                    .into())
                }
            };
            raw.insert(index.parent_id_field().to_string(), JsonValue::from(parent.id()));
            if let Some(table_field) = index.parent_table_field() {
                raw.insert(table_field.to_string(), JsonValue::from(index.parent_table()));
            }
            (index.child_type().to_string(), raw)
        };
        raw.remove("id");
        self.create(&child_type, &JsonValue::Object(raw), cache)
    }

    pub fn update_child(
        &self,
        parent: &Entity,
        relationship: &str,
        key: Option<&str>,
        value: impl Into<Value>,
        params: &JsonValue,
        always: bool,
    ) -> RolodexResult<bool> {
        match self.child(parent, relationship, key, value, true)? {
            Some(child) => self.update(&child, params, always),
            None => Ok(false),
        }
    }

    pub fn delete_child(
        &self,
        parent: &Entity,
        relationship: &str,
        key: Option<&str>,
        value: impl Into<Value>,
        permanent: bool,
    ) -> RolodexResult<()> {
        if let Some(child) = self.child(parent, relationship, key, value, true)? {
            self.delete(&child, permanent)?;
        }
        Ok(())
    }

    pub fn delete_children(&self, parent: &Entity, relationship: &str, permanent: bool) -> RolodexResult<()> {
        for child in self.children(parent, relationship)? {
            self.delete(&child, permanent)?;
        }
        Ok(())
    }

    /// Forget that `parent`'s children are loaded. The children stay cached.
    pub fn uncache_children(&self, parent: &Entity, relationship: &str) -> RolodexResult<()> {
        let mut state = self.lock()?;
        let index = state.child_relationship(parent.entity_type(), relationship)?;
        if state.relationships[index].is_parent_cached(parent.id()) {
            state.relationships[index].uncache_parent(parent.id())?;
        }
        Ok(())
    }
}
