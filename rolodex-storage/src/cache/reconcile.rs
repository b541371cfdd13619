//! Reconciliation of handles that share an id.
//!
//! The handle held by a type's id table is the system of record. Any other
//! handle for the same id is a duplicate view: it pushes what it learns into
//! the cached handle and keeps its own fields current, but is never indexed.

use super::handle::Entity;
use super::registry::{CacheState, EntityCache, PendingLoad};
use crate::RemoteBoundary;
use rolodex_core::{EntityTypeDescriptor, FieldSnapshot, Fields, RolodexResult};
use std::sync::Arc;
use tracing::{debug, warn};

impl CacheState {
    /// Index a handle in its type's lookup tables and under every loaded
    /// parent. Autoloading types get their child relationships too: empty
    /// slots for a handle that cannot have children yet, otherwise a pending
    /// load to run once the state lock is released.
    pub(crate) fn cache_object(
        &mut self,
        entity: &Entity,
        may_have_children: bool,
        pending: &mut Vec<PendingLoad>,
    ) -> RolodexResult<()> {
        let fields = entity.fields_unchecked()?;
        let type_cache = self.type_cache(entity.entity_type())?;
        let parent_rels = type_cache.parent_rels.clone();
        let child_rels = type_cache.child_rels.clone();

        self.index_under_parents(entity, &fields, &parent_rels)?;
        self.type_cache_mut(entity.entity_type())?
            .lookups
            .insert(entity, &fields);

        if entity.descriptor().autoload_children() {
            for i in child_rels {
                if self.relationships[i].is_parent_cached(entity.id()) {
                    continue;
                }
                if may_have_children {
                    pending.push(PendingLoad {
                        relationship: i,
                        parent: entity.clone(),
                    });
                } else {
                    self.relationships[i].cache_parent(entity.id())?;
                }
            }
        }
        debug!(entity_type = %entity.entity_type(), id = entity.id(), "Entity cached");
        Ok(())
    }

    /// Remove a handle from every table and index it sits in, evicting its
    /// own cached children with it.
    pub(crate) fn uncache_object(&mut self, entity: &Entity, deleting: bool) -> RolodexResult<()> {
        let fields = entity.fields_unchecked()?;
        let type_cache = self.type_cache_mut(entity.entity_type())?;
        type_cache.lookups.remove(entity, &fields);
        type_cache.memberships.remove(&entity.id());
        type_cache.tags.remove(&entity.id());
        if !deleting {
            type_cache.all_cached = false;
        }
        let parent_rels = type_cache.parent_rels.clone();
        let child_rels = type_cache.child_rels.clone();

        for i in parent_rels {
            let index = &mut self.relationships[i];
            if let Some(parent_id) = index.parent_id_of(&fields) {
                if index.contains_child(parent_id, entity) {
                    index.uncache_child(entity, &fields)?;
                }
            }
        }

        for i in child_rels {
            let Some(children) = self.relationships[i].get_children(entity.id()) else {
                continue;
            };
            for child in children.iter().filter(|c| !c.same_handle(entity)) {
                self.uncache_object(child, false)?;
            }
            if self.relationships[i].is_parent_cached(entity.id()) {
                self.relationships[i].uncache_parent(entity.id())?;
            }
        }
        debug!(entity_type = %entity.entity_type(), id = entity.id(), deleting, "Entity uncached");
        Ok(())
    }

    /// Apply a snapshot to the cached handle, re-keying it everywhere it is
    /// indexed. Entries under the old values are removed before the new
    /// values are applied.
    pub(crate) fn update_and_recache(
        &mut self,
        entity: &Entity,
        snapshot: &FieldSnapshot,
    ) -> RolodexResult<()> {
        let old = entity.fields_unchecked()?;
        let type_cache = self.type_cache_mut(entity.entity_type())?;
        type_cache.lookups.remove(entity, &old);
        let parent_rels = type_cache.parent_rels.clone();

        for &i in &parent_rels {
            let index = &mut self.relationships[i];
            if let Some(parent_id) = index.parent_id_of(&old) {
                if index.contains_child(parent_id, entity) {
                    index.uncache_child(entity, &old)?;
                }
            }
        }

        entity.apply(snapshot)?;
        let new = entity.fields_unchecked()?;
        if let Err(err) = self.index_under_parents(entity, &new, &parent_rels) {
            // The old entries are gone and the new ones conflict.
            warn!(
                entity_type = %entity.entity_type(),
                id = entity.id(),
                error = %err,
                "Re-keyed entity conflicts with a loaded parent, evicting it"
            );
            self.uncache_object(entity, false)?;
            return Err(err);
        }
        self.type_cache_mut(entity.entity_type())?
            .lookups
            .insert(entity, &new);
        Ok(())
    }

    /// Index a handle under every loaded parent its fields name. When one
    /// parent refuses it, the entries already made are taken out again.
    fn index_under_parents(
        &mut self,
        entity: &Entity,
        fields: &Fields,
        parent_rels: &[usize],
    ) -> RolodexResult<()> {
        let mut indexed: Vec<usize> = Vec::new();
        for &i in parent_rels {
            let index = &mut self.relationships[i];
            let Some(parent_id) = index.parent_id_of(fields) else {
                continue;
            };
            if !index.is_parent_cached(parent_id) || index.contains_child(parent_id, entity) {
                continue;
            }
            if let Err(err) = index.cache_child(entity, fields) {
                for j in indexed {
                    self.relationships[j].uncache_child(entity, fields)?;
                }
                return Err(err);
            }
            indexed.push(i);
        }
        Ok(())
    }

    /// Handle for a freshly observed snapshot: the cached one (brought up to
    /// date) when there is one, otherwise a new handle, cached if asked.
    pub(crate) fn object_from_snapshot(
        &mut self,
        descriptor: &Arc<EntityTypeDescriptor>,
        snapshot: &FieldSnapshot,
        cache: bool,
        pending: &mut Vec<PendingLoad>,
    ) -> RolodexResult<Entity> {
        if let Some(cached) = self.cached(descriptor.entity_type(), snapshot.id())? {
            if snapshot.stamp().is_newer_than(&cached.stamp()?) {
                self.update_and_recache(&cached, snapshot)?;
            }
            return Ok(cached);
        }
        let entity = Entity::new(descriptor.clone(), snapshot);
        if cache {
            self.cache_object(&entity, true, pending)?;
        }
        Ok(entity)
    }

    /// Push a newly learned snapshot into the cached handle and into
    /// `entity`, each only if the snapshot is newer than what it holds.
    pub(crate) fn reconcile(&mut self, entity: &Entity, snapshot: &FieldSnapshot) -> RolodexResult<()> {
        let cached = self.cached(entity.entity_type(), entity.id())?;
        if let Some(cached) = &cached {
            if snapshot.stamp().is_newer_than(&cached.stamp()?) {
                self.update_and_recache(cached, snapshot)?;
            }
        }
        let is_cached = cached.map(|c| c.same_handle(entity)).unwrap_or(false);
        if !is_cached && snapshot.stamp().is_newer_than(&entity.stamp()?) {
            entity.apply(snapshot)?;
        }
        Ok(())
    }

    /// Evict the cached handle for `entity`'s id and mark both it and
    /// `entity` deleted.
    pub(crate) fn delete_and_reconcile(&mut self, entity: &Entity) -> RolodexResult<()> {
        if let Some(cached) = self.cached(entity.entity_type(), entity.id())? {
            self.uncache_object(&cached, true)?;
            cached.mark_deleted()?;
        }
        entity.mark_deleted()
    }

    /// The freshest fields known for `entity`'s id.
    pub(crate) fn latest(&self, entity: &Entity) -> RolodexResult<Fields> {
        let own = entity.stamp()?;
        if let Some(cached) = self.cached(entity.entity_type(), entity.id())? {
            if !cached.same_handle(entity) && cached.stamp()?.is_newer_than(&own) {
                return cached.fields();
            }
        }
        entity.fields()
    }
}

impl<R: RemoteBoundary> EntityCache<R> {
    pub(crate) fn update_and_reconcile(&self, entity: &Entity, snapshot: &FieldSnapshot) -> RolodexResult<()> {
        self.lock()?.reconcile(entity, snapshot)
    }

    pub(crate) fn delete_and_reconcile(&self, entity: &Entity) -> RolodexResult<()> {
        self.lock()?.delete_and_reconcile(entity)
    }

    /// The freshest fields known for a handle's id, whichever handle holds them.
    pub fn latest(&self, entity: &Entity) -> RolodexResult<Fields> {
        self.lock()?.latest(entity)
    }
}
