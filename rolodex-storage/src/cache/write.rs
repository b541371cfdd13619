//! Write path: create, update, delete and refresh, plus explicit caching.
//!
//! Every write goes to the remote boundary first; the returned record is then
//! reconciled into the cached handle and the handle the caller holds.

use super::handle::{CustomValue, Entity};
use super::read::GetOptions;
use super::registry::{render, CacheState, EntityCache};
use crate::RemoteBoundary;
use rolodex_core::{
    custom_key_id, raw_id, CoerceMode, ConsistencyError, EntityId, EntityTypeDescriptor,
    FieldSnapshot, Fields, RawRecord, RecordSource, RemoteError, RolodexResult, Value,
};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

impl<R: RemoteBoundary> EntityCache<R> {
    fn verify(&self, descriptor: &EntityTypeDescriptor, supplied: &Fields, snapshot: &FieldSnapshot) -> RolodexResult<()> {
        if !self.config().verify_writes {
            return Ok(());
        }
        descriptor.verify_result(supplied, snapshot).map_err(|err| {
            warn!(entity_type = %descriptor.entity_type(), id = snapshot.id(), error = %err, "Write result did not match parameters");
            err.into()
        })
    }

    /// Create an entity. The remote boundary assigns its id.
    pub fn create(&self, entity_type: &str, params: &JsonValue, cache: Option<bool>) -> RolodexResult<Entity> {
        let descriptor = self.descriptor(entity_type)?;
        let params = EntityTypeDescriptor::parse_params(params)?;
        descriptor.assert_id_not_supplied(&params)?;
        descriptor.assert_required_fields(&params)?;
        descriptor.assert_writable(&params, "create")?;
        let params = self.map_custom_params(&descriptor, params.clone(), Some(&params))?;
        let mut params = descriptor.normalise(params, CoerceMode::Fields)?;

        let soft_delete_field = descriptor.soft_delete_field();
        if descriptor.can_undelete()
            && descriptor.is_valid_field(soft_delete_field)
            && !params.contains_key(soft_delete_field)
        {
            params.insert(soft_delete_field.to_string(), Value::Bool(false));
        }

        let raw = self.remote_write(entity_type, "create", &descriptor.serialise(&params))?;
        let snapshot = if descriptor.create_returns_fields() {
            descriptor.snapshot_from_raw(&raw, RecordSource::Create)?
        } else {
            FieldSnapshot::new(raw_id(&raw)?, params.clone())
        };
        self.verify(&descriptor, &params, &snapshot)?;

        let mut pending = Vec::new();
        let entity = {
            let mut state = self.lock()?;
            // A side effect of the write may already have cached this id.
            if let Some(existing) = state.cached(entity_type, snapshot.id())? {
                state.reconcile(&existing, &snapshot)?;
                debug!(entity_type, id = existing.id(), "Created entity already cached");
                existing
            } else {
                let entity = Entity::new(descriptor.clone(), &snapshot);
                let type_cache = state.type_cache(entity_type)?;
                let has_loaded_parent = type_cache.parent_rels.iter().any(|&i| {
                    let index = &state.relationships[i];
                    index
                        .parent_id_of(snapshot.fields())
                        .map(|pid| index.is_parent_cached(pid))
                        .unwrap_or(false)
                });
                let cache = cache.unwrap_or(type_cache.cache_by_default) || has_loaded_parent;
                if cache {
                    state.cache_object(&entity, false, &mut pending)?;
                } else {
                    state.type_cache_mut(entity_type)?.all_cached = false;
                }
                entity
            }
        };
        self.run_pending(pending)?;
        info!(entity_type, id = entity.id(), "Entity created");
        Ok(entity)
    }

    /// Update an entity. Unless `always`, nothing is written when every
    /// supplied value already matches the latest known one. Returns whether
    /// the remote boundary was called.
    pub fn update(&self, entity: &Entity, params: &JsonValue, always: bool) -> RolodexResult<bool> {
        if entity.is_deleted() {
            return Err(entity.deleted_error());
        }
        let descriptor = entity.descriptor().clone();
        let params = EntityTypeDescriptor::parse_params(params)?;
        descriptor.assert_id_not_supplied(&params)?;
        if descriptor.extension().is_none() {
            return self.update_fields(entity, params, always);
        }

        // Intrinsic fields first: a changed sub-type can make other custom
        // attributes applicable.
        let (known, custom): (Fields, Fields) = params
            .into_iter()
            .partition(|(name, _)| descriptor.is_known_param(name));
        let mut written = false;
        if !known.is_empty() || custom.is_empty() {
            written |= self.update_fields(entity, known, always)?;
        }
        if !custom.is_empty() {
            let latest = self.latest(entity)?;
            let custom = self.map_custom_params(&descriptor, custom, Some(&latest))?;
            written |= self.update_fields(entity, custom, always)?;
        }
        Ok(written)
    }

    fn differs(&self, entity: &Entity, latest: &Fields, params: &Fields) -> RolodexResult<bool> {
        for (name, value) in params {
            let changed = match custom_key_id(name) {
                Some(attribute_id) => match entity.cached_custom(attribute_id)? {
                    Some(CustomValue::Single(known)) => &known != value,
                    Some(CustomValue::Multi(_)) => true,
                    None => entity.raw_custom(attribute_id)?.as_ref() != Some(value),
                },
                None => latest.get(name).unwrap_or(&Value::Null) != value,
            };
            if changed {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn update_fields(&self, entity: &Entity, params: Fields, always: bool) -> RolodexResult<bool> {
        let descriptor = entity.descriptor().clone();
        let entity_type = descriptor.entity_type();
        descriptor.assert_writable(&params, "update")?;
        let params = descriptor.normalise(params, CoerceMode::Fields)?;
        let latest = self.latest(entity)?;
        if !always && !self.differs(entity, &latest, &params)? {
            debug!(entity_type, id = entity.id(), "Update skipped, nothing changed");
            return Ok(false);
        }

        // Re-send persist fields the remote would otherwise reset to defaults.
        let mut request = params.clone();
        for field in descriptor.persist_fields() {
            if request.contains_key(field) {
                continue;
            }
            if let Some(value) = latest.get(field).filter(|v| !v.is_null()) {
                request.insert(field.clone(), value.clone());
            }
        }
        let mut raw_request = descriptor.serialise(&request);
        raw_request.insert("id".to_string(), JsonValue::from(entity.id()));
        let raw = self.remote_write(entity_type, "update", &raw_request)?;

        let written_custom: BTreeMap<i64, Value> = params
            .iter()
            .filter_map(|(name, value)| custom_key_id(name).map(|id| (id, value.clone())))
            .collect();
        let snapshot = descriptor
            .snapshot_from_raw(&raw, RecordSource::Update(&request))?
            .supplemented_by(&latest)
            .with_custom(written_custom);
        self.verify(&descriptor, &request, &snapshot)?;
        self.update_and_reconcile(entity, &snapshot)?;
        debug!(entity_type, id = entity.id(), fields = request.len(), "Entity updated");
        Ok(true)
    }

    /// Delete an entity. A non-permanent delete of a type that can be
    /// undeleted only marks it deleted, and the handle stays live.
    pub fn delete(&self, entity: &Entity, permanent: bool) -> RolodexResult<()> {
        if entity.is_deleted() {
            return Err(entity.deleted_error());
        }
        let descriptor = entity.descriptor().clone();
        let entity_type = descriptor.entity_type();
        let soft_delete_field = descriptor.soft_delete_field();
        if !permanent && descriptor.can_undelete() && descriptor.is_valid_field(soft_delete_field) {
            self.remote_remove(entity_type, entity.id(), false)?;
            let mut fields = self.latest(entity)?;
            fields.insert(soft_delete_field.to_string(), Value::Bool(true));
            self.update_and_reconcile(entity, &FieldSnapshot::new(entity.id(), fields))?;
            info!(entity_type, id = entity.id(), "Entity marked deleted");
            return Ok(());
        }
        self.remote_remove(entity_type, entity.id(), true)?;
        self.delete_and_reconcile(entity)?;
        info!(entity_type, id = entity.id(), "Entity deleted");
        Ok(())
    }

    /// Re-read an entity. A record that no longer exists is treated as deleted.
    pub fn refresh(&self, entity: &Entity) -> RolodexResult<()> {
        if entity.is_deleted() {
            return Err(entity.deleted_error());
        }
        let descriptor = entity.descriptor().clone();
        let entity_type = descriptor.entity_type();
        let mut params = RawRecord::new();
        params.insert("id".to_string(), JsonValue::from(entity.id()));
        let records = self.remote_read(entity_type, &params)?;
        match records.as_slice() {
            [] => {
                debug!(entity_type, id = entity.id(), "Refreshed entity no longer exists");
                self.delete_and_reconcile(entity)
            }
            [raw] => {
                let snapshot = descriptor.snapshot_from_raw(raw, RecordSource::Read)?;
                self.update_and_reconcile(entity, &snapshot)
            }
            _ => Err(RemoteError::UnexpectedResultCount {
                entity_type: entity_type.to_string(),
                action: "get".to_string(),
                params: render(&params),
                count: records.len(),
            }
            .into()),
        }
    }

    /// Update by id: through the cached handle when there is one, otherwise
    /// straight to the remote boundary.
    pub fn update_by_id(&self, entity_type: &str, id: EntityId, params: &JsonValue, always: bool) -> RolodexResult<()> {
        let descriptor = self.descriptor(entity_type)?;
        let cached = self.lock()?.cached(entity_type, id)?;
        if let Some(entity) = cached {
            return self.update(&entity, params, always).map(|_| ());
        }
        let params = EntityTypeDescriptor::parse_params(params)?;
        descriptor.assert_id_not_supplied(&params)?;
        descriptor.assert_writable(&params, "update")?;
        let params = self.map_custom_params(&descriptor, params, None)?;
        let params = descriptor.normalise(params, CoerceMode::Fields)?;
        let mut raw_request = descriptor.serialise(&params);
        raw_request.insert("id".to_string(), JsonValue::from(id));
        self.remote_write(entity_type, "update", &raw_request)?;
        Ok(())
    }

    pub fn delete_by_id(&self, entity_type: &str, id: EntityId, permanent: bool) -> RolodexResult<()> {
        let descriptor = self.descriptor(entity_type)?;
        let cached = self.lock()?.cached(entity_type, id)?;
        if let Some(entity) = cached {
            return self.delete(&entity, permanent);
        }
        self.remote_remove(entity_type, id, permanent || !descriptor.can_undelete())
    }

    // ------------------------------------------------------------------------
    // Explicit caching
    // ------------------------------------------------------------------------

    /// Cache a handle unless one is already cached for its id.
    pub fn cache(&self, entity: &Entity) -> RolodexResult<()> {
        if entity.is_deleted() {
            return Err(entity.deleted_error());
        }
        let mut pending = Vec::new();
        {
            let mut state = self.lock()?;
            if state.cached(entity.entity_type(), entity.id())?.is_some() {
                return Ok(());
            }
            state.cache_object(entity, true, &mut pending)?;
        }
        self.run_pending(pending)
    }

    /// Evict a handle. Refused while a loaded parent still lists it as a child.
    pub fn uncache(&self, entity: &Entity) -> RolodexResult<()> {
        let mut state = self.lock()?;
        if !state.type_cache(entity.entity_type())?.lookups.holds(entity) {
            return Ok(());
        }
        state.check_no_cached_parent(entity)?;
        state.uncache_object(entity, false)
    }

    /// Read and cache every entity of a type.
    pub fn cache_all(&self, entity_type: &str) -> RolodexResult<Vec<Entity>> {
        self.get(entity_type, &JsonValue::Null, GetOptions::default().with_cache(true))
    }

    /// Evict every cached entity of a type.
    pub fn uncache_all(&self, entity_type: &str) -> RolodexResult<()> {
        let mut state = self.lock()?;
        let entities = state.type_cache(entity_type)?.lookups.entities();
        for entity in &entities {
            state.check_no_cached_parent(entity)?;
        }
        for entity in &entities {
            if state.type_cache(entity_type)?.lookups.holds(entity) {
                state.uncache_object(entity, false)?;
            }
        }
        state.type_cache_mut(entity_type)?.all_cached = false;
        debug!(entity_type, count = entities.len(), "All entities of type uncached");
        Ok(())
    }
}

impl CacheState {
    fn check_no_cached_parent(&self, entity: &Entity) -> RolodexResult<()> {
        let fields = entity.fields_unchecked()?;
        for &i in &self.type_cache(entity.entity_type())?.parent_rels {
            let index = &self.relationships[i];
            if let Some(parent_id) = index.parent_id_of(&fields) {
                if index.contains_child(parent_id, entity) {
                    return Err(ConsistencyError::ParentCached {
                        entity: entity.to_string(),
                        parent_type: index.parent_type().to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MockRemote, TableDef};
    use rolodex_core::{CacheConfig, EntityTypeSpec, RemoteFailure, RolodexError, ValidationError};
    use serde_json::json;
    use std::sync::Arc;

    fn cache() -> (Arc<MockRemote>, EntityCache<Arc<MockRemote>>) {
        let remote = Arc::new(MockRemote::new());
        remote.define(
            TableDef::new("Contact", "civicrm_contact")
                .column("contact_type", "varchar")
                .column("first_name", "varchar")
                .column("last_name", "varchar")
                .column("do_not_email", "tinyint")
                .column("is_deleted", "tinyint")
                .column("created_date", "datetime")
                .default_value("do_not_email", json!(0))
                .reset_on_update(&["do_not_email"])
                .soft_delete("is_deleted"),
        );
        let cache = EntityCache::new(remote.clone(), CacheConfig::default());
        cache
            .register(
                EntityTypeSpec::new("Contact")
                    .with_lookups(&["first_name,last_name"])
                    .with_required_on_create(&["contact_type"])
                    .with_read_only(&["created_date"])
                    .with_can_undelete(true),
            )
            .unwrap();
        (remote, cache)
    }

    fn ada(cache: &EntityCache<Arc<MockRemote>>) -> Entity {
        cache
            .create(
                "Contact",
                &json!({"contact_type": "Individual", "first_name": "Ada", "last_name": "Lovelace"}),
                None,
            )
            .unwrap()
    }

    #[test]
    fn test_create_validation_happens_before_remote() {
        let (remote, cache) = cache();
        let err = cache.create("Contact", &json!({"id": 3, "contact_type": "Individual"}), None).unwrap_err();
        assert!(matches!(err, RolodexError::Validation(ValidationError::IdSupplied { .. })));
        let err = cache.create("Contact", &json!({"first_name": "Ada"}), None).unwrap_err();
        assert!(matches!(err, RolodexError::Validation(ValidationError::RequiredFieldsMissing { .. })));
        let err = cache
            .create("Contact", &json!({"contact_type": "Individual", "created_date": "2024-01-01"}), None)
            .unwrap_err();
        assert!(matches!(err, RolodexError::Validation(ValidationError::ReadOnlyFields { .. })));
        assert!(remote.calls_for("create").is_empty());
    }

    #[test]
    fn test_create_caches_and_defaults_soft_delete_flag() {
        let (remote, cache) = cache();
        let contact = ada(&cache);
        assert!(cache.is_cached(&contact).unwrap());
        assert_eq!(contact.get("is_deleted").unwrap(), Value::Bool(false));
        let sent = &remote.calls_for("create")[0].params;
        assert_eq!(sent["is_deleted"], json!(0));
    }

    #[test]
    fn test_noop_update_makes_no_call() {
        let (remote, cache) = cache();
        let contact = ada(&cache);
        remote.reset_calls();
        let written = cache.update(&contact, &json!({"first_name": "Ada"}), false).unwrap();
        assert!(!written);
        assert_eq!(remote.call_count(), 0);
        assert!(cache.update(&contact, &json!({"first_name": "Ada"}), true).unwrap());
        assert_eq!(remote.calls_for("update").len(), 1);
    }

    #[test]
    fn test_update_resends_persist_fields() {
        let (remote, cache) = cache();
        let contact = ada(&cache);
        cache.update(&contact, &json!({"do_not_email": true}), false).unwrap();
        cache.update(&contact, &json!({"first_name": "Augusta"}), false).unwrap();
        let row = remote.row("Contact", contact.id()).unwrap();
        assert_eq!(row["do_not_email"], json!(1));
        assert_eq!(contact.get("do_not_email").unwrap(), Value::Bool(true));
        let sent = &remote.calls_for("update")[1].params;
        assert!(!sent.contains_key("created_date"));
    }

    #[test]
    fn test_update_rekeys_lookup() {
        let (remote, cache) = cache();
        let contact = ada(&cache);
        cache.update(&contact, &json!({"first_name": "Augusta"}), false).unwrap();
        remote.reset_calls();
        let found = cache
            .get("Contact", &json!({"first_name": "Augusta", "last_name": "Lovelace"}), GetOptions::default())
            .unwrap();
        assert!(found[0].same_handle(&contact));
        assert_eq!(remote.call_count(), 0);
        let stale = cache
            .get("Contact", &json!({"first_name": "Ada", "last_name": "Lovelace"}), GetOptions::default())
            .unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn test_soft_and_permanent_delete() {
        let (remote, cache) = cache();
        let contact = ada(&cache);
        cache.delete(&contact, false).unwrap();
        assert_eq!(contact.get("is_deleted").unwrap(), Value::Bool(true));
        assert!(cache.is_cached(&contact).unwrap());

        cache.delete(&contact, true).unwrap();
        assert!(matches!(contact.get("first_name"), Err(RolodexError::Deleted { .. })));
        assert!(cache.get_by_id("Contact", contact.id(), false).unwrap().is_none());
        assert_eq!(remote.row_count("Contact"), 0);
        assert!(cache.update(&contact, &json!({"first_name": "X"}), true).is_err());
    }

    #[test]
    fn test_refresh_sees_remote_changes_and_deletion() {
        let (remote, cache) = cache();
        let contact = ada(&cache);
        let mut params = RawRecord::new();
        params.insert("id".to_string(), json!(contact.id()));
        params.insert("last_name".to_string(), json!("King"));
        remote.write("Contact", &params).unwrap();
        cache.refresh(&contact).unwrap();
        assert_eq!(contact.get("last_name").unwrap(), Value::from("King"));

        remote.remove("Contact", contact.id(), true).unwrap();
        cache.refresh(&contact).unwrap();
        assert!(contact.is_deleted());
    }

    #[test]
    fn test_remote_failure_is_wrapped_and_leaves_cache_alone() {
        let (remote, cache) = cache();
        let contact = ada(&cache);
        remote.fail_next(RemoteFailure::new("db_error", "boom"));
        let err = cache.update(&contact, &json!({"first_name": "Augusta"}), false).unwrap_err();
        match err {
            RolodexError::Remote(RemoteError::CallFailed { action, params, .. }) => {
                assert_eq!(action, "update");
                assert!(params.contains("Augusta"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(contact.get("first_name").unwrap(), Value::from("Ada"));
    }

    #[test]
    fn test_by_id_helpers() {
        let (remote, cache) = cache();
        let contact = ada(&cache);
        cache.update_by_id("Contact", contact.id(), &json!({"last_name": "Byron"}), false).unwrap();
        assert_eq!(contact.get("last_name").unwrap(), Value::from("Byron"));

        let other = remote.seed("Contact", json!({"contact_type": "Individual", "first_name": "Mary"})).unwrap();
        cache.update_by_id("Contact", other, &json!({"last_name": "Somerville"}), false).unwrap();
        assert_eq!(remote.row("Contact", other).unwrap()["last_name"], json!("Somerville"));
        cache.delete_by_id("Contact", other, true).unwrap();
        assert!(remote.row("Contact", other).is_none());
    }

    #[test]
    fn test_cache_and_uncache() {
        let (_, cache) = cache();
        let contact = cache
            .create("Contact", &json!({"contact_type": "Individual", "first_name": "Ada"}), Some(false))
            .unwrap();
        assert!(!cache.is_cached(&contact).unwrap());
        cache.cache(&contact).unwrap();
        assert!(cache.is_cached(&contact).unwrap());
        cache.uncache(&contact).unwrap();
        assert!(!cache.is_cached(&contact).unwrap());
        let all = cache.cache_all("Contact").unwrap();
        assert_eq!(all.len(), 1);
        cache.uncache_all("Contact").unwrap();
        assert!(cache.cached_entities("Contact").unwrap().is_empty());
    }
}
