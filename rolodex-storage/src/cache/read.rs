//! Read path: lookup tables and relationship indexes first, then the remote.

use super::handle::Entity;
use super::registry::{render, CacheState, EntityCache};
use super::relationship::RelationshipIndex;
use crate::RemoteBoundary;
use rolodex_core::{
    describe_fields, CardinalityError, CoerceMode, EntityId, EntityTypeDescriptor, Fields,
    NotFoundError, RawRecord, RecordSource, RolodexResult, ValidationError, Value,
};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

/// How a read may use the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    /// Cache what the remote returns; the type's default when `None`.
    pub cache: Option<bool>,
    /// Answer from lookup tables and relationship indexes when possible.
    pub read_from_cache: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            cache: None,
            read_from_cache: true,
        }
    }
}

impl GetOptions {
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Always go to the remote boundary.
    pub fn from_remote(mut self) -> Self {
        self.read_from_cache = false;
        self
    }
}

/// Ways of naming a single entity.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupArg {
    Id(EntityId),
    /// Value of the type's default string lookup field.
    Name(String),
    Params(JsonValue),
}

impl From<EntityId> for LookupArg {
    fn from(id: EntityId) -> Self {
        LookupArg::Id(id)
    }
}

impl From<&str> for LookupArg {
    fn from(name: &str) -> Self {
        LookupArg::Name(name.to_string())
    }
}

impl From<JsonValue> for LookupArg {
    fn from(params: JsonValue) -> Self {
        LookupArg::Params(params)
    }
}

/// Children of one parent answering `params`, when `params` is the parent
/// id alone or the parent id plus one indexed key and the parent's children
/// are loaded.
fn children_from_index(index: &RelationshipIndex, params: &Fields) -> RolodexResult<Option<Vec<Entity>>> {
    let Some(parent_id) = params.get(index.parent_id_field()).and_then(Value::as_int) else {
        return Ok(None);
    };
    let mut used = 1;
    if let Some(table_field) = index.parent_table_field() {
        match params.get(table_field).and_then(Value::as_str) {
            Some(table) if table.eq_ignore_ascii_case(index.parent_table()) => used += 1,
            _ => return Ok(None),
        }
    }
    if !index.is_parent_cached(parent_id) {
        return Ok(None);
    }
    let rest: Vec<(&String, &Value)> = params
        .iter()
        .filter(|(name, _)| {
            name.as_str() != index.parent_id_field() && Some(name.as_str()) != index.parent_table_field()
        })
        .collect();
    match rest.as_slice() {
        [] if params.len() == used => Ok(index.get_children(parent_id)),
        [(key, value)] if index.keys().contains(key) && !value.is_empty() => Ok(Some(
            index
                .get_child(parent_id, Some(key.as_str()), value)?
                .into_iter()
                .collect(),
        )),
        _ => Ok(None),
    }
}

impl CacheState {
    fn get_from_cache(
        &self,
        descriptor: &EntityTypeDescriptor,
        params: &Fields,
    ) -> RolodexResult<Option<Vec<Entity>>> {
        let type_cache = self.type_cache(descriptor.entity_type())?;
        if params.is_empty() {
            return Ok(type_cache.all_cached.then(|| type_cache.lookups.entities()));
        }
        if let Some(id_key) = descriptor.lookup_keys().first() {
            if let Some(entity) = type_cache.lookups.find(id_key, params) {
                return Ok(Some(vec![entity]));
            }
        }
        for &i in &type_cache.parent_rels {
            if let Some(children) = children_from_index(&self.relationships[i], params)? {
                return Ok(Some(children));
            }
        }
        Ok(None)
    }
}

impl<R: RemoteBoundary> EntityCache<R> {
    /// Every entity of a type matching `params` (a JSON object, or null for
    /// no parameters).
    pub fn get(&self, entity_type: &str, params: &JsonValue, options: GetOptions) -> RolodexResult<Vec<Entity>> {
        let descriptor = self.descriptor(entity_type)?;
        let params = EntityTypeDescriptor::parse_params(params)?;
        let params = self.map_custom_params(&descriptor, params, None)?;
        let params = descriptor.normalise(params, CoerceMode::Query)?;
        let cache = match options.cache {
            Some(cache) => cache,
            None => self.cache_by_default(entity_type)?,
        };

        if options.read_from_cache {
            if let Some(entities) = self.lock()?.get_from_cache(&descriptor, &params)? {
                self.stats.hit();
                debug!(
                    entity_type,
                    params = %describe_fields(&params),
                    count = entities.len(),
                    "Cache hit"
                );
                return Ok(entities);
            }
        }
        self.stats.miss();
        debug!(entity_type, params = %describe_fields(&params), "Cache miss");

        let records = self.remote_read(entity_type, &descriptor.serialise(&params))?;
        let snapshots = records
            .iter()
            .map(|raw| descriptor.snapshot_from_raw(raw, RecordSource::Read))
            .collect::<Result<Vec<_>, _>>()?;

        let mut pending = Vec::new();
        let mut entities = Vec::with_capacity(snapshots.len());
        {
            let mut state = self.lock()?;
            let mut all_cached = true;
            for snapshot in &snapshots {
                let entity = state.object_from_snapshot(&descriptor, snapshot, cache, &mut pending)?;
                all_cached &= state.type_cache(entity_type)?.lookups.holds(&entity);
                entities.push(entity);
            }
            if params.is_empty() && cache && all_cached {
                state.type_cache_mut(entity_type)?.all_cached = true;
                info!(entity_type, count = entities.len(), "All entities of type cached");
            }
        }
        self.run_pending(pending)?;
        Ok(entities)
    }

    fn single_params(&self, descriptor: &EntityTypeDescriptor, arg: LookupArg) -> RolodexResult<JsonValue> {
        Ok(match arg {
            LookupArg::Id(id) => json!({ "id": id }),
            LookupArg::Name(name) => {
                let field = descriptor
                    .default_string_lookup()
                    .ok_or_else(|| ValidationError::NoDefaultLookup { value: name.clone() })?;
                let mut params = serde_json::Map::new();
                params.insert(field.to_string(), JsonValue::String(name));
                JsonValue::Object(params)
            }
            LookupArg::Params(params) => params,
        })
    }

    /// Exactly one entity. None found is an error when `required`, and
    /// `None` otherwise; more than one is always an error.
    pub fn get_single(
        &self,
        entity_type: &str,
        arg: impl Into<LookupArg>,
        required: bool,
    ) -> RolodexResult<Option<Entity>> {
        let descriptor = self.descriptor(entity_type)?;
        let params = self.single_params(&descriptor, arg.into())?;
        let mut entities = self.get(entity_type, &params, GetOptions::default())?;
        match entities.len() {
            1 => Ok(entities.pop()),
            0 if required => Err(NotFoundError {
                entity_type: entity_type.to_string(),
                params: params.to_string(),
            }
            .into()),
            0 => {
                warn!(entity_type, params = %params, "No entity found");
                Ok(None)
            }
            count => Err(CardinalityError {
                entity_type: entity_type.to_string(),
                count,
                params: params.to_string(),
            }
            .into()),
        }
    }

    pub fn get_by_id(&self, entity_type: &str, id: EntityId, required: bool) -> RolodexResult<Option<Entity>> {
        self.get_single(entity_type, LookupArg::Id(id), required)
    }

    /// The one entity a lookup names.
    pub fn resolve(&self, entity_type: &str, arg: impl Into<LookupArg>) -> RolodexResult<Entity> {
        let arg = arg.into();
        let described = format!("{:?}", arg);
        self.get_single(entity_type, arg, true)?.ok_or_else(|| {
            NotFoundError {
                entity_type: entity_type.to_string(),
                params: described,
            }
            .into()
        })
    }

    /// Id of the entity a lookup names. A bare id is returned as is.
    pub fn resolve_id(&self, entity_type: &str, arg: impl Into<LookupArg>) -> RolodexResult<EntityId> {
        match arg.into() {
            LookupArg::Id(id) => Ok(id),
            other => Ok(self.resolve(entity_type, other)?.id()),
        }
    }

    /// Handle for a record the caller already holds, reconciled with the
    /// cached handle when there is one.
    pub fn get_object(&self, entity_type: &str, raw: &RawRecord, cache: Option<bool>) -> RolodexResult<Entity> {
        let descriptor = self.descriptor(entity_type)?;
        let snapshot = descriptor.snapshot_from_raw(raw, RecordSource::Known)?;
        let cache = match cache {
            Some(cache) => cache,
            None => self.cache_by_default(entity_type)?,
        };
        let mut pending = Vec::new();
        let entity = self
            .lock()?
            .object_from_snapshot(&descriptor, &snapshot, cache, &mut pending)?;
        self.run_pending(pending)?;
        debug!(entity_type, id = entity.id(), params = %render(raw), "Object from known record");
        Ok(entity)
    }

    /// Cached handles of a type, in id order.
    pub fn cached_entities(&self, entity_type: &str) -> RolodexResult<Vec<Entity>> {
        Ok(self.lock()?.type_cache(entity_type)?.lookups.entities())
    }

    pub fn is_cached(&self, entity: &Entity) -> RolodexResult<bool> {
        Ok(self.lock()?.type_cache(entity.entity_type())?.lookups.holds(entity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MockRemote, TableDef};
    use rolodex_core::{CacheConfig, EntityTypeSpec, RolodexError};
    use std::sync::Arc;

    fn cache() -> (Arc<MockRemote>, EntityCache<Arc<MockRemote>>) {
        let remote = Arc::new(MockRemote::new());
        remote.define(
            TableDef::new("Group", "civicrm_group")
                .column("name", "varchar")
                .column("title", "varchar")
                .column("is_active", "tinyint"),
        );
        remote.seed("Group", json!({"name": "members", "title": "Members", "is_active": 1})).unwrap();
        remote.seed("Group", json!({"name": "donors", "title": "Donors", "is_active": 1})).unwrap();
        remote.seed("Group", json!({"name": "lapsed", "title": "Members", "is_active": 0})).unwrap();
        let cache = EntityCache::new(remote.clone(), CacheConfig::default());
        cache
            .register(
                EntityTypeSpec::new("Group")
                    .with_lookups(&["name"])
                    .with_default_string_lookup("name"),
            )
            .unwrap();
        (remote, cache)
    }

    #[test]
    fn test_lookup_key_hit_skips_remote() {
        let (remote, cache) = cache();
        let first = cache.get_single("Group", "members", true).unwrap().unwrap();
        remote.reset_calls();
        let again = cache.get_single("Group", "MEMBERS", true).unwrap().unwrap();
        let by_id = cache.get_by_id("Group", first.id(), true).unwrap().unwrap();
        assert!(first.same_handle(&again));
        assert!(first.same_handle(&by_id));
        assert_eq!(remote.call_count(), 0);
        assert_eq!(cache.diagnostics().unwrap().stats.hits, 2);
    }

    #[test]
    fn test_non_key_params_go_remote() {
        let (remote, cache) = cache();
        let active = cache
            .get("Group", &json!({"is_active": true}), GetOptions::default())
            .unwrap();
        assert_eq!(active.len(), 2);
        cache.get("Group", &json!({"is_active": true}), GetOptions::default()).unwrap();
        assert_eq!(remote.calls_for("get").len(), 2);
    }

    #[test]
    fn test_get_all_marks_type_fully_cached() {
        let (remote, cache) = cache();
        let all = cache.get("Group", &JsonValue::Null, GetOptions::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert!(cache.diagnostics().unwrap().types["Group"].all_cached);
        let again = cache.get("Group", &json!({}), GetOptions::default()).unwrap();
        assert_eq!(again.len(), 3);
        assert!(again.iter().zip(&all).all(|(a, b)| a.same_handle(b)));
        assert_eq!(remote.calls_for("get").len(), 1);
    }

    #[test]
    fn test_uncached_get_all_is_not_marked() {
        let (_, cache) = cache();
        cache
            .get("Group", &JsonValue::Null, GetOptions::default().with_cache(false))
            .unwrap();
        assert!(!cache.diagnostics().unwrap().types["Group"].all_cached);
        assert!(cache.cached_entities("Group").unwrap().is_empty());
    }

    #[test]
    fn test_get_single_cardinality() {
        let (_, cache) = cache();
        let err = cache
            .get_single("Group", json!({"title": "Members"}), true)
            .unwrap_err();
        assert!(matches!(err, RolodexError::Cardinality(CardinalityError { count: 2, .. })));

        let err = cache.get_single("Group", "nobody", true).unwrap_err();
        assert!(err.is_not_found());
        assert!(cache.get_single("Group", "nobody", false).unwrap().is_none());
    }

    #[test]
    fn test_resolve_id_without_remote_for_ids() {
        let (remote, cache) = cache();
        assert_eq!(cache.resolve_id("Group", LookupArg::Id(99)).unwrap(), 99);
        assert_eq!(remote.call_count(), 0);
        let id = cache.resolve_id("Group", "donors").unwrap();
        assert_eq!(cache.resolve("Group", LookupArg::Id(id)).unwrap().get("name").unwrap(), Value::from("donors"));
    }

    #[test]
    fn test_malformed_params_fail_before_remote() {
        let (remote, cache) = cache();
        let err = cache
            .get("Group", &json!({"is_active": "maybe"}), GetOptions::default())
            .unwrap_err();
        assert!(matches!(err, RolodexError::Validation(ValidationError::TypeMismatch { .. })));
        let err = cache.get("Group", &json!([1, 2]), GetOptions::default()).unwrap_err();
        assert!(matches!(err, RolodexError::Validation(ValidationError::NotAParameterMap { .. })));
        assert_eq!(remote.calls_for("get").len(), 0);
    }

    #[test]
    fn test_get_object_reuses_cached_handle() {
        let (remote, cache) = cache();
        let cached = cache.get_single("Group", "donors", true).unwrap().unwrap();
        let raw = json!({"id": cached.id(), "name": "donors", "title": "Givers"});
        let known = cache.get_object("Group", raw.as_object().unwrap(), None).unwrap();
        assert!(known.same_handle(&cached));
        assert_eq!(cached.get("title").unwrap(), Value::from("Givers"));
        assert_eq!(remote.calls_for("get").len(), 1);
    }
}
