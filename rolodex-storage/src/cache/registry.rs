//! The process-wide registry of entity types and their cache state.
//!
//! All mutable cache state sits behind one mutex. It is never held across a
//! call to the remote boundary, so a remote side effect (a write hook, say)
//! may call back into the cache.

use super::handle::Entity;
use super::lookup::LookupTables;
use super::membership::MembershipCache;
use super::overlay::CustomCatalog;
use super::relationship::RelationshipIndex;
use super::stats::{CacheDiagnostics, StatCounters, TypeDiagnostics};
use crate::RemoteBoundary;
use rolodex_core::{
    CacheConfig, ConfigError, ConsistencyError, EntityId, EntityTypeDescriptor, EntityTypeSpec,
    RawRecord, RemoteError, RolodexResult, SchemaConfig,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Cache state of one registered entity type.
#[derive(Debug)]
pub(crate) struct TypeCache {
    pub(crate) spec: EntityTypeSpec,
    pub(crate) descriptor: Option<Arc<EntityTypeDescriptor>>,
    pub(crate) lookups: LookupTables,
    /// Every entity of the type is cached.
    pub(crate) all_cached: bool,
    pub(crate) cache_by_default: bool,
    /// Relationships in which this type is the child.
    pub(crate) parent_rels: Vec<usize>,
    /// Relationships in which this type is the parent.
    pub(crate) child_rels: Vec<usize>,
    pub(crate) memberships: HashMap<EntityId, MembershipCache>,
    pub(crate) tags: HashMap<EntityId, BTreeSet<EntityId>>,
}

#[derive(Debug, Default)]
pub(crate) struct CacheState {
    pub(crate) types: HashMap<String, TypeCache>,
    pub(crate) relationships: Vec<RelationshipIndex>,
    pub(crate) catalog: Option<Arc<CustomCatalog>>,
}

impl CacheState {
    pub(crate) fn type_cache(&self, entity_type: &str) -> Result<&TypeCache, ConfigError> {
        self.types
            .get(entity_type)
            .ok_or_else(|| ConfigError::UnknownEntityType {
                entity_type: entity_type.to_string(),
            })
    }

    pub(crate) fn type_cache_mut(&mut self, entity_type: &str) -> Result<&mut TypeCache, ConfigError> {
        self.types
            .get_mut(entity_type)
            .ok_or_else(|| ConfigError::UnknownEntityType {
                entity_type: entity_type.to_string(),
            })
    }

    /// Relationship in which `child_type` is the child, by its parent accessor name.
    pub(crate) fn parent_relationship(&self, child_type: &str, name: &str) -> Result<usize, ConfigError> {
        self.type_cache(child_type)?
            .parent_rels
            .iter()
            .copied()
            .find(|&i| self.relationships[i].name() == name)
            .ok_or_else(|| ConfigError::UnknownRelationship {
                entity_type: child_type.to_string(),
                name: name.to_string(),
            })
    }

    /// Relationship in which `parent_type` is the parent, by its children accessor name.
    pub(crate) fn child_relationship(&self, parent_type: &str, name: &str) -> Result<usize, ConfigError> {
        self.type_cache(parent_type)?
            .child_rels
            .iter()
            .copied()
            .find(|&i| self.relationships[i].children_name() == name)
            .ok_or_else(|| ConfigError::UnknownRelationship {
                entity_type: parent_type.to_string(),
                name: name.to_string(),
            })
    }

    /// The cached handle for an id, if any.
    pub(crate) fn cached(&self, entity_type: &str, id: EntityId) -> Result<Option<Entity>, ConfigError> {
        Ok(self.type_cache(entity_type)?.lookups.by_id(id).cloned())
    }
}

/// Children of `parent` still to be loaded once the state lock is released.
#[derive(Debug, Clone)]
pub(crate) struct PendingLoad {
    pub(crate) relationship: usize,
    pub(crate) parent: Entity,
}

/// Render parameters for error messages and logs.
pub(crate) fn render(params: &RawRecord) -> String {
    serde_json::to_string(params).unwrap_or_default()
}

/// Identity-preserving cache in front of a [`RemoteBoundary`].
pub struct EntityCache<R: RemoteBoundary> {
    remote: R,
    config: CacheConfig,
    state: Mutex<CacheState>,
    pub(crate) stats: StatCounters,
}

impl<R: RemoteBoundary> std::fmt::Debug for EntityCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl<R: RemoteBoundary> EntityCache<R> {
    pub fn new(remote: R, config: CacheConfig) -> Self {
        Self {
            remote,
            config,
            state: Mutex::new(CacheState::default()),
            stats: StatCounters::default(),
        }
    }

    /// Build a cache and register every type a schema declares.
    pub fn from_schema(remote: R, schema: &SchemaConfig) -> RolodexResult<Self> {
        schema.validate()?;
        let cache = Self::new(remote, schema.cache.clone());
        for spec in &schema.entity {
            cache.register(spec.clone())?;
        }
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub(crate) fn lock(&self) -> RolodexResult<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| ConsistencyError::LockPoisoned.into())
    }

    /// Register an entity type. Parent types must be registered first.
    pub fn register(&self, spec: EntityTypeSpec) -> RolodexResult<()> {
        let mut state = self.lock()?;
        if spec.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "name".to_string(),
                value: String::new(),
                reason: "entity type name must not be empty".to_string(),
            }
            .into());
        }
        if state.types.contains_key(&spec.name) {
            return Err(ConfigError::DuplicateEntityType {
                entity_type: spec.name.clone(),
            }
            .into());
        }

        let mut names = BTreeSet::new();
        let mut indexes = Vec::new();
        for parent in &spec.parents {
            if !names.insert(parent.name.clone()) {
                return Err(ConfigError::DuplicateRelationship {
                    entity_type: spec.name.clone(),
                    name: parent.name.clone(),
                }
                .into());
            }
            let parent_table = if parent.parent == spec.name {
                spec.table_name(&self.config.table_prefix)
            } else {
                let parent_cache = state.type_cache(&parent.parent)?;
                let clash = parent_cache
                    .child_rels
                    .iter()
                    .any(|&i| state.relationships[i].children_name() == parent.children);
                if clash {
                    return Err(ConfigError::DuplicateRelationship {
                        entity_type: parent.parent.clone(),
                        name: parent.children.clone(),
                    }
                    .into());
                }
                parent_cache.spec.table_name(&self.config.table_prefix)
            };
            indexes.push(RelationshipIndex::new(&spec, parent, parent_table));
        }

        let mut type_cache = TypeCache {
            spec: spec.clone(),
            descriptor: None,
            lookups: LookupTables::default(),
            all_cached: false,
            cache_by_default: self.config.cache_by_default,
            parent_rels: Vec::new(),
            child_rels: Vec::new(),
            memberships: HashMap::new(),
            tags: HashMap::new(),
        };
        let mut self_children = Vec::new();
        for index in indexes {
            let i = state.relationships.len();
            type_cache.parent_rels.push(i);
            if index.parent_type() == spec.name {
                self_children.push(i);
            } else {
                state.type_cache_mut(index.parent_type())?.child_rels.push(i);
            }
            state.relationships.push(index);
        }
        type_cache.child_rels.extend(self_children);
        state.types.insert(spec.name.clone(), type_cache);
        debug!(entity_type = %spec.name, parents = spec.parents.len(), "Entity type registered");
        Ok(())
    }

    pub fn is_registered(&self, entity_type: &str) -> RolodexResult<bool> {
        Ok(self.lock()?.types.contains_key(entity_type))
    }

    /// Descriptor of a type, built from the remote column schema on first use.
    pub fn descriptor(&self, entity_type: &str) -> RolodexResult<Arc<EntityTypeDescriptor>> {
        let (spec, table) = {
            let state = self.lock()?;
            let type_cache = state.type_cache(entity_type)?;
            if let Some(descriptor) = &type_cache.descriptor {
                return Ok(descriptor.clone());
            }
            let table = type_cache.spec.table_name(&self.config.table_prefix);
            (type_cache.spec.clone(), table)
        };

        let columns = self.remote.table_columns(&table).map_err(|source| RemoteError::CallFailed {
            entity_type: entity_type.to_string(),
            action: "columns".to_string(),
            params: table.clone(),
            source,
        })?;
        let descriptor = Arc::new(EntityTypeDescriptor::build(&spec, &columns, &self.config)?);

        let mut state = self.lock()?;
        let type_cache = state.type_cache_mut(entity_type)?;
        if let Some(existing) = &type_cache.descriptor {
            return Ok(existing.clone());
        }
        type_cache.lookups = LookupTables::new(descriptor.lookup_keys());
        type_cache.descriptor = Some(descriptor.clone());
        info!(
            entity_type,
            table = %descriptor.table(),
            columns = columns.len(),
            lookups = descriptor.lookup_keys().len(),
            "Entity type descriptor built"
        );
        Ok(descriptor)
    }

    /// Whether a type caches what it reads unless told otherwise.
    pub fn set_cache_by_default(&self, entity_type: &str, cache: bool) -> RolodexResult<()> {
        self.lock()?.type_cache_mut(entity_type)?.cache_by_default = cache;
        Ok(())
    }

    pub(crate) fn cache_by_default(&self, entity_type: &str) -> RolodexResult<bool> {
        Ok(self.lock()?.type_cache(entity_type)?.cache_by_default)
    }

    // ------------------------------------------------------------------------
    // Remote calls
    // ------------------------------------------------------------------------

    pub(crate) fn remote_read(&self, entity_type: &str, params: &RawRecord) -> RolodexResult<Vec<RawRecord>> {
        self.stats.remote_read();
        debug!(entity_type, params = %render(params), "Remote read");
        let records = self
            .remote
            .read(entity_type, params)
            .map_err(|source| RemoteError::CallFailed {
                entity_type: entity_type.to_string(),
                action: "get".to_string(),
                params: render(params),
                source,
            })?;
        debug!(entity_type, count = records.len(), "Remote read returned");
        Ok(records)
    }

    pub(crate) fn remote_write(
        &self,
        entity_type: &str,
        action: &str,
        params: &RawRecord,
    ) -> RolodexResult<RawRecord> {
        self.stats.remote_write();
        debug!(entity_type, action, params = %render(params), "Remote write");
        Ok(self
            .remote
            .write(entity_type, params)
            .map_err(|source| RemoteError::CallFailed {
                entity_type: entity_type.to_string(),
                action: action.to_string(),
                params: render(params),
                source,
            })?)
    }

    pub(crate) fn remote_remove(&self, entity_type: &str, id: EntityId, permanent: bool) -> RolodexResult<()> {
        self.stats.remote_remove();
        debug!(entity_type, id, permanent, "Remote delete");
        Ok(self
            .remote
            .remove(entity_type, id, permanent)
            .map_err(|source| RemoteError::CallFailed {
                entity_type: entity_type.to_string(),
                action: "delete".to_string(),
                params: format!("{{\"id\":{},\"permanent\":{}}}", id, permanent),
                source,
            })?)
    }

    // ------------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------------

    /// Drop every cached handle, index and counter. Registrations and built
    /// descriptors are kept.
    pub fn reset(&self) -> RolodexResult<()> {
        let mut state = self.lock()?;
        for type_cache in state.types.values_mut() {
            type_cache.lookups.clear();
            type_cache.all_cached = false;
            type_cache.cache_by_default = self.config.cache_by_default;
            type_cache.memberships.clear();
            type_cache.tags.clear();
        }
        for index in &mut state.relationships {
            index.clear();
        }
        state.catalog = None;
        self.stats.reset();
        debug!("Entity cache reset");
        Ok(())
    }

    /// Current population counts per type, plus the hit/miss counters.
    pub fn diagnostics(&self) -> RolodexResult<CacheDiagnostics> {
        let state = self.lock()?;
        let mut diagnostics = CacheDiagnostics {
            stats: self.stats.snapshot(),
            custom_attributes: state.catalog.as_ref().map(|c| c.len()),
            ..Default::default()
        };
        for (name, type_cache) in &state.types {
            let parents_with_children = type_cache
                .child_rels
                .iter()
                .map(|&i| {
                    let index = &state.relationships[i];
                    (index.children_name().to_string(), index.cached_parent_count())
                })
                .collect();
            diagnostics.types.insert(
                name.clone(),
                TypeDiagnostics {
                    initialised: type_cache.descriptor.is_some(),
                    cached: type_cache.lookups.len(),
                    all_cached: type_cache.all_cached,
                    cache_by_default: type_cache.cache_by_default,
                    parents_with_children,
                    memberships: type_cache.memberships.len(),
                    tagged: type_cache.tags.len(),
                },
            );
        }
        Ok(diagnostics)
    }
}
