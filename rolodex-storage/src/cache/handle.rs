//! Identity-bearing entity handles.
//!
//! An [`Entity`] is a cheap clone of a shared cell. Clones are the *same*
//! handle; a handle built separately for the same id is a *duplicate* and is
//! kept in step with the cached one by reconciliation.

use rolodex_core::{
    ConsistencyError, EntityId, EntityTypeDescriptor, FieldSnapshot, Fields, RolodexError,
    RolodexResult, SnapshotStamp, ValidationError, Value,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A normalised custom attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum CustomValue {
    Single(Value),
    /// Multi-valued attribute: remote record id to value.
    Multi(BTreeMap<i64, Value>),
}

impl CustomValue {
    pub fn as_single(&self) -> Option<&Value> {
        match self {
            CustomValue::Single(v) => Some(v),
            CustomValue::Multi(_) => None,
        }
    }

    pub fn as_multi(&self) -> Option<&BTreeMap<i64, Value>> {
        match self {
            CustomValue::Single(_) => None,
            CustomValue::Multi(records) => Some(records),
        }
    }
}

#[derive(Debug)]
struct HandleState {
    fields: Fields,
    stamp: SnapshotStamp,
    deleted: bool,
    /// Custom values that arrived with a snapshot, not yet normalised.
    raw_custom: BTreeMap<i64, Value>,
    /// Normalised custom values, per attribute id.
    custom: BTreeMap<i64, CustomValue>,
}

#[derive(Debug)]
struct HandleCell {
    descriptor: Arc<EntityTypeDescriptor>,
    id: EntityId,
    state: RwLock<HandleState>,
}

/// Handle to one remote record.
#[derive(Clone)]
pub struct Entity(Arc<HandleCell>);

impl Entity {
    pub(crate) fn new(descriptor: Arc<EntityTypeDescriptor>, snapshot: &FieldSnapshot) -> Self {
        Entity(Arc::new(HandleCell {
            descriptor,
            id: snapshot.id(),
            state: RwLock::new(HandleState {
                fields: snapshot.fields().clone(),
                stamp: snapshot.stamp(),
                deleted: false,
                raw_custom: snapshot.custom().clone(),
                custom: BTreeMap::new(),
            }),
        }))
    }

    fn read(&self) -> RolodexResult<RwLockReadGuard<'_, HandleState>> {
        self.0
            .state
            .read()
            .map_err(|_| RolodexError::from(ConsistencyError::LockPoisoned))
    }

    fn write(&self) -> RolodexResult<RwLockWriteGuard<'_, HandleState>> {
        self.0
            .state
            .write()
            .map_err(|_| RolodexError::from(ConsistencyError::LockPoisoned))
    }

    fn live(&self) -> RolodexResult<RwLockReadGuard<'_, HandleState>> {
        let state = self.read()?;
        if state.deleted {
            return Err(self.deleted_error());
        }
        Ok(state)
    }

    pub(crate) fn deleted_error(&self) -> RolodexError {
        RolodexError::Deleted {
            entity_type: self.entity_type().to_string(),
            id: self.id(),
        }
    }

    pub fn id(&self) -> EntityId {
        self.0.id
    }

    pub fn entity_type(&self) -> &str {
        self.0.descriptor.entity_type()
    }

    pub fn descriptor(&self) -> &Arc<EntityTypeDescriptor> {
        &self.0.descriptor
    }

    /// Is `other` this very handle (not merely the same id)?
    pub fn same_handle(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_deleted(&self) -> bool {
        self.0.state.read().map(|s| s.deleted).unwrap_or(true)
    }

    /// Value of an intrinsic field; null when the field is valid but unset.
    pub fn get(&self, field: &str) -> RolodexResult<Value> {
        let state = self.live()?;
        if field == "id" {
            return Ok(Value::Int(self.id()));
        }
        if !self.0.descriptor.is_valid_field(field) {
            drop(state);
            return Err(ValidationError::UnknownField {
                entity: self.to_string(),
                field: field.to_string(),
            }
            .into());
        }
        Ok(state.fields.get(field).cloned().unwrap_or_default())
    }

    /// Is the field present with a non-empty value?
    pub fn is_set(&self, field: &str) -> RolodexResult<bool> {
        let state = self.live()?;
        Ok(state.fields.get(field).map(|v| !v.is_empty()).unwrap_or(false))
    }

    /// Copy of the current intrinsic fields.
    pub fn fields(&self) -> RolodexResult<Fields> {
        Ok(self.live()?.fields.clone())
    }

    pub fn stamp(&self) -> RolodexResult<SnapshotStamp> {
        Ok(self.read()?.stamp)
    }

    // ------------------------------------------------------------------------
    // Cache-internal mutation
    // ------------------------------------------------------------------------

    /// Fields regardless of the deleted flag, for index removal.
    pub(crate) fn fields_unchecked(&self) -> RolodexResult<Fields> {
        Ok(self.read()?.fields.clone())
    }

    pub(crate) fn apply(&self, snapshot: &FieldSnapshot) -> RolodexResult<()> {
        if snapshot.id() != self.id() {
            return Err(ConsistencyError::IdMismatch {
                snapshot_id: snapshot.id(),
                entity_id: self.id(),
            }
            .into());
        }
        let mut state = self.write()?;
        state.fields = snapshot.fields().clone();
        state.stamp = snapshot.stamp();
        for (attribute_id, value) in snapshot.custom() {
            state.raw_custom.insert(*attribute_id, value.clone());
            state.custom.remove(attribute_id);
        }
        Ok(())
    }

    pub(crate) fn mark_deleted(&self) -> RolodexResult<()> {
        self.write()?.deleted = true;
        Ok(())
    }

    pub(crate) fn cached_custom(&self, attribute_id: i64) -> RolodexResult<Option<CustomValue>> {
        Ok(self.live()?.custom.get(&attribute_id).cloned())
    }

    pub(crate) fn raw_custom(&self, attribute_id: i64) -> RolodexResult<Option<Value>> {
        Ok(self.live()?.raw_custom.get(&attribute_id).cloned())
    }

    pub(crate) fn store_custom(&self, attribute_id: i64, value: CustomValue) -> RolodexResult<()> {
        self.write()?.custom.insert(attribute_id, value);
        Ok(())
    }

    pub(crate) fn invalidate_custom(&self, attribute_id: i64) -> RolodexResult<()> {
        let mut state = self.write()?;
        state.custom.remove(&attribute_id);
        state.raw_custom.remove(&attribute_id);
        Ok(())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let described = match self.0.state.read() {
            Ok(state) if !state.deleted => self.0.descriptor.describe(self.id(), Some(&state.fields)),
            _ => self.0.descriptor.describe(self.id(), None),
        };
        f.write_str(&described)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("entity_type", &self.entity_type())
            .field("id", &self.id())
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
