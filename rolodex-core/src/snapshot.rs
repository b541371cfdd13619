//! Immutable field snapshots.

use crate::{CoerceMode, Coerced, EntityId, FieldType, Fields, SnapshotStamp, ValidationError, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Untyped field-name to value mapping as exchanged with the remote boundary.
pub type RawRecord = serde_json::Map<String, JsonValue>;

static CUSTOM_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^custom_(\d+)$").expect("Invalid custom key regex"));

/// Attribute id of a `custom_N` key, if it is one.
pub fn custom_key_id(key: &str) -> Option<i64> {
    CUSTOM_KEY
        .captures(key)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Key under which a custom attribute is addressed in remote parameters.
pub fn custom_key(attribute_id: i64) -> String {
    format!("custom_{}", attribute_id)
}

/// Read the integer id of a raw record. The id is coerced like any other
/// int field, so `"4"` reads as 4.
pub fn raw_id(raw: &RawRecord) -> Result<EntityId, ValidationError> {
    let id = raw.get("id").map(Value::from_json).and_then(|value| {
        match FieldType::Int.coerce("id", value, CoerceMode::Fields, false) {
            Ok(Coerced::Set(Value::Int(id))) => Some(id),
            _ => None,
        }
    });
    id.ok_or_else(|| ValidationError::MissingId {
        fields: JsonValue::Object(raw.clone()).to_string(),
    })
}

/// One observed state of an entity: its id, intrinsic fields, custom
/// attribute values, and the stamp ordering it against other observations.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSnapshot {
    id: EntityId,
    fields: Fields,
    custom: BTreeMap<i64, Value>,
    stamp: SnapshotStamp,
}

impl FieldSnapshot {
    /// Build a snapshot, separating `custom_N` values from intrinsic fields.
    /// An `id` entry in `fields` is discarded.
    pub fn new(id: EntityId, fields: Fields) -> Self {
        let mut intrinsic = Fields::new();
        let mut custom = BTreeMap::new();
        for (name, value) in fields {
            if name == "id" {
                continue;
            }
            match custom_key_id(&name) {
                Some(attribute_id) => {
                    custom.insert(attribute_id, value);
                }
                None => {
                    intrinsic.insert(name, value);
                }
            }
        }
        Self {
            id,
            fields: intrinsic,
            custom,
            stamp: SnapshotStamp::next(),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn custom(&self) -> &BTreeMap<i64, Value> {
        &self.custom
    }

    pub fn stamp(&self) -> SnapshotStamp {
        self.stamp
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Fill in fields this snapshot lacks from an older set of values.
    pub fn supplemented_by(mut self, older: &Fields) -> Self {
        for (name, value) in older {
            self.fields
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }

    /// Copy of this snapshot with one field replaced, stamped afresh.
    pub fn with_field(&self, field: &str, value: Value) -> Self {
        let mut fields = self.fields.clone();
        fields.insert(field.to_string(), value);
        Self {
            id: self.id,
            fields,
            custom: self.custom.clone(),
            stamp: SnapshotStamp::next(),
        }
    }

    /// Record custom values that were written alongside this snapshot.
    pub fn with_custom(mut self, custom: BTreeMap<i64, Value>) -> Self {
        for (attribute_id, value) in custom {
            self.custom.entry(attribute_id).or_insert(value);
        }
        self
    }

    pub fn into_parts(self) -> (EntityId, Fields, BTreeMap<i64, Value>, SnapshotStamp) {
        (self.id, self.fields, self.custom, self.stamp)
    }
}
