//! Rolodex Storage - Remote Boundary and Entity Cache
//!
//! Defines the remote record boundary the cache sits in front of, an
//! in-memory mock of it for tests, and the cache itself.

pub mod cache;

pub use cache::{
    CacheDiagnostics, CacheStats, CustomAttribute, CustomGroupInfo, CustomValue, Entity,
    EntityCache, FieldResolution, GetOptions, GroupStatus, LookupArg, StatusFilter,
    TypeDiagnostics, ENTITY_TAG_ENTITY, TAG_ENTITY,
};

use rolodex_core::{ColumnInfo, EntityId, RawRecord, RemoteFailure};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ============================================================================
// REMOTE BOUNDARY TRAIT
// ============================================================================

/// The narrow record-oriented API the cache talks to.
///
/// Calls are synchronous. Implementations report their own failures as
/// [`RemoteFailure`]; the cache wraps them with the entity type, action and
/// parameters of the call.
pub trait RemoteBoundary: Send + Sync {
    /// Read every record of `entity_type` matching `params`.
    fn read(&self, entity_type: &str, params: &RawRecord) -> Result<Vec<RawRecord>, RemoteFailure>;

    /// Create a record (no `id` in `params`) or update one (`id` present).
    fn write(&self, entity_type: &str, params: &RawRecord) -> Result<RawRecord, RemoteFailure>;

    /// Delete a record. A non-permanent delete of a soft-deletable type only
    /// marks it deleted.
    fn remove(&self, entity_type: &str, id: EntityId, permanent: bool) -> Result<(), RemoteFailure>;

    /// Column schema of a backing table.
    fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, RemoteFailure>;
}

impl<T: RemoteBoundary + ?Sized> RemoteBoundary for Arc<T> {
    fn read(&self, entity_type: &str, params: &RawRecord) -> Result<Vec<RawRecord>, RemoteFailure> {
        (**self).read(entity_type, params)
    }

    fn write(&self, entity_type: &str, params: &RawRecord) -> Result<RawRecord, RemoteFailure> {
        (**self).write(entity_type, params)
    }

    fn remove(&self, entity_type: &str, id: EntityId, permanent: bool) -> Result<(), RemoteFailure> {
        (**self).remove(entity_type, id, permanent)
    }

    fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, RemoteFailure> {
        (**self).table_columns(table)
    }
}

// ============================================================================
// MOCK REMOTE
// ============================================================================

/// Entity type the mock treats as the custom value side table.
pub const CUSTOM_VALUE_ENTITY: &str = "CustomValue";

/// One call made against a [`MockRemote`].
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub entity_type: String,
    pub action: String,
    pub params: RawRecord,
}

/// Declaration of one table held by a [`MockRemote`].
#[derive(Debug, Clone)]
pub struct TableDef {
    entity_type: String,
    table: String,
    columns: Vec<ColumnInfo>,
    defaults: RawRecord,
    reset_on_update: Vec<String>,
    upsert_keys: Vec<String>,
    soft_delete: Option<String>,
}

impl TableDef {
    pub fn new(entity_type: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            table: table.into(),
            columns: vec![ColumnInfo::new("id", "int")],
            defaults: RawRecord::new(),
            reset_on_update: Vec::new(),
            upsert_keys: Vec::new(),
            soft_delete: None,
        }
    }

    pub fn column(mut self, name: &str, data_type: &str) -> Self {
        self.columns.push(ColumnInfo::new(name, data_type));
        self
    }

    /// Values a created record starts from.
    pub fn default_value(mut self, field: &str, value: JsonValue) -> Self {
        self.defaults.insert(field.to_string(), value);
        self
    }

    /// Fields an update resets to their default unless it supplies them.
    pub fn reset_on_update(mut self, fields: &[&str]) -> Self {
        self.reset_on_update = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Fields identifying an existing record that a create updates instead.
    pub fn upsert_keys(mut self, fields: &[&str]) -> Self {
        self.upsert_keys = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Boolean field set by non-permanent deletes.
    pub fn soft_delete(mut self, field: &str) -> Self {
        self.soft_delete = Some(field.to_string());
        self
    }
}

#[derive(Debug)]
struct MockTable {
    def: TableDef,
    rows: BTreeMap<EntityId, RawRecord>,
    next_id: EntityId,
}

/// Custom values of one entity, keyed by attribute id then record id.
/// Single-valued attributes use record id 0.
type CustomStore = HashMap<(String, EntityId), BTreeMap<i64, BTreeMap<i64, JsonValue>>>;

type WriteHook = Box<dyn Fn(&str, &RawRecord) + Send + Sync>;

/// In-memory remote boundary for testing.
#[derive(Default)]
pub struct MockRemote {
    tables: Arc<RwLock<HashMap<String, MockTable>>>,
    custom_values: Arc<RwLock<CustomStore>>,
    next_custom_record: Arc<RwLock<i64>>,
    calls: Arc<RwLock<Vec<RemoteCall>>>,
    failures: Arc<RwLock<VecDeque<RemoteFailure>>>,
    write_hook: Arc<RwLock<Option<WriteHook>>>,
}

impl std::fmt::Debug for MockRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRemote")
            .field("tables", &self.tables)
            .field("calls", &self.call_count())
            .finish()
    }
}

fn poisoned() -> RemoteFailure {
    RemoteFailure::new("lock-poisoned", "Mock remote lock poisoned")
}

fn read_lock<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, RemoteFailure> {
    lock.read().map_err(|_| poisoned())
}

fn write_lock<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, RemoteFailure> {
    lock.write().map_err(|_| poisoned())
}

/// Integer reading of a JSON id that may be spelled as a string.
fn json_id(value: &JsonValue) -> Option<EntityId> {
    match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Comparable text of a scalar: case-folded, with null and "" equivalent.
fn scalar_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.to_lowercase(),
        other => other.to_string(),
    }
}

/// Loose filter match: an array cell matches any scalar it contains.
fn cell_matches(cell: &JsonValue, filter: &JsonValue) -> bool {
    match (cell, filter) {
        (JsonValue::Array(items), JsonValue::Array(wanted)) => {
            wanted.iter().all(|w| items.iter().any(|i| cell_matches(i, w)))
        }
        (JsonValue::Array(items), scalar) => items.iter().any(|i| cell_matches(i, scalar)),
        (cell, filter) => scalar_text(cell) == scalar_text(filter),
    }
}

fn is_option_key(key: &str) -> bool {
    key == "options" || key == "sequential" || key.starts_with("return") || key.starts_with("api.")
}

impl MockRemote {
    /// Create an empty mock remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table. Redeclaring replaces it and drops its rows.
    pub fn define(&self, def: TableDef) {
        if let Ok(mut tables) = self.tables.write() {
            tables.insert(
                def.entity_type.clone(),
                MockTable {
                    def,
                    rows: BTreeMap::new(),
                    next_id: 1,
                },
            );
        }
    }

    /// Insert a record directly, bypassing call logging and hooks.
    pub fn seed(&self, entity_type: &str, record: JsonValue) -> Result<EntityId, RemoteFailure> {
        let mut tables = write_lock(&self.tables)?;
        let table = tables
            .get_mut(entity_type)
            .ok_or_else(|| RemoteFailure::not_found(format!("No such entity type {}", entity_type)))?;
        let mut row = table.def.defaults.clone();
        if let JsonValue::Object(fields) = record {
            row.extend(fields);
        }
        let id = match row.get("id").and_then(json_id) {
            Some(id) => id,
            None => table.next_id,
        };
        table.next_id = table.next_id.max(id + 1);
        row.insert("id".to_string(), JsonValue::from(id));
        table.rows.insert(id, row);
        Ok(id)
    }

    /// Current stored record, as the remote holds it.
    pub fn row(&self, entity_type: &str, id: EntityId) -> Option<RawRecord> {
        let tables = self.tables.read().ok()?;
        tables.get(entity_type)?.rows.get(&id).cloned()
    }

    /// Number of stored records of a type.
    pub fn row_count(&self, entity_type: &str) -> usize {
        self.tables
            .read()
            .ok()
            .and_then(|t| t.get(entity_type).map(|t| t.rows.len()))
            .unwrap_or(0)
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.read().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Calls with the given action (`get`, `create`, `update`, `delete`, `columns`).
    pub fn calls_for(&self, action: &str) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.action == action)
            .collect()
    }

    pub fn reset_calls(&self) {
        if let Ok(mut calls) = self.calls.write() {
            calls.clear();
        }
    }

    /// Make the next read, write or remove fail.
    pub fn fail_next(&self, failure: RemoteFailure) {
        if let Ok(mut failures) = self.failures.write() {
            failures.push_back(failure);
        }
    }

    /// Run `hook` after every successful write, with no internal locks held.
    pub fn set_write_hook(&self, hook: impl Fn(&str, &RawRecord) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.write_hook.write() {
            *slot = Some(Box::new(hook));
        }
    }

    pub fn clear_write_hook(&self) {
        if let Ok(mut slot) = self.write_hook.write() {
            *slot = None;
        }
    }

    fn log(&self, entity_type: &str, action: &str, params: &RawRecord) -> Result<(), RemoteFailure> {
        write_lock(&self.calls)?.push(RemoteCall {
            entity_type: entity_type.to_string(),
            action: action.to_string(),
            params: params.clone(),
        });
        Ok(())
    }

    fn injected_failure(&self) -> Result<(), RemoteFailure> {
        match write_lock(&self.failures)?.pop_front() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Custom values
    // ------------------------------------------------------------------------

    fn custom_owner(params: &RawRecord) -> Result<(String, EntityId), RemoteFailure> {
        let entity_id = params
            .get("entity_id")
            .and_then(json_id)
            .ok_or_else(|| RemoteFailure::new("mandatory_missing", "Mandatory key(s) missing: entity_id"))?;
        let table = params
            .get("entity_table")
            .and_then(JsonValue::as_str)
            .unwrap_or("civicrm_contact")
            .to_string();
        Ok((table, entity_id))
    }

    fn read_custom_values(&self, params: &RawRecord) -> Result<Vec<RawRecord>, RemoteFailure> {
        let owner = Self::custom_owner(params)?;
        let store = read_lock(&self.custom_values)?;
        let Some(values) = store.get(&owner) else {
            return Ok(Vec::new());
        };
        let wanted: Vec<i64> = params
            .keys()
            .filter_map(|k| k.strip_prefix("return.custom_"))
            .filter_map(|id| id.parse().ok())
            .collect();

        let mut results = Vec::new();
        for (attribute_id, records) in values {
            if !wanted.is_empty() && !wanted.contains(attribute_id) {
                continue;
            }
            let mut record = RawRecord::new();
            record.insert("id".to_string(), JsonValue::from(*attribute_id));
            record.insert("entity_id".to_string(), JsonValue::from(owner.1));
            for (record_id, value) in records {
                record.insert(record_id.to_string(), value.clone());
            }
            results.push(record);
        }
        Ok(results)
    }

    /// Store `custom_N`, `custom_N:-k` (new record) and `custom_N:<rid>` keys.
    fn store_custom_values(
        &self,
        owner: &(String, EntityId),
        params: &RawRecord,
    ) -> Result<RawRecord, RemoteFailure> {
        let mut written = RawRecord::new();
        let mut store = write_lock(&self.custom_values)?;
        for (key, value) in params {
            let Some(rest) = key.strip_prefix("custom_") else {
                continue;
            };
            let (attribute, record) = match rest.split_once(':') {
                Some((a, r)) => (a, Some(r)),
                None => (rest, None),
            };
            let Ok(attribute_id) = attribute.parse::<i64>() else {
                continue;
            };
            let record_id = match record.map(|r| r.parse::<i64>()) {
                None => 0,
                Some(Ok(r)) if r < 0 => {
                    let mut next = write_lock(&self.next_custom_record)?;
                    *next += 1;
                    *next
                }
                Some(Ok(r)) => r,
                Some(Err(_)) => {
                    return Err(RemoteFailure::new(
                        "invalid_key",
                        format!("Invalid custom value key {}", key),
                    ))
                }
            };
            store
                .entry(owner.clone())
                .or_default()
                .entry(attribute_id)
                .or_default()
                .insert(record_id, value.clone());
            if record_id == 0 {
                written.insert(format!("custom_{}", attribute_id), value.clone());
            }
        }
        Ok(written)
    }

    fn write_record(&self, entity_type: &str, params: &RawRecord) -> Result<RawRecord, RemoteFailure> {
        let mut tables = write_lock(&self.tables)?;
        let table = tables
            .get_mut(entity_type)
            .ok_or_else(|| RemoteFailure::not_found(format!("No such entity type {}", entity_type)))?;
        let columns: Vec<String> = table.def.columns.iter().map(|c| c.name.clone()).collect();

        let existing = match params.get("id") {
            Some(id) => {
                let id = json_id(id).ok_or_else(|| RemoteFailure::new("invalid_id", "Invalid id"))?;
                if !table.rows.contains_key(&id) {
                    return Err(RemoteFailure::not_found(format!(
                        "{} {} does not exist",
                        entity_type, id
                    )));
                }
                Some(id)
            }
            None if !table.def.upsert_keys.is_empty()
                && table.def.upsert_keys.iter().all(|k| params.contains_key(k)) =>
            {
                table
                    .rows
                    .iter()
                    .find(|(_, row)| {
                        table.def.upsert_keys.iter().all(|k| {
                            cell_matches(row.get(k).unwrap_or(&JsonValue::Null), &params[k])
                        })
                    })
                    .map(|(id, _)| *id)
            }
            None => None,
        };

        let id = match existing {
            Some(id) => {
                let defaults = table.def.defaults.clone();
                let resets = table.def.reset_on_update.clone();
                if let Some(row) = table.rows.get_mut(&id) {
                    for field in resets {
                        if !params.contains_key(&field) {
                            let reset = defaults.get(&field).cloned().unwrap_or(JsonValue::Null);
                            row.insert(field, reset);
                        }
                    }
                }
                id
            }
            None => {
                let id = table.next_id;
                table.next_id += 1;
                let mut row = table.def.defaults.clone();
                row.insert("id".to_string(), JsonValue::from(id));
                table.rows.insert(id, row);
                id
            }
        };

        let row = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| RemoteFailure::not_found(format!("{} {} vanished", entity_type, id)))?;
        for (key, value) in params {
            if key != "id" && columns.contains(key) {
                row.insert(key.clone(), value.clone());
            }
        }
        let mut result = row.clone();
        let owner = (table.def.table.clone(), id);
        drop(tables);

        result.extend(self.store_custom_values(&owner, params)?);
        Ok(result)
    }
}

impl RemoteBoundary for MockRemote {
    fn read(&self, entity_type: &str, params: &RawRecord) -> Result<Vec<RawRecord>, RemoteFailure> {
        self.log(entity_type, "get", params)?;
        self.injected_failure()?;
        if entity_type == CUSTOM_VALUE_ENTITY {
            return self.read_custom_values(params);
        }

        let tables = read_lock(&self.tables)?;
        let table = tables
            .get(entity_type)
            .ok_or_else(|| RemoteFailure::not_found(format!("No such entity type {}", entity_type)))?;
        Ok(table
            .rows
            .values()
            .filter(|row| {
                params.iter().filter(|(k, _)| !is_option_key(k)).all(|(k, v)| {
                    cell_matches(row.get(k).unwrap_or(&JsonValue::Null), v)
                })
            })
            .cloned()
            .collect())
    }

    fn write(&self, entity_type: &str, params: &RawRecord) -> Result<RawRecord, RemoteFailure> {
        let action = if params.contains_key("id") { "update" } else { "create" };
        self.log(entity_type, action, params)?;
        self.injected_failure()?;

        let result = if entity_type == CUSTOM_VALUE_ENTITY {
            let owner = Self::custom_owner(params)?;
            let mut result = self.store_custom_values(&owner, params)?;
            result.insert("id".to_string(), JsonValue::from(owner.1));
            result
        } else {
            self.write_record(entity_type, params)?
        };

        // The hook may call back into this remote.
        let hook = read_lock(&self.write_hook)?;
        if let Some(hook) = hook.as_ref() {
            hook(entity_type, &result);
        }
        Ok(result)
    }

    fn remove(&self, entity_type: &str, id: EntityId, permanent: bool) -> Result<(), RemoteFailure> {
        let mut params = RawRecord::new();
        params.insert("id".to_string(), JsonValue::from(id));
        params.insert("skip_undelete".to_string(), JsonValue::from(permanent));
        self.log(entity_type, "delete", &params)?;
        self.injected_failure()?;

        let mut tables = write_lock(&self.tables)?;
        let table = tables
            .get_mut(entity_type)
            .ok_or_else(|| RemoteFailure::not_found(format!("No such entity type {}", entity_type)))?;
        match (&table.def.soft_delete, permanent) {
            (Some(field), false) => {
                let row = table.rows.get_mut(&id).ok_or_else(|| {
                    RemoteFailure::not_found(format!("{} {} does not exist", entity_type, id))
                })?;
                row.insert(field.clone(), JsonValue::from(1));
            }
            _ => {
                if table.rows.remove(&id).is_none() {
                    return Err(RemoteFailure::not_found(format!(
                        "{} {} does not exist",
                        entity_type, id
                    )));
                }
            }
        }
        Ok(())
    }

    fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>, RemoteFailure> {
        let mut params = RawRecord::new();
        params.insert("table".to_string(), JsonValue::from(table));
        self.log("Schema", "columns", &params)?;

        let tables = read_lock(&self.tables)?;
        tables
            .values()
            .find(|t| t.def.table == table)
            .map(|t| t.def.columns.clone())
            .ok_or_else(|| RemoteFailure::not_found(format!("No such table {}", table)))
    }
}

// ============================================================================
// TESTS
// ============================================================================
