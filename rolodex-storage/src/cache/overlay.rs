//! Custom attribute overlay.
//!
//! Custom attributes are declared by `CustomGroup` and `CustomField` records
//! and stored in the `CustomValue` side table. Which of them an entity may
//! carry depends on its type's extension rule and, for most rules, on the
//! entity's own sub-type fields.

use super::handle::{CustomValue, Entity};
use super::registry::EntityCache;
use crate::{RemoteBoundary, CUSTOM_VALUE_ENTITY};
use rolodex_core::{
    custom_key, custom_key_id, raw_id, CoerceMode, Coerced, EntityId, EntityRef,
    EntityTypeDescriptor, ExtensionRule, FieldType, Fields, RawRecord, RolodexResult, ValidationError, Value,
};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Separator the remote uses inside multi-valued strings.
const VALUE_SEPARATOR: char = '\u{1}';

/// A group of custom attributes and the entities it extends.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomGroupInfo {
    pub id: i64,
    pub name: String,
    /// Entity type or category the group extends (e.g. `Individual`).
    pub extends: String,
    /// Sub-type values the group is narrowed to; empty means all.
    pub extends_entity_column_value: Vec<Value>,
    /// Whether each entity may hold several records of the group.
    pub is_multiple: bool,
}

/// One custom attribute declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomAttribute {
    pub id: i64,
    pub name: String,
    pub label: String,
    pub data_type: String,
    pub html_type: String,
    pub group_id: i64,
    pub option_group_id: Option<i64>,
    pub is_multiple: bool,
}

impl CustomAttribute {
    /// Parameter key addressing this attribute (`custom_N`).
    pub fn key(&self) -> String {
        custom_key(self.id)
    }

    pub fn is_multi_select(&self) -> bool {
        matches!(
            self.html_type.as_str(),
            "Multi-Select" | "AdvMulti-Select" | "CheckBox"
        )
    }

    /// Entity type referenced by id-valued attributes.
    pub fn ref_type(&self) -> Option<&'static str> {
        match self.data_type.as_str() {
            "StateProvince" => Some("StateProvince"),
            "Country" => Some("Country"),
            "File" => Some("File"),
            "ContactReference" => Some("Contact"),
            _ => None,
        }
    }
}

/// Result of resolving a field name against an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldResolution {
    Intrinsic(Value),
    Custom(CustomAttribute),
    NotFound,
}

fn int_of(raw: &RawRecord, key: &str) -> Option<i64> {
    match raw.get(key)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_of(raw: &RawRecord, key: &str) -> String {
    raw.get(key)
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string()
}

fn flag_of(raw: &RawRecord, key: &str, default: bool) -> bool {
    match raw.get(key) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_i64() != Some(0),
        Some(JsonValue::String(s)) if !s.is_empty() => s != "0",
        _ => default,
    }
}

fn separated(json: Option<&JsonValue>) -> Vec<Value> {
    match json {
        Some(JsonValue::String(s)) => s
            .split(VALUE_SEPARATOR)
            .filter(|part| !part.is_empty())
            .map(Value::from)
            .collect(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(Value::from_json)
            .filter(|v| !v.is_empty())
            .collect(),
        Some(JsonValue::Number(_)) => json.map(Value::from_json).into_iter().collect(),
        _ => Vec::new(),
    }
}

/// Active custom groups and attributes, indexed by id and by name.
#[derive(Debug, Default)]
pub(crate) struct CustomCatalog {
    groups: HashMap<i64, CustomGroupInfo>,
    attributes: HashMap<i64, CustomAttribute>,
    /// Lowercased name to attribute ids; names are not unique.
    by_name: HashMap<String, Vec<i64>>,
}

impl CustomCatalog {
    pub(crate) fn from_records(groups: &[RawRecord], fields: &[RawRecord]) -> Result<Self, ValidationError> {
        let mut catalog = CustomCatalog::default();
        for raw in groups {
            if !flag_of(raw, "is_active", true) {
                continue;
            }
            let group = CustomGroupInfo {
                id: raw_id(raw)?,
                name: text_of(raw, "name"),
                extends: text_of(raw, "extends"),
                extends_entity_column_value: separated(raw.get("extends_entity_column_value")),
                is_multiple: flag_of(raw, "is_multiple", false),
            };
            catalog.groups.insert(group.id, group);
        }
        for raw in fields {
            if !flag_of(raw, "is_active", true) {
                continue;
            }
            let Some(group) = int_of(raw, "custom_group_id").and_then(|id| catalog.groups.get(&id)) else {
                continue;
            };
            let attribute = CustomAttribute {
                id: raw_id(raw)?,
                name: text_of(raw, "name"),
                label: text_of(raw, "label"),
                data_type: text_of(raw, "data_type"),
                html_type: text_of(raw, "html_type"),
                group_id: group.id,
                option_group_id: int_of(raw, "option_group_id"),
                is_multiple: group.is_multiple,
            };
            catalog
                .by_name
                .entry(attribute.name.to_lowercase())
                .or_default()
                .push(attribute.id);
            catalog.attributes.insert(attribute.id, attribute);
        }
        for ids in catalog.by_name.values_mut() {
            ids.sort_unstable();
        }
        Ok(catalog)
    }

    pub(crate) fn len(&self) -> usize {
        self.attributes.len()
    }

    pub(crate) fn attribute(&self, id: i64) -> Option<&CustomAttribute> {
        self.attributes.get(&id)
    }

    pub(crate) fn group(&self, id: i64) -> Option<&CustomGroupInfo> {
        self.groups.get(&id)
    }

    /// The attribute's group, if it extends `entity_type` under `rule`.
    fn extending_group(
        &self,
        attribute: &CustomAttribute,
        rule: &ExtensionRule,
        entity_type: &str,
    ) -> Option<&CustomGroupInfo> {
        self.group(attribute.group_id)
            .filter(|g| rule.extends_type(entity_type, &g.extends))
    }

    pub(crate) fn named(&self, name: &str) -> Vec<&CustomAttribute> {
        self.by_name
            .get(&name.to_lowercase())
            .map(|ids| ids.iter().filter_map(|id| self.attributes.get(id)).collect())
            .unwrap_or_default()
    }
}

fn normalise_scalar(attribute: &CustomAttribute, field: &str, value: Value) -> Result<Value, ValidationError> {
    if let Some(entity_type) = attribute.ref_type() {
        return Ok(match FieldType::Int.coerce(field, value, CoerceMode::Fields, false)? {
            Coerced::Set(Value::Int(id)) => Value::Ref(EntityRef::new(entity_type, id)),
            Coerced::Set(other) => other,
            Coerced::Unset => Value::Null,
        });
    }
    let field_type = match attribute.data_type.as_str() {
        "Int" => FieldType::Int,
        "Float" | "Money" => FieldType::Float,
        "Boolean" => FieldType::Bool,
        "Date" => FieldType::DateTime,
        _ => FieldType::String,
    };
    Ok(match field_type.coerce(field, value, CoerceMode::Fields, false)? {
        Coerced::Set(v) => v,
        Coerced::Unset => Value::Null,
    })
}

/// Normalise a custom value by the attribute's data type. Multi-select
/// attributes always hold arrays.
pub(crate) fn normalise_custom(attribute: &CustomAttribute, value: Value) -> Result<Value, ValidationError> {
    let field = attribute.key();
    if !attribute.is_multi_select() {
        return normalise_scalar(attribute, &field, value);
    }
    let items = match value {
        Value::Array(items) => items,
        Value::String(s) => s
            .split(VALUE_SEPARATOR)
            .filter(|part| !part.is_empty())
            .map(Value::from)
            .collect(),
        Value::Null => Vec::new(),
        scalar => vec![scalar],
    };
    let items = items
        .into_iter()
        .map(|item| normalise_scalar(attribute, &field, item))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Array(items))
}

fn is_option_param(name: &str) -> bool {
    name == "options" || name == "sequential" || name.starts_with("return") || name.starts_with("api.")
}

impl<R: RemoteBoundary> EntityCache<R> {
    pub(crate) fn catalog(&self) -> RolodexResult<Arc<CustomCatalog>> {
        if let Some(catalog) = &self.lock()?.catalog {
            return Ok(catalog.clone());
        }
        let groups = self.remote_read("CustomGroup", &RawRecord::new())?;
        let fields = self.remote_read("CustomField", &RawRecord::new())?;
        let catalog = Arc::new(CustomCatalog::from_records(&groups, &fields)?);
        info!(
            groups = catalog.groups.len(),
            attributes = catalog.len(),
            "Custom attribute catalog loaded"
        );
        Ok(self.lock()?.catalog.get_or_insert(catalog).clone())
    }

    /// Every active custom attribute, in id order.
    pub fn custom_attributes(&self) -> RolodexResult<Vec<CustomAttribute>> {
        let catalog = self.catalog()?;
        let mut attributes: Vec<CustomAttribute> = catalog.attributes.values().cloned().collect();
        attributes.sort_by_key(|a| a.id);
        Ok(attributes)
    }

    /// The attribute `name` (or a `custom_N` key) names for an entity of
    /// this type. With `fields`, only attributes applicable to an entity with
    /// those fields are considered; without, any the type could carry.
    fn find_attribute(
        &self,
        descriptor: &EntityTypeDescriptor,
        name: &str,
        fields: Option<&Fields>,
        entity: &str,
    ) -> RolodexResult<Option<CustomAttribute>> {
        let Some(rule) = descriptor.extension() else {
            return Ok(None);
        };
        let entity_type = descriptor.entity_type();
        let catalog = self.catalog()?;

        if let Some(id) = custom_key_id(name) {
            return Ok(catalog
                .attribute(id)
                .filter(|a| catalog.extending_group(a, rule, entity_type).is_some())
                .cloned());
        }
        let matches: Vec<&CustomAttribute> = catalog
            .named(name)
            .into_iter()
            .filter(|attribute| match (catalog.extending_group(attribute, rule, entity_type), fields) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(group), Some(fields)) => rule.applies(
                    entity_type,
                    &group.extends,
                    &group.extends_entity_column_value,
                    fields,
                ),
            })
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some((*only).clone())),
            many => Err(ValidationError::CustomFieldMatch {
                name: name.to_string(),
                count: many.len(),
                entity: entity.to_string(),
            }
            .into()),
        }
    }

    /// Replace custom attribute names in parameters with `custom_N` keys and
    /// normalise their values. Names that match nothing pass through.
    pub(crate) fn map_custom_params(
        &self,
        descriptor: &EntityTypeDescriptor,
        params: Fields,
        fields: Option<&Fields>,
    ) -> RolodexResult<Fields> {
        let needs_mapping = descriptor.extension().is_some()
            && params
                .keys()
                .any(|name| !descriptor.is_valid_field(name) && !is_option_param(name));
        if !needs_mapping {
            return Ok(params);
        }
        let mut mapped = Fields::new();
        for (name, value) in params {
            if descriptor.is_valid_field(&name) || is_option_param(&name) {
                mapped.insert(name, value);
                continue;
            }
            match self.find_attribute(descriptor, &name, fields, descriptor.entity_type())? {
                Some(attribute) => {
                    let value = normalise_custom(&attribute, value)?;
                    debug!(entity_type = %descriptor.entity_type(), name = %name, key = %attribute.key(), "Custom parameter mapped");
                    mapped.insert(attribute.key(), value);
                }
                None => {
                    mapped.insert(name, value);
                }
            }
        }
        Ok(mapped)
    }

    /// Resolve a field name: intrinsic fields first, then the custom
    /// attributes applicable to this entity.
    pub fn resolve_field(&self, entity: &Entity, name: &str) -> RolodexResult<FieldResolution> {
        if entity.is_deleted() {
            return Err(entity.deleted_error());
        }
        if name == "id" || entity.descriptor().is_valid_field(name) {
            return Ok(FieldResolution::Intrinsic(entity.get(name)?));
        }
        let fields = self.latest(entity)?;
        let found = self.find_attribute(entity.descriptor(), name, Some(&fields), &entity.to_string())?;
        Ok(match found {
            Some(attribute) => FieldResolution::Custom(attribute),
            None => FieldResolution::NotFound,
        })
    }

    /// Value of an intrinsic field or an applicable custom attribute.
    pub fn field(&self, entity: &Entity, name: &str) -> RolodexResult<Value> {
        match self.resolve_field(entity, name)? {
            FieldResolution::Intrinsic(value) => Ok(value),
            FieldResolution::Custom(attribute) => Ok(match self.custom_value(entity, attribute.id)? {
                CustomValue::Single(value) => value,
                CustomValue::Multi(records) => Value::Array(records.into_values().collect()),
            }),
            FieldResolution::NotFound => Err(ValidationError::UnknownField {
                entity: entity.to_string(),
                field: name.to_string(),
            }
            .into()),
        }
    }

    fn owner_params(descriptor: &EntityTypeDescriptor, id: EntityId) -> RawRecord {
        let mut params = RawRecord::new();
        params.insert("entity_id".to_string(), JsonValue::from(id));
        params.insert("entity_table".to_string(), JsonValue::from(descriptor.table()));
        params
    }

    /// Normalised value of a custom attribute, fetched once and cached on
    /// the handle.
    pub fn custom_value(&self, entity: &Entity, attribute_id: i64) -> RolodexResult<CustomValue> {
        if let Some(value) = entity.cached_custom(attribute_id)? {
            return Ok(value);
        }
        let attribute = self
            .catalog()?
            .attribute(attribute_id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownField {
                entity: entity.to_string(),
                field: custom_key(attribute_id),
            })?;

        if !attribute.is_multiple {
            if let Some(raw) = entity.raw_custom(attribute_id)? {
                let value = CustomValue::Single(normalise_custom(&attribute, raw)?);
                entity.store_custom(attribute_id, value.clone())?;
                return Ok(value);
            }
        }

        let mut params = Self::owner_params(entity.descriptor(), entity.id());
        params.insert(format!("return.{}", attribute.key()), JsonValue::from(1));
        let records = self.remote_read(CUSTOM_VALUE_ENTITY, &params)?;
        let mut values = BTreeMap::new();
        if let Some(record) = records.iter().find(|r| int_of(r, "id") == Some(attribute_id)) {
            for (key, json) in record {
                if let Ok(record_id) = key.parse::<i64>() {
                    values.insert(record_id, normalise_custom(&attribute, Value::from_json(json))?);
                }
            }
        }
        let value = if attribute.is_multiple {
            CustomValue::Multi(values)
        } else {
            CustomValue::Single(values.into_values().next().unwrap_or_default())
        };
        entity.store_custom(attribute_id, value.clone())?;
        Ok(value)
    }

    /// `entity` and, when it is a different handle, the cached one.
    fn handles_for(&self, entity: &Entity) -> RolodexResult<Vec<Entity>> {
        let mut handles = vec![entity.clone()];
        let cached = self.lock()?.cached(entity.entity_type(), entity.id())?;
        if let Some(cached) = cached {
            if !cached.same_handle(entity) {
                handles.push(cached);
            }
        }
        Ok(handles)
    }

    fn custom_attribute_for(&self, entity: &Entity, name: &str) -> RolodexResult<CustomAttribute> {
        match self.resolve_field(entity, name)? {
            FieldResolution::Custom(attribute) => Ok(attribute),
            _ => Err(ValidationError::UnknownField {
                entity: entity.to_string(),
                field: name.to_string(),
            }
            .into()),
        }
    }

    fn write_custom(&self, descriptor: &EntityTypeDescriptor, id: EntityId, key: String, value: &Value) -> RolodexResult<()> {
        let mut params = Self::owner_params(descriptor, id);
        params.insert(key, value.serialise());
        self.remote_write(CUSTOM_VALUE_ENTITY, "create", &params)?;
        Ok(())
    }

    /// Set a single-valued custom attribute.
    pub fn set_custom(&self, entity: &Entity, name: &str, value: impl Into<Value>) -> RolodexResult<()> {
        let attribute = self.custom_attribute_for(entity, name)?;
        if attribute.is_multiple {
            return Err(ValidationError::CustomFieldUsage {
                field: attribute.name,
                reason: "holds several records; use add_custom or update_custom".to_string(),
            }
            .into());
        }
        let value = normalise_custom(&attribute, value.into())?;
        self.write_custom(entity.descriptor(), entity.id(), attribute.key(), &value)?;
        for handle in self.handles_for(entity)? {
            handle.store_custom(attribute.id, CustomValue::Single(value.clone()))?;
        }
        Ok(())
    }

    fn multi_record_attribute(&self, entity: &Entity, name: &str) -> RolodexResult<CustomAttribute> {
        let attribute = self.custom_attribute_for(entity, name)?;
        if !attribute.is_multiple {
            return Err(ValidationError::CustomFieldUsage {
                field: attribute.name,
                reason: "holds a single value; use set_custom".to_string(),
            }
            .into());
        }
        Ok(attribute)
    }

    /// Add a record to a multi-record custom attribute. The remote assigns
    /// the record id, so the attribute's cached value is dropped.
    pub fn add_custom(&self, entity: &Entity, name: &str, value: impl Into<Value>) -> RolodexResult<()> {
        let attribute = self.multi_record_attribute(entity, name)?;
        let value = normalise_custom(&attribute, value.into())?;
        self.write_custom(entity.descriptor(), entity.id(), format!("{}:-1", attribute.key()), &value)?;
        for handle in self.handles_for(entity)? {
            handle.invalidate_custom(attribute.id)?;
        }
        Ok(())
    }

    /// Replace one record of a multi-record custom attribute.
    pub fn update_custom(
        &self,
        entity: &Entity,
        name: &str,
        record_id: i64,
        value: impl Into<Value>,
    ) -> RolodexResult<()> {
        let attribute = self.multi_record_attribute(entity, name)?;
        let value = normalise_custom(&attribute, value.into())?;
        self.write_custom(
            entity.descriptor(),
            entity.id(),
            format!("{}:{}", attribute.key(), record_id),
            &value,
        )?;
        for handle in self.handles_for(entity)? {
            handle.invalidate_custom(attribute.id)?;
        }
        Ok(())
    }

    /// Set a single-valued custom attribute by entity id. Without a cached
    /// handle the attribute must be unambiguous for the type as a whole.
    pub fn set_custom_by_id(
        &self,
        entity_type: &str,
        id: EntityId,
        name: &str,
        value: impl Into<Value>,
    ) -> RolodexResult<()> {
        let cached = self.lock()?.cached(entity_type, id)?;
        if let Some(entity) = cached {
            return self.set_custom(&entity, name, value);
        }
        let descriptor = self.descriptor(entity_type)?;
        let described = descriptor.describe(id, Some(&Fields::new()));
        let attribute = self
            .find_attribute(&descriptor, name, None, &described)?
            .ok_or_else(|| ValidationError::UnknownField {
                entity: described.clone(),
                field: name.to_string(),
            })?;
        if attribute.is_multiple {
            return Err(ValidationError::CustomFieldUsage {
                field: attribute.name,
                reason: "holds several records; use add_custom or update_custom".to_string(),
            }
            .into());
        }
        let value = normalise_custom(&attribute, value.into())?;
        self.write_custom(&descriptor, id, attribute.key(), &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: JsonValue) -> RawRecord {
        value.as_object().cloned().unwrap_or_default()
    }

    fn attribute(data_type: &str, html_type: &str) -> CustomAttribute {
        CustomAttribute {
            id: 7,
            name: "thing".to_string(),
            label: "Thing".to_string(),
            data_type: data_type.to_string(),
            html_type: html_type.to_string(),
            group_id: 1,
            option_group_id: None,
            is_multiple: false,
        }
    }

    #[test]
    fn test_catalog_indexes_active_attributes_by_name() {
        let groups = vec![
            record(json!({"id": 1, "name": "about", "extends": "Individual",
                          "extends_entity_column_value": "\u{1}Student\u{1}Staff\u{1}", "is_active": 1})),
            record(json!({"id": 2, "name": "old", "extends": "Contact", "is_active": 0})),
            record(json!({"id": 3, "name": "gifts", "extends": "Contribution",
                          "extends_entity_column_value": [1], "is_multiple": "1"})),
        ];
        let fields = vec![
            record(json!({"id": 10, "name": "School", "custom_group_id": 1, "data_type": "String", "html_type": "Text"})),
            record(json!({"id": 11, "name": "school", "custom_group_id": 3, "data_type": "String", "html_type": "Text"})),
            record(json!({"id": 12, "name": "retired", "custom_group_id": 2, "data_type": "String"})),
            record(json!({"id": 13, "name": "hidden", "custom_group_id": 1, "is_active": 0})),
        ];
        let catalog = CustomCatalog::from_records(&groups, &fields).unwrap();
        assert_eq!(catalog.len(), 2);
        let named: Vec<i64> = catalog.named("SCHOOL").iter().map(|a| a.id).collect();
        assert_eq!(named, vec![10, 11]);
        assert!(catalog.attribute(11).unwrap().is_multiple);
        assert_eq!(
            catalog.group(1).unwrap().extends_entity_column_value,
            vec![Value::from("Student"), Value::from("Staff")]
        );
        assert_eq!(catalog.group(3).unwrap().extends_entity_column_value, vec![Value::Int(1)]);
    }

    #[test]
    fn test_normalise_by_data_type() {
        assert_eq!(
            normalise_custom(&attribute("Int", "Text"), Value::from("42")).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            normalise_custom(&attribute("Money", "Text"), Value::from("12.50")).unwrap(),
            Value::Float(12.5)
        );
        assert_eq!(
            normalise_custom(&attribute("Boolean", "Radio"), Value::from("1")).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            normalise_custom(&attribute("ContactReference", "Autocomplete-Select"), Value::from("9")).unwrap(),
            Value::Ref(EntityRef::new("Contact", 9))
        );
        assert_eq!(
            normalise_custom(&attribute("String", "CheckBox"), Value::from("\u{1}a\u{1}b\u{1}")).unwrap(),
            Value::Array(vec![Value::from("a"), Value::from("b")])
        );
        assert!(normalise_custom(&attribute("Int", "Text"), Value::from("many")).is_err());
    }

    #[test]
    fn test_option_params_are_not_custom() {
        assert!(is_option_param("options"));
        assert!(is_option_param("return.custom_4"));
        assert!(is_option_param("api.Email.get"));
        assert!(!is_option_param("favourite_colour"));
    }
}
