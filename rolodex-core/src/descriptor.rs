//! Entity type declarations and the descriptors built from them.
//!
//! An [`EntityTypeSpec`] is what a caller declares (usually from TOML). An
//! [`EntityTypeDescriptor`] is built from a spec plus the column schema of
//! the backing table the first time the type is used, and is immutable
//! afterwards.

use crate::{
    custom_key_id, raw_id, CacheConfig, CoerceMode, Coerced, ConfigError, EntityId, FieldSnapshot,
    FieldType, Fields, RawRecord, RemoteError, ValidationError, Value,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};

static RAW_CUSTOM_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^custom_(\d+)(?:_(\w+))?$").expect("Invalid raw custom key regex"));

static WORD_BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z])([A-Z][a-z])|([a-z])([A-Z])").expect("Invalid word boundary regex")
});

/// Convert a CamelCase type name to snake_case (`ContributionSoft` -> `contribution_soft`).
pub fn snake_case(name: &str) -> String {
    // Run twice so overlapping boundaries ("ABc" after "aB") are all split.
    let once = WORD_BOUNDARY.replace_all(name, "${1}${3}_${2}${4}");
    WORD_BOUNDARY
        .replace_all(&once, "${1}${3}_${2}${4}")
        .to_lowercase()
}

// ============================================================================
// DECLARATIONS
// ============================================================================

/// Explicit field typing, overriding what the column schema implies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FieldsByType {
    pub string: Vec<String>,
    pub int: Vec<String>,
    pub bool: Vec<String>,
    pub float: Vec<String>,
    pub datetime: Vec<String>,
    pub array: Vec<String>,
}

impl FieldsByType {
    fn iter(&self) -> impl Iterator<Item = (&String, FieldType)> {
        self.string
            .iter()
            .map(|f| (f, FieldType::String))
            .chain(self.int.iter().map(|f| (f, FieldType::Int)))
            .chain(self.bool.iter().map(|f| (f, FieldType::Bool)))
            .chain(self.float.iter().map(|f| (f, FieldType::Float)))
            .chain(self.datetime.iter().map(|f| (f, FieldType::DateTime)))
            .chain(self.array.iter().map(|f| (f, FieldType::Array)))
    }

    fn bucket_mut(&mut self, field_type: FieldType) -> &mut Vec<String> {
        match field_type {
            FieldType::String => &mut self.string,
            FieldType::Int => &mut self.int,
            FieldType::Bool => &mut self.bool,
            FieldType::Float => &mut self.float,
            FieldType::DateTime => &mut self.datetime,
            FieldType::Array => &mut self.array,
        }
    }
}

/// A parent relationship declared by a child type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParentSpec {
    /// Name the child uses for its parent (e.g. `contact`).
    pub name: String,
    /// Name the parent uses for its children (e.g. `emails`).
    pub children: String,
    /// Parent entity type.
    pub parent: String,
    /// Child field holding the parent's id.
    pub parent_id_field: String,
    /// Integer child key; children are looked up by id when absent.
    #[serde(default)]
    pub int_lookup: Option<String>,
    /// String child key, matched case-insensitively.
    #[serde(default)]
    pub string_lookup: Option<String>,
    #[serde(default)]
    pub extra_lookups: Vec<String>,
    /// Child field naming the parent's table, for polymorphic parents.
    #[serde(default)]
    pub parent_table_field: Option<String>,
}

impl ParentSpec {
    pub fn new(
        name: impl Into<String>,
        children: impl Into<String>,
        parent: impl Into<String>,
        parent_id_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            children: children.into(),
            parent: parent.into(),
            parent_id_field: parent_id_field.into(),
            int_lookup: None,
            string_lookup: None,
            extra_lookups: Vec::new(),
            parent_table_field: None,
        }
    }

    pub fn with_int_lookup(mut self, field: impl Into<String>) -> Self {
        self.int_lookup = Some(field.into());
        self
    }

    pub fn with_string_lookup(mut self, field: impl Into<String>) -> Self {
        self.string_lookup = Some(field.into());
        self
    }

    pub fn with_extra_lookups(mut self, fields: &[&str]) -> Self {
        self.extra_lookups = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_parent_table_field(mut self, field: impl Into<String>) -> Self {
        self.parent_table_field = Some(field.into());
        self
    }

    /// Child fields a read must report, as null when the remote omits them.
    pub fn key_fields(&self) -> Vec<String> {
        let mut fields = vec![self.parent_id_field.clone()];
        fields.extend(self.int_lookup.iter().cloned());
        fields.extend(self.string_lookup.iter().cloned());
        fields.extend(self.parent_table_field.iter().cloned());
        fields.extend(self.extra_lookups.iter().cloned());
        fields
    }
}

/// Which custom attribute groups apply to an entity of this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ExtensionRule {
    /// Groups extending exactly this type.
    Plain,
    /// Groups extending this type, optionally narrowed to entities whose
    /// `column` value is listed by the group.
    SubtypeColumn { column: String },
    /// Groups extending this type or one of its `categories`, narrowed by
    /// the entity's category (`type_field`) and sub-types (`subtype_field`).
    ContactLike {
        type_field: String,
        subtype_field: String,
        categories: Vec<String>,
    },
}

impl ExtensionRule {
    /// Could a group extending `extends` apply to some entity of this type?
    pub fn extends_type(&self, entity_type: &str, extends: &str) -> bool {
        match self {
            ExtensionRule::Plain | ExtensionRule::SubtypeColumn { .. } => extends == entity_type,
            ExtensionRule::ContactLike { categories, .. } => {
                extends == entity_type || categories.iter().any(|c| c == extends)
            }
        }
    }

    /// Does a group apply to this particular entity?
    pub fn applies(
        &self,
        entity_type: &str,
        extends: &str,
        column_values: &[Value],
        fields: &Fields,
    ) -> bool {
        if !self.extends_type(entity_type, extends) {
            return false;
        }
        match self {
            ExtensionRule::Plain => true,
            ExtensionRule::SubtypeColumn { column } => {
                column_values.is_empty()
                    || fields
                        .get(column)
                        .map(|v| column_values.iter().any(|c| c.loosely_equals(v)))
                        .unwrap_or(false)
            }
            ExtensionRule::ContactLike {
                type_field,
                subtype_field,
                ..
            } => {
                let category_matches = extends == entity_type
                    || fields
                        .get(type_field)
                        .map(|v| v.loosely_equals(&Value::from(extends)))
                        .unwrap_or(false);
                let subtype_matches = column_values.is_empty()
                    || fields
                        .get(subtype_field)
                        .map(|subtypes| {
                            column_values
                                .iter()
                                .any(|c| subtypes.contains_loosely(c) || subtypes.loosely_equals(c))
                        })
                        .unwrap_or(false);
                category_matches && subtype_matches
            }
        }
    }

    fn fields(&self) -> Vec<String> {
        match self {
            ExtensionRule::Plain => Vec::new(),
            ExtensionRule::SubtypeColumn { column } => vec![column.clone()],
            ExtensionRule::ContactLike {
                type_field,
                subtype_field,
                ..
            } => vec![type_field.clone(), subtype_field.clone()],
        }
    }
}

fn default_status_field() -> String {
    "status".to_string()
}

fn default_date_field() -> String {
    "date".to_string()
}

/// Group membership carried by this type through a link entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MembershipSpec {
    /// Link entity recording membership status (e.g. `GroupContact`).
    pub via: String,
    /// Entity type of the groups (e.g. `Group`).
    pub group_type: String,
    /// Link field holding the member id.
    pub member_field: String,
    /// Link field holding the group id.
    pub group_field: String,
    #[serde(default = "default_status_field")]
    pub status_field: String,
    #[serde(default = "default_date_field")]
    pub date_field: String,
}

impl MembershipSpec {
    pub fn new(
        via: impl Into<String>,
        group_type: impl Into<String>,
        member_field: impl Into<String>,
        group_field: impl Into<String>,
    ) -> Self {
        Self {
            via: via.into(),
            group_type: group_type.into(),
            member_field: member_field.into(),
            group_field: group_field.into(),
            status_field: default_status_field(),
            date_field: default_date_field(),
        }
    }
}

/// Declaration of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EntityTypeSpec {
    pub name: String,
    /// Overrides the configured table prefix.
    pub table_prefix: Option<String>,
    /// Lookup keys, each a comma-separated tuple of fields (`extends,title`).
    pub lookups: Vec<String>,
    /// Field used when a bare string identifies an entity.
    pub default_string_lookup: Option<String>,
    pub fields_by_type: FieldsByType,
    pub display_fields: Vec<String>,
    /// Fields the remote may return with a different value, or not at all.
    pub may_not_match: Vec<String>,
    pub required_on_create: Vec<String>,
    pub read_only: Vec<String>,
    /// Fields never re-submitted on update.
    pub persist_exclude: Vec<String>,
    pub autoload_children: bool,
    pub create_returns_fields: bool,
    pub can_undelete: bool,
    /// Integer field ordering siblings within a parent.
    pub position_field: Option<String>,
    pub parents: Vec<ParentSpec>,
    pub extension: Option<ExtensionRule>,
    pub taggable: bool,
    pub membership: Option<MembershipSpec>,
}

impl Default for EntityTypeSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            table_prefix: None,
            lookups: Vec::new(),
            default_string_lookup: None,
            fields_by_type: FieldsByType::default(),
            display_fields: Vec::new(),
            may_not_match: Vec::new(),
            required_on_create: Vec::new(),
            read_only: Vec::new(),
            persist_exclude: Vec::new(),
            autoload_children: false,
            create_returns_fields: true,
            can_undelete: false,
            position_field: None,
            parents: Vec::new(),
            extension: None,
            taggable: false,
            membership: None,
        }
    }
}

fn owned(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

impl EntityTypeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_lookups(mut self, lookups: &[&str]) -> Self {
        self.lookups = owned(lookups);
        self
    }

    pub fn with_default_string_lookup(mut self, field: impl Into<String>) -> Self {
        self.default_string_lookup = Some(field.into());
        self
    }

    pub fn with_field_type(mut self, field_type: FieldType, fields: &[&str]) -> Self {
        self.fields_by_type
            .bucket_mut(field_type)
            .extend(owned(fields));
        self
    }

    pub fn with_display_fields(mut self, fields: &[&str]) -> Self {
        self.display_fields = owned(fields);
        self
    }

    pub fn with_may_not_match(mut self, fields: &[&str]) -> Self {
        self.may_not_match = owned(fields);
        self
    }

    pub fn with_required_on_create(mut self, fields: &[&str]) -> Self {
        self.required_on_create = owned(fields);
        self
    }

    pub fn with_read_only(mut self, fields: &[&str]) -> Self {
        self.read_only = owned(fields);
        self
    }

    pub fn with_persist_exclude(mut self, fields: &[&str]) -> Self {
        self.persist_exclude = owned(fields);
        self
    }

    pub fn with_autoload_children(mut self, autoload: bool) -> Self {
        self.autoload_children = autoload;
        self
    }

    pub fn with_create_returns_fields(mut self, returns: bool) -> Self {
        self.create_returns_fields = returns;
        self
    }

    pub fn with_can_undelete(mut self, can_undelete: bool) -> Self {
        self.can_undelete = can_undelete;
        self
    }

    pub fn with_position_field(mut self, field: impl Into<String>) -> Self {
        self.position_field = Some(field.into());
        self
    }

    pub fn with_parent(mut self, parent: ParentSpec) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn with_extension(mut self, rule: ExtensionRule) -> Self {
        self.extension = Some(rule);
        self
    }

    pub fn with_taggable(mut self, taggable: bool) -> Self {
        self.taggable = taggable;
        self
    }

    pub fn with_membership(mut self, membership: MembershipSpec) -> Self {
        self.membership = Some(membership);
        self
    }

    /// Table backing this type under the given default prefix.
    pub fn table_name(&self, default_prefix: &str) -> String {
        let prefix = self.table_prefix.as_deref().unwrap_or(default_prefix);
        format!("{}_{}", prefix, snake_case(&self.name))
    }
}

/// One column of a backing table, as reported by the remote boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

// ============================================================================
// DESCRIPTOR
// ============================================================================

/// A lookup key: a fixed ordered tuple of fields that identifies one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupKey {
    name: String,
    fields: Vec<String>,
}

impl LookupKey {
    fn parse(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: name.split(',').map(|f| f.trim().to_string()).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn is_id(&self) -> bool {
        self.fields.len() == 1 && self.fields[0] == "id"
    }

    /// Does a parameter set consist of exactly this key's fields?
    pub fn matches_params(&self, params: &Fields) -> bool {
        params.len() == self.fields.len() && self.fields.iter().all(|f| params.contains_key(f))
    }

    /// Composite value under which an entity is indexed, or `None` when any
    /// component is empty.
    pub fn value_of(&self, id: Option<EntityId>, fields: &Fields) -> Option<String> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let part = match (field.as_str(), id) {
                ("id", Some(id)) => Some(id.to_string()),
                _ => fields.get(field).and_then(Value::lookup_fragment),
            };
            parts.push(part?);
        }
        Some(parts.join("\u{1f}"))
    }
}

/// Static, validated configuration of one entity type.
#[derive(Debug, Clone)]
pub struct EntityTypeDescriptor {
    entity_type: String,
    table: String,
    field_prefix: String,
    field_types: BTreeMap<String, FieldType>,
    intrinsic: BTreeSet<String>,
    lookup_keys: Vec<LookupKey>,
    default_string_lookup: Option<String>,
    display_fields: Vec<String>,
    may_not_match: BTreeSet<String>,
    required_on_create: Vec<String>,
    read_only: BTreeSet<String>,
    persist: BTreeSet<String>,
    fill_in: Vec<String>,
    autoload_children: bool,
    create_returns_fields: bool,
    can_undelete: bool,
    soft_delete_field: String,
    position_field: Option<String>,
    extension: Option<ExtensionRule>,
    taggable: bool,
    membership: Option<MembershipSpec>,
}

impl EntityTypeDescriptor {
    /// Classify every column and validate the declaration against them.
    pub fn build(
        spec: &EntityTypeSpec,
        columns: &[ColumnInfo],
        config: &CacheConfig,
    ) -> Result<Self, ConfigError> {
        let table = spec.table_name(&config.table_prefix);
        let explicit: BTreeMap<String, FieldType> = spec
            .fields_by_type
            .iter()
            .map(|(f, t)| (f.clone(), t))
            .collect();

        let mut field_types = explicit.clone();
        let mut intrinsic = BTreeSet::new();
        for column in columns {
            intrinsic.insert(column.name.clone());
            if explicit.contains_key(&column.name) {
                continue;
            }
            let field_type = FieldType::from_column_type(&column.data_type).ok_or_else(|| {
                ConfigError::UnknownColumnType {
                    table: table.clone(),
                    column: column.name.clone(),
                    data_type: column.data_type.clone(),
                }
            })?;
            field_types.insert(column.name.clone(), field_type);
        }

        let check = |property: &str, fields: &[String]| -> Result<(), ConfigError> {
            let unknown: Vec<String> = fields
                .iter()
                .filter(|f| !field_types.contains_key(f.as_str()))
                .cloned()
                .collect();
            if unknown.is_empty() {
                Ok(())
            } else {
                Err(ConfigError::UnknownFields {
                    entity_type: spec.name.clone(),
                    property: property.to_string(),
                    fields: unknown,
                })
            }
        };

        let mut lookup_keys = vec![LookupKey::parse("id")];
        lookup_keys.extend(spec.lookups.iter().map(|l| LookupKey::parse(l)));
        for key in &lookup_keys[1..] {
            check("lookups", key.fields())?;
        }
        check("display_fields", &spec.display_fields)?;
        check("may_not_match", &spec.may_not_match)?;
        check("required_on_create", &spec.required_on_create)?;
        check("read_only", &spec.read_only)?;
        check("persist_exclude", &spec.persist_exclude)?;
        check(
            "default_string_lookup",
            &spec.default_string_lookup.iter().cloned().collect::<Vec<_>>(),
        )?;
        check(
            "position_field",
            &spec.position_field.iter().cloned().collect::<Vec<_>>(),
        )?;
        if let Some(rule) = &spec.extension {
            check("extension", &rule.fields())?;
        }

        let mut fill_in = Vec::new();
        let mut seen_parents = BTreeSet::new();
        for parent in &spec.parents {
            if !seen_parents.insert(parent.name.as_str()) {
                return Err(ConfigError::DuplicateRelationship {
                    entity_type: spec.name.clone(),
                    name: parent.name.clone(),
                });
            }
            let key_fields = parent.key_fields();
            check("parents", &key_fields)?;
            for field in key_fields {
                if !fill_in.contains(&field) {
                    fill_in.push(field);
                }
            }
        }

        // Explicitly typed fields with no column behind them are extrinsic and
        // may legitimately come back different from what was written.
        let mut may_not_match: BTreeSet<String> = spec.may_not_match.iter().cloned().collect();
        may_not_match.extend(
            explicit
                .keys()
                .filter(|f| !intrinsic.contains(f.as_str()))
                .cloned(),
        );
        let read_only: BTreeSet<String> = spec.read_only.iter().cloned().collect();
        let persist = intrinsic
            .iter()
            .filter(|f| {
                f.as_str() != "id"
                    && !read_only.contains(f.as_str())
                    && !may_not_match.contains(f.as_str())
                    && !spec.persist_exclude.contains(f)
            })
            .cloned()
            .collect();

        Ok(Self {
            entity_type: spec.name.clone(),
            field_prefix: format!("{}_", snake_case(&spec.name)),
            table,
            field_types,
            intrinsic,
            lookup_keys,
            default_string_lookup: spec.default_string_lookup.clone(),
            display_fields: spec.display_fields.clone(),
            may_not_match,
            required_on_create: spec.required_on_create.clone(),
            read_only,
            persist,
            fill_in,
            autoload_children: spec.autoload_children,
            create_returns_fields: spec.create_returns_fields,
            can_undelete: spec.can_undelete,
            soft_delete_field: config.soft_delete_field.clone(),
            position_field: spec.position_field.clone(),
            extension: spec.extension.clone(),
            taggable: spec.taggable,
            membership: spec.membership.clone(),
        })
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn field_prefix(&self) -> &str {
        &self.field_prefix
    }

    /// Primitive type of a field, if it is a valid field of this type.
    pub fn classify(&self, field: &str) -> Option<FieldType> {
        self.field_types.get(field).copied()
    }

    pub fn is_valid_field(&self, field: &str) -> bool {
        self.field_types.contains_key(field)
    }

    pub fn is_intrinsic(&self, field: &str) -> bool {
        self.intrinsic.contains(field)
    }

    /// Lookup keys, the id key first.
    pub fn lookup_keys(&self) -> &[LookupKey] {
        &self.lookup_keys
    }

    pub fn default_string_lookup(&self) -> Option<&str> {
        self.default_string_lookup.as_deref()
    }

    pub fn display_fields(&self) -> &[String] {
        &self.display_fields
    }

    pub fn may_not_match(&self) -> &BTreeSet<String> {
        &self.may_not_match
    }

    pub fn read_only_fields(&self) -> &BTreeSet<String> {
        &self.read_only
    }

    pub fn persist_fields(&self) -> &BTreeSet<String> {
        &self.persist
    }

    pub fn required_on_create(&self) -> &[String] {
        &self.required_on_create
    }

    pub fn fill_in_fields(&self) -> &[String] {
        &self.fill_in
    }

    pub fn autoload_children(&self) -> bool {
        self.autoload_children
    }

    pub fn create_returns_fields(&self) -> bool {
        self.create_returns_fields
    }

    pub fn can_undelete(&self) -> bool {
        self.can_undelete
    }

    pub fn soft_delete_field(&self) -> &str {
        &self.soft_delete_field
    }

    pub fn position_field(&self) -> Option<&str> {
        self.position_field.as_deref()
    }

    pub fn extension(&self) -> Option<&ExtensionRule> {
        self.extension.as_ref()
    }

    pub fn taggable(&self) -> bool {
        self.taggable
    }

    pub fn membership(&self) -> Option<&MembershipSpec> {
        self.membership.as_ref()
    }

    /// Is this parameter name a declared field or a `custom_N` key?
    pub fn is_known_param(&self, name: &str) -> bool {
        self.is_valid_field(name) || custom_key_id(name).is_some()
    }

    // ------------------------------------------------------------------------
    // Parameter handling
    // ------------------------------------------------------------------------

    /// Accept a JSON object (or null, meaning no parameters) as parameters.
    pub fn parse_params(params: &JsonValue) -> Result<Fields, ValidationError> {
        match params {
            JsonValue::Null => Ok(Fields::new()),
            JsonValue::Object(map) => Ok(map
                .iter()
                .map(|(k, v)| (k.clone(), Value::from_json(v)))
                .collect()),
            other => Err(ValidationError::NotAParameterMap {
                value: other.to_string(),
            }),
        }
    }

    /// Coerce every declared field to its canonical type. Undeclared
    /// parameters pass through untouched.
    pub fn normalise(&self, fields: Fields, mode: CoerceMode) -> Result<Fields, ValidationError> {
        let mut normalised = Fields::new();
        for (name, value) in fields {
            match self.classify(&name) {
                Some(field_type) => {
                    let tolerant = self.may_not_match.contains(&name);
                    if let Coerced::Set(v) = field_type.coerce(&name, value, mode, tolerant)? {
                        normalised.insert(name, v);
                    }
                }
                None => {
                    normalised.insert(name, value);
                }
            }
        }
        Ok(normalised)
    }

    pub fn assert_id_not_supplied(&self, params: &Fields) -> Result<(), ValidationError> {
        if params.contains_key("id") {
            return Err(ValidationError::IdSupplied {
                params: describe_fields(params),
            });
        }
        Ok(())
    }

    pub fn assert_required_fields(&self, params: &Fields) -> Result<(), ValidationError> {
        let missing: Vec<String> = self
            .required_on_create
            .iter()
            .filter(|f| !params.contains_key(f.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::RequiredFieldsMissing {
                entity_type: self.entity_type.clone(),
                fields: missing,
            })
        }
    }

    /// Reject read-only fields on any non-read action.
    pub fn assert_writable(&self, params: &Fields, action: &str) -> Result<(), ValidationError> {
        let read_only: Vec<String> = params
            .keys()
            .filter(|k| self.read_only.contains(k.as_str()))
            .cloned()
            .collect();
        if read_only.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ReadOnlyFields {
                entity_type: self.entity_type.clone(),
                action: action.to_string(),
                fields: read_only,
            })
        }
    }

    /// Serialise parameters for the remote boundary.
    pub fn serialise(&self, fields: &Fields) -> RawRecord {
        fields
            .iter()
            .map(|(k, v)| (k.clone(), v.serialise()))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Raw record handling
    // ------------------------------------------------------------------------

    /// Filter and normalise a raw record's fields.
    ///
    /// `"null"` strings become null, misnamed `custom_N_id` keys become
    /// `custom_N`, prefixed names are un-prefixed, unknown fields are dropped
    /// and array fields always hold arrays.
    pub fn filter_raw(&self, raw: &RawRecord) -> Result<Fields, ValidationError> {
        let mut fields = Fields::new();
        let mut misnamed_custom = Fields::new();
        for (name, json) in raw {
            let mut value = Value::from_json(json);
            if matches!(&value, Value::String(s) if s.eq_ignore_ascii_case("null")) {
                value = Value::Null;
            }

            let mut name = name.clone();
            if let Some(caps) = RAW_CUSTOM_KEY.captures(&name) {
                match caps.get(2).map(|m| m.as_str()) {
                    None => {}
                    Some("id") => {
                        misnamed_custom.insert(format!("custom_{}", &caps[1]), value);
                        continue;
                    }
                    Some(_) => continue,
                }
            } else if !self.is_valid_field(&name) {
                match name.strip_prefix(self.field_prefix.as_str()) {
                    Some(stripped) if self.is_valid_field(stripped) => name = stripped.to_string(),
                    _ => continue,
                }
            }

            if self.classify(&name) == Some(FieldType::Array) {
                value = match value {
                    Value::String(s) if s.is_empty() => Value::Array(Vec::new()),
                    Value::Array(items) => Value::Array(items),
                    Value::Null => Value::Null,
                    scalar => Value::Array(vec![scalar]),
                };
            }
            fields.insert(name, value);
        }
        for (name, value) in misnamed_custom {
            fields.insert(name, value);
        }
        self.normalise(fields, CoerceMode::Fields)
    }

    /// Build a snapshot from a record the remote boundary returned.
    ///
    /// Reads fill in absent relationship key fields as null. When the record
    /// answers an update, empty values for fields that were not supplied are
    /// dropped since the remote reports them spuriously.
    pub fn snapshot_from_raw(
        &self,
        raw: &RawRecord,
        action: RecordSource<'_>,
    ) -> Result<FieldSnapshot, ValidationError> {
        let id = raw_id(raw)?;
        let mut raw = raw.clone();
        match action {
            RecordSource::Read => {
                for field in &self.fill_in {
                    raw.entry(field.clone()).or_insert(JsonValue::Null);
                }
            }
            RecordSource::Update(supplied) => {
                raw.retain(|name, value| {
                    name == "id"
                        || supplied.contains_key(name)
                        || !(value.is_null() || value.as_str() == Some(""))
                });
            }
            RecordSource::Create | RecordSource::Known => {}
        }
        let fields = self.filter_raw(&raw)?;
        Ok(FieldSnapshot::new(id, fields))
    }

    /// Check that a write's returned fields match what was supplied.
    pub fn verify_result(
        &self,
        supplied: &Fields,
        snapshot: &FieldSnapshot,
    ) -> Result<(), RemoteError> {
        let comparable: Vec<(&String, &Value)> = supplied
            .iter()
            .filter(|(name, value)| {
                name.as_str() != "options"
                    && !name.starts_with("api.")
                    && !self.may_not_match.contains(name.as_str())
                    && custom_key_id(name).is_none()
                    && !value.is_empty()
            })
            .collect();

        let returned_value = |name: &str| -> Option<Value> {
            if name == "id" {
                Some(Value::Int(snapshot.id()))
            } else {
                snapshot.get(name).cloned()
            }
        };

        let missing: Vec<String> = comparable
            .iter()
            .filter(|(name, _)| returned_value(name).is_none())
            .map(|(name, _)| (*name).clone())
            .collect();
        if !missing.is_empty() {
            return Err(RemoteError::MissingResultFields {
                entity_type: self.entity_type.clone(),
                fields: missing,
            });
        }

        let mut supplied_mismatch = Fields::new();
        let mut returned_mismatch = Fields::new();
        for (name, supplied_value) in comparable {
            let Some(returned) = returned_value(name) else {
                continue;
            };
            let array_contains = self.classify(name) == Some(FieldType::Array)
                && supplied_value.as_array().is_none()
                && returned.contains_loosely(supplied_value);
            if !returned.loosely_equals(supplied_value) && !array_contains {
                supplied_mismatch.insert(name.clone(), supplied_value.clone());
                returned_mismatch.insert(name.clone(), returned);
            }
        }
        if supplied_mismatch.is_empty() {
            Ok(())
        } else {
            Err(RemoteError::ResultMismatch {
                entity_type: self.entity_type.clone(),
                supplied: describe_fields(&supplied_mismatch),
                returned: describe_fields(&returned_mismatch),
            })
        }
    }

    /// Diagnostic rendering of an entity of this type.
    pub fn describe(&self, id: EntityId, fields: Option<&Fields>) -> String {
        let mut out = format!("{} {}", self.entity_type, id);
        match fields {
            None => out.push_str(" (deleted)"),
            Some(fields) => {
                let shown: Vec<String> = self
                    .display_fields
                    .iter()
                    .filter_map(|f| {
                        fields
                            .get(f)
                            .filter(|v| !v.is_empty())
                            .map(|v| format!("{} = {}", f, v))
                    })
                    .collect();
                if !shown.is_empty() {
                    out.push_str(&format!(" ({})", shown.join(", ")));
                }
            }
        }
        out
    }
}

/// Where a raw record came from, which decides how it is filtered.
#[derive(Debug, Clone, Copy)]
pub enum RecordSource<'a> {
    Read,
    Create,
    /// An update; carries the fields that were supplied.
    Update(&'a Fields),
    /// A record the caller already holds.
    Known,
}

/// Render fields for error messages.
pub fn describe_fields(fields: &Fields) -> String {
    let parts: Vec<String> = fields
        .iter()
        .map(|(k, v)| format!("'{}' => {}", k, v))
        .collect();
    format!("[{}]", parts.join(", "))
}

// =============================================================================
// TESTS
// =============================================================================
