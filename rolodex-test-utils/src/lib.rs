//! Rolodex Test Utilities
//!
//! Shared test infrastructure for the Rolodex workspace:
//! - A CRM-shaped schema and a seeded mock remote
//! - Proptest generators for cache operation sequences
//! - Custom assertions for Rolodex-specific validation
//! - Tracing initialisation for tests

// Re-export the mock remote and the cache from their source crate
pub use rolodex_storage::{
    CustomValue, Entity, EntityCache, FieldResolution, GetOptions, GroupStatus, LookupArg,
    MockRemote, RemoteBoundary, RemoteCall, StatusFilter, TableDef,
};

// Re-export core types for convenience
pub use rolodex_core::{
    CacheConfig, ConfigError, ConsistencyError, EntityId, EntityRef, EntityTypeSpec, Fields,
    RemoteError, RemoteFailure, RolodexError, RolodexResult, SchemaConfig, ValidationError, Value,
};

use std::sync::{Arc, Once};

/// The cache type every fixture builds.
pub type TestCache = EntityCache<Arc<MockRemote>>;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Once = Once::new();

/// Install a test-writer subscriber filtered by `RUST_LOG` (default `warn`).
/// Safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! A small CRM: contacts with emails, notes and contributions, groups,
    //! tags, option groups with ordered values, and custom attributes.

    use super::*;
    use serde_json::json;

    /// Schema of the fixture types, parents before children.
    pub const CRM_SCHEMA: &str = r#"
[cache]
verify_writes = true

[[entity]]
name = "Contact"
lookups = ["external_identifier"]
default_string_lookup = "external_identifier"
display_fields = ["external_identifier", "first_name", "last_name"]
read_only = ["display_name"]
can_undelete = true
taggable = true

[entity.fields_by_type]
array = ["contact_sub_type"]

[entity.extension]
rule = "contact_like"
type_field = "contact_type"
subtype_field = "contact_sub_type"
categories = ["Individual", "Household", "Organization"]

[entity.membership]
via = "GroupContact"
group_type = "Group"
member_field = "contact_id"
group_field = "group_id"

[[entity]]
name = "Group"
lookups = ["name", "title"]
default_string_lookup = "name"
display_fields = ["title"]

[[entity]]
name = "Tag"
lookups = ["name"]
default_string_lookup = "name"

[[entity]]
name = "Email"
display_fields = ["email"]

[[entity.parents]]
name = "contact"
children = "emails"
parent = "Contact"
parent_id_field = "contact_id"
int_lookup = "location_type_id"

[[entity]]
name = "Note"
display_fields = ["subject"]

[[entity.parents]]
name = "contact"
children = "notes"
parent = "Contact"
parent_id_field = "entity_id"
parent_table_field = "entity_table"
string_lookup = "subject"

[[entity]]
name = "Contribution"
display_fields = ["total_amount"]
required_on_create = ["contact_id", "financial_type_id"]

[entity.extension]
rule = "subtype_column"
column = "financial_type_id"

[[entity.parents]]
name = "contact"
children = "contributions"
parent = "Contact"
parent_id_field = "contact_id"

[[entity]]
name = "OptionGroup"
lookups = ["name"]
default_string_lookup = "name"
autoload_children = true

[[entity]]
name = "OptionValue"
display_fields = ["label"]
position_field = "weight"

[[entity.parents]]
name = "option_group"
children = "option_values"
parent = "OptionGroup"
parent_id_field = "option_group_id"
string_lookup = "value"
"#;

    /// Attribute ids of the seeded custom fields.
    pub const FAVOURITE_COLOUR: i64 = 1;
    pub const SCHOOL: i64 = 2;
    pub const GIFT_AID_DECLARED: i64 = 3;
    pub const LANGUAGE: i64 = 4;
    pub const ORGANISATION_SCHOOL: i64 = 5;

    fn define_tables(remote: &MockRemote) {
        remote.define(
            TableDef::new("Contact", "civicrm_contact")
                .column("contact_type", "varchar")
                .column("contact_sub_type", "varchar")
                .column("external_identifier", "varchar")
                .column("first_name", "varchar")
                .column("last_name", "varchar")
                .column("display_name", "varchar")
                .column("birth_date", "date")
                .column("is_deleted", "tinyint")
                .default_value("contact_type", json!("Individual"))
                .default_value("contact_sub_type", json!(""))
                .default_value("is_deleted", json!(0))
                .reset_on_update(&["contact_sub_type"])
                .soft_delete("is_deleted"),
        );
        remote.define(
            TableDef::new("Group", "civicrm_group")
                .column("name", "varchar")
                .column("title", "varchar")
                .column("is_active", "tinyint")
                .default_value("is_active", json!(1)),
        );
        remote.define(
            TableDef::new("GroupContact", "civicrm_group_contact")
                .column("group_id", "int")
                .column("contact_id", "int")
                .column("status", "varchar")
                .column("date", "datetime")
                .upsert_keys(&["group_id", "contact_id"]),
        );
        remote.define(
            TableDef::new("Tag", "civicrm_tag")
                .column("name", "varchar")
                .column("description", "text"),
        );
        remote.define(
            TableDef::new("EntityTag", "civicrm_entity_tag")
                .column("entity_table", "varchar")
                .column("entity_id", "int")
                .column("tag_id", "int")
                .upsert_keys(&["entity_table", "entity_id", "tag_id"]),
        );
        remote.define(
            TableDef::new("Email", "civicrm_email")
                .column("contact_id", "int")
                .column("location_type_id", "int")
                .column("email", "varchar")
                .column("is_primary", "tinyint")
                .default_value("is_primary", json!(0)),
        );
        remote.define(
            TableDef::new("Note", "civicrm_note")
                .column("entity_table", "varchar")
                .column("entity_id", "int")
                .column("subject", "varchar")
                .column("note", "text"),
        );
        remote.define(
            TableDef::new("Contribution", "civicrm_contribution")
                .column("contact_id", "int")
                .column("financial_type_id", "int")
                .column("total_amount", "decimal")
                .column("receive_date", "datetime"),
        );
        remote.define(
            TableDef::new("OptionGroup", "civicrm_option_group")
                .column("name", "varchar")
                .column("title", "varchar"),
        );
        remote.define(
            TableDef::new("OptionValue", "civicrm_option_value")
                .column("option_group_id", "int")
                .column("value", "varchar")
                .column("label", "varchar")
                .column("weight", "int"),
        );
        remote.define(
            TableDef::new("CustomGroup", "civicrm_custom_group")
                .column("name", "varchar")
                .column("extends", "varchar")
                .column("extends_entity_column_value", "varchar")
                .column("is_multiple", "tinyint")
                .column("is_active", "tinyint"),
        );
        remote.define(
            TableDef::new("CustomField", "civicrm_custom_field")
                .column("custom_group_id", "int")
                .column("name", "varchar")
                .column("label", "varchar")
                .column("data_type", "varchar")
                .column("html_type", "varchar")
                .column("option_group_id", "int")
                .column("is_active", "tinyint"),
        );
    }

    fn seed(remote: &MockRemote, entity_type: &str, records: &[serde_json::Value]) {
        for record in records {
            if let Err(err) = remote.seed(entity_type, record.clone()) {
                panic!("seeding {} failed: {}", entity_type, err);
            }
        }
    }

    /// A mock remote holding the fixture tables, two groups, two tags, a
    /// `colours` option group and the custom attribute catalog.
    pub fn crm_remote() -> Arc<MockRemote> {
        let remote = Arc::new(MockRemote::new());
        define_tables(&remote);
        seed(
            &remote,
            "Group",
            &[
                json!({"name": "newsletter", "title": "Newsletter"}),
                json!({"name": "volunteers", "title": "Volunteers"}),
            ],
        );
        seed(
            &remote,
            "Tag",
            &[json!({"name": "vip"}), json!({"name": "major_donor"})],
        );
        seed(&remote, "OptionGroup", &[json!({"name": "colours", "title": "Colours"})]);
        seed(
            &remote,
            "OptionValue",
            &[
                json!({"option_group_id": 1, "value": "red", "label": "Red", "weight": 3}),
                json!({"option_group_id": 1, "value": "green", "label": "Green", "weight": 1}),
                json!({"option_group_id": 1, "value": "blue", "label": "Blue", "weight": 2}),
            ],
        );
        seed(
            &remote,
            "CustomGroup",
            &[
                json!({"id": 1, "name": "preferences", "extends": "Contact", "is_active": 1}),
                json!({"id": 2, "name": "education", "extends": "Individual",
                       "extends_entity_column_value": "\u{1}Student\u{1}", "is_active": 1}),
                json!({"id": 3, "name": "gift_aid", "extends": "Contribution",
                       "extends_entity_column_value": "\u{1}1\u{1}", "is_active": 1}),
                json!({"id": 4, "name": "languages", "extends": "Individual",
                       "is_multiple": 1, "is_active": 1}),
                json!({"id": 5, "name": "organisation", "extends": "Organization", "is_active": 1}),
            ],
        );
        seed(
            &remote,
            "CustomField",
            &[
                json!({"id": FAVOURITE_COLOUR, "custom_group_id": 1, "name": "favourite_colour",
                       "label": "Favourite colour", "data_type": "String", "html_type": "Select",
                       "option_group_id": 1, "is_active": 1}),
                json!({"id": SCHOOL, "custom_group_id": 2, "name": "school", "label": "School",
                       "data_type": "String", "html_type": "Text", "is_active": 1}),
                json!({"id": GIFT_AID_DECLARED, "custom_group_id": 3, "name": "gift_aid_declared",
                       "label": "Gift aid declared", "data_type": "Boolean", "html_type": "Radio",
                       "is_active": 1}),
                json!({"id": LANGUAGE, "custom_group_id": 4, "name": "language", "label": "Language",
                       "data_type": "String", "html_type": "Text", "is_active": 1}),
                json!({"id": ORGANISATION_SCHOOL, "custom_group_id": 5, "name": "school",
                       "label": "Affiliated school", "data_type": "String", "html_type": "Text",
                       "is_active": 1}),
            ],
        );
        remote
    }

    pub fn crm_schema() -> SchemaConfig {
        match SchemaConfig::from_toml_str(CRM_SCHEMA) {
            Ok(schema) => schema,
            Err(err) => panic!("fixture schema is invalid: {}", err),
        }
    }

    /// A cache over [`crm_remote`] with every fixture type registered. The
    /// remote's call log starts empty.
    pub fn crm_cache() -> (Arc<MockRemote>, TestCache) {
        super::init_tracing();
        let remote = crm_remote();
        let cache = match EntityCache::from_schema(remote.clone(), &crm_schema()) {
            Ok(cache) => cache,
            Err(err) => panic!("fixture registration failed: {}", err),
        };
        remote.reset_calls();
        (remote, cache)
    }

    /// Create an Individual with an external identifier.
    pub fn individual(cache: &TestCache, external_identifier: &str) -> Entity {
        let created = cache.create(
            "Contact",
            &json!({
                "contact_type": "Individual",
                "external_identifier": external_identifier,
                "first_name": "Ada",
                "last_name": "Lovelace",
            }),
            None,
        );
        match created {
            Ok(contact) => contact,
            Err(err) => panic!("creating {} failed: {}", external_identifier, err),
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cache operation sequences.

    use proptest::prelude::*;

    /// One step of a sequence run against the contact cache. Indexes pick
    /// among the contacts created so far, modulo their count.
    #[derive(Debug, Clone)]
    pub enum CacheOp {
        Create(String),
        GetById(usize),
        GetByKey(usize),
        Rekey(usize, String),
        Rename(usize, String),
        Refresh(usize),
        Delete(usize),
    }

    pub fn arb_external_identifier() -> impl Strategy<Value = String> {
        "[a-z]{1,6}-[0-9]{1,3}"
    }

    pub fn arb_first_name() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{1,8}"
    }

    pub fn arb_cache_op() -> impl Strategy<Value = CacheOp> {
        prop_oneof![
            3 => arb_external_identifier().prop_map(CacheOp::Create),
            2 => any::<usize>().prop_map(CacheOp::GetById),
            2 => any::<usize>().prop_map(CacheOp::GetByKey),
            2 => (any::<usize>(), arb_external_identifier()).prop_map(|(i, k)| CacheOp::Rekey(i, k)),
            2 => (any::<usize>(), arb_first_name()).prop_map(|(i, n)| CacheOp::Rename(i, n)),
            1 => any::<usize>().prop_map(CacheOp::Refresh),
            1 => any::<usize>().prop_map(CacheOp::Delete),
        ]
    }

    pub fn arb_cache_ops() -> impl Strategy<Value = Vec<CacheOp>> {
        prop::collection::vec(arb_cache_op(), 1..25)
    }

    /// Distinct sibling positions in arbitrary insertion order.
    pub fn arb_positions() -> impl Strategy<Value = Vec<i64>> {
        prop::collection::btree_set(0i64..1000, 1..12)
            .prop_map(|set| set.into_iter().collect::<Vec<_>>())
            .prop_shuffle()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for Rolodex-specific outcomes.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &RolodexResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    #[track_caller]
    pub fn assert_deleted<T: std::fmt::Debug>(result: &RolodexResult<T>) {
        match result {
            Err(RolodexError::Deleted { .. }) => {}
            other => panic!("Expected Deleted error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &RolodexResult<T>) {
        match result {
            Err(RolodexError::NotFound(_)) => {}
            other => panic!("Expected NotFound error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_consistency_error<T: std::fmt::Debug>(result: &RolodexResult<T>) {
        match result {
            Err(RolodexError::Consistency(_)) => {}
            other => panic!("Expected Consistency error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &RolodexResult<T>) {
        match result {
            Err(RolodexError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_remote_error<T: std::fmt::Debug>(result: &RolodexResult<T>) {
        match result {
            Err(RolodexError::Remote(_)) => {}
            other => panic!("Expected Remote error, got: {:?}", other),
        }
    }

    /// Assert both handles are the same object, not merely equal.
    #[track_caller]
    pub fn assert_same_handle(a: &Entity, b: &Entity) {
        assert!(a.same_handle(b), "Expected one handle, got {:?} and {:?}", a, b);
    }

    /// Assert the entity's field holds `expected`.
    #[track_caller]
    pub fn assert_field(entity: &Entity, field: &str, expected: impl Into<Value>) {
        let expected = expected.into();
        match entity.get(field) {
            Ok(value) => assert_eq!(value, expected, "{} of {}", field, entity),
            Err(err) => panic!("Reading {} of {:?} failed: {}", field, entity, err),
        }
    }

    /// Assert no call reached the remote since the log was last reset.
    #[track_caller]
    pub fn assert_no_remote_calls(remote: &MockRemote) {
        let calls = remote.calls();
        assert!(calls.is_empty(), "Expected no remote calls, got: {:?}", calls);
    }
}
