//! Custom attribute resolution and storage.

use rolodex_test_utils::assertions::*;
use rolodex_test_utils::fixtures::*;
use rolodex_test_utils::*;
use serde_json::json;

#[test]
fn test_intrinsic_fields_skip_the_catalog() {
    let (remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    remote.reset_calls();

    assert_eq!(
        cache.resolve_field(&contact, "first_name").unwrap(),
        FieldResolution::Intrinsic(Value::from("Ada"))
    );
    assert_eq!(cache.field(&contact, "id").unwrap(), Value::Int(contact.id()));
    assert_no_remote_calls(&remote);
    assert_eq!(cache.diagnostics().unwrap().custom_attributes, None);
}

#[test]
fn test_catalog_lists_active_attributes() {
    let (remote, cache) = crm_cache();
    let attributes = cache.custom_attributes().unwrap();
    let ids: Vec<i64> = attributes.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![FAVOURITE_COLOUR, SCHOOL, GIFT_AID_DECLARED, LANGUAGE, ORGANISATION_SCHOOL]);
    assert!(attributes[3].is_multiple);
    assert_eq!(attributes[0].option_group_id, Some(1));
    assert_eq!(cache.diagnostics().unwrap().custom_attributes, Some(5));

    // Loaded once.
    cache.custom_attributes().unwrap();
    assert_eq!(remote.calls_for("get").len(), 2);
}

#[test]
fn test_set_custom_is_visible_to_a_fresh_cache() {
    let (remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");

    cache.set_custom(&contact, "favourite_colour", "blue").unwrap();
    match cache.resolve_field(&contact, "Favourite_Colour").unwrap() {
        FieldResolution::Custom(attribute) => assert_eq!(attribute.id, FAVOURITE_COLOUR),
        other => panic!("Expected custom attribute, got: {:?}", other),
    }
    remote.reset_calls();
    assert_eq!(cache.field(&contact, "favourite_colour").unwrap(), Value::from("blue"));
    assert_no_remote_calls(&remote);

    let other = EntityCache::from_schema(remote.clone(), &crm_schema()).unwrap();
    let seen = other.get_single("Contact", "ada-1", true).unwrap().unwrap();
    assert_eq!(other.field(&seen, "favourite_colour").unwrap(), Value::from("blue"));
    assert_eq!(
        other.custom_value(&seen, FAVOURITE_COLOUR).unwrap(),
        CustomValue::Single(Value::from("blue"))
    );
}

#[test]
fn test_custom_params_on_create() {
    let (remote, cache) = crm_cache();
    let contact = cache
        .create(
            "Contact",
            &json!({"contact_type": "Individual", "external_identifier": "ada-1", "favourite_colour": "green"}),
            None,
        )
        .unwrap();
    let create = remote.calls_for("create").pop().unwrap();
    assert!(create.params.contains_key("custom_1"));
    assert!(!create.params.contains_key("favourite_colour"));
    assert_eq!(cache.field(&contact, "favourite_colour").unwrap(), Value::from("green"));
}

#[test]
fn test_subtype_narrows_applicable_attributes() {
    let (_remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");

    assert_eq!(cache.resolve_field(&contact, "school").unwrap(), FieldResolution::NotFound);
    assert_validation_error(&cache.field(&contact, "school"));
    assert_validation_error(&cache.set_custom(&contact, "school", "Hogwarts"));

    cache
        .update(
            &contact,
            &json!({"contact_sub_type": ["Student"], "school": "Hogwarts"}),
            false,
        )
        .unwrap();
    match cache.resolve_field(&contact, "school").unwrap() {
        FieldResolution::Custom(attribute) => assert_eq!(attribute.id, SCHOOL),
        other => panic!("Expected custom attribute, got: {:?}", other),
    }
    assert_eq!(cache.field(&contact, "school").unwrap(), Value::from("Hogwarts"));
}

#[test]
fn test_organisation_sees_its_own_school() {
    let (_remote, cache) = crm_cache();
    let org = cache
        .create(
            "Contact",
            &json!({"contact_type": "Organization", "external_identifier": "org-1"}),
            None,
        )
        .unwrap();
    cache.set_custom(&org, "school", "Tech College").unwrap();
    assert_eq!(
        cache.custom_value(&org, ORGANISATION_SCHOOL).unwrap(),
        CustomValue::Single(Value::from("Tech College"))
    );
    // Individual-only attributes do not apply.
    assert_eq!(cache.resolve_field(&org, "language").unwrap(), FieldResolution::NotFound);
}

#[test]
fn test_ambiguous_name_without_entity_fields() {
    let (_remote, cache) = crm_cache();
    match cache.set_custom_by_id("Contact", 999, "school", "Hogwarts") {
        Err(RolodexError::Validation(ValidationError::CustomFieldMatch { count, .. })) => {
            assert_eq!(count, 2)
        }
        other => panic!("Expected CustomFieldMatch, got: {:?}", other),
    }
}

#[test]
fn test_set_custom_by_id_through_cached_handle() {
    let (remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    cache
        .set_custom_by_id("Contact", contact.id(), "favourite_colour", "red")
        .unwrap();
    remote.reset_calls();
    assert_eq!(cache.field(&contact, "favourite_colour").unwrap(), Value::from("red"));
    assert_no_remote_calls(&remote);

    cache
        .set_custom_by_id("Contact", 999, "favourite_colour", "green")
        .unwrap();
    assert_eq!(remote.calls_for("create").len(), 1);
}

#[test]
fn test_multi_record_attribute() {
    let (_remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");

    match cache.set_custom(&contact, "language", "French") {
        Err(RolodexError::Validation(ValidationError::CustomFieldUsage { .. })) => {}
        other => panic!("Expected CustomFieldUsage, got: {:?}", other),
    }
    assert_validation_error(&cache.add_custom(&contact, "favourite_colour", "red"));

    cache.add_custom(&contact, "language", "French").unwrap();
    cache.add_custom(&contact, "language", "German").unwrap();
    let records = match cache.custom_value(&contact, LANGUAGE).unwrap() {
        CustomValue::Multi(records) => records,
        other => panic!("Expected multi-record value, got: {:?}", other),
    };
    assert_eq!(
        records.values().cloned().collect::<Vec<_>>(),
        vec![Value::from("French"), Value::from("German")]
    );

    let german = *records.keys().last().unwrap();
    cache.update_custom(&contact, "language", german, "Spanish").unwrap();
    assert_eq!(
        cache.field(&contact, "language").unwrap(),
        Value::Array(vec![Value::from("French"), Value::from("Spanish")])
    );
}

#[test]
fn test_subtype_column_rule() {
    let (_remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    let eligible = cache
        .create_child(
            &contact,
            "contributions",
            &json!({"financial_type_id": 1, "total_amount": 25.0}),
            None,
        )
        .unwrap();
    let other = cache
        .create_child(
            &contact,
            "contributions",
            &json!({"financial_type_id": 2, "total_amount": 10.0}),
            None,
        )
        .unwrap();

    cache.set_custom(&eligible, "gift_aid_declared", "1").unwrap();
    assert_eq!(cache.field(&eligible, "gift_aid_declared").unwrap(), Value::Bool(true));
    assert_eq!(cache.resolve_field(&other, "gift_aid_declared").unwrap(), FieldResolution::NotFound);
}

#[test]
fn test_custom_values_reset_with_the_cache() {
    let (remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    cache.set_custom(&contact, "favourite_colour", "blue").unwrap();

    cache.reset().unwrap();
    assert_eq!(cache.diagnostics().unwrap().custom_attributes, None);
    let again = cache.get_single("Contact", "ada-1", true).unwrap().unwrap();
    remote.reset_calls();
    assert_eq!(cache.field(&again, "favourite_colour").unwrap(), Value::from("blue"));
    // Catalog reload plus one value read.
    assert_eq!(remote.calls_for("get").len(), 3);
}
