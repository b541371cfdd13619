//! Parent and child traversal through relationship indexes.

use rolodex_test_utils::assertions::*;
use rolodex_test_utils::fixtures::{crm_cache, individual};
use rolodex_test_utils::*;
use serde_json::json;

fn labels(children: &[Entity]) -> Vec<String> {
    children
        .iter()
        .map(|c| c.get("label").unwrap().as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn test_autoloaded_children_in_position_order() {
    let (remote, cache) = crm_cache();
    let colours = cache.resolve("OptionGroup", "colours").unwrap();
    remote.reset_calls();

    let children = cache.children(&colours, "option_values").unwrap();
    assert_eq!(labels(&children), vec!["Green", "Blue", "Red"]);
    assert_no_remote_calls(&remote);

    let diagnostics = cache.diagnostics().unwrap();
    assert_eq!(diagnostics.types["OptionGroup"].parents_with_children["option_values"], 1);
    assert_eq!(diagnostics.types["OptionValue"].cached, 3);
}

#[test]
fn test_child_by_string_key() {
    let (remote, cache) = crm_cache();
    let colours = cache.resolve("OptionGroup", "colours").unwrap();
    remote.reset_calls();

    let blue = cache
        .child(&colours, "option_values", None, "BLUE", true)
        .unwrap()
        .unwrap();
    assert_field(&blue, "label", "Blue");
    let by_key = cache
        .child(&colours, "option_values", Some("id"), blue.id(), true)
        .unwrap()
        .unwrap();
    assert_same_handle(&blue, &by_key);

    assert!(cache
        .child(&colours, "option_values", None, "purple", false)
        .unwrap()
        .is_none());
    assert_not_found(&cache.child(&colours, "option_values", None, "purple", true));
    assert_validation_error(&cache.child(&colours, "option_values", None, "", false));
    assert_no_remote_calls(&remote);
}

#[test]
fn test_get_by_parent_id_answers_from_index() {
    let (remote, cache) = crm_cache();
    let colours = cache.resolve("OptionGroup", "colours").unwrap();
    remote.reset_calls();

    let values = cache
        .get("OptionValue", &json!({"option_group_id": colours.id()}), GetOptions::default())
        .unwrap();
    assert_eq!(labels(&values), vec!["Green", "Blue", "Red"]);
    let red = cache
        .get_single("OptionValue", json!({"option_group_id": colours.id(), "value": "red"}), true)
        .unwrap()
        .unwrap();
    assert_field(&red, "weight", 3i64);
    assert_no_remote_calls(&remote);
}

#[test]
fn test_duplicate_child_key_is_consistency_error() {
    let (_remote, cache) = crm_cache();
    let colours = cache.resolve("OptionGroup", "colours").unwrap();

    let result = cache.create_child(
        &colours,
        "option_values",
        &json!({"value": "Red", "label": "Another red", "weight": 4}),
        None,
    );
    assert_consistency_error(&result);

    // The refused child is not cached outside its parent's index either.
    let children = cache.children(&colours, "option_values").unwrap();
    assert_eq!(labels(&children), vec!["Green", "Blue", "Red"]);
    let diagnostics = cache.diagnostics().unwrap();
    assert_eq!(diagnostics.types["OptionValue"].cached, children.len());
    let cached = cache.cached_entities("OptionValue").unwrap();
    assert!(cached.iter().all(|c| children.iter().any(|k| k.same_handle(c))));
}

#[test]
fn test_rekey_onto_taken_child_key_evicts_the_child() {
    let (_remote, cache) = crm_cache();
    let colours = cache.resolve("OptionGroup", "colours").unwrap();
    let blue = cache
        .child(&colours, "option_values", None, "blue", true)
        .unwrap()
        .unwrap();

    let result = cache.update_child(&colours, "option_values", None, "blue", &json!({"value": "red"}), false);
    assert_consistency_error(&result);

    assert!(!cache.is_cached(&blue).unwrap());
    let children = cache.children(&colours, "option_values").unwrap();
    assert_eq!(labels(&children), vec!["Green", "Red"]);
    assert_eq!(cache.diagnostics().unwrap().types["OptionValue"].cached, children.len());
}

#[test]
fn test_failed_child_load_leaves_parent_unloaded() {
    let (remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    for address in ["home@example.org", "other@example.org"] {
        remote
            .seed("Email", json!({"contact_id": contact.id(), "location_type_id": 1, "email": address}))
            .unwrap();
    }

    assert_consistency_error(&cache.children(&contact, "emails"));
    let diagnostics = cache.diagnostics().unwrap();
    assert_eq!(diagnostics.types["Contact"].parents_with_children["emails"], 0);
    // Nothing partial is served on the next attempt either.
    assert_consistency_error(&cache.children(&contact, "emails"));
}

#[test]
fn test_created_child_joins_loaded_parent_in_order() {
    let (_remote, cache) = crm_cache();
    let colours = cache.resolve("OptionGroup", "colours").unwrap();

    let teal = cache
        .create_child(
            &colours,
            "option_values",
            &json!({"value": "teal", "label": "Teal", "weight": 2}),
            Some(false),
        )
        .unwrap();
    // A child of a loaded parent is always cached.
    assert!(cache.is_cached(&teal).unwrap());

    let children = cache.children(&colours, "option_values").unwrap();
    assert_eq!(labels(&children), vec!["Green", "Blue", "Teal", "Red"]);
    let parent = cache.parent(&teal, "option_group", true).unwrap().unwrap();
    assert_same_handle(&parent, &colours);
}

#[test]
fn test_children_of_uncached_parent_caches_it() {
    let (remote, cache) = crm_cache();
    let contact = cache
        .create("Contact", &json!({"external_identifier": "ada-1"}), Some(false))
        .unwrap();
    remote
        .seed("Email", json!({"contact_id": contact.id(), "location_type_id": 1, "email": "ada@example.org"}))
        .unwrap();

    let emails = cache.children(&contact, "emails").unwrap();
    assert_eq!(emails.len(), 1);
    assert!(cache.is_cached(&contact).unwrap());
    let home = cache.child(&contact, "emails", None, 1i64, true).unwrap().unwrap();
    assert_same_handle(&home, &emails[0]);
}

#[test]
fn test_polymorphic_children_filter_on_parent_table() {
    let (remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    remote
        .seed(
            "Note",
            json!({"entity_table": "civicrm_group", "entity_id": contact.id(), "subject": "Elsewhere"}),
        )
        .unwrap();

    let note = cache
        .create_child(&contact, "notes", &json!({"subject": "Called", "note": "Left a message"}), None)
        .unwrap();
    assert_field(&note, "entity_table", "civicrm_contact");

    let notes = cache.children(&contact, "notes").unwrap();
    assert_eq!(notes.len(), 1);
    assert_same_handle(&notes[0], &note);
    let found = cache.child(&contact, "notes", None, "called", true).unwrap().unwrap();
    assert_same_handle(&found, &note);
    let parent = cache.parent(&note, "contact", true).unwrap().unwrap();
    assert_same_handle(&parent, &contact);
}

#[test]
fn test_uncache_refused_while_parent_holds_child() {
    let (_remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    let email = cache
        .create_child(&contact, "emails", &json!({"email": "ada@example.org", "location_type_id": 1}), None)
        .unwrap();
    cache.children(&contact, "emails").unwrap();

    assert_consistency_error(&cache.uncache(&email));
    assert!(cache.is_cached(&email).unwrap());

    cache.uncache_children(&contact, "emails").unwrap();
    cache.uncache(&email).unwrap();
    assert!(!cache.is_cached(&email).unwrap());
}

#[test]
fn test_child_moves_between_loaded_parents() {
    let (remote, cache) = crm_cache();
    let ada = individual(&cache, "ada-1");
    let grace = individual(&cache, "grace-1");
    let email = cache
        .create_child(&ada, "emails", &json!({"email": "shared@example.org", "location_type_id": 1}), None)
        .unwrap();
    cache.children(&ada, "emails").unwrap();
    assert!(cache.children(&grace, "emails").unwrap().is_empty());
    remote.reset_calls();

    cache
        .update(&email, &json!({"contact_id": grace.id()}), false)
        .unwrap();
    assert!(cache.children(&ada, "emails").unwrap().is_empty());
    let moved = cache.children(&grace, "emails").unwrap();
    assert_eq!(moved.len(), 1);
    assert_same_handle(&moved[0], &email);
    assert_eq!(remote.calls_for("get").len(), 0);
    let parent = cache.parent(&email, "contact", true).unwrap().unwrap();
    assert_same_handle(&parent, &grace);
}

#[test]
fn test_delete_propagates_through_indexes() {
    let (remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    let home = cache
        .create_child(&contact, "emails", &json!({"email": "home@example.org", "location_type_id": 1}), None)
        .unwrap();
    let work = cache
        .create_child(&contact, "emails", &json!({"email": "work@example.org", "location_type_id": 2}), None)
        .unwrap();
    assert_eq!(cache.children(&contact, "emails").unwrap().len(), 2);

    cache.delete_child(&contact, "emails", None, 1i64, true).unwrap();
    assert_deleted(&home.get("email"));
    let remaining = cache.children(&contact, "emails").unwrap();
    assert_eq!(remaining.len(), 1);
    assert_same_handle(&remaining[0], &work);
    assert!(remote.row("Email", home.id()).is_none());

    cache.delete(&contact, true).unwrap();
    assert!(!cache.is_cached(&work).unwrap());
    assert_eq!(cache.diagnostics().unwrap().types["Email"].cached, 0);
    assert_eq!(cache.diagnostics().unwrap().types["Contact"].parents_with_children["emails"], 0);
    assert_deleted(&cache.children(&contact, "emails"));
}

#[test]
fn test_update_child_by_key() {
    let (remote, cache) = crm_cache();
    let colours = cache.resolve("OptionGroup", "colours").unwrap();

    assert!(cache
        .update_child(&colours, "option_values", None, "red", &json!({"weight": 0}), false)
        .unwrap());
    let children = cache.children(&colours, "option_values").unwrap();
    assert_eq!(labels(&children), vec!["Red", "Green", "Blue"]);
    let red = cache.child(&colours, "option_values", None, "red", true).unwrap().unwrap();
    assert_field(&red, "weight", 0i64);
    assert_eq!(remote.calls_for("update").len(), 1);
}

#[test]
fn test_unknown_relationship_is_config_error() {
    let (_remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    match cache.children(&contact, "addresses") {
        Err(RolodexError::Config(_)) => {}
        other => panic!("Expected Config error, got: {:?}", other),
    }
}
