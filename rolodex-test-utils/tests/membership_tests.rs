//! Group membership status and tags.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use rolodex_test_utils::assertions::*;
use rolodex_test_utils::fixtures::{crm_cache, individual};
use rolodex_test_utils::*;
use serde_json::json;

fn t1() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .unwrap()
}

#[test]
fn test_status_change_moves_member_between_statuses() {
    let (remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    let volunteers = cache.resolve("Group", "volunteers").unwrap();

    cache
        .update_group_status(&contact, "volunteers", GroupStatus::Added, Some(t1()))
        .unwrap();
    assert!(cache.in_group(&contact, "volunteers", GroupStatus::Added).unwrap());
    assert!(!cache.in_group(&contact, "volunteers", GroupStatus::Removed).unwrap());

    let t2 = t1() + Duration::days(30);
    cache
        .update_group_status(&contact, volunteers.id(), GroupStatus::Removed, Some(t2))
        .unwrap();
    assert!(!cache.in_group(&contact, "volunteers", GroupStatus::Added).unwrap());
    assert!(cache.in_group(&contact, "volunteers", GroupStatus::Removed).unwrap());
    assert_eq!(
        cache.group_ids(&contact, StatusFilter::Any, true).unwrap(),
        vec![volunteers.id()]
    );

    assert_eq!(remote.row_count("GroupContact"), 1);
    let link = remote.row("GroupContact", 1).unwrap();
    assert_eq!(link["status"], json!("Removed"));
    assert_eq!(link["date"], json!("20240331090000"));
}

#[test]
fn test_cached_statuses_answer_without_remote() {
    let (remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    cache
        .update_group_status(&contact, "newsletter", GroupStatus::Added, None)
        .unwrap();
    cache
        .update_group_status(&contact, "volunteers", GroupStatus::Pending, None)
        .unwrap();

    assert_eq!(cache.group_ids(&contact, StatusFilter::Any, true).unwrap(), vec![1, 2]);
    remote.reset_calls();
    assert_eq!(cache.group_ids(&contact, GroupStatus::Pending, true).unwrap(), vec![2]);
    assert_no_remote_calls(&remote);

    assert_eq!(cache.group_ids(&contact, GroupStatus::Added, false).unwrap(), vec![1]);
    assert_eq!(remote.calls_for("get").len(), 1);
    assert_eq!(cache.diagnostics().unwrap().types["Contact"].memberships, 1);
}

#[test]
fn test_uncached_member_memberships_not_kept() {
    let (remote, cache) = crm_cache();
    let contact = cache
        .create("Contact", &json!({"external_identifier": "ada-1"}), Some(false))
        .unwrap();
    cache
        .update_group_status(&contact, "newsletter", GroupStatus::Added, None)
        .unwrap();
    remote.reset_calls();

    assert_eq!(cache.group_ids(&contact, GroupStatus::Added, true).unwrap(), vec![1]);
    assert_eq!(cache.group_ids(&contact, GroupStatus::Added, true).unwrap(), vec![1]);
    assert_eq!(remote.calls_for("get").len(), 2);
    assert_eq!(cache.diagnostics().unwrap().types["Contact"].memberships, 0);
}

#[test]
fn test_uncaching_member_drops_memberships() {
    let (_remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    cache
        .update_group_status(&contact, "newsletter", GroupStatus::Added, None)
        .unwrap();
    cache.group_ids(&contact, StatusFilter::Any, true).unwrap();
    assert_eq!(cache.diagnostics().unwrap().types["Contact"].memberships, 1);

    cache.uncache(&contact).unwrap();
    assert_eq!(cache.diagnostics().unwrap().types["Contact"].memberships, 0);
}

#[test]
fn test_membership_unsupported_for_groups() {
    let (_remote, cache) = crm_cache();
    let group = cache.resolve("Group", "newsletter").unwrap();
    match cache.group_ids(&group, StatusFilter::Any, true) {
        Err(RolodexError::Validation(ValidationError::Unsupported { operation, .. })) => {
            assert_eq!(operation, "group membership")
        }
        other => panic!("Expected Unsupported, got: {:?}", other),
    }
}

#[test]
fn test_unknown_group_is_not_found() {
    let (_remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    assert_not_found(&cache.update_group_status(&contact, "board", GroupStatus::Added, None));
}

#[test]
fn test_tags_added_and_removed() {
    let (remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");

    assert!(!cache.has_tag(&contact, "vip").unwrap());
    cache.tag(&contact, "vip").unwrap();
    cache.tag(&contact, "major_donor").unwrap();
    remote.reset_calls();
    assert_eq!(cache.tag_ids(&contact).unwrap(), vec![1, 2]);
    assert!(cache.has_tag(&contact, "VIP").unwrap());
    assert_eq!(remote.calls_for("get").len(), 0);

    cache.untag(&contact, "vip").unwrap();
    assert_eq!(cache.tag_ids(&contact).unwrap(), vec![2]);
    assert_eq!(remote.row_count("EntityTag"), 1);

    // Removing a tag the contact lacks changes nothing.
    cache.untag(&contact, "vip").unwrap();
    assert_eq!(remote.row_count("EntityTag"), 1);
    assert_eq!(cache.diagnostics().unwrap().types["Contact"].tagged, 1);
}

#[test]
fn test_tags_read_fresh_for_uncached_entity() {
    let (remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    cache.tag(&contact, "vip").unwrap();

    let other = cache
        .create("Contact", &json!({"external_identifier": "bob-1"}), Some(false))
        .unwrap();
    cache.tag_id("Contact", other.id(), LookupArg::Id(2)).unwrap();
    remote.reset_calls();
    assert_eq!(cache.id_tag_ids("Contact", other.id()).unwrap(), vec![2]);
    assert_eq!(cache.tag_ids(&other).unwrap(), vec![2]);
    assert_eq!(remote.calls_for("get").len(), 2);
    assert_eq!(cache.tag_ids(&contact).unwrap(), vec![1]);
}

#[test]
fn test_groups_are_not_taggable() {
    let (_remote, cache) = crm_cache();
    let group = cache.resolve("Group", "newsletter").unwrap();
    assert_validation_error(&cache.tag(&group, "vip"));
    assert_validation_error(&cache.tag_ids(&group));
}

#[test]
fn test_deleted_member_rejected() {
    let (_remote, cache) = crm_cache();
    let contact = individual(&cache, "ada-1");
    cache.delete(&contact, true).unwrap();
    assert_deleted(&cache.update_group_status(&contact, "newsletter", GroupStatus::Added, None));
    assert_deleted(&cache.tag(&contact, "vip"));
}
