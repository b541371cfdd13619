//! Group membership status of member entities.
//!
//! Memberships are link records (`GroupContact` for contacts) carrying a
//! status per member and group. Group ids are cached per member and status,
//! and only while the member itself is cached.

use super::handle::Entity;
use super::read::LookupArg;
use super::registry::EntityCache;
use crate::RemoteBoundary;
use chrono::NaiveDateTime;
use rolodex_core::{
    EntityId, MembershipSpec, RawRecord, RolodexResult, ValidationError, Value,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info};

/// Status of a member in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupStatus {
    Added,
    Removed,
    Pending,
}

impl GroupStatus {
    pub const ALL: [GroupStatus; 3] = [GroupStatus::Added, GroupStatus::Removed, GroupStatus::Pending];

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Added => "Added",
            GroupStatus::Removed => "Removed",
            GroupStatus::Pending => "Pending",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which statuses a membership query covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Status(GroupStatus),
    Any,
}

impl StatusFilter {
    fn statuses(self) -> Vec<GroupStatus> {
        match self {
            StatusFilter::Status(status) => vec![status],
            StatusFilter::Any => GroupStatus::ALL.to_vec(),
        }
    }
}

impl From<GroupStatus> for StatusFilter {
    fn from(status: GroupStatus) -> Self {
        StatusFilter::Status(status)
    }
}

/// Group ids of one member, per status loaded so far.
#[derive(Debug, Default)]
pub(crate) struct MembershipCache {
    groups: BTreeMap<GroupStatus, BTreeSet<EntityId>>,
}

impl MembershipCache {
    fn get(&self, status: GroupStatus) -> Option<&BTreeSet<EntityId>> {
        self.groups.get(&status)
    }

    fn load(&mut self, status: GroupStatus, group_ids: &[EntityId]) {
        self.groups.insert(status, group_ids.iter().copied().collect());
    }

    /// Move a group to `status` within the statuses already loaded.
    fn record(&mut self, group_id: EntityId, status: GroupStatus) {
        for (loaded, group_ids) in self.groups.iter_mut() {
            if *loaded == status {
                group_ids.insert(group_id);
            } else {
                group_ids.remove(&group_id);
            }
        }
    }
}

impl<R: RemoteBoundary> EntityCache<R> {
    fn membership_spec(&self, entity_type: &str) -> RolodexResult<MembershipSpec> {
        let descriptor = self.descriptor(entity_type)?;
        descriptor.membership().cloned().ok_or_else(|| {
            ValidationError::Unsupported {
                entity_type: entity_type.to_string(),
                operation: "group membership".to_string(),
            }
            .into()
        })
    }

    /// Set a member's status in a group. `at` is forwarded to the remote as
    /// the date of the change.
    pub fn update_group_status(
        &self,
        member: &Entity,
        group: impl Into<LookupArg>,
        status: GroupStatus,
        at: Option<NaiveDateTime>,
    ) -> RolodexResult<()> {
        if member.is_deleted() {
            return Err(member.deleted_error());
        }
        self.update_id_group_status(member.entity_type(), member.id(), group, status, at)
    }

    pub fn update_id_group_status(
        &self,
        entity_type: &str,
        member_id: EntityId,
        group: impl Into<LookupArg>,
        status: GroupStatus,
        at: Option<NaiveDateTime>,
    ) -> RolodexResult<()> {
        let spec = self.membership_spec(entity_type)?;
        let group_id = self.resolve_id(&spec.group_type, group)?;

        let mut params = RawRecord::new();
        params.insert(spec.member_field.clone(), JsonValue::from(member_id));
        params.insert(spec.group_field.clone(), JsonValue::from(group_id));
        params.insert(spec.status_field.clone(), JsonValue::from(status.as_str()));
        if let Some(at) = at {
            params.insert(spec.date_field.clone(), Value::DateTime(at).serialise());
        }
        self.remote_write(&spec.via, "create", &params)?;

        let mut state = self.lock()?;
        if let Some(memberships) = state.type_cache_mut(entity_type)?.memberships.get_mut(&member_id) {
            memberships.record(group_id, status);
        }
        info!(entity_type, member_id, group_id, status = %status, "Group status updated");
        Ok(())
    }

    /// Ids of the groups in which a member has a status, in id order.
    pub fn group_ids(
        &self,
        member: &Entity,
        filter: impl Into<StatusFilter>,
        read_from_cache: bool,
    ) -> RolodexResult<Vec<EntityId>> {
        if member.is_deleted() {
            return Err(member.deleted_error());
        }
        self.id_group_ids(member.entity_type(), member.id(), filter, read_from_cache)
    }

    pub fn id_group_ids(
        &self,
        entity_type: &str,
        member_id: EntityId,
        filter: impl Into<StatusFilter>,
        read_from_cache: bool,
    ) -> RolodexResult<Vec<EntityId>> {
        let spec = self.membership_spec(entity_type)?;
        let mut found = BTreeSet::new();
        for status in filter.into().statuses() {
            if read_from_cache {
                let state = self.lock()?;
                let cached = state
                    .type_cache(entity_type)?
                    .memberships
                    .get(&member_id)
                    .and_then(|m| m.get(status));
                if let Some(group_ids) = cached {
                    found.extend(group_ids.iter().copied());
                    continue;
                }
            }

            let mut params = RawRecord::new();
            params.insert(spec.member_field.clone(), JsonValue::from(member_id));
            params.insert(spec.status_field.clone(), JsonValue::from(status.as_str()));
            let group_ids: Vec<EntityId> = self
                .remote_read(&spec.via, &params)?
                .iter()
                .filter_map(|record| record.get(&spec.group_field))
                .filter_map(|id| match id {
                    JsonValue::Number(n) => n.as_i64(),
                    JsonValue::String(s) => s.parse().ok(),
                    _ => None,
                })
                .collect();
            found.extend(group_ids.iter().copied());

            let mut state = self.lock()?;
            if state.cached(entity_type, member_id)?.is_some() {
                state
                    .type_cache_mut(entity_type)?
                    .memberships
                    .entry(member_id)
                    .or_default()
                    .load(status, &group_ids);
                debug!(entity_type, member_id, status = %status, count = group_ids.len(), "Memberships cached");
            }
        }
        Ok(found.into_iter().collect())
    }

    pub fn in_group(
        &self,
        member: &Entity,
        group: impl Into<LookupArg>,
        filter: impl Into<StatusFilter>,
    ) -> RolodexResult<bool> {
        let spec = self.membership_spec(member.entity_type())?;
        let group_id = self.resolve_id(&spec.group_type, group)?;
        Ok(self.group_ids(member, filter, true)?.contains(&group_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_moves_group_between_loaded_statuses() {
        let mut cache = MembershipCache::default();
        cache.load(GroupStatus::Added, &[1, 2]);
        cache.load(GroupStatus::Removed, &[]);

        cache.record(2, GroupStatus::Removed);
        assert_eq!(cache.get(GroupStatus::Added).unwrap().iter().copied().collect::<Vec<_>>(), vec![1]);
        assert!(cache.get(GroupStatus::Removed).unwrap().contains(&2));
        // Pending was never loaded, so it stays unknown.
        cache.record(3, GroupStatus::Pending);
        assert!(cache.get(GroupStatus::Pending).is_none());
        assert!(!cache.get(GroupStatus::Added).unwrap().contains(&3));
    }

    #[test]
    fn test_any_covers_every_status() {
        assert_eq!(StatusFilter::Any.statuses(), GroupStatus::ALL.to_vec());
        assert_eq!(
            StatusFilter::from(GroupStatus::Pending).statuses(),
            vec![GroupStatus::Pending]
        );
        assert_eq!(GroupStatus::Removed.to_string(), "Removed");
    }
}
