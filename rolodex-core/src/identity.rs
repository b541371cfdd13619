//! Identity and ordering types shared by every cached entity.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Remote-assigned integer entity identifier.
pub type EntityId = i64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

static SNAPSHOT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Monotonic stamp recording when a snapshot of an entity was observed.
///
/// Two snapshots of the same entity are ordered by `sequence` alone; the
/// wall-clock `observed_at` is carried for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotStamp {
    /// Process-wide monotonically increasing sequence number.
    pub sequence: u64,
    /// When this snapshot was observed.
    pub observed_at: Timestamp,
}

impl SnapshotStamp {
    /// Take the next stamp from the process-wide sequence.
    pub fn next() -> Self {
        Self {
            sequence: SNAPSHOT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            observed_at: Utc::now(),
        }
    }

    /// A stamp older than every stamp produced by [`SnapshotStamp::next`].
    pub fn zero() -> Self {
        Self {
            sequence: 0,
            observed_at: DateTime::UNIX_EPOCH,
        }
    }

    /// Check if this stamp is newer than another.
    pub fn is_newer_than(&self, other: &SnapshotStamp) -> bool {
        self.sequence > other.sequence
    }
}

impl Default for SnapshotStamp {
    fn default() -> Self {
        Self::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamps_are_monotonic() {
        let a = SnapshotStamp::next();
        let b = SnapshotStamp::next();
        assert!(b.is_newer_than(&a));
        assert!(!a.is_newer_than(&b));
        assert!(a < b);
    }

    #[test]
    fn test_zero_is_oldest() {
        let zero = SnapshotStamp::zero();
        assert!(SnapshotStamp::next().is_newer_than(&zero));
        assert_eq!(SnapshotStamp::default(), zero);
    }
}
