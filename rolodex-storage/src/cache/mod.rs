//! Entity cache
//!
//! One [`EntityCache`] holds, per registered entity type, the lookup tables
//! of cached handles and the relationship indexes between types. Reads are
//! served from those tables when the parameters allow it; every write goes
//! to the remote boundary and its result is reconciled so that at most one
//! live handle per id is reachable from the cache.

mod handle;
mod lookup;
mod membership;
mod overlay;
mod read;
mod reconcile;
mod registry;
mod relationship;
mod stats;
mod tags;
mod traverse;
mod write;

pub use handle::{CustomValue, Entity};
pub use membership::{GroupStatus, StatusFilter};
pub use overlay::{CustomAttribute, CustomGroupInfo, FieldResolution};
pub use read::{GetOptions, LookupArg};
pub use registry::EntityCache;
pub use stats::{CacheDiagnostics, CacheStats, TypeDiagnostics};
pub use tags::{ENTITY_TAG_ENTITY, TAG_ENTITY};
