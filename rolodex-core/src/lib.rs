//! Rolodex Core - Value and Schema Types
//!
//! Typed field values, immutable snapshots and entity type descriptors.
//! Nothing here talks to the remote record store or holds cache state; the
//! storage crate builds the cache on top of these types.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod identity;
pub mod snapshot;
pub mod value;

pub use config::*;
pub use descriptor::*;
pub use error::*;
pub use identity::*;
pub use snapshot::*;
pub use value::*;
