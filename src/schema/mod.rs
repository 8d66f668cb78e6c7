//! Resource type registry.
//!
//! Schema parsing and JSON-schema validation live outside of this crate;
//! the registry only carries what the replication plane needs: URLs,
//! sync metadata, isolation levels and extension time limits.

mod manager;
mod resource;
mod schema;

pub use manager::*;
pub use resource::*;
pub use schema::*;
