//! # gohan
//!
//! State-synchronization and replication plane of a schema-driven resource
//! server.
//!
//! ## Components
//! - [`server::EventLoggingDatabase`]: appends an event row to every mutating transaction
//! - [`server::SyncWriter`]: leader-elected mirror of the event table into the coordination store
//! - [`server::PathWatcher`] / [`server::SyncWatcher`]: watched prefixes fanned out to extensions
//! - [`server::StateWatcher`]: agent state and monitoring reports applied to `ResourceState`
//! - [`server::MessageDispatch`]: in-process long-poll rendezvous
//!
//! The coordination store and the database are reached through the
//! [`sync::CoordinationStore`] and [`db::Database`] traits; in-memory
//! implementations of both ship with the crate.

pub mod config;
pub mod constants;
pub mod db;
mod errors;
pub mod extension;
pub mod metrics;
pub mod schema;
pub mod server;
pub mod sync;
pub mod utils;

pub use errors::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
