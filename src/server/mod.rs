//! Replication plane of a resource server member.
//!
//! Mutations are recorded in the event table inside the transaction that
//! performs them, mirrored into the coordination store by a leader-elected
//! sync writer, and agent reports flowing back are applied by the state
//! watcher. Path watchers fan watched prefixes out to extensions.

mod commit_informer;
mod event_logger;
mod long_polling;
mod message_dispatch;
mod path_watcher;
mod resync;
mod server;
mod state_watcher;
mod sync_watcher;
mod sync_writer;

pub use commit_informer::*;
pub use event_logger::*;
pub use long_polling::*;
pub use message_dispatch::*;
pub use path_watcher::*;
pub use resync::*;
pub use server::*;
pub use state_watcher::*;
pub use sync_watcher::*;
pub use sync_writer::*;

#[cfg(test)]
mod message_dispatch_test;
#[cfg(test)]
mod resync_test;
