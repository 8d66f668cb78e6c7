// -
// Coordination store key layout

pub const CONFIG_PREFIX: &str = "/config";
pub const STATE_PREFIX: &str = "/state";
pub const MONITORING_PREFIX: &str = "/monitoring";

pub const LOCK_PATH: &str = "/gohan/cluster/lock";
/// Updated after every commit that logged events; wakes the sync writer.
pub const SYNC_KEY_TX_COMMITTED: &str = "/gohan/cluster/sync";
pub const SYNC_WATCH_REVISION_PREFIX: &str = "/gohan/watch/revision";
pub const PROCESS_PATH_PREFIX: &str = "/gohan/cluster/process";
pub const LONG_POLL_PREFIX: &str = "/gohan/long_poll_notifications/";

pub const SYNC_LOCK_SUBSYSTEM: &str = "sync";
pub const STATE_WATCH_LOCK_SUBSYSTEM: &str = "state_watch";
pub const WATCH_LOCK_SUBSYSTEM: &str = "watch";

/// Sentinel revision: start watching from the current store revision.
pub const REVISION_CURRENT: i64 = -1;

pub const LONG_POLL_NOTIFICATION_TTL_SECS: u64 = 10;

/// Revisions of watch history an in-memory store keeps before compacting.
pub const MEM_STORE_HISTORY_REVISIONS: i64 = 10_000;

// -
// Event table

pub const EVENT_TYPE_CREATE: &str = "create";
pub const EVENT_TYPE_UPDATE: &str = "update";
pub const EVENT_TYPE_DELETE: &str = "delete";

// -
// Extension event names

pub const NOTIFICATION_EVENT: &str = "notification";
pub const STATE_UPDATE_EVENT: &str = "state_update";
pub const MONITORING_UPDATE_EVENT: &str = "monitoring_update";
pub const PRE_STATE_UPDATE_IN_TX: &str = "pre_state_update_in_transaction";
pub const POST_STATE_UPDATE_IN_TX: &str = "post_state_update_in_transaction";
pub const PRE_MONITORING_UPDATE_IN_TX: &str = "pre_monitoring_update_in_transaction";
pub const POST_MONITORING_UPDATE_IN_TX: &str = "post_monitoring_update_in_transaction";

// -
// Database engine messages classified as deadlocks

pub const MYSQL_DEADLOCK_MSG: &str =
    "Deadlock found when trying to get lock; try restarting transaction";
pub const SQLITE_DEADLOCK_MSG: &str = "database is locked";

/// Composes the advisory lock key of a subsystem, e.g. `/gohan/cluster/lock/watch/foo`.
pub fn lock_key(
    subsystem: &str,
    path: &str,
) -> String {
    format!("{}/{}{}", LOCK_PATH, subsystem, path)
}
