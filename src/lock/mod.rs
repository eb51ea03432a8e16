//! Lease-based advisory lock used to elect a single sweeper among instances.
//!
//! A lease is held by `instance` while `now - last_lock_time < ttl`. Holders
//! renew before the lease runs out; a crashed holder simply stops renewing
//! and the next [`LeaseLock::acquire`] after expiry succeeds.
//!
//! There is no fencing token. A holder that stalls past its lease can race
//! the next holder, so anything done under the lock must be safe to repeat.

use chrono::Duration;
use futures_util::future::BoxFuture;

use crate::{error::Error, message::MessageKind};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryLeaseLock;
pub use sqlite::SqliteLeaseLock;

/// Lock name guarding the retry sweep of one message kind.
pub fn retry_lock_key(kind: MessageKind, version: &str) -> String {
    match kind {
        MessageKind::Published => format!("publish_retry_{version}"),
        MessageKind::Received => format!("received_retry_{version}"),
    }
}

/// Lock name guarding the delayed-message sweep.
pub fn schedule_lock_key(version: &str) -> String {
    format!("publish_schedule_{version}")
}

/// Lock name guarding the expired-message collector.
pub fn collect_lock_key(version: &str) -> String {
    format!("collect_expired_{version}")
}

pub trait LeaseLock: Send + Sync + 'static {
    /// Takes the lease if nobody holds a live one. Re-acquiring a lease the
    /// caller already holds succeeds and refreshes it.
    ///
    /// Returns `false` when another instance holds the lease; that is
    /// contention, not an error.
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
        instance: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>>;

    /// Extends the lease if `instance` still holds it.
    ///
    /// `false` means the lease may have been lost and the caller should stop
    /// work and try to acquire it again later.
    fn renew<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
        instance: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>>;

    /// Clears the lease only if `instance` is the current holder.
    fn release<'a>(&'a self, key: &'a str, instance: &'a str) -> BoxFuture<'a, Result<bool, Error>>;
}
