//! Durable storage for outgoing and incoming messages.
//!
//! [`MessageStore`] is the capability interface every backend implements:
//!
//! - [`sqlite::SqliteStore`] runs each operation as a single conditional SQL
//!   statement and can join a caller's open transaction.
//! - [`memory::MemoryStore`] behaves like a document store: updates are
//!   fetch-modify-write, and only inserts can be staged in a transaction.
//!
//! # Ambient transactions
//!
//! Outgoing messages must be written in the same transaction as the business
//! change they describe. Callers pass that transaction explicitly as a
//! [`Transaction`]; a backend handed a transaction it cannot honor fails with
//! [`Error::TransactionUnsupported`] instead of silently writing outside it.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::BoxFuture;
use sqlx::SqliteConnection;

use crate::{
    clock::{from_millis, to_millis, Clock, SystemClock},
    error::Error,
    message::{
        Message, MessageKind, MessageRecord, HEADER_GROUP, HEADER_MESSAGE_ID, HEADER_MESSAGE_NAME,
    },
    monitoring::MonitoringApi,
    serializer::{JsonSerializer, Serializer},
    snowflake::SnowflakeId,
    status::{ExpiryPolicy, StatusName},
};

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryStore, MemoryTransaction};
pub use sqlite::SqliteStore;

/// How far ahead of their due time delayed messages are picked up.
pub const DELAYED_LOOKAHEAD: Duration = Duration::minutes(2);
/// How long a message may sit in `Queued` before it is considered stuck.
pub const QUEUED_STUCK_AFTER: Duration = Duration::minutes(1);

/// Upper bound for configured expiries and durations.
pub const MAX_EXPIRY: Duration = Duration::days(365 * 100);

/// The caller's open transaction, passed to operations that must commit or
/// roll back together with it.
pub enum Transaction<'a> {
    Sqlite(&'a mut SqliteConnection),
    Memory(&'a mut MemoryTransaction),
}

impl Transaction<'_> {
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => sqlite::BACKEND,
            Self::Memory(_) => memory::BACKEND,
        }
    }
}

impl<'a> From<&'a mut SqliteConnection> for Transaction<'a> {
    fn from(conn: &'a mut SqliteConnection) -> Self {
        Self::Sqlite(conn)
    }
}

impl<'a> From<&'a mut MemoryTransaction> for Transaction<'a> {
    fn from(tx: &'a mut MemoryTransaction) -> Self {
        Self::Memory(tx)
    }
}

/// Policy knobs shared by all backends.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreOptions {
    /// Prefix of the message and lock tables
    pub table_prefix: String,
    /// Version tag stamped on new rows; retry lookups only see this version
    pub version: String,
    /// Rows with this many retries are no longer retried automatically
    pub retry_limit: u32,
    /// Maximum rows returned by one retry lookup
    pub retry_page_size: u32,
    /// Maximum rows handled by one delayed-message sweep
    pub scheduler_batch_size: u32,
    pub succeeded_expiry: Duration,
    pub failed_expiry: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        let expiry = ExpiryPolicy::default();

        Self {
            table_prefix: "letterbox".to_owned(),
            version: "v1".to_owned(),
            retry_limit: 50,
            retry_page_size: 200,
            scheduler_batch_size: 200,
            succeeded_expiry: expiry.succeeded,
            failed_expiry: expiry.failed,
        }
    }
}

impl StoreOptions {
    pub fn expiry_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            succeeded: self.succeeded_expiry,
            failed: self.failed_expiry,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        TableNames::new(&self.table_prefix)?;

        if self.retry_page_size == 0 || self.scheduler_batch_size == 0 {
            return Err(Error::invalid_argument("batch sizes must be positive"));
        }

        for expiry in [self.succeeded_expiry, self.failed_expiry] {
            if expiry < Duration::zero() || expiry > MAX_EXPIRY {
                return Err(Error::invalid_argument(format!(
                    "expiry of {expiry} is out of range"
                )));
            }
        }

        Ok(())
    }
}

/// Validated table names derived from a prefix.
///
/// Table names are interpolated into SQL, so the prefix is restricted to an
/// identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableNames {
    published: String,
    received: String,
    lock: String,
}

impl TableNames {
    pub fn new(prefix: &str) -> Result<Self, Error> {
        let mut chars = prefix.chars();

        let valid = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

        if !valid {
            return Err(Error::invalid_argument(format!(
                "invalid table prefix `{prefix}`"
            )));
        }

        Ok(Self {
            published: format!("{prefix}_published"),
            received: format!("{prefix}_received"),
            lock: format!("{prefix}_lock"),
        })
    }

    pub fn messages(&self, kind: MessageKind) -> &str {
        match kind {
            MessageKind::Published => &self.published,
            MessageKind::Received => &self.received,
        }
    }

    pub fn lock(&self) -> &str {
        &self.lock
    }
}

/// State and record-building rules shared by every backend.
#[derive(Clone)]
pub(crate) struct StoreCore {
    pub options: Arc<StoreOptions>,
    pub tables: TableNames,
    pub ids: Arc<SnowflakeId>,
    pub clock: Arc<dyn Clock>,
    pub serializer: Arc<dyn Serializer>,
}

/// Values a status change writes, computed before the write happens.
pub(crate) struct Transition {
    pub status: StatusName,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoreCore {
    pub fn new(
        options: StoreOptions,
        ids: Option<Arc<SnowflakeId>>,
        clock: Option<Arc<dyn Clock>>,
        serializer: Option<Arc<dyn Serializer>>,
    ) -> Result<Self, Error> {
        options.validate()?;

        Ok(Self {
            tables: TableNames::new(&options.table_prefix)?,
            options: Arc::new(options),
            ids: ids.unwrap_or_else(|| Arc::new(SnowflakeId::random())),
            clock: clock.unwrap_or_else(|| Arc::new(SystemClock)),
            serializer: serializer.unwrap_or_else(|| Arc::new(JsonSerializer)),
        })
    }

    /// Truncated to the millisecond precision rows are stored with.
    pub fn now(&self) -> DateTime<Utc> {
        from_millis(to_millis(self.clock.now()))
    }

    fn record(
        &self,
        id: i64,
        name: &str,
        group: Option<&str>,
        content: Option<String>,
        data_source: Option<&str>,
    ) -> MessageRecord {
        MessageRecord {
            id,
            name: name.to_owned(),
            group: group.map(str::to_owned),
            content,
            retries: 0,
            added: self.now(),
            expires_at: None,
            status: StatusName::Scheduled,
            data_source: data_source.map(str::to_owned),
            version: Some(self.options.version.clone()),
        }
    }

    pub fn published(
        &self,
        name: &str,
        content: &Message,
        data_source: Option<&str>,
    ) -> Result<MessageRecord, Error> {
        require_name(name)?;

        let id = self.ids.next_id();
        let content = content
            .clone()
            .with_header(HEADER_MESSAGE_ID, id.to_string())
            .with_header(HEADER_MESSAGE_NAME, name);

        Ok(self.record(
            id,
            name,
            None,
            Some(self.serializer.serialize(&content)?),
            data_source,
        ))
    }

    pub fn received(
        &self,
        name: &str,
        group: &str,
        content: &Message,
    ) -> Result<MessageRecord, Error> {
        require_name(name)?;

        let id = self.ids.next_id();
        let content = content
            .clone()
            .with_header(HEADER_MESSAGE_ID, id.to_string())
            .with_header(HEADER_MESSAGE_NAME, name)
            .with_header(HEADER_GROUP, group);

        Ok(self.record(
            id,
            name,
            Some(group),
            Some(self.serializer.serialize(&content)?),
            None,
        ))
    }

    /// The raw content is kept verbatim since it may not deserialize.
    pub fn received_exception(
        &self,
        name: &str,
        group: &str,
        raw_content: &str,
    ) -> Result<MessageRecord, Error> {
        require_name(name)?;

        let mut record = self.record(
            self.ids.next_id(),
            name,
            Some(group),
            Some(raw_content.to_owned()),
            None,
        );
        record.status = StatusName::Failed;
        record.retries = self.options.retry_limit;
        record.expires_at = Some(record.added + self.options.failed_expiry);

        Ok(record)
    }

    pub fn transition(
        &self,
        record: &MessageRecord,
        status: StatusName,
    ) -> Result<Transition, Error> {
        record.status.ensure_transition(status)?;

        Ok(Transition {
            status,
            expires_at: self
                .options
                .expiry_policy()
                .expires_at(status, self.now(), record.expires_at),
        })
    }
}

impl Transition {
    pub fn apply(self, record: &mut MessageRecord) {
        record.status = self.status;
        record.expires_at = self.expires_at;
    }
}

fn require_name(name: &str) -> Result<(), Error> {
    if name.trim().is_empty() {
        return Err(Error::invalid_argument("message name is required"));
    }
    Ok(())
}

/// Callback invoked by [`MessageStore::schedule_delayed`] with the sweep's
/// open transaction and the records about to be marked `Queued`.
///
/// Returning an error rolls the whole sweep back. On SQLite the sweep holds
/// the write lock until it commits, so database writes made here must go
/// through `tx`; other writers wait for the sweep to finish.
pub trait DelayedDispatch: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        tx: &'a mut Transaction<'_>,
        records: &'a [MessageRecord],
    ) -> BoxFuture<'a, Result<(), Error>>;
}

/// Read/write access to message records.
///
/// Every operation is safe to call concurrently from many processes sharing
/// the same datastore. Dropping a returned future abandons the operation;
/// anything it had not committed is rolled back.
pub trait MessageStore: Send + Sync + 'static {
    /// Persists an outgoing message as `Scheduled`.
    ///
    /// With `tx`, the insert runs inside the caller's transaction and shares
    /// its fate. Without it, the insert commits on its own.
    fn store_message<'a>(
        &'a self,
        name: &'a str,
        content: &'a Message,
        data_source: Option<&'a str>,
        tx: Option<&'a mut Transaction<'_>>,
    ) -> BoxFuture<'a, Result<MessageRecord, Error>>;

    /// Persists an incoming message as `Scheduled` in its own transaction.
    fn store_received_message<'a>(
        &'a self,
        name: &'a str,
        group: &'a str,
        content: &'a Message,
    ) -> BoxFuture<'a, Result<MessageRecord, Error>>;

    /// Persists an incoming message that could not be read or dispatched.
    ///
    /// The row starts `Failed` with its retries exhausted, so only an operator
    /// or the collector will touch it again.
    fn store_received_exception_message<'a>(
        &'a self,
        name: &'a str,
        group: &'a str,
        raw_content: &'a str,
    ) -> BoxFuture<'a, Result<MessageRecord, Error>>;

    /// Writes `status`, `content`, `retries` and `expires_at` of `record`.
    ///
    /// Terminal statuses get a fresh cleanup deadline stamped onto `record`.
    /// A record that no longer exists is ignored.
    fn change_publish_state<'a>(
        &'a self,
        record: &'a mut MessageRecord,
        status: StatusName,
        tx: Option<&'a mut Transaction<'_>>,
    ) -> BoxFuture<'a, Result<(), Error>>;

    /// Like [`MessageStore::change_publish_state`] for received records.
    fn change_receive_state<'a>(
        &'a self,
        record: &'a mut MessageRecord,
        status: StatusName,
    ) -> BoxFuture<'a, Result<(), Error>>;

    /// Moves the given published messages to `Delayed` without touching
    /// their payload. Returns how many rows changed.
    fn change_publish_state_to_delayed<'a>(
        &'a self,
        ids: &'a [i64],
    ) -> BoxFuture<'a, Result<u64, Error>>;

    /// Oldest `Failed`/`Scheduled` messages added before `now - lookback`
    /// that are still under the retry limit.
    fn get_messages_needing_retry<'a>(
        &'a self,
        kind: MessageKind,
        lookback: Duration,
    ) -> BoxFuture<'a, Result<Vec<MessageRecord>, Error>>;

    /// Deletes at most `batch_size` terminal rows with
    /// `expires_at < timeout_before`. Returns the number deleted.
    fn delete_expired<'a>(
        &'a self,
        kind: MessageKind,
        timeout_before: DateTime<Utc>,
        batch_size: u32,
    ) -> BoxFuture<'a, Result<u64, Error>>;

    /// Hands due `Delayed` and stuck `Queued` published messages to
    /// `dispatch` and marks them `Queued`, all in one transaction.
    /// `expires_at` is reset to now so the stuck-message watchdog counts from
    /// this dispatch. Returns the number of records dispatched.
    fn schedule_delayed<'a>(
        &'a self,
        dispatch: &'a dyn DelayedDispatch,
    ) -> BoxFuture<'a, Result<usize, Error>>;

    fn monitoring_api(&self) -> Arc<dyn MonitoringApi>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names() {
        let names = TableNames::new("cap_v2").unwrap();

        assert_eq!(names.messages(MessageKind::Published), "cap_v2_published");
        assert_eq!(names.messages(MessageKind::Received), "cap_v2_received");
        assert_eq!(names.lock(), "cap_v2_lock");
    }

    #[test]
    fn test_table_prefix_must_be_identifier() {
        for prefix in ["", "1abc", "a-b", "x; DROP TABLE y", "café"] {
            assert!(
                matches!(TableNames::new(prefix), Err(Error::InvalidArgument { .. })),
                "{prefix} should be rejected"
            );
        }
    }

    #[test]
    fn test_options_validation() {
        assert!(StoreOptions::default().validate().is_ok());

        let options = StoreOptions {
            scheduler_batch_size: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
