//! In-memory [`MessageStore`] for tests and single-process deployments.
//!
//! Records live in one concurrent map per kind. Each status change is an
//! atomic per-record compute, like a document database without
//! multi-document transactions, so the only thing a [`MemoryTransaction`]
//! can stage is a new published message.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::BoxFuture;
use papaya::{Compute, Operation};

use crate::{
    clock::Clock,
    error::Error,
    message::{Message, MessageKind, MessageRecord},
    monitoring::{memory::MemoryMonitoring, MonitoringApi},
    serializer::Serializer,
    snowflake::SnowflakeId,
    status::StatusName,
};

use super::{
    DelayedDispatch, MessageStore, StoreCore, StoreOptions, Transaction, DELAYED_LOOKAHEAD,
    QUEUED_STUCK_AFTER,
};

pub(crate) const BACKEND: &str = "memory";

pub(crate) type Records = Arc<papaya::HashMap<i64, MessageRecord>>;

/// Published messages staged until [`MemoryStore::commit`].
///
/// Dropping it without committing discards everything staged.
#[derive(Debug, Default)]
pub struct MemoryTransaction {
    staged: Vec<MessageRecord>,
}

impl MemoryTransaction {
    pub fn staged(&self) -> &[MessageRecord] {
        &self.staged
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    published: Records,
    received: Records,
    core: StoreCore,
}

#[bon::bon]
impl MemoryStore {
    #[builder]
    pub fn new(
        #[builder(default)] options: StoreOptions,
        ids: Option<Arc<SnowflakeId>>,
        clock: Option<Arc<dyn Clock>>,
        serializer: Option<Arc<dyn Serializer>>,
    ) -> Result<Self, Error> {
        Ok(Self {
            published: Arc::new(papaya::HashMap::new()),
            received: Arc::new(papaya::HashMap::new()),
            core: StoreCore::new(options, ids, clock, serializer)?,
        })
    }
}

impl MemoryStore {
    pub fn begin(&self) -> MemoryTransaction {
        MemoryTransaction::default()
    }

    /// Makes every staged message visible.
    pub fn commit(&self, tx: MemoryTransaction) {
        let published = self.published.pin();
        for record in tx.staged {
            tracing::debug!(id = record.id, name = %record.name, "Stored message");
            published.insert(record.id, record);
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.core.options
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.core.clock.clone()
    }

    /// Snapshot of a stored record.
    pub fn get(&self, kind: MessageKind, id: i64) -> Option<MessageRecord> {
        self.records(kind).pin().get(&id).cloned()
    }

    pub fn count(&self, kind: MessageKind) -> usize {
        self.records(kind).len()
    }

    fn records(&self, kind: MessageKind) -> &Records {
        match kind {
            MessageKind::Published => &self.published,
            MessageKind::Received => &self.received,
        }
    }

    fn insert(&self, kind: MessageKind, record: &MessageRecord) {
        tracing::debug!(id = record.id, %kind, name = %record.name, status = %record.status, "Stored message");
        self.records(kind).pin().insert(record.id, record.clone());
    }

    fn change_state(
        &self,
        kind: MessageKind,
        record: &mut MessageRecord,
        status: StatusName,
    ) -> Result<(), Error> {
        let transition = self.core.transition(record, status)?;
        let records = self.records(kind).pin();

        // A single compare-and-swap, so a row deleted or rewritten meanwhile
        // is never resurrected from a stale copy.
        let result = records.compute(record.id, |entry| match entry {
            Some((_, stored))
                if record.data_source.is_none() || stored.data_source == record.data_source =>
            {
                Operation::Insert(MessageRecord {
                    content: record.content.clone(),
                    retries: record.retries,
                    status: transition.status,
                    expires_at: transition.expires_at,
                    ..stored.clone()
                })
            }
            _ => Operation::Abort(()),
        });

        match result {
            Compute::Updated { .. } => {
                tracing::debug!(id = record.id, %kind, from = %record.status, to = %status, "Changed message status");
            }
            _ => {
                tracing::debug!(id = record.id, %kind, "Status change skipped, message is gone");
            }
        }

        transition.apply(record);

        Ok(())
    }
}

impl MessageStore for MemoryStore {
    fn store_message<'a>(
        &'a self,
        name: &'a str,
        content: &'a Message,
        data_source: Option<&'a str>,
        tx: Option<&'a mut Transaction<'_>>,
    ) -> BoxFuture<'a, Result<MessageRecord, Error>> {
        Box::pin(async move {
            let record = self.core.published(name, content, data_source)?;

            match tx {
                Some(Transaction::Memory(tx)) => tx.staged.push(record.clone()),
                Some(Transaction::Sqlite(_)) => {
                    return Err(Error::transaction_unsupported(BACKEND, "store_message"))
                }
                None => self.insert(MessageKind::Published, &record),
            }

            Ok(record)
        })
    }

    fn store_received_message<'a>(
        &'a self,
        name: &'a str,
        group: &'a str,
        content: &'a Message,
    ) -> BoxFuture<'a, Result<MessageRecord, Error>> {
        Box::pin(async move {
            let record = self.core.received(name, group, content)?;
            self.insert(MessageKind::Received, &record);
            Ok(record)
        })
    }

    fn store_received_exception_message<'a>(
        &'a self,
        name: &'a str,
        group: &'a str,
        raw_content: &'a str,
    ) -> BoxFuture<'a, Result<MessageRecord, Error>> {
        Box::pin(async move {
            let record = self.core.received_exception(name, group, raw_content)?;
            self.insert(MessageKind::Received, &record);
            Ok(record)
        })
    }

    fn change_publish_state<'a>(
        &'a self,
        record: &'a mut MessageRecord,
        status: StatusName,
        tx: Option<&'a mut Transaction<'_>>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if tx.is_some() {
                return Err(Error::transaction_unsupported(
                    BACKEND,
                    "change_publish_state",
                ));
            }

            self.change_state(MessageKind::Published, record, status)
        })
    }

    fn change_receive_state<'a>(
        &'a self,
        record: &'a mut MessageRecord,
        status: StatusName,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move { self.change_state(MessageKind::Received, record, status) })
    }

    fn change_publish_state_to_delayed<'a>(
        &'a self,
        ids: &'a [i64],
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(async move {
            let published = self.published.pin();
            let mut changed = 0;

            for id in ids {
                let result = published.compute(*id, |entry| match entry {
                    Some((_, record))
                        if matches!(
                            record.status,
                            StatusName::Scheduled | StatusName::Queued | StatusName::Failed
                        ) =>
                    {
                        Operation::Insert(MessageRecord {
                            status: StatusName::Delayed,
                            ..record.clone()
                        })
                    }
                    _ => Operation::Abort(()),
                });

                if matches!(result, Compute::Updated { .. }) {
                    changed += 1;
                }
            }

            tracing::debug!(requested = ids.len(), changed, "Delayed published messages");

            Ok(changed)
        })
    }

    fn get_messages_needing_retry<'a>(
        &'a self,
        kind: MessageKind,
        lookback: Duration,
    ) -> BoxFuture<'a, Result<Vec<MessageRecord>, Error>> {
        Box::pin(async move {
            let added_before = self.core.now() - lookback;
            let options = &self.core.options;

            let mut records: Vec<_> = self
                .records(kind)
                .pin()
                .values()
                .filter(|record| {
                    record.can_retry(options.retry_limit)
                        && record.added < added_before
                        && record.version.as_deref() == Some(options.version.as_str())
                })
                .cloned()
                .collect();

            records.sort_by_key(|record| (record.added, record.id));
            records.truncate(options.retry_page_size as usize);

            Ok(records)
        })
    }

    fn delete_expired<'a>(
        &'a self,
        kind: MessageKind,
        timeout_before: DateTime<Utc>,
        batch_size: u32,
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(async move {
            if batch_size == 0 {
                return Err(Error::invalid_argument("batch size must be positive"));
            }

            let records = self.records(kind).pin();

            let is_expired = |record: &MessageRecord| {
                record.status.is_terminal()
                    && record.expires_at.is_some_and(|at| at < timeout_before)
            };

            let expired: Vec<i64> = records
                .values()
                .filter(|record| is_expired(record))
                .map(|record| record.id)
                .take(batch_size as usize)
                .collect();

            // Re-checked at removal; a row rewritten in between is kept.
            let deleted = expired
                .into_iter()
                .filter(|id| {
                    matches!(
                        records.compute(*id, |entry| match entry {
                            Some((_, record)) if is_expired(record) => Operation::Remove,
                            _ => Operation::Abort(()),
                        }),
                        Compute::Removed(..)
                    )
                })
                .count() as u64;

            if deleted > 0 {
                tracing::debug!(%kind, deleted, "Deleted expired messages");
            }

            Ok(deleted)
        })
    }

    fn schedule_delayed<'a>(
        &'a self,
        dispatch: &'a dyn DelayedDispatch,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        Box::pin(async move {
            let now = self.core.now();
            let due = now + DELAYED_LOOKAHEAD;
            let stuck = now - QUEUED_STUCK_AFTER;

            let mut records: Vec<MessageRecord> = self
                .published
                .pin()
                .values()
                .filter(|record| match (record.status, record.expires_at) {
                    (StatusName::Delayed, Some(at)) => at < due,
                    (StatusName::Queued, Some(at)) => at < stuck,
                    _ => false,
                })
                .cloned()
                .collect();

            records.sort_by_key(|record| (record.expires_at, record.id));
            records.truncate(self.core.options.scheduler_batch_size as usize);

            if records.is_empty() {
                return Ok(0);
            }

            let mut tx = self.begin();
            dispatch
                .dispatch(&mut Transaction::Memory(&mut tx), &records)
                .await?;
            self.commit(tx);

            let published = self.published.pin();
            for record in &records {
                published.update(record.id, |stored| MessageRecord {
                    status: StatusName::Queued,
                    expires_at: Some(now),
                    ..stored.clone()
                });
            }

            tracing::debug!(count = records.len(), "Queued delayed messages");

            Ok(records.len())
        })
    }

    fn monitoring_api(&self) -> Arc<dyn MonitoringApi> {
        Arc::new(MemoryMonitoring::new(
            self.published.clone(),
            self.received.clone(),
            self.core.clock.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use sqlx::Connection;

    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());

        let store = MemoryStore::builder()
            .options(StoreOptions {
                retry_limit: 3,
                scheduler_batch_size: 2,
                ..Default::default()
            })
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();

        (store, clock)
    }

    fn payload() -> Message {
        Message::new(serde_json::json!({ "order": 1 })).unwrap()
    }

    struct Failing;

    impl DelayedDispatch for Failing {
        fn dispatch<'a>(
            &'a self,
            _tx: &'a mut Transaction<'_>,
            _records: &'a [MessageRecord],
        ) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Err(Error::dispatch(eyre::eyre!("broker down"))) })
        }
    }

    struct Accepting;

    impl DelayedDispatch for Accepting {
        fn dispatch<'a>(
            &'a self,
            _tx: &'a mut Transaction<'_>,
            _records: &'a [MessageRecord],
        ) -> BoxFuture<'a, Result<(), Error>> {
            Box::pin(async { Ok(()) })
        }
    }

    async fn delayed(store: &MemoryStore, name: &str, due: DateTime<Utc>) -> MessageRecord {
        let mut record = store
            .store_message(name, &payload(), None, None)
            .await
            .unwrap();
        record.expires_at = Some(due);
        store
            .change_publish_state(&mut record, StatusName::Delayed, None)
            .await
            .unwrap();
        record
    }

    #[tokio::test]
    async fn test_transaction_commit_and_drop() {
        let (store, _clock) = setup();

        let mut tx = store.begin();
        let kept = store
            .store_message("a", &payload(), None, Some(&mut Transaction::Memory(&mut tx)))
            .await
            .unwrap();
        assert!(store.get(MessageKind::Published, kept.id).is_none());
        store.commit(tx);

        let stored = store.get(MessageKind::Published, kept.id).unwrap();
        assert_eq!(stored.status, StatusName::Scheduled);

        let mut tx = store.begin();
        let dropped = store
            .store_message("b", &payload(), None, Some(&mut Transaction::Memory(&mut tx)))
            .await
            .unwrap();
        drop(tx);

        assert!(store.get(MessageKind::Published, dropped.id).is_none());
    }

    #[tokio::test]
    async fn test_sqlite_transaction_is_unsupported() {
        let (store, _clock) = setup();
        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:")
            .await
            .unwrap();

        let result = store
            .store_message("a", &payload(), None, Some(&mut Transaction::Sqlite(&mut conn)))
            .await;

        assert!(matches!(
            result,
            Err(Error::TransactionUnsupported { backend: "memory", .. })
        ));
        assert_eq!(store.count(MessageKind::Published), 0);
    }

    #[tokio::test]
    async fn test_change_state_in_transaction_is_unsupported() {
        let (store, _clock) = setup();
        let mut record = store
            .store_message("a", &payload(), None, None)
            .await
            .unwrap();

        let mut tx = store.begin();
        let result = store
            .change_publish_state(
                &mut record,
                StatusName::Succeeded,
                Some(&mut Transaction::Memory(&mut tx)),
            )
            .await;

        assert!(matches!(result, Err(Error::TransactionUnsupported { .. })));
        assert_eq!(
            store.get(MessageKind::Published, record.id).unwrap().status,
            StatusName::Scheduled
        );
    }

    #[tokio::test]
    async fn test_retry_limit_excludes_exhausted() {
        let (store, clock) = setup();

        let mut under = store
            .store_received_message("a", "billing", &payload())
            .await
            .unwrap();
        let mut exhausted = store
            .store_received_message("b", "billing", &payload())
            .await
            .unwrap();

        under.retries = 2;
        store
            .change_receive_state(&mut under, StatusName::Failed)
            .await
            .unwrap();
        exhausted.retries = 3;
        store
            .change_receive_state(&mut exhausted, StatusName::Failed)
            .await
            .unwrap();

        clock.advance(Duration::minutes(5));

        let retry = store
            .get_messages_needing_retry(MessageKind::Received, Duration::minutes(4))
            .await
            .unwrap();

        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].id, under.id);
        assert_eq!(retry[0].group.as_deref(), Some("billing"));
    }

    #[tokio::test]
    async fn test_delete_expired_converges() {
        let (store, clock) = setup();

        for i in 0..5 {
            let mut record = store
                .store_message(&format!("m{i}"), &payload(), None, None)
                .await
                .unwrap();
            store
                .change_publish_state(&mut record, StatusName::Succeeded, None)
                .await
                .unwrap();
        }

        clock.advance(Duration::days(2));

        let mut total = 0;
        loop {
            let deleted = store
                .delete_expired(MessageKind::Published, clock.now(), 2)
                .await
                .unwrap();
            assert!(deleted <= 2);
            if deleted == 0 {
                break;
            }
            total += deleted;
        }

        assert_eq!(total, 5);
        assert_eq!(store.count(MessageKind::Published), 0);
    }

    #[tokio::test]
    async fn test_schedule_delayed_failure_changes_nothing() {
        let (store, clock) = setup();
        let record = delayed(&store, "a", clock.now() + Duration::minutes(1)).await;

        let result = store.schedule_delayed(&Failing).await;

        assert!(matches!(result, Err(Error::Dispatch { .. })));
        assert_eq!(
            store.get(MessageKind::Published, record.id).unwrap().status,
            StatusName::Delayed
        );
    }

    #[tokio::test]
    async fn test_schedule_delayed_is_bounded_and_ordered() {
        let (store, clock) = setup();
        let now = clock.now();

        let late = delayed(&store, "late", now + Duration::seconds(90)).await;
        let early = delayed(&store, "early", now - Duration::seconds(30)).await;
        let middle = delayed(&store, "middle", now).await;
        let future = delayed(&store, "future", now + Duration::hours(1)).await;

        assert_eq!(store.schedule_delayed(&Accepting).await.unwrap(), 2);

        let status = |id| store.get(MessageKind::Published, id).unwrap().status;
        assert_eq!(status(early.id), StatusName::Queued);
        assert_eq!(status(middle.id), StatusName::Queued);
        assert_eq!(status(late.id), StatusName::Delayed);
        assert_eq!(status(future.id), StatusName::Delayed);

        assert_eq!(store.schedule_delayed(&Accepting).await.unwrap(), 1);
        assert_eq!(status(late.id), StatusName::Queued);
        assert_eq!(status(future.id), StatusName::Delayed);
    }

    #[tokio::test]
    async fn test_schedule_delayed_restarts_the_watchdog() {
        let (store, clock) = setup();
        let record = delayed(&store, "overdue", clock.now() - Duration::minutes(10)).await;

        assert_eq!(store.schedule_delayed(&Accepting).await.unwrap(), 1);
        assert_eq!(store.schedule_delayed(&Accepting).await.unwrap(), 0);

        let queued = store.get(MessageKind::Published, record.id).unwrap();
        assert_eq!(queued.status, StatusName::Queued);
        assert_eq!(queued.expires_at, Some(clock.now()));

        clock.advance(Duration::seconds(61));
        assert_eq!(store.schedule_delayed(&Accepting).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_copies_do_not_revive_deleted_rows() {
        let (store, clock) = setup();

        let mut record = store
            .store_received_message("a", "billing", &payload())
            .await
            .unwrap();
        store
            .change_receive_state(&mut record, StatusName::Failed)
            .await
            .unwrap();
        let mut published = store
            .store_message("b", &payload(), None, None)
            .await
            .unwrap();
        store
            .change_publish_state(&mut published, StatusName::Failed, None)
            .await
            .unwrap();

        clock.advance(Duration::days(16));
        for kind in MessageKind::ALL {
            assert_eq!(
                store.delete_expired(kind, clock.now(), 10).await.unwrap(),
                1
            );
        }

        // Writers still holding the old record change nothing.
        store
            .change_receive_state(&mut record, StatusName::Failed)
            .await
            .unwrap();
        store
            .change_publish_state(&mut published, StatusName::Queued, None)
            .await
            .unwrap();
        assert_eq!(
            store
                .change_publish_state_to_delayed(&[published.id])
                .await
                .unwrap(),
            0
        );

        assert_eq!(store.count(MessageKind::Received), 0);
        assert_eq!(store.count(MessageKind::Published), 0);
    }
}
