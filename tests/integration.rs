use std::{
    ops::Deref,
    sync::{Arc, Mutex},
};

use chrono::{Duration, TimeZone, Utc};
use futures_util::future::BoxFuture;
use letterbox::{
    clock::{Clock, ManualClock},
    config::Config,
    error::Error,
    lock::LeaseLock,
    message::{Message, MessageKind, MessageRecord},
    processor::{Processor, ProcessorOptions, Transport},
    status::StatusName,
    store::{DelayedDispatch, MessageStore, SqliteStore, StoreOptions, Transaction},
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tempfile::TempDir;

struct TmpStore {
    store: SqliteStore,
    clock: ManualClock,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpStore {
    type Target = SqliteStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

async fn setup() -> TmpStore {
    let tmpdir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());

    let pool = SqlitePoolOptions::new()
        .connect_with(
            SqliteConnectOptions::new()
                .filename(tmpdir.path().join("letterbox.db"))
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal),
        )
        .await
        .unwrap();

    sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, total INTEGER NOT NULL)")
        .execute(&pool)
        .await
        .unwrap();

    let store = SqliteStore::builder()
        .db(pool)
        .options(StoreOptions {
            retry_limit: 3,
            ..Default::default()
        })
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    store.initialize().await.unwrap();

    TmpStore {
        store,
        clock,
        tmpdir,
    }
}

fn order(id: i64) -> Message {
    Message::new(serde_json::json!({ "order": id })).unwrap()
}

async fn status_of(store: &SqliteStore, id: i64) -> Option<StatusName> {
    store
        .monitoring_api()
        .message(MessageKind::Published, id)
        .await
        .ok()
        .map(|record| record.status)
}

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<i64>>,
}

impl Transport for RecordingTransport {
    fn send<'a>(
        &'a self,
        _kind: MessageKind,
        record: &'a MessageRecord,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.sent.lock().unwrap().push(record.id);
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_connect_with_config() {
    let tmpdir = tempfile::tempdir().unwrap();

    let config = Config {
        db_path: Some(
            tmpdir
                .path()
                .join("letterbox.db")
                .to_string_lossy()
                .to_string(),
        ),
        table_prefix: Some("outbox".to_owned()),
        ..Default::default()
    };

    let store = SqliteStore::connect_with(&config).await.unwrap();
    assert_eq!(store.tables().lock(), "outbox_lock");

    let record = store
        .store_message("order.created", &order(1), None, None)
        .await
        .unwrap();
    assert_eq!(status_of(&store, record.id).await, Some(StatusName::Scheduled));

    // Reconnecting keeps existing rows.
    drop(store);
    let store = SqliteStore::connect_with(&config).await.unwrap();
    assert_eq!(status_of(&store, record.id).await, Some(StatusName::Scheduled));
}

#[tokio::test]
async fn test_message_commits_with_business_change() {
    let store = setup().await;

    let mut tx = store.db().begin().await.unwrap();
    sqlx::query("INSERT INTO orders (id, total) VALUES (1, 100)")
        .execute(&mut *tx)
        .await
        .unwrap();
    let kept = store
        .store_message("order.created", &order(1), None, Some(&mut (&mut *tx).into()))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.db().begin().await.unwrap();
    sqlx::query("INSERT INTO orders (id, total) VALUES (2, 200)")
        .execute(&mut *tx)
        .await
        .unwrap();
    let discarded = store
        .store_message("order.created", &order(2), None, Some(&mut (&mut *tx).into()))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    let orders: Vec<i64> = sqlx::query_scalar("SELECT id FROM orders")
        .fetch_all(store.db())
        .await
        .unwrap();
    assert_eq!(orders, vec![1]);

    assert_eq!(status_of(&store, kept.id).await, Some(StatusName::Scheduled));
    assert_eq!(status_of(&store, discarded.id).await, None);
}

struct AuditThenFail;

impl DelayedDispatch for AuditThenFail {
    fn dispatch<'a>(
        &'a self,
        tx: &'a mut Transaction<'_>,
        records: &'a [MessageRecord],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let Transaction::Sqlite(conn) = tx else {
                return Err(Error::invalid_argument("expected a sqlite transaction"));
            };

            sqlx::query("INSERT INTO orders (id, total) VALUES ($1, 0)")
                .bind(records[0].id)
                .execute(&mut **conn)
                .await?;

            Err(Error::dispatch(eyre::eyre!("broker unavailable")))
        })
    }
}

#[tokio::test]
async fn test_scheduler_failure_rolls_back_everything() {
    let store = setup().await;

    let mut ids = Vec::new();
    for i in 0..3 {
        let record = store
            .store_message("order.created", &order(i), None, None)
            .await
            .unwrap();
        ids.push(record.id);
    }
    store.change_publish_state_to_delayed(&ids).await.unwrap();
    sqlx::query(&format!(
        "UPDATE {} SET expires_at = $1",
        store.tables().messages(MessageKind::Published)
    ))
    .bind(store.clock.now().timestamp_millis())
    .execute(store.db())
    .await
    .unwrap();

    let result = store.schedule_delayed(&AuditThenFail).await;
    assert!(matches!(result, Err(Error::Dispatch { .. })));

    for id in &ids {
        assert_eq!(status_of(&store, *id).await, Some(StatusName::Delayed));
    }
    let audit: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
        .fetch_one(store.db())
        .await
        .unwrap();
    assert_eq!(audit, 0);
}

#[tokio::test]
async fn test_stuck_queued_messages_are_redispatched() {
    let store = setup().await;
    let transport = Arc::new(RecordingTransport::default());

    let processor = Processor::builder()
        .store(Arc::new(store.store.clone()))
        .lock(Arc::new(store.lease_lock()))
        .transport(transport.clone())
        .clock(Arc::new(store.clock.clone()))
        .build();

    let mut record = store
        .store_message("order.created", &order(1), None, None)
        .await
        .unwrap();
    // Queuing stamps the watchdog; the caller sets no deadline.
    store
        .change_publish_state(&mut record, StatusName::Queued, None)
        .await
        .unwrap();

    // Not stuck yet.
    assert_eq!(processor.schedule_once().await.unwrap(), 0);

    store.clock.advance(Duration::minutes(2));
    assert_eq!(processor.schedule_once().await.unwrap(), 1);

    assert_eq!(*transport.sent.lock().unwrap(), vec![record.id]);
    assert_eq!(status_of(&store, record.id).await, Some(StatusName::Succeeded));
}

#[tokio::test]
async fn test_competing_processors_send_each_message_once() {
    let store = setup().await;
    let transport = Arc::new(RecordingTransport::default());

    let processor = |instance: &str| {
        Processor::builder()
            .store(Arc::new(store.store.clone()))
            .lock(Arc::new(store.lease_lock()) as Arc<dyn LeaseLock>)
            .transport(transport.clone())
            .clock(Arc::new(store.clock.clone()))
            .options(ProcessorOptions {
                retry_limit: 3,
                use_storage_lock: true,
                instance: instance.to_owned(),
                ..Default::default()
            })
            .build()
    };
    let a = processor("instance-a");
    let b = processor("instance-b");

    let mut expected = Vec::new();
    for i in 0..10 {
        let record = store
            .store_message("order.created", &order(i), None, None)
            .await
            .unwrap();
        expected.push(record.id);
    }
    let received = store
        .store_received_message("payment.settled", "billing", &order(99))
        .await
        .unwrap();
    expected.push(received.id);

    store.clock.advance(Duration::minutes(5));

    let (sent_a, sent_b) = tokio::join!(a.retry_once(), b.retry_once());
    assert_eq!(sent_a.unwrap() + sent_b.unwrap(), 11);

    let mut sent = transport.sent.lock().unwrap().clone();
    sent.sort();
    expected.sort();
    assert_eq!(sent, expected);

    let stats = store.monitoring_api().statistics().await.unwrap();
    assert_eq!(stats.published.succeeded, 10);
    assert_eq!(stats.received.succeeded, 1);

    // Both leases were released.
    let holders: Vec<Option<String>> = sqlx::query_scalar(&format!(
        "SELECT instance FROM {}",
        store.tables().lock()
    ))
    .fetch_all(store.db())
    .await
    .unwrap();
    assert!(holders.iter().all(Option::is_none));
}

#[tokio::test]
async fn test_lifecycle_ends_in_cleanup() {
    let store = setup().await;
    let transport = Arc::new(RecordingTransport::default());

    let processor = Processor::builder()
        .store(Arc::new(store.store.clone()))
        .lock(Arc::new(store.lease_lock()))
        .transport(transport)
        .clock(Arc::new(store.clock.clone()))
        .options(ProcessorOptions {
            cleanup_batch_size: 4,
            ..Default::default()
        })
        .build();

    for i in 0..9 {
        let mut record = store
            .store_message("order.created", &order(i), None, None)
            .await
            .unwrap();
        store
            .change_publish_state(&mut record, StatusName::Queued, None)
            .await
            .unwrap();
        store
            .change_publish_state(&mut record, StatusName::Succeeded, None)
            .await
            .unwrap();
    }

    assert_eq!(processor.collect_once().await.unwrap(), 0);

    store.clock.advance(Duration::days(1) + Duration::seconds(1));
    assert_eq!(processor.collect_once().await.unwrap(), 9);

    let stats = store.monitoring_api().statistics().await.unwrap();
    assert_eq!(stats.published.total(), 0);
}
