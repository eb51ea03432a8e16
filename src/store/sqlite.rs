//! SQLite-backed [`MessageStore`].
//!
//! Every status change is a single `UPDATE ... WHERE id = ?` and every delete
//! is bounded by a `LIMIT`, so no statement holds locks over an unbounded set
//! of rows. The delayed-message sweep is the only multi-statement
//! transaction the store opens on its own.

use std::{str::FromStr, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use futures_util::future::BoxFuture;
use itertools::Itertools;
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    Executor, Sqlite, SqlitePool,
};

use crate::{
    clock::{to_millis, Clock},
    config::Config,
    error::Error,
    lock::retry_lock_key,
    message::{Message, MessageKind, MessageRecord, MessageRow},
    monitoring::{sqlite::SqliteMonitoring, MonitoringApi},
    serializer::Serializer,
    snowflake::SnowflakeId,
    status::StatusName,
};

use super::{
    DelayedDispatch, MessageStore, StoreCore, StoreOptions, TableNames, Transaction,
    DELAYED_LOOKAHEAD, QUEUED_STUCK_AFTER,
};

pub(crate) const BACKEND: &str = "sqlite";

/// Column list selecting a [`MessageRow`] from either message table.
pub(crate) fn row_columns(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Published => {
            "id, name, NULL AS grp, content, retries, added, expires_at, status, data_source, version"
        }
        MessageKind::Received => {
            "id, name, grp, content, retries, added, expires_at, status, data_source, version"
        }
    }
}

/// `$first, $first+1, ...` placeholders for an `IN (...)` list.
pub(crate) fn placeholders(first: usize, count: usize) -> String {
    (first..first + count).map(|i| format!("${i}")).join(", ")
}

#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
    core: StoreCore,
}

#[bon::bon]
impl SqliteStore {
    /// Wraps an existing pool. Call [`SqliteStore::initialize`] before use
    /// if the tables may not exist yet.
    #[builder]
    pub fn new(
        db: SqlitePool,
        #[builder(default)] options: StoreOptions,
        ids: Option<Arc<SnowflakeId>>,
        clock: Option<Arc<dyn Clock>>,
        serializer: Option<Arc<dyn Serializer>>,
    ) -> Result<Self, Error> {
        Ok(Self {
            db,
            core: StoreCore::new(options, ids, clock, serializer)?,
        })
    }
}

impl SqliteStore {
    /// Opens (or creates) the configured database and prepares the tables.
    pub async fn connect_with(config: &Config) -> Result<Self, Error> {
        let in_memory = config.db_path() == ":memory:";

        let opts = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(config.db_path())
                .create_if_missing(true)
        }
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full);

        // Each connection to `sqlite::memory:` is its own database.
        let mut pool_opts = SqlitePoolOptions::new();
        if in_memory {
            pool_opts = pool_opts.max_connections(1);
        }
        let pool = pool_opts.connect_with(opts).await?;

        let ids = config.worker_id().map(|id| Arc::new(SnowflakeId::new(id)));

        let store = Self::builder()
            .db(pool)
            .options(config.store_options()?)
            .maybe_ids(ids)
            .build()?;

        store.initialize().await?;

        Ok(store)
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn tables(&self) -> &TableNames {
        &self.core.tables
    }

    pub fn options(&self) -> &StoreOptions {
        &self.core.options
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.core.clock.clone()
    }

    /// Creates the message and lock tables if missing and seeds the retry
    /// lock rows for the configured version.
    pub async fn initialize(&self) -> Result<(), Error> {
        let published = self.core.tables.messages(MessageKind::Published);
        let received = self.core.tables.messages(MessageKind::Received);
        let lock = self.core.tables.lock();

        let statements = [
            format!(
                "
                CREATE TABLE IF NOT EXISTS {published} (
                    id INTEGER PRIMARY KEY,
                    version TEXT,
                    name TEXT NOT NULL,
                    content TEXT,
                    retries INTEGER NOT NULL DEFAULT 0,
                    added INTEGER NOT NULL,
                    expires_at INTEGER,
                    status TEXT NOT NULL,
                    data_source TEXT
                )
                "
            ),
            format!(
                "
                CREATE TABLE IF NOT EXISTS {received} (
                    id INTEGER PRIMARY KEY,
                    version TEXT,
                    name TEXT NOT NULL,
                    grp TEXT,
                    content TEXT,
                    retries INTEGER NOT NULL DEFAULT 0,
                    added INTEGER NOT NULL,
                    expires_at INTEGER,
                    status TEXT NOT NULL,
                    data_source TEXT
                )
                "
            ),
            format!(
                "
                CREATE TABLE IF NOT EXISTS {lock} (
                    key TEXT NOT NULL,
                    instance TEXT,
                    last_lock_time INTEGER,

                    PRIMARY KEY (key)
                )
                "
            ),
            format!("CREATE INDEX IF NOT EXISTS {published}_status_expires ON {published} (status, expires_at)"),
            format!("CREATE INDEX IF NOT EXISTS {published}_version_added ON {published} (version, added)"),
            format!("CREATE INDEX IF NOT EXISTS {received}_status_expires ON {received} (status, expires_at)"),
            format!("CREATE INDEX IF NOT EXISTS {received}_version_added ON {received} (version, added)"),
        ];

        let mut tx = self.db.begin().await?;

        for statement in statements {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }

        for kind in MessageKind::ALL {
            sqlx::query(&format!(
                "INSERT OR IGNORE INTO {lock} (key, instance, last_lock_time) VALUES ($1, NULL, NULL)"
            ))
            .bind(retry_lock_key(kind, &self.core.options.version))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(prefix = %self.core.options.table_prefix, "Initialized message tables");

        Ok(())
    }

    async fn insert<'e, E>(&self, db: E, kind: MessageKind, record: &MessageRecord) -> Result<(), Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let table = self.core.tables.messages(kind);

        let sql = match kind {
            MessageKind::Published => format!(
                "
                INSERT INTO {table} (id, version, name, content, retries, added, expires_at, status, data_source)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "
            ),
            MessageKind::Received => format!(
                "
                INSERT INTO {table} (id, version, name, content, retries, added, expires_at, status, data_source, grp)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "
            ),
        };

        let mut query = sqlx::query(&sql)
            .bind(record.id)
            .bind(record.version.as_deref())
            .bind(&record.name)
            .bind(record.content.as_deref())
            .bind(record.retries as i64)
            .bind(to_millis(record.added))
            .bind(record.expires_at.map(to_millis))
            .bind(record.status.as_str())
            .bind(record.data_source.as_deref());

        if kind == MessageKind::Received {
            query = query.bind(record.group.as_deref());
        }

        query.execute(db).await?;

        tracing::debug!(id = record.id, %kind, name = %record.name, status = %record.status, "Stored message");

        Ok(())
    }

    async fn change_state<'e, E>(
        &self,
        db: E,
        kind: MessageKind,
        record: &mut MessageRecord,
        status: StatusName,
    ) -> Result<(), Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let transition = self.core.transition(record, status)?;
        let table = self.core.tables.messages(kind);

        let updated = sqlx::query(&format!(
            "
            UPDATE {table}
            SET content = $1, retries = $2, expires_at = $3, status = $4
            WHERE id = $5 AND ($6 IS NULL OR data_source = $6)
            "
        ))
        .bind(record.content.as_deref())
        .bind(record.retries as i64)
        .bind(transition.expires_at.map(to_millis))
        .bind(transition.status.as_str())
        .bind(record.id)
        .bind(record.data_source.as_deref())
        .execute(db)
        .await?
        .rows_affected();

        if updated == 0 {
            tracing::debug!(id = record.id, %kind, "Status change skipped, message is gone");
        } else {
            tracing::debug!(id = record.id, %kind, from = %record.status, to = %status, "Changed message status");
        }

        transition.apply(record);

        Ok(())
    }
}

impl MessageStore for SqliteStore {
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
                Some(Transaction::Sqlite(conn)) => {
                    self.insert(&mut **conn, MessageKind::Published, &record)
                        .await?
                }
                Some(Transaction::Memory(_)) => {
                    return Err(Error::transaction_unsupported(BACKEND, "store_message"))
                }
                None => {
                    self.insert(&self.db, MessageKind::Published, &record)
                        .await?
                }
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
            self.insert(&self.db, MessageKind::Received, &record)
                .await?;
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
            self.insert(&self.db, MessageKind::Received, &record)
                .await?;
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
            match tx {
                Some(Transaction::Sqlite(conn)) => {
                    self.change_state(&mut **conn, MessageKind::Published, record, status)
                        .await
                }
                Some(Transaction::Memory(_)) => Err(Error::transaction_unsupported(
                    BACKEND,
                    "change_publish_state",
                )),
                None => {
                    self.change_state(&self.db, MessageKind::Published, record, status)
                        .await
                }
            }
        })
    }

    fn change_receive_state<'a>(
        &'a self,
        record: &'a mut MessageRecord,
        status: StatusName,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            self.change_state(&self.db, MessageKind::Received, record, status)
                .await
        })
    }

    fn change_publish_state_to_delayed<'a>(
        &'a self,
        ids: &'a [i64],
    ) -> BoxFuture<'a, Result<u64, Error>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(0);
            }

            let table = self.core.tables.messages(MessageKind::Published);
            let sql = format!(
                "
                UPDATE {table}
                SET status = 'Delayed'
                WHERE status IN ('Scheduled', 'Queued', 'Failed') AND id IN ({})
                ",
                placeholders(1, ids.len())
            );

            let mut query = sqlx::query(&sql);
            for id in ids {
                query = query.bind(*id);
            }

            let changed = query.execute(&self.db).await?.rows_affected();

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
            let table = self.core.tables.messages(kind);
            let added_before = self.core.now() - lookback;

            let rows: Vec<MessageRow> = sqlx::query_as(&format!(
                "
                SELECT {columns} FROM {table}
                WHERE retries < $1 AND version = $2 AND added < $3
                    AND status IN ('Failed', 'Scheduled')
                ORDER BY added, id
                LIMIT $4
                ",
                columns = row_columns(kind)
            ))
            .bind(self.core.options.retry_limit as i64)
            .bind(&self.core.options.version)
            .bind(to_millis(added_before))
            .bind(self.core.options.retry_page_size as i64)
            .fetch_all(&self.db)
            .await?;

            rows.into_iter().map(MessageRecord::try_from).collect()
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

            let table = self.core.tables.messages(kind);

            let deleted = sqlx::query(&format!(
                "
                DELETE FROM {table}
                WHERE id IN (
                    SELECT id FROM {table}
                    WHERE expires_at < $1 AND status IN ('Succeeded', 'Failed')
                    LIMIT $2
                )
                "
            ))
            .bind(to_millis(timeout_before))
            .bind(batch_size as i64)
            .execute(&self.db)
            .await?
            .rows_affected();

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
            let table = self.core.tables.messages(MessageKind::Published);
            let now = self.core.now();

            // Take the write lock up front. A deferred transaction would read
            // from a snapshot that any concurrent commit invalidates, failing
            // the final UPDATE after the batch was already dispatched.
            let mut tx = self.db.begin_with("BEGIN IMMEDIATE").await?;

            let rows: Vec<MessageRow> = sqlx::query_as(&format!(
                "
                SELECT {columns} FROM {table}
                WHERE (status = 'Delayed' AND expires_at < $1)
                    OR (status = 'Queued' AND expires_at < $2)
                ORDER BY expires_at, id
                LIMIT $3
                ",
                columns = row_columns(MessageKind::Published)
            ))
            .bind(to_millis(now + DELAYED_LOOKAHEAD))
            .bind(to_millis(now - QUEUED_STUCK_AFTER))
            .bind(self.core.options.scheduler_batch_size as i64)
            .fetch_all(&mut *tx)
            .await?;

            let records = rows
                .into_iter()
                .map(MessageRecord::try_from)
                .collect::<Result<Vec<_>, _>>()?;

            if records.is_empty() {
                return Ok(0);
            }

            dispatch
                .dispatch(&mut Transaction::Sqlite(&mut *tx), &records)
                .await?;

            // expires_at becomes the stuck-message watchdog.
            let sql = format!(
                "UPDATE {table} SET status = 'Queued', expires_at = $1 WHERE id IN ({})",
                placeholders(2, records.len())
            );

            let mut query = sqlx::query(&sql).bind(to_millis(now));
            for record in &records {
                query = query.bind(record.id);
            }
            query.execute(&mut *tx).await?;

            tx.commit().await?;

            tracing::debug!(count = records.len(), "Queued delayed messages");

            Ok(records.len())
        })
    }

    fn monitoring_api(&self) -> Arc<dyn MonitoringApi> {
        Arc::new(SqliteMonitoring::new(
            self.db.clone(),
            self.core.tables.clone(),
            self.core.clock.clone(),
        ))
    }
}
