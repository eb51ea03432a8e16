//! Lease lock stored as one row per key in the `<prefix>_lock` table.

use std::sync::Arc;

use chrono::Duration;
use futures_util::future::BoxFuture;
use sqlx::SqlitePool;

use crate::{
    clock::{to_millis, Clock},
    error::Error,
    store::{SqliteStore, TableNames},
};

use super::LeaseLock;

#[derive(Clone)]
pub struct SqliteLeaseLock {
    db: SqlitePool,
    table: String,
    clock: Arc<dyn Clock>,
}

impl SqliteLeaseLock {
    /// The lock table must already exist, see [`SqliteStore::initialize`].
    pub fn new(db: SqlitePool, tables: &TableNames, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            table: tables.lock().to_owned(),
            clock,
        }
    }

    /// Current holder of `key`, if the row exists and is not released.
    pub async fn holder(&self, key: &str) -> Result<Option<String>, Error> {
        let holder: Option<Option<String>> =
            sqlx::query_scalar(&format!("SELECT instance FROM {} WHERE key = $1", self.table))
                .bind(key)
                .fetch_optional(&self.db)
                .await?;

        Ok(holder.flatten())
    }
}

impl SqliteStore {
    /// A lease lock sharing this store's database and clock.
    pub fn lease_lock(&self) -> SqliteLeaseLock {
        SqliteLeaseLock::new(self.db().clone(), self.tables(), self.clock())
    }
}

impl LeaseLock for SqliteLeaseLock {
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
        instance: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let now = self.clock.now();
            let table = &self.table;

            // Insert-or-take-over in one statement; two racing instances
            // cannot both see the row as free.
            let acquired = sqlx::query(&format!(
                "
                INSERT INTO {table} (key, instance, last_lock_time)
                VALUES ($1, $2, $3)
                ON CONFLICT (key) DO UPDATE
                SET instance = excluded.instance, last_lock_time = excluded.last_lock_time
                WHERE {table}.instance IS NULL
                    OR {table}.last_lock_time IS NULL
                    OR {table}.last_lock_time <= $4
                    OR {table}.instance = excluded.instance
                "
            ))
            .bind(key)
            .bind(instance)
            .bind(to_millis(now))
            .bind(to_millis(now - ttl))
            .execute(&self.db)
            .await?
            .rows_affected()
                > 0;

            if acquired {
                tracing::debug!(key, instance, "Acquired lease");
            } else {
                tracing::trace!(key, instance, "Lease held elsewhere");
            }

            Ok(acquired)
        })
    }

    fn renew<'a>(
        &'a self,
        key: &'a str,
        _ttl: Duration,
        instance: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let renewed = sqlx::query(&format!(
                "UPDATE {} SET last_lock_time = $1 WHERE key = $2 AND instance = $3",
                self.table
            ))
            .bind(to_millis(self.clock.now()))
            .bind(key)
            .bind(instance)
            .execute(&self.db)
            .await?
            .rows_affected()
                > 0;

            if !renewed {
                tracing::warn!(key, instance, "Lease renewal failed, lease may be lost");
            }

            Ok(renewed)
        })
    }

    fn release<'a>(&'a self, key: &'a str, instance: &'a str) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let released = sqlx::query(&format!(
                "
                UPDATE {}
                SET instance = NULL, last_lock_time = NULL
                WHERE key = $1 AND instance = $2
                ",
                self.table
            ))
            .bind(key)
            .bind(instance)
            .execute(&self.db)
            .await?
            .rows_affected()
                > 0;

            tracing::debug!(key, instance, released, "Released lease");

            Ok(released)
        })
    }
}
