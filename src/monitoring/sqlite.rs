use std::sync::Arc;

use futures_util::future::BoxFuture;
use sqlx::SqlitePool;

use crate::{
    clock::{from_millis, to_millis, Clock},
    error::Error,
    message::{MessageKind, MessageRecord, MessageRow},
    status::StatusName,
    store::{sqlite::row_columns, TableNames},
};

use super::{
    fill_timeline, timeline_start, HourlyCount, MessageQuery, MonitoringApi, PagedMessages,
    Statistics,
};

const HOUR_MILLIS: i64 = 3_600_000;

#[derive(Clone)]
pub struct SqliteMonitoring {
    db: SqlitePool,
    tables: TableNames,
    clock: Arc<dyn Clock>,
}

impl SqliteMonitoring {
    pub fn new(db: SqlitePool, tables: TableNames, clock: Arc<dyn Clock>) -> Self {
        Self { db, tables, clock }
    }
}

impl MonitoringApi for SqliteMonitoring {
    fn statistics(&self) -> BoxFuture<'_, Result<Statistics, Error>> {
        Box::pin(async move {
            let mut stats = Statistics::default();

            for kind in MessageKind::ALL {
                let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
                    "SELECT status, COUNT(*) FROM {} GROUP BY status",
                    self.tables.messages(kind)
                ))
                .fetch_all(&self.db)
                .await?;

                for (status, count) in rows {
                    stats
                        .kind_mut(kind)
                        .add(StatusName::parse(&status)?, count.max(0) as u64);
                }
            }

            Ok(stats)
        })
    }

    fn message(&self, kind: MessageKind, id: i64) -> BoxFuture<'_, Result<MessageRecord, Error>> {
        Box::pin(async move {
            let row: Option<MessageRow> = sqlx::query_as(&format!(
                "SELECT {} FROM {} WHERE id = $1",
                row_columns(kind),
                self.tables.messages(kind)
            ))
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

            match row {
                Some(row) => MessageRecord::try_from(row),
                None => Err(Error::message_not_found(kind, id)),
            }
        })
    }

    fn messages<'a>(&'a self, query: &'a MessageQuery) -> BoxFuture<'a, Result<PagedMessages, Error>> {
        Box::pin(async move {
            query.validate()?;

            let table = self.tables.messages(query.kind);
            let filter = "($1 IS NULL OR status = $1) AND ($2 IS NULL OR instr(name, $2) > 0)";
            let status = query.status.map(|s| s.as_str());

            let total: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {table} WHERE {filter}"
            ))
            .bind(status)
            .bind(query.name.as_deref())
            .fetch_one(&self.db)
            .await?;

            let rows: Vec<MessageRow> = sqlx::query_as(&format!(
                "
                SELECT {columns} FROM {table}
                WHERE {filter}
                ORDER BY added DESC, id DESC
                LIMIT $3 OFFSET $4
                ",
                columns = row_columns(query.kind)
            ))
            .bind(status)
            .bind(query.name.as_deref())
            .bind(query.page_size as i64)
            .bind(query.offset() as i64)
            .fetch_all(&self.db)
            .await?;

            Ok(PagedMessages {
                items: rows
                    .into_iter()
                    .map(MessageRecord::try_from)
                    .collect::<Result<_, _>>()?,
                total: total.max(0) as u64,
                page: query.page,
                page_size: query.page_size,
            })
        })
    }

    fn hourly_counts(
        &self,
        kind: MessageKind,
        status: StatusName,
    ) -> BoxFuture<'_, Result<Vec<HourlyCount>, Error>> {
        Box::pin(async move {
            let start = timeline_start(self.clock.now())?;

            let rows: Vec<(i64, i64)> = sqlx::query_as(&format!(
                "
                SELECT (added / {HOUR_MILLIS}) * {HOUR_MILLIS} AS hour, COUNT(*)
                FROM {}
                WHERE status = $1 AND added >= $2
                GROUP BY hour
                ",
                self.tables.messages(kind)
            ))
            .bind(status.as_str())
            .bind(to_millis(start))
            .fetch_all(&self.db)
            .await?;

            Ok(fill_timeline(
                start,
                rows.into_iter()
                    .map(|(hour, count)| (from_millis(hour), count.max(0) as u64)),
            ))
        })
    }
}
