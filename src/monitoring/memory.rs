use std::sync::Arc;

use chrono::{DurationRound, TimeDelta};
use futures_util::future::BoxFuture;
use itertools::Itertools;

use crate::{
    clock::Clock,
    error::Error,
    message::{MessageKind, MessageRecord},
    status::StatusName,
    store::memory::Records,
};

use super::{
    fill_timeline, timeline_start, HourlyCount, MessageQuery, MonitoringApi, PagedMessages,
    Statistics,
};

#[derive(Clone)]
pub struct MemoryMonitoring {
    published: Records,
    received: Records,
    clock: Arc<dyn Clock>,
}

impl MemoryMonitoring {
    pub(crate) fn new(published: Records, received: Records, clock: Arc<dyn Clock>) -> Self {
        Self {
            published,
            received,
            clock,
        }
    }

    fn records(&self, kind: MessageKind) -> &Records {
        match kind {
            MessageKind::Published => &self.published,
            MessageKind::Received => &self.received,
        }
    }
}

impl MonitoringApi for MemoryMonitoring {
    fn statistics(&self) -> BoxFuture<'_, Result<Statistics, Error>> {
        Box::pin(async move {
            let mut stats = Statistics::default();

            for kind in MessageKind::ALL {
                let counts = stats.kind_mut(kind);
                for record in self.records(kind).pin().values() {
                    counts.add(record.status, 1);
                }
            }

            Ok(stats)
        })
    }

    fn message(&self, kind: MessageKind, id: i64) -> BoxFuture<'_, Result<MessageRecord, Error>> {
        Box::pin(async move {
            self.records(kind)
                .pin()
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::message_not_found(kind, id))
        })
    }

    fn messages<'a>(&'a self, query: &'a MessageQuery) -> BoxFuture<'a, Result<PagedMessages, Error>> {
        Box::pin(async move {
            query.validate()?;

            let matching: Vec<MessageRecord> = self
                .records(query.kind)
                .pin()
                .values()
                .filter(|record| query.matches(record))
                .cloned()
                .sorted_by(|a, b| (b.added, b.id).cmp(&(a.added, a.id)))
                .collect();

            Ok(PagedMessages {
                total: matching.len() as u64,
                items: matching
                    .into_iter()
                    .skip(query.offset() as usize)
                    .take(query.page_size as usize)
                    .collect(),
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

            let counts = self
                .records(kind)
                .pin()
                .values()
                .filter(|record| record.status == status && record.added >= start)
                .filter_map(|record| record.added.duration_trunc(TimeDelta::hours(1)).ok())
                .counts();

            Ok(fill_timeline(
                start,
                counts
                    .into_iter()
                    .map(|(hour, count)| (hour, count as u64)),
            ))
        })
    }
}
