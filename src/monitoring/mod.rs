//! Read-only reporting over stored messages.
//!
//! Obtained from [`MessageStore::monitoring_api`](crate::store::MessageStore::monitoring_api)
//! and served over HTTP by [`crate::api::monitoring`].

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    message::{MessageKind, MessageRecord},
    status::StatusName,
};

pub mod memory;
pub mod sqlite;

/// Number of hourly buckets returned by [`MonitoringApi::hourly_counts`].
pub const TIMELINE_HOURS: i64 = 24;

pub const MAX_PAGE_SIZE: u32 = 500;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub scheduled: u64,
    pub queued: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: StatusName, count: u64) {
        let slot = match status {
            StatusName::Scheduled => &mut self.scheduled,
            StatusName::Queued => &mut self.queued,
            StatusName::Succeeded => &mut self.succeeded,
            StatusName::Failed => &mut self.failed,
            StatusName::Delayed => &mut self.delayed,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        self.scheduled + self.queued + self.succeeded + self.failed + self.delayed
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub published: StatusCounts,
    pub received: StatusCounts,
}

impl Statistics {
    pub fn kind_mut(&mut self, kind: MessageKind) -> &mut StatusCounts {
        match kind {
            MessageKind::Published => &mut self.published,
            MessageKind::Received => &mut self.received,
        }
    }
}

/// Filter for [`MonitoringApi::messages`]. Pages start at 1.
#[derive(Clone, Debug, PartialEq, bon::Builder)]
pub struct MessageQuery {
    pub kind: MessageKind,
    pub status: Option<StatusName>,
    /// Substring of the message name
    #[builder(into)]
    pub name: Option<String>,
    #[builder(default = 1)]
    pub page: u32,
    #[builder(default = 20)]
    pub page_size: u32,
}

impl MessageQuery {
    pub fn validate(&self) -> Result<(), Error> {
        if self.page == 0 {
            return Err(Error::invalid_argument("page numbers start at 1"));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(Error::invalid_argument(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        (self.page as u64 - 1) * self.page_size as u64
    }

    pub(crate) fn matches(&self, record: &MessageRecord) -> bool {
        self.status.map_or(true, |status| record.status == status)
            && self
                .name
                .as_deref()
                .map_or(true, |name| record.name.contains(name))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PagedMessages {
    pub items: Vec<MessageRecord>,
    /// Matches across all pages
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyCount {
    /// Start of the hour
    pub hour: DateTime<Utc>,
    pub count: u64,
}

pub trait MonitoringApi: Send + Sync + 'static {
    fn statistics(&self) -> BoxFuture<'_, Result<Statistics, Error>>;

    /// Fails with [`Error::NotFound`] if there is no such record.
    fn message(&self, kind: MessageKind, id: i64) -> BoxFuture<'_, Result<MessageRecord, Error>>;

    /// Matching records, newest first.
    fn messages<'a>(&'a self, query: &'a MessageQuery) -> BoxFuture<'a, Result<PagedMessages, Error>>;

    /// Records added with `status` in each of the last [`TIMELINE_HOURS`]
    /// hours, oldest hour first. The last bucket is the current hour.
    fn hourly_counts(
        &self,
        kind: MessageKind,
        status: StatusName,
    ) -> BoxFuture<'_, Result<Vec<HourlyCount>, Error>>;
}

/// Start of the first timeline bucket ending at the hour containing `now`.
pub(crate) fn timeline_start(now: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
    let hour = now
        .duration_trunc(TimeDelta::hours(1))
        .map_err(Error::internal)?;

    Ok(hour - TimeDelta::hours(TIMELINE_HOURS - 1))
}

/// Expands sparse `(hour, count)` pairs into the full timeline.
pub(crate) fn fill_timeline(
    start: DateTime<Utc>,
    counts: impl IntoIterator<Item = (DateTime<Utc>, u64)>,
) -> Vec<HourlyCount> {
    let mut timeline: Vec<_> = (0..TIMELINE_HOURS)
        .map(|i| HourlyCount {
            hour: start + TimeDelta::hours(i),
            count: 0,
        })
        .collect();

    for (hour, count) in counts {
        let index = (hour - start).num_hours();
        if let Some(bucket) = usize::try_from(index)
            .ok()
            .and_then(|i| timeline.get_mut(i))
        {
            bucket.count += count;
        }
    }

    timeline
}
