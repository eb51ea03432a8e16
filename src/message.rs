//! Message records for the outbox and the inbox.
//!
//! Outgoing messages are stored as [`MessageKind::Published`] records inside the
//! business transaction that produced them. Incoming messages are stored as
//! [`MessageKind::Received`] records before they are handed to a consumer.
//! Both share one shape, [`MessageRecord`]; received records also carry the
//! consumer group.
//!
//! # Record Lifecycle
//!
//! 1. Records are created in `Scheduled` status with `retries = 0`
//! 2. Transport and consumer callbacks move them through the
//!    [`StatusName`](crate::status::StatusName) state machine
//! 3. Terminal records past `expires_at` are deleted by the collector

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use strum::{Display, EnumString};

use crate::{clock::from_millis, error::Error, status::StatusName};

/// Header carrying the message id once a message has been persisted.
pub const HEADER_MESSAGE_ID: &str = "letterbox-msg-id";
/// Header carrying the logical message name.
pub const HEADER_MESSAGE_NAME: &str = "letterbox-msg-name";
/// Header carrying the consumer group of a received message.
pub const HEADER_GROUP: &str = "letterbox-msg-group";
/// Header recording the last delivery error.
pub const HEADER_EXCEPTION: &str = "letterbox-exception";

/// Which side of the store a record lives on.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Published,
    Received,
}

impl MessageKind {
    pub const ALL: [MessageKind; 2] = [MessageKind::Published, MessageKind::Received];

    /// Parses a kind name coming from outside the crate.
    pub fn parse(name: &str) -> Result<Self, Error> {
        name.parse()
            .map_err(|_| Error::invalid_argument(format!("unknown message kind `{name}`")))
    }
}

/// Payload of a message before it is serialized into a record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Arbitrary key-value pairs travelling with the message
    pub headers: BTreeMap<String, String>,
    /// The message body
    pub value: Option<serde_json::Value>,
}

impl Message {
    pub fn new(value: impl Serialize) -> Result<Self, Error> {
        Ok(Self {
            headers: BTreeMap::new(),
            value: Some(serde_json::to_value(value)?),
        })
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// A persisted message, as read from and written to storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Time-ordered unique id
    pub id: i64,
    /// Logical message or event name
    pub name: String,
    /// Consumer group; only set on received records
    pub group: Option<String>,
    /// Serialized payload; `None` only for corrupted rows
    pub content: Option<String>,
    /// Number of failed delivery attempts
    pub retries: u32,
    pub added: DateTime<Utc>,
    /// Cleanup deadline, dispatch time or watchdog deadline depending on `status`
    pub expires_at: Option<DateTime<Utc>>,
    pub status: StatusName,
    /// Shard or tenant tag of the datastore holding the row
    pub data_source: Option<String>,
    pub version: Option<String>,
}

impl MessageRecord {
    /// Whether the retry sweep may pick this record up again.
    pub fn can_retry(&self, retry_limit: u32) -> bool {
        self.status.is_retryable() && self.retries < retry_limit
    }
}

/// Row shape shared by both message tables.
#[derive(Debug, FromRow)]
pub(crate) struct MessageRow {
    pub id: i64,
    pub name: String,
    pub grp: Option<String>,
    pub content: Option<String>,
    pub retries: i64,
    pub added: i64,
    pub expires_at: Option<i64>,
    pub status: String,
    pub data_source: Option<String>,
    pub version: Option<String>,
}

impl TryFrom<MessageRow> for MessageRecord {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            group: row.grp,
            content: row.content,
            retries: row.retries.max(0) as u32,
            added: from_millis(row.added),
            expires_at: row.expires_at.map(from_millis),
            status: StatusName::parse(&row.status)?,
            data_source: row.data_source,
            version: row.version,
        })
    }
}
