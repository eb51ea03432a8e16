//! Delivery status of a message record and the rules for moving between them.
//!
//! ```text
//! Scheduled --> Queued --> Succeeded
//!     |           |
//!     +--------> Failed --(retry sweep)--> Scheduled | Queued
//!
//! {Scheduled, Queued, Failed} --> Delayed --(scheduler sweep)--> Queued
//! ```
//!
//! `Succeeded` and `Failed` rows past their `expires_at` are removed by the
//! collector.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::Error;

/// Lifecycle state of a message record.
///
/// Stored as the literal variant name; parsing is case-insensitive.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
pub enum StatusName {
    /// Persisted, waiting for the first send attempt
    Scheduled,
    /// Handed to the transport, waiting for an acknowledgement
    Queued,
    /// Delivery confirmed
    Succeeded,
    /// Send or processing failed; retried while under the retry limit
    Failed,
    /// Parked until `expires_at`
    Delayed,
}

impl StatusName {
    pub fn parse(name: &str) -> Result<Self, Error> {
        name.parse()
            .map_err(|_| Error::invalid_argument(format!("unknown status `{name}`")))
    }

    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Rows in these states are eligible for cleanup once expired.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Rows in these states are picked up by the retry sweep.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Scheduled)
    }

    /// Whether a record may move from `self` to `next`.
    ///
    /// Rewriting the current status is always allowed; it is how a failed
    /// redelivery records its new retry count.
    pub fn can_transition_to(&self, next: StatusName) -> bool {
        use StatusName::*;

        if *self == next {
            return true;
        }

        matches!(
            (self, next),
            (Scheduled, Queued)
                | (Scheduled, Succeeded)
                | (Scheduled, Failed)
                | (Scheduled, Delayed)
                | (Queued, Succeeded)
                | (Queued, Failed)
                | (Queued, Delayed)
                | (Failed, Scheduled)
                | (Failed, Queued)
                | (Failed, Succeeded)
                | (Failed, Delayed)
                | (Delayed, Queued)
        )
    }

    pub fn ensure_transition(&self, next: StatusName) -> Result<(), Error> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::invalid_argument(format!(
                "cannot move a message from {self} to {next}"
            )))
        }
    }
}

/// How long terminal rows are kept before the collector may delete them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub succeeded: Duration,
    pub failed: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            succeeded: Duration::days(1),
            failed: Duration::days(15),
        }
    }
}

impl ExpiryPolicy {
    /// The `expires_at` a record should carry after moving to `status`.
    ///
    /// `Queued` always restarts the watchdog at `now`; the stuck-message
    /// sweep measures from there. `Scheduled` and `Delayed` keep whatever
    /// deadline the record already has.
    pub fn expires_at(
        &self,
        status: StatusName,
        now: DateTime<Utc>,
        current: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match status {
            StatusName::Succeeded => Some(now + self.succeeded),
            StatusName::Failed => Some(now + self.failed),
            StatusName::Queued => Some(now),
            StatusName::Scheduled | StatusName::Delayed => current,
        }
    }
}
