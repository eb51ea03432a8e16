//! Time-ordered 64-bit identifiers for message rows.
//!
//! Layout, most significant first: 1 unused sign bit, 41 bits of milliseconds
//! since [`EPOCH_MILLIS`], 10 bits of worker id, 12 bits of per-millisecond
//! sequence. Ids from one generator are strictly increasing; ids from
//! different workers only interleave within the same millisecond.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// 2015-01-01T00:00:00Z
pub const EPOCH_MILLIS: i64 = 1_420_070_400_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

pub const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug)]
pub struct SnowflakeId {
    worker_id: u64,
    /// `(last_millis << SEQUENCE_BITS) | sequence`
    state: AtomicU64,
}

impl SnowflakeId {
    /// Worker ids wrap at [`MAX_WORKER_ID`].
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: (worker_id & MAX_WORKER_ID) as u64,
            state: AtomicU64::new(0),
        }
    }

    pub fn random() -> Self {
        Self::new(rand::random::<u16>() & MAX_WORKER_ID)
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id as u16
    }

    pub fn next_id(&self) -> i64 {
        loop {
            let now = current_millis();
            let prev = self.state.load(Ordering::Acquire);
            let prev_millis = prev >> SEQUENCE_BITS;

            // A clock that stepped backwards keeps issuing from the last seen
            // millisecond rather than reusing old ids.
            let next = if now > prev_millis {
                now << SEQUENCE_BITS
            } else if prev & SEQUENCE_MASK < SEQUENCE_MASK {
                prev + 1
            } else {
                (prev_millis + 1) << SEQUENCE_BITS
            };

            if self
                .state
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let millis = next >> SEQUENCE_BITS;
                let sequence = next & SEQUENCE_MASK;

                return ((millis << (WORKER_BITS + SEQUENCE_BITS))
                    | (self.worker_id << SEQUENCE_BITS)
                    | sequence) as i64;
            }
        }
    }
}

impl Default for SnowflakeId {
    fn default() -> Self {
        Self::random()
    }
}

fn current_millis() -> u64 {
    (Utc::now().timestamp_millis() - EPOCH_MILLIS).max(0) as u64
}
