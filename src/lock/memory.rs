//! Process-local lease lock for the in-memory store and for tests.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::BoxFuture;
use papaya::{Compute, Operation};

use crate::{
    clock::{Clock, SystemClock},
    error::Error,
};

use super::LeaseLock;

/// One lease row. Released rows stay in the table with no holder.
#[derive(Clone, Debug, Default)]
struct Lease {
    instance: Option<String>,
    last_lock_time: Option<DateTime<Utc>>,
}

impl Lease {
    fn held_by(&self, instance: &str) -> bool {
        self.instance.as_deref() == Some(instance)
    }
}

#[derive(Clone)]
pub struct MemoryLeaseLock {
    leases: Arc<papaya::HashMap<String, Lease>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryLeaseLock {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryLeaseLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::new(papaya::HashMap::new()),
            clock,
        }
    }

    /// Current holder of `key`, if any.
    pub fn holder(&self, key: &str) -> Option<String> {
        self.leases
            .pin()
            .get(key)
            .and_then(|lease| lease.instance.clone())
    }

    /// Whether a row exists for `key`, held or not.
    pub fn contains(&self, key: &str) -> bool {
        self.leases.pin().contains_key(key)
    }
}

impl LeaseLock for MemoryLeaseLock {
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
        instance: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let now = self.clock.now();
            let leases = self.leases.pin();

            let result = leases.compute(key.to_owned(), |entry| {
                let free = match entry {
                    None => true,
                    Some((_, lease)) => {
                        lease.instance.is_none()
                            || lease.held_by(instance)
                            || lease.last_lock_time.map_or(true, |at| at <= now - ttl)
                    }
                };

                if free {
                    Operation::Insert(Lease {
                        instance: Some(instance.to_owned()),
                        last_lock_time: Some(now),
                    })
                } else {
                    Operation::Abort(())
                }
            });

            let acquired = !matches!(result, Compute::Aborted(()));
            if acquired {
                tracing::debug!(key, instance, "Acquired lease");
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
            let now = self.clock.now();
            let leases = self.leases.pin();

            let result = leases.compute(key.to_owned(), |entry| match entry {
                Some((_, lease)) if lease.held_by(instance) => Operation::Insert(Lease {
                    last_lock_time: Some(now),
                    ..lease.clone()
                }),
                _ => Operation::Abort(()),
            });

            let renewed = matches!(result, Compute::Updated { .. });
            if !renewed {
                tracing::warn!(key, instance, "Lease renewal failed, lease may be lost");
            }

            Ok(renewed)
        })
    }

    fn release<'a>(&'a self, key: &'a str, instance: &'a str) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(async move {
            let leases = self.leases.pin();

            let result = leases.compute(key.to_owned(), |entry| match entry {
                Some((_, lease)) if lease.held_by(instance) => Operation::Insert(Lease::default()),
                _ => Operation::Abort(()),
            });

            Ok(matches!(result, Compute::Updated { .. }))
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (MemoryLeaseLock, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        (MemoryLeaseLock::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_lease_scenario() {
        let (lock, clock) = setup();
        let ttl = Duration::seconds(2);

        assert!(lock.acquire("L", ttl, "A").await.unwrap());
        assert!(!lock.acquire("L", ttl, "B").await.unwrap());

        clock.advance(Duration::milliseconds(2500));

        assert!(lock.acquire("L", ttl, "B").await.unwrap());
        assert!(!lock.renew("L", ttl, "A").await.unwrap());
        assert!(!lock.release("L", "A").await.unwrap());
        assert_eq!(lock.holder("L").as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_reacquire_by_holder_refreshes() {
        let (lock, clock) = setup();
        let ttl = Duration::seconds(2);

        assert!(lock.acquire("L", ttl, "A").await.unwrap());
        clock.advance(Duration::milliseconds(1500));
        assert!(lock.acquire("L", ttl, "A").await.unwrap());
        clock.advance(Duration::milliseconds(1500));
        assert!(!lock.acquire("L", ttl, "B").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_clears_the_holder_and_keeps_the_row() {
        let (lock, _clock) = setup();
        let ttl = Duration::seconds(30);

        assert!(lock.acquire("L", ttl, "A").await.unwrap());
        assert!(lock.release("L", "A").await.unwrap());
        assert_eq!(lock.holder("L"), None);
        assert!(lock.contains("L"));

        // A second release and a renew by the old holder take no effect.
        assert!(!lock.release("L", "A").await.unwrap());
        assert!(!lock.renew("L", ttl, "A").await.unwrap());

        assert!(lock.acquire("L", ttl, "B").await.unwrap());
        assert_eq!(lock.holder("L").as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_has_one_winner() {
        let (lock, _clock) = setup();
        let ttl = Duration::seconds(30);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let lock = lock.clone();
                tokio::spawn(async move {
                    lock.acquire("L", ttl, &format!("instance-{i}")).await.unwrap()
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
    }
}
