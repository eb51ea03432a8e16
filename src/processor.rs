//! Background sweeps that keep stored messages moving.
//!
//! - the retry sweep resends `Failed` and stale `Scheduled` messages
//! - the scheduler sweep dispatches due `Delayed` and stuck `Queued` messages
//! - the collector deletes expired terminal messages in bounded batches
//!
//! With `use_storage_lock` each sweep first takes a lease so that only one
//! instance sharing the datastore runs it at a time. Without it, every
//! instance sweeps; delivery is at-least-once either way.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::BoxFuture;
use strum::Display;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::{Clock, SystemClock},
    error::Error,
    lock::{collect_lock_key, retry_lock_key, schedule_lock_key, LeaseLock},
    message::{MessageKind, MessageRecord, HEADER_EXCEPTION},
    serializer::{JsonSerializer, Serializer},
    status::StatusName,
    store::{DelayedDispatch, MessageStore, Transaction},
};

/// Delivers a message: published records go to the broker, received records
/// to their consumer.
pub trait Transport: Send + Sync + 'static {
    fn send<'a>(
        &'a self,
        kind: MessageKind,
        record: &'a MessageRecord,
    ) -> BoxFuture<'a, Result<(), Error>>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessorOptions {
    pub version: String,
    /// Matches the store's retry limit; only used to report exhaustion
    pub retry_limit: u32,
    /// Minimum age before a message is retried
    pub retry_lookback: chrono::Duration,
    pub retry_interval: Duration,
    pub scheduler_interval: Duration,
    pub cleanup_interval: Duration,
    pub cleanup_batch_size: u32,
    pub use_storage_lock: bool,
    pub lease_ttl: chrono::Duration,
    /// Lease holder name of this process
    pub instance: String,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            version: "v1".to_owned(),
            retry_limit: 50,
            retry_lookback: chrono::Duration::minutes(4),
            retry_interval: Duration::from_secs(60),
            scheduler_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
            cleanup_batch_size: 1000,
            use_storage_lock: false,
            lease_ttl: chrono::Duration::seconds(70),
            instance: "letterbox".to_owned(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
enum Sweep {
    Retry,
    Schedule,
    Collect,
}

/// Sends every record of a scheduler sweep through the transport, inside
/// the sweep's transaction.
struct TransportDispatch<'t> {
    transport: &'t dyn Transport,
    sent: Mutex<Vec<MessageRecord>>,
}

impl DelayedDispatch for TransportDispatch<'_> {
    fn dispatch<'a>(
        &'a self,
        _tx: &'a mut Transaction<'_>,
        records: &'a [MessageRecord],
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            for record in records {
                self.transport.send(MessageKind::Published, record).await?;
            }

            self.sent
                .lock()
                .map_err(|_| Error::internal(eyre::eyre!("dispatch buffer poisoned")))?
                .extend_from_slice(records);

            Ok(())
        })
    }
}

#[derive(Clone)]
pub struct Processor {
    store: Arc<dyn MessageStore>,
    lock: Arc<dyn LeaseLock>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    serializer: Arc<dyn Serializer>,
    options: Arc<ProcessorOptions>,
}

#[bon::bon]
impl Processor {
    #[builder]
    pub fn new(
        store: Arc<dyn MessageStore>,
        lock: Arc<dyn LeaseLock>,
        transport: Arc<dyn Transport>,
        clock: Option<Arc<dyn Clock>>,
        serializer: Option<Arc<dyn Serializer>>,
        #[builder(default)] options: ProcessorOptions,
    ) -> Self {
        Self {
            store,
            lock,
            transport,
            clock: clock.unwrap_or_else(|| Arc::new(SystemClock)),
            serializer: serializer.unwrap_or_else(|| Arc::new(JsonSerializer)),
            options: Arc::new(options),
        }
    }
}

impl Processor {
    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Starts the three sweep loops. They stop at the next await point after
    /// `token` is cancelled; an interrupted sweep rolls back.
    pub fn spawn(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        [
            (Sweep::Retry, self.options.retry_interval),
            (Sweep::Schedule, self.options.scheduler_interval),
            (Sweep::Collect, self.options.cleanup_interval),
        ]
        .into_iter()
        .map(|(sweep, period)| {
            let processor = self.clone();
            let token = token.clone();
            tokio::spawn(async move { processor.run_loop(sweep, period, token).await })
        })
        .collect()
    }

    async fn run_loop(self, sweep: Sweep, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(%sweep, ?period, "Starting sweep loop");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = self.sweep(sweep) => result,
            };

            match result {
                Ok(0) => {}
                Ok(count) => tracing::info!(%sweep, count, "Sweep finished"),
                Err(e) => tracing::error!(%sweep, error = %e, "Sweep failed"),
            }
        }

        tracing::info!(%sweep, "Stopped sweep loop");
    }

    async fn sweep(&self, sweep: Sweep) -> Result<usize, Error> {
        match sweep {
            Sweep::Retry => self.retry_once().await,
            Sweep::Schedule => self.schedule_once().await,
            Sweep::Collect => self.collect_once().await.map(|n| n as usize),
        }
    }

    /// Runs `work` under the lease `key`, or skips it if another instance
    /// holds the lease. Returns `None` when skipped.
    async fn with_lease<'a, T>(
        &'a self,
        key: &'a str,
        work: impl std::future::Future<Output = Result<T, Error>> + 'a,
    ) -> Result<Option<T>, Error> {
        if !self.options.use_storage_lock {
            return work.await.map(Some);
        }

        let instance = &self.options.instance;

        if !self.lock.acquire(key, self.options.lease_ttl, instance).await? {
            tracing::debug!(key, "Lease held by another instance, skipping");
            return Ok(None);
        }

        let result = work.await;

        if let Err(e) = self.lock.release(key, instance).await {
            tracing::warn!(key, error = %e, "Failed to release lease");
        }

        result.map(Some)
    }

    /// One retry pass over both kinds. Returns the number of records resent.
    #[tracing::instrument(skip(self), fields(instance = %self.options.instance))]
    pub async fn retry_once(&self) -> Result<usize, Error> {
        let mut total = 0;

        for kind in MessageKind::ALL {
            let key = retry_lock_key(kind, &self.options.version);
            total += self
                .with_lease(&key, self.retry_kind(kind, &key))
                .await?
                .unwrap_or(0);
        }

        Ok(total)
    }

    async fn retry_kind(&self, kind: MessageKind, key: &str) -> Result<usize, Error> {
        let records = self
            .store
            .get_messages_needing_retry(kind, self.options.retry_lookback)
            .await?;

        let mut processed = 0;

        for mut record in records {
            if self.options.use_storage_lock
                && processed > 0
                && !self
                    .lock
                    .renew(key, self.options.lease_ttl, &self.options.instance)
                    .await?
            {
                break;
            }

            match self.transport.send(kind, &record).await {
                Ok(()) => {
                    self.change_state(kind, &mut record, StatusName::Succeeded)
                        .await?;
                }
                Err(e) => {
                    record.retries += 1;
                    self.record_exception(&mut record, &e);
                    self.change_state(kind, &mut record, StatusName::Failed)
                        .await?;

                    if record.retries >= self.options.retry_limit {
                        tracing::warn!(
                            id = record.id,
                            %kind,
                            name = %record.name,
                            retries = record.retries,
                            error = %e,
                            "Retries exhausted, message stays failed"
                        );
                    } else {
                        tracing::warn!(id = record.id, %kind, retries = record.retries, error = %e, "Retry failed");
                    }
                }
            }

            processed += 1;
        }

        Ok(processed)
    }

    /// Stamps the delivery error into the content headers. Content that
    /// does not deserialize is left untouched.
    fn record_exception(&self, record: &mut MessageRecord, error: &Error) {
        let Some(content) = record.content.as_deref() else {
            return;
        };

        let stamped = self.serializer.deserialize(content).and_then(|message| {
            self.serializer
                .serialize(&message.with_header(HEADER_EXCEPTION, error.to_string()))
        });

        match stamped {
            Ok(content) => record.content = Some(content),
            Err(e) => tracing::debug!(id = record.id, error = %e, "Keeping undecodable content"),
        }
    }

    async fn change_state(
        &self,
        kind: MessageKind,
        record: &mut MessageRecord,
        status: StatusName,
    ) -> Result<(), Error> {
        match kind {
            MessageKind::Published => {
                self.store
                    .change_publish_state(record, status, None)
                    .await
            }
            MessageKind::Received => self.store.change_receive_state(record, status).await,
        }
    }

    /// One scheduler pass. Returns the number of records dispatched.
    #[tracing::instrument(skip(self), fields(instance = %self.options.instance))]
    pub async fn schedule_once(&self) -> Result<usize, Error> {
        let key = schedule_lock_key(&self.options.version);
        Ok(self
            .with_lease(&key, self.schedule_delayed())
            .await?
            .unwrap_or(0))
    }

    async fn schedule_delayed(&self) -> Result<usize, Error> {
        let dispatch = TransportDispatch {
            transport: self.transport.as_ref(),
            sent: Mutex::new(Vec::new()),
        };

        let count = self.store.schedule_delayed(&dispatch).await?;

        let sent = dispatch
            .sent
            .into_inner()
            .map_err(|_| Error::internal(eyre::eyre!("dispatch buffer poisoned")))?;

        for mut record in sent {
            // The sweep committed them as Queued.
            record.status = StatusName::Queued;
            self.store
                .change_publish_state(&mut record, StatusName::Succeeded, None)
                .await?;
        }

        Ok(count)
    }

    /// Deletes expired terminal records of both kinds until a batch comes
    /// back short. Returns the number deleted.
    #[tracing::instrument(skip(self), fields(instance = %self.options.instance))]
    pub async fn collect_once(&self) -> Result<u64, Error> {
        let key = collect_lock_key(&self.options.version);
        Ok(self
            .with_lease(&key, self.collect_expired())
            .await?
            .unwrap_or(0))
    }

    async fn collect_expired(&self) -> Result<u64, Error> {
        let batch = self.options.cleanup_batch_size;
        let mut total = 0;

        for kind in MessageKind::ALL {
            loop {
                let deleted = self
                    .store
                    .delete_expired(kind, self.clock.now(), batch)
                    .await?;
                total += deleted;

                if deleted < batch as u64 {
                    break;
                }
            }
        }

        Ok(total)
    }
}
