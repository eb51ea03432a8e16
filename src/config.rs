use std::time::Duration;

use rand::distributions::{Alphanumeric, DistString};
use serde::Deserialize;

use chrono::TimeDelta;

use crate::{
    error::Error,
    processor::ProcessorOptions,
    store::{StoreOptions, MAX_EXPIRY},
};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub table_prefix: Option<String>,
    pub version: Option<String>,

    pub retry_limit: Option<u32>,
    pub retry_lookback_secs: Option<u64>,
    pub retry_interval_secs: Option<u64>,
    pub retry_page_size: Option<u32>,

    pub scheduler_batch_size: Option<u32>,
    pub scheduler_interval_secs: Option<u64>,

    pub cleanup_batch_size: Option<u32>,
    pub cleanup_interval_secs: Option<u64>,

    pub succeeded_expiry_secs: Option<u64>,
    pub failed_expiry_secs: Option<u64>,

    pub use_storage_lock: Option<bool>,
    pub lease_ttl_secs: Option<u64>,
    pub instance: Option<String>,
    pub worker_id: Option<u16>,

    pub bind_addr: Option<String>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("LETTERBOX_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or("letterbox.db")
    }

    pub fn table_prefix(&self) -> &str {
        self.table_prefix.as_deref().unwrap_or("letterbox")
    }

    pub fn version(&self) -> &str {
        self.version.as_deref().unwrap_or("v1")
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.unwrap_or(60))
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs.unwrap_or(60))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.unwrap_or(300))
    }

    /// Defaults to ten seconds longer than one retry pass so a live holder
    /// renews before anyone else can take over.
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.retry_interval().saturating_add(Duration::from_secs(10)))
    }

    pub fn use_storage_lock(&self) -> bool {
        self.use_storage_lock.unwrap_or(false)
    }

    pub fn instance(&self) -> String {
        self.instance.clone().unwrap_or_else(|| {
            format!(
                "letterbox-{}",
                Alphanumeric.sample_string(&mut rand::thread_rng(), 8)
            )
        })
    }

    pub fn worker_id(&self) -> Option<u16> {
        self.worker_id
    }

    pub fn bind_addr(&self) -> &str {
        self.bind_addr.as_deref().unwrap_or("127.0.0.1:8080")
    }

    pub fn store_options(&self) -> Result<StoreOptions, Error> {
        let defaults = StoreOptions::default();

        let options = StoreOptions {
            table_prefix: self.table_prefix().to_owned(),
            version: self.version().to_owned(),
            retry_limit: self.retry_limit.unwrap_or(defaults.retry_limit),
            retry_page_size: self.retry_page_size.unwrap_or(defaults.retry_page_size),
            scheduler_batch_size: self
                .scheduler_batch_size
                .unwrap_or(defaults.scheduler_batch_size),
            succeeded_expiry: self
                .succeeded_expiry_secs
                .map(|s| seconds("succeeded expiry", s))
                .transpose()?
                .unwrap_or(defaults.succeeded_expiry),
            failed_expiry: self
                .failed_expiry_secs
                .map(|s| seconds("failed expiry", s))
                .transpose()?
                .unwrap_or(defaults.failed_expiry),
        };
        options.validate()?;

        Ok(options)
    }

    pub fn processor_options(&self) -> Result<ProcessorOptions, Error> {
        Ok(ProcessorOptions {
            version: self.version().to_owned(),
            retry_limit: self.store_options()?.retry_limit,
            retry_lookback: seconds("retry lookback", self.retry_lookback_secs.unwrap_or(240))?,
            retry_interval: self.retry_interval(),
            scheduler_interval: self.scheduler_interval(),
            cleanup_interval: self.cleanup_interval(),
            cleanup_batch_size: self.cleanup_batch_size.unwrap_or(1000),
            use_storage_lock: self.use_storage_lock(),
            lease_ttl: seconds("lease ttl", self.lease_ttl().as_secs())?,
            instance: self.instance(),
        })
    }
}

/// Whole seconds as a [`TimeDelta`], bounded by [`MAX_EXPIRY`] so adding it to
/// a timestamp cannot overflow.
fn seconds(what: &str, secs: u64) -> Result<TimeDelta, Error> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .filter(|delta| *delta <= MAX_EXPIRY)
        .ok_or_else(|| Error::invalid_argument(format!("{what} of {secs}s is out of range")))
}
