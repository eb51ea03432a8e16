use std::sync::Arc;

use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::Data,
    App, HttpServer,
};
use config::Config;
use lock::LeaseLock;
use monitoring::MonitoringApi;
use processor::{Processor, Transport};
use store::{MessageStore, SqliteStore};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod message;
pub mod monitoring;
pub mod processor;
pub mod serializer;
pub mod snowflake;
pub mod status;
pub mod store;

/// Returns a builder for the main application: the SQLite store, the
/// background sweeps delivering through `transport`, and the monitoring
/// HTTP routes.
#[bon::builder(finish_fn = start)]
pub async fn run<T>(transport: T) -> eyre::Result<()>
where
    T: Transport,
{
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("LETTERBOX_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("LETTERBOX_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;

    let store = SqliteStore::connect_with(&config).await?;
    let lock: Arc<dyn LeaseLock> = Arc::new(store.lease_lock());
    let monitoring: Data<dyn MonitoringApi> = Data::from(store.monitoring_api());

    let processor = Processor::builder()
        .store(Arc::new(store.clone()))
        .lock(lock)
        .transport(Arc::new(transport))
        .clock(store.clock())
        .options(config.processor_options()?)
        .build();

    tracing::info!(
        instance = %processor.options().instance,
        db = config.db_path(),
        "Starting letterbox"
    );

    let token = CancellationToken::new();
    let sweeps = processor.spawn(token.clone());

    HttpServer::new(move || {
        App::new()
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .wrap(TracingLogger::default())
            .service(api::monitoring::service())
            .app_data(monitoring.clone())
    })
    .bind(config.bind_addr())?
    .run()
    .await?;

    token.cancel();
    for sweep in sweeps {
        sweep.await?;
    }

    Ok(())
}
