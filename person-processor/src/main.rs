//! Resolve incoming events to persons and emit them enriched with person state.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use person_processor::api::{self, AppState};
use person_processor::config::{Config, LogFormat, StoreBackend};
use person_processor::dedup::{DedupStore, Deduplicator, MemoryDedupStore, PgDedupStore};
use person_processor::health::HealthRegistry;
use person_processor::metrics::{serve, setup_metrics_recorder};
use person_processor::pipeline::EventPipeline;
use person_processor::resolver::IdentityResolver;
use person_processor::retry::RetryPolicy;
use person_processor::sink::{OverflowSink, PgOverflowSink, StdoutSink};
use person_processor::store::{MemoryPersonStore, PersonStore, PgPersonStore};
use person_processor::worker::Worker;

const DEDUP_PURGE_INTERVAL: Duration = Duration::from_secs(300);

struct Backends {
    persons: Arc<dyn PersonStore>,
    dedup: Arc<dyn DedupStore>,
    overflow: Arc<dyn OverflowSink>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(filter)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_filter(filter).boxed(),
    };
    tracing_subscriber::registry().with(log_layer).init();
}

async fn connect(config: &Config, stdout: Arc<StdoutSink>) -> Result<Backends> {
    match config.store_backend {
        StoreBackend::Memory => {
            info!("using in-memory stores");
            Ok(Backends {
                persons: Arc::new(MemoryPersonStore::new()),
                dedup: Arc::new(MemoryDedupStore::new(config.dedup_cache_capacity)),
                overflow: stdout,
            })
        }
        StoreBackend::Postgres => {
            let store = PgPersonStore::new(&config.database_url, config.max_pg_connections)
                .await
                .context("failed to connect to postgres")?;
            store
                .migrate()
                .await
                .context("failed to run migrations")?;
            info!("using postgres stores");

            let dedup = Arc::new(PgDedupStore::new(store.pool().clone()));
            let purger = dedup.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(DEDUP_PURGE_INTERVAL);
                loop {
                    interval.tick().await;
                    match purger.purge_expired().await {
                        Ok(purged) => info!(purged, "purged expired dedup keys"),
                        Err(error) => error!(error = %error, "failed to purge dedup keys"),
                    }
                }
            });

            Ok(Backends {
                overflow: Arc::new(PgOverflowSink::new(store.pool().clone())),
                persons: Arc::new(store),
                dedup,
            })
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(error = %error, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().context("invalid configuration")?;
    init_tracing(config.log_format);

    let recorder = setup_metrics_recorder().context("failed to install metrics recorder")?;

    let stdout = Arc::new(StdoutSink::new());
    let backends = connect(&config, stdout.clone()).await?;

    let pipeline = EventPipeline::new(
        Deduplicator::new(backends.dedup, config.dedup_window()),
        IdentityResolver::new(
            backends.persons,
            config.alias_precedence,
            config.max_conflict_retries,
        ),
        stdout,
        backends.overflow,
    )
    .with_retry_policy(RetryPolicy::from(&config.retry_policy))
    .with_step_timeout(config.step_timeout.0);

    let liveness = HealthRegistry::new("liveness");
    let worker = Arc::new(Worker::start(
        Arc::new(pipeline),
        config.worker_lanes,
        config.lane_buffer_size,
        &liveness,
        config.health_deadline(),
    ));

    let router = api::router(
        AppState {
            worker: worker.clone(),
            liveness,
        },
        Some(recorder),
    );

    let bind = config.bind();
    info!(bind = %bind, "serving");
    let served = serve(router, &bind, shutdown_signal()).await;

    worker.shutdown().await;
    served.with_context(|| format!("failed to serve on {bind}"))
}
