//! Fulfillment worker.
//!
//! Wires the pipeline stages to their backends, runs one consumer per stage
//! plus the top-up and outbox timers, and serves a small operations API
//! (health, Prometheus metrics, dead-letter inspection and replay).

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use event_log::{
    EventLog, IdempotentEmitter, InMemoryEventLog, InMemoryOutbox, OutboxStore, PostgresEventLog,
    PostgresOutbox,
};
use metrics_exporter_prometheus::PrometheusHandle;
use pipeline::{
    AllocationCoordinator, CacheInvalidator, CacheStore, DeadLetterReplayer, Dispatcher,
    EventHandler, HttpTutorMatcher, InMemoryCacheStore, InMemoryTutorMatcher, PurchaseMaterializer,
    RedisCacheStore, SessionScheduler, StageConsumer, TutorMatcher, spawn_republish_timer,
    spawn_top_up_timer,
};
use store::{FulfillmentStore, InMemoryFulfillmentStore, PostgresFulfillmentStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use error::StartupError;
use routes::dead_letters::AppState;

/// Outbox entries younger than this are left to the emit that wrote them.
const REPUBLISH_GRACE: std::time::Duration = std::time::Duration::from_secs(5);
const REPUBLISH_BATCH: usize = 100;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/dead-letters", get(routes::dead_letters::list))
        .route("/dead-letters/{id}", get(routes::dead_letters::get))
        .route("/dead-letters/{id}/replay", post(routes::dead_letters::replay))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// The storage and collaborator implementations the stages run against.
#[derive(Clone)]
pub struct Backends {
    pub log: Arc<dyn EventLog>,
    pub outbox: Arc<dyn OutboxStore>,
    pub store: Arc<dyn FulfillmentStore>,
    pub cache: Arc<dyn CacheStore>,
    pub matcher: Arc<dyn TutorMatcher>,
}

impl Backends {
    /// Everything in memory: a single-process pipeline for local runs and
    /// tests.
    pub fn in_memory(config: &Config) -> Self {
        Self {
            log: Arc::new(InMemoryEventLog::new(config.log_config())),
            outbox: Arc::new(InMemoryOutbox::new()),
            store: Arc::new(InMemoryFulfillmentStore::new()),
            cache: Arc::new(InMemoryCacheStore::new()),
            matcher: Arc::new(InMemoryTutorMatcher::with_tutors(config.matcher_tutors)),
        }
    }
}

/// Connects the backends named by the configuration.
///
/// Without `DATABASE_URL` the log, outbox and store live in memory; without
/// `REDIS_URL` or `MATCHER_URL` the in-memory cache and matcher are used.
pub async fn create_backends(config: &Config) -> Result<Backends, StartupError> {
    let mut backends = Backends::in_memory(config);

    if let Some(url) = &config.database_url {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(url)
            .await?;

        let log = PostgresEventLog::new(pool.clone(), config.log_config());
        log.run_migrations().await?;
        tracing::info!(partitions = config.log_partitions, "connected to PostgreSQL");

        backends.log = Arc::new(log);
        backends.outbox = Arc::new(PostgresOutbox::new(pool.clone()));
        backends.store = Arc::new(PostgresFulfillmentStore::new(pool));
    } else {
        tracing::warn!("DATABASE_URL not set, running with in-memory log and store");
    }

    if let Some(url) = &config.redis_url {
        backends.cache = Arc::new(RedisCacheStore::new(url).await?);
        tracing::info!("connected to Redis");
    }

    if let Some(url) = &config.matcher_url {
        backends.matcher = Arc::new(HttpTutorMatcher::new(url.clone(), config.matcher_timeout)?);
        tracing::info!(%url, "using HTTP tutor matcher");
    }

    Ok(backends)
}

/// The wired pipeline of one worker process.
pub struct FulfillmentWorker {
    pub emitter: IdempotentEmitter,
    pub scheduler: Arc<SessionScheduler>,
    pub replayer: DeadLetterReplayer,
    pub consumers: Vec<StageConsumer>,
    top_up_interval: std::time::Duration,
    republish_interval: std::time::Duration,
}

impl FulfillmentWorker {
    /// Builds every stage with its configured retry budget and one consumer
    /// per stage.
    pub fn new(config: &Config, backends: &Backends) -> Result<Self, StartupError> {
        let emitter = IdempotentEmitter::new(backends.log.clone(), backends.outbox.clone());

        let materializer: Arc<dyn EventHandler> = Arc::new(
            PurchaseMaterializer::new(backends.store.clone(), emitter.clone())
                .with_retry_policy(config.retry_policy(config.materializer_max_attempts)),
        );
        let allocator: Arc<dyn EventHandler> = Arc::new(
            AllocationCoordinator::new(
                backends.store.clone(),
                emitter.clone(),
                backends.matcher.clone(),
            )
            .with_retry_policy(config.retry_policy(config.allocator_max_attempts))
            .with_matcher_timeout(config.matcher_timeout),
        );
        let scheduler = Arc::new(SessionScheduler::new(
            backends.store.clone(),
            emitter.clone(),
            config.scheduler_config()?,
        ));
        let invalidator: Arc<dyn EventHandler> = Arc::new(
            CacheInvalidator::new(backends.cache.clone(), backends.store.clone())
                .with_retry_policy(config.retry_policy(config.cache_max_attempts)),
        );

        let handlers = [
            materializer,
            allocator,
            scheduler.clone() as Arc<dyn EventHandler>,
            invalidator,
        ];
        let consumers = handlers
            .into_iter()
            .map(|handler| {
                StageConsumer::new(
                    Dispatcher::new(handler, backends.store.clone()),
                    backends.log.clone(),
                    config.consumer_config(),
                )
            })
            .collect();

        Ok(Self {
            replayer: DeadLetterReplayer::new(backends.store.clone(), backends.log.clone()),
            emitter,
            scheduler,
            consumers,
            top_up_interval: config.top_up_interval,
            republish_interval: config.republish_interval,
        })
    }

    /// Spawns every consumer and both timers. All of them stop once
    /// `shutdown` turns true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.consumers.len() + 2);

        for consumer in self.consumers {
            handles.push(tokio::spawn(consumer.run(shutdown.clone())));
        }
        handles.push(spawn_top_up_timer(
            self.scheduler,
            self.top_up_interval,
            shutdown.clone(),
        ));
        handles.push(spawn_republish_timer(
            self.emitter,
            self.republish_interval,
            REPUBLISH_GRACE,
            REPUBLISH_BATCH,
            shutdown,
        ));

        handles
    }
}
