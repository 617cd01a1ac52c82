//! Engine wiring: job store selection, transports and the audit sink.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

use courier_core::SystemClock;
use courier_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use courier_infra::{ConfigError, DispatchConfig, DispatchEngine, TracingAuditSink};

/// Shared state behind every route.
#[derive(Debug)]
pub struct AppServices {
    pub engine: Arc<DispatchEngine>,
}

impl AppServices {
    pub fn new(engine: DispatchEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    /// In-memory store, wall clock, tracing audit sink.
    pub fn in_memory(config: DispatchConfig) -> Result<Self, ConfigError> {
        let store = InMemoryJobStore::arc();
        Self::with_store(config, store)
    }

    fn with_store(config: DispatchConfig, store: Arc<dyn JobStore>) -> Result<Self, ConfigError> {
        let engine = DispatchEngine::from_config(
            config,
            store,
            Arc::new(SystemClock),
            Arc::new(TracingAuditSink),
        )?;
        Ok(Self::new(engine))
    }
}

/// Build services from configuration: Postgres when `database_url` is given,
/// otherwise an in-memory store that loses jobs on restart.
pub async fn build_services(config: DispatchConfig, database_url: Option<&str>) -> anyhow::Result<AppServices> {
    let Some(url) = database_url else {
        tracing::warn!("DATABASE_URL not set; using in-memory job store");
        return Ok(AppServices::in_memory(config)?);
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(url)
        .await?;
    let store = PostgresJobStore::new(pool);
    store.ensure_schema().await?;
    tracing::info!("using postgres job store");

    Ok(AppServices::with_store(config, Arc::new(store))?)
}
