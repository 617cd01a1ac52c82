use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use courier_api::app::{build_app, services};
use courier_infra::DispatchConfig;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
        tracing::warn!("JWT_SECRET not set; using insecure dev default");
        "dev-secret".to_string()
    });
    let bind_addr = std::env::var("COURIER_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty());

    let config = DispatchConfig::from_env().context("invalid dispatch configuration")?;
    tracing::info!(?config, "dispatch configuration loaded");

    let services = Arc::new(services::build_services(config, database_url.as_deref()).await?);

    // Optional in-process trigger; without it `POST /dispatch/retry-due` drives retries.
    let scheduler = match poll_interval()? {
        Some(interval) => {
            let batch = services.engine.config().concurrency * 4;
            Some(services.engine.scheduler().clone().spawn(interval, batch))
        }
        None => None,
    };

    let app = build_app(jwt_secret, services);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    Ok(())
}

fn poll_interval() -> anyhow::Result<Option<Duration>> {
    let Ok(raw) = std::env::var("DISPATCH_POLL_INTERVAL_MS") else {
        return Ok(None);
    };
    let ms: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("invalid DISPATCH_POLL_INTERVAL_MS '{raw}'"))?;
    Ok((ms > 0).then(|| Duration::from_millis(ms)))
}
