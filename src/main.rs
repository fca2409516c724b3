use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use food_delivery::api;
use food_delivery::config::{Config, LogFormat};
use food_delivery::engine::location::spawn_location_publisher;
use food_delivery::error::AppError;
use food_delivery::state::{AppState, Services};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Compact => subscriber.compact().init(),
    }

    let http_port = config.http_port;
    let services = Services::from_config(&config);
    if services.payments.is_none() {
        info!("PAYMENT_ACCESS_TOKEN not set; payment endpoints will answer 503");
    }
    if services.mailer.is_none() {
        info!("MAILER_URL not set; email endpoint will answer 503");
    }

    let (app_state, position_rx) = AppState::new(config, services);
    let shared_state = Arc::new(app_state);

    let publisher = spawn_location_publisher(shared_state.clone(), position_rx);

    let purge_state = shared_state.clone();
    let purge_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = purge_state.rate_limiter.purge_expired(Utc::now());
            if removed > 0 {
                debug!(removed, "expired rate-limit windows purged");
            }
        }
    });

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{http_port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    info!(http_port, "http server started");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    purge_task.abort();
    publisher.stop().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
