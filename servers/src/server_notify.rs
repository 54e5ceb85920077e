use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_realtime::transport::PhoenixTransport;
use lib_realtime::NotificationService;

mod notify_logic;
use notify_logic::{config, logger, monitor};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), config.log_level())?;

    let realtime_config = config.realtime_config();
    realtime_config.validate().context("invalid realtime configuration")?;
    let phoenix_config = config
        .phoenix_config()
        .context("NOTIFY_REALTIME_URL and NOTIFY_API_KEY must both be set")?;

    let transport = Arc::new(PhoenixTransport::new(phoenix_config));
    let service = NotificationService::new(realtime_config, transport);
    service.init().await.context("realtime service failed to start")?;

    let _car_feed = service.subscribe_to_car_status_changes(|change| {
        log::info!(
            "Car {} status {} -> {}",
            change.id,
            change.old_status.as_ref().map_or("?", |status| status.as_str()),
            change.new_status
        );
    })?;

    let _admin_feed = match &config.admin_user_id {
        Some(admin_user_id) => Some(service.subscribe_to_admin_notifications(admin_user_id, |notification| {
            log::info!(
                "Admin notification [{}] {}: {}",
                notification.kind,
                notification.title,
                notification.message
            );
        })?),
        None => None,
    };

    let shutdown = CancellationToken::new();
    let monitor_handle = tokio::spawn(monitor::run(service.clone(), config.stats_interval(), shutdown.clone()));
    let events_handle = tokio::spawn(monitor::watch_connections(service.clone(), shutdown.clone()));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate() => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }

    shutdown.cancel();
    monitor::join_background(monitor_handle, events_handle).await;
    service.shutdown().await;

    log::info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term_signal) => {
            term_signal.recv().await;
        }
        Err(e) => {
            log::warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
}
