use lib_realtime::NotificationService;
use lib_realtime::core::ConnectionEvent;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// Logs service stats on a fixed interval and retries channels that gave up.
pub async fn run(service: NotificationService, period: Duration, shutdown: CancellationToken) {
    let mut stats_interval = interval(period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("Monitor received shutdown signal.");
                break;
            }
            _ = stats_interval.tick() => {
                let stats = service.get_service_stats();
                log::info!(
                    "connections open={} total={} error={} | subscriptions channels={} callbacks={} | reconnects={} callback_failures={}",
                    stats.active_connections,
                    stats.total_connections,
                    stats.error_connections,
                    stats.active_subscriptions,
                    stats.total_subscriptions,
                    stats.reconnect_attempts,
                    stats.callback_failures
                );

                // A listener process has nobody to press the retry button.
                let restarted = service.reconnect();
                if restarted > 0 {
                    log::warn!("Restarted {} failed channel(s).", restarted);
                }
            }
        }
    }
}

/// Mirrors pool lifecycle events into the log.
pub async fn watch_connections(service: NotificationService, shutdown: CancellationToken) {
    let mut events = service.connection_events();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Ok(ConnectionEvent::Opening { channel, generation }) => {
                    log::debug!("Opening channel {} (generation {}).", channel, generation)
                }
                Ok(ConnectionEvent::Opened { channel }) => log::info!("Channel {} opened.", channel),
                Ok(ConnectionEvent::Errored { channel }) => log::warn!("Channel {} errored.", channel),
                Ok(ConnectionEvent::Closed { channel }) => log::debug!("Channel {} closed.", channel),
                Ok(ConnectionEvent::Swept { channel, state }) => {
                    log::warn!("Channel {} swept while {:?}.", channel, state)
                }
                Err(RecvError::Lagged(skipped)) => log::warn!("Skipped {} connection events.", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Waits for the background loops after shutdown was requested. A loop that
/// panicked or was aborted is logged; returns whether both ended cleanly.
pub async fn join_background(monitor: JoinHandle<()>, events: JoinHandle<()>) -> bool {
    match tokio::try_join!(monitor, events) {
        Ok(_) => true,
        Err(e) => {
            log::error!("Background task failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_background_reports_aborted_task() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let clean = tokio::spawn(async move { token.cancelled().await });
        let broken = tokio::spawn(std::future::pending::<()>());
        broken.abort();

        shutdown.cancel();
        assert!(!join_background(clean, broken).await);
    }

    #[tokio::test]
    async fn test_join_background_clean_exit() {
        let shutdown = CancellationToken::new();
        let (a, b) = (shutdown.clone(), shutdown.clone());
        let first = tokio::spawn(async move { a.cancelled().await });
        let second = tokio::spawn(async move { b.cancelled().await });

        shutdown.cancel();
        assert!(join_background(first, second).await);
    }
}
