use anyhow::Result;
use clap::Parser;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;

use lib_realtime::transport::MemoryTransport;
use lib_realtime::{ChannelName, ChannelStatus, NotificationService, RealtimeConfig, RowChange};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Drives the notification service over the in-memory transport", long_about = None)]
struct Args {
    /// Number of status changes to publish
    #[clap(short, long, default_value_t = 5)]
    events: usize,

    /// Inject a channel error after this many events (0 disables)
    #[clap(short, long, default_value_t = 2)]
    fail_after: usize,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short, long, default_value = "info")]
    log_level: String,
}

fn setup_logging(level: &str) -> Result<()> {
    let level = level.parse::<log::LevelFilter>().unwrap_or(log::LevelFilter::Info);
    fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("[{}][{}] {}", record.target(), record.level(), message)))
        .level(level)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let transport = MemoryTransport::new();
    let config = RealtimeConfig {
        reconnect_base_delay_ms: 200,
        ..RealtimeConfig::default()
    };
    let service = NotificationService::new(config, Arc::new(transport.clone()));
    service.init().await?;

    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let _dashboard = service.subscribe_to_car_status_changes(move |change| {
        counter.fetch_add(1, Ordering::SeqCst);
        println!("dashboard: car {} is now {}", change.id, change.new_status);
    })?;
    let _audit = service.subscribe_to_car_status_changes(|change| {
        println!("audit: {:?} -> {}", change.old_status, change.new_status);
    })?;
    sleep(Duration::from_millis(50)).await;

    let channel = ChannelName::from("car_status_changes");
    let statuses = ["PENDING_APPROVAL", "ACTIVE", "INACTIVE", "ACTIVE", "REJECTED"];
    for n in 0..args.events {
        if args.fail_after > 0 && n == args.fail_after {
            println!("-- injecting CHANNEL_ERROR --");
            transport.report(&channel, ChannelStatus::ChannelError);
            sleep(Duration::from_millis(500)).await;
        }

        let old = statuses[n % statuses.len()];
        let new = statuses[(n + 1) % statuses.len()];
        let delivered = transport.emit(
            &channel,
            RowChange::update(
                "cars",
                json!({"id": format!("car{}", n), "status": new, "make": "Toyota"}),
                Some(json!({"id": format!("car{}", n), "status": old})),
            ),
        );
        if !delivered {
            println!("event {} dropped: channel not open", n);
        }
        sleep(Duration::from_millis(50)).await;
    }

    let stats = service.get_service_stats();
    println!("received={} stats={}", received.load(Ordering::SeqCst), serde_json::to_string_pretty(&stats)?);
    println!("channels={}", serde_json::to_string_pretty(&service.channel_details())?);

    service.shutdown().await;
    Ok(())
}
