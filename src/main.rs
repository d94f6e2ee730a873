use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use court_reservation_bot::domain::notifier::NullNotifier;
use court_reservation_bot::{build_scheduler, logger};

/// Scheduler and browser-driven executor that races concurrent workers
/// to acquire tennis court reservations the moment the upstream booking
/// window opens.
#[derive(Parser, Debug)]
#[command(name = "court_reservation_bot", version, about)]
struct Cli {
    /// Path to an optional TOML configuration file overlaying the
    /// compiled-in defaults (§6 "Configuration surface").
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    logger::init();
    let cli = Cli::parse();

    log::info!("starting court reservation bot");

    // The chat front-end's notification delivery mechanism is out of
    // scope (§1); a real deployment would inject a Notifier that posts
    // back into that system instead of this no-op implementation.
    let notifier = Arc::new(NullNotifier);

    let scheduler = match build_scheduler(cli.config.as_deref(), notifier).await {
        Ok(scheduler) => scheduler,
        Err(err) => {
            log::error!("failed to initialize scheduler: {err}");
            std::process::exit(1);
        }
    };

    let shutdown = scheduler.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received");
            shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    scheduler.run().await;
    log::info!("scheduler stopped");
}
