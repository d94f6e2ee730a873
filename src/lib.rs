//! Court reservation bot: a scheduler and browser-driven executor that
//! races concurrent workers to acquire tennis court reservations the
//! moment the upstream booking window opens (see `DESIGN.md`).

pub mod config;
pub mod domain;
pub mod error;
pub mod logger;

use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::domain::chromium_driver::ChromiumDriverFactory;
use crate::domain::court::CourtRegistry;
use crate::domain::notifier::Notifier;
use crate::domain::pool::BrowserPool;
use crate::domain::queue::ReservationQueue;
use crate::domain::scheduler::Scheduler;
use crate::domain::store::JsonFileStore;
use crate::error::Result;

/// Wires together the queue, pool, and scheduler from a loaded
/// configuration and an injected notifier (§9 "Duck-typed collaborators").
/// The chat front-end, profile store, and notification delivery mechanism
/// are out of scope (§1) and are represented here only by the `notifier`
/// capability the caller supplies.
pub async fn build_scheduler(config_path: Option<&Path>, notifier: Arc<dyn Notifier>) -> Result<Scheduler> {
    let config = Config::load(config_path)?;
    logger::log_event("startup", None, None, None, &format!("loaded configuration with {} courts", config.courts.len()));

    let registry = CourtRegistry::from_config(&config.courts);
    let court_urls: Vec<(u32, String)> = registry.iter().map(|c| (c.number, c.url.clone())).collect();
    let factory = Arc::new(ChromiumDriverFactory::launch().await?);
    let pool = Arc::new(BrowserPool::initialize(factory, &court_urls).await);

    logger::log_event(
        "pool",
        None,
        None,
        None,
        &format!("pool readiness={:?} available={:?}", pool.readiness().await, pool.available_courts().await),
    );

    let store = Arc::new(JsonFileStore::new(config.queue_path.clone()));
    let queue = Arc::new(ReservationQueue::load(store, config.max_retry_attempts).await?);

    Ok(Scheduler::new(config, queue, pool, notifier))
}

/// The configured set of courts, for a request-submission caller (the
/// chat front-end, out of scope here) to validate a user's court
/// preferences against before constructing a [`domain::reservation::ReservationRequest`]
/// (§3 "Court preference list elements belong to the set of configured
/// courts").
pub fn court_registry(config: &Config) -> CourtRegistry {
    CourtRegistry::from_config(&config.courts)
}
