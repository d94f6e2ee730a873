pub mod availability;
pub mod chromium_driver;
pub mod contact;
pub mod court;
pub mod executor;
pub mod health;
pub mod notifier;
pub mod orchestrator;
pub mod pool;
pub mod priority;
pub mod queue;
pub mod reservation;
pub mod scheduler;
pub mod store;
pub mod tier;
