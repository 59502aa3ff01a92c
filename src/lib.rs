//! TimePost - desktop activity capture agent with guaranteed delivery
//!
//! While a worker is on the clock, periodic producers sample the
//! foreground application, user idleness and the screen. Records flow
//! through a durable local queue to the backend with at-least-once
//! delivery; confirmed screenshots are republished on a fan-out hub for
//! live dashboards. External dependencies sit behind traits for
//! testability.

pub mod capture_scheduler;
pub mod config;
pub mod delivery_worker;
pub mod fanout;
pub mod idle_monitor;
pub mod mocks;
pub mod production;
pub mod records;
pub mod tracking;
pub mod traits;

mod ledger;
mod state;

pub use ledger::DeliveryLedger;
pub use state::AppState;
