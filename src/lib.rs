pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod ledger;
pub mod metering;
pub mod models;
pub mod pool;
pub mod provider;
pub mod router;
pub mod server;
pub mod telemetry;
pub mod usage_collector;

pub use error::{Error, Result};
