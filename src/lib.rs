pub mod amount;
pub mod cache;
pub mod classify;
pub mod config;
pub mod deals;
pub mod error;
pub mod fiat;
pub mod ledger;
pub mod lifecycle;
pub mod offers;
pub mod orchestrator;
pub mod prefs;
pub mod types;
pub mod utils;
pub mod validate;

pub use config::MarketConfig;
pub use orchestrator::Orchestrator;
