pub mod config;
pub mod distributor;
pub mod error;
pub mod events;
pub mod hot_score;
pub mod lifecycle;
pub mod logging;
pub mod models;
pub mod notify;
pub mod payout;
pub mod report;
pub mod signing;
pub mod store;
pub mod withdrawal;
