pub mod api;
pub mod config;
pub mod dedup;
pub mod error;
pub mod health;
pub mod hooks;
pub mod merge;
pub mod metrics;
pub mod metrics_consts;
pub mod pipeline;
pub mod properties;
pub mod resolver;
pub mod retry;
pub mod sink;
pub mod store;
pub mod test_utils;
pub mod types;
pub mod worker;
