pub mod admission;
pub mod broker;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod error;
pub mod event;
pub mod logging;
pub mod metrics;
pub mod publisher;
pub mod ranking;
pub mod rate_limiter;
pub mod server;
pub mod sink;
