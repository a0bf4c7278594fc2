//! Monitoring: metrics collection and the stats HTTP service

pub mod metrics;
pub mod stats_server;

pub use stats_server::{StatsService, StatsServiceConfig};
