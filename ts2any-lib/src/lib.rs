//! # TimescaleDB CDC Event Streamer
//!
//! Core library for ts2any: attaches to a TimescaleDB-enabled PostgreSQL
//! server over logical replication, discovers hypertables, their chunks and
//! vanilla tables, translates row-level changes and logical messages into
//! schema-framed envelopes, and pushes them to a pluggable sink with
//! at-least-once delivery.
//!
//! ## Architecture
//!
//! Decoded WAL events enter through a [`replicationchannel::WalEventSource`],
//! are resolved against the [`systemcatalog::SystemCatalog`], and flow
//! through the single-worker [`dispatcher::Dispatcher`] to the
//! [`eventemitter::EventEmitter`], which builds Debezium-style envelopes,
//! applies the event filter, emits to the [`sink::Sink`] under bounded
//! retry, and acknowledges the WAL position. The
//! [`replicator::Replicator`] supervises startup and teardown ordering.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ts2any_lib::{load_config_from_env, run_streamer_app_with_config};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = load_config_from_env().expect("configuration");
//!     std::process::exit(run_streamer_app_with_config(config).await);
//! }
//! ```

// Core modules
pub mod app;
pub mod config;
pub mod env;
pub mod error;

// Wire formats and shared types
pub mod buffer;
pub mod knowntables;
pub mod types;

// Catalog model and discovery
pub mod catalog;
pub mod replicaidentity;
pub mod systemcatalog;
pub mod tablefilter;

// Event pipeline
pub mod dispatcher;
pub mod eventemitter;
pub mod eventfilter;
pub mod handlers;
pub mod retry;
pub mod schema;
pub mod schemaregistry;
pub mod topic;
pub mod transactionmonitor;
pub mod typeconverter;

// Boundaries
pub mod replicationchannel;
pub mod replicationcontext;
pub mod sidechannel;
pub mod sink;
pub mod snapshotter;
pub mod statestorage;

// Supervision
pub mod replicator;

// Monitoring and metrics
pub mod monitoring;

// Public API exports
pub use app::{run_streamer_app, run_streamer_app_with_config};
pub use config::{Config, ConfigBuilder};
pub use env::load_config_from_env;
pub use error::{exit_codes, ExitError, StreamerError};
pub use replicator::{Replicator, SystemConfig};

/// Result type for streamer operations
pub type StreamerResult<T> = error::Result<T>;
