//! Prometheus metrics for the event pipeline

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, Encoder, Gauge, IntCounter,
    IntCounterVec, TextEncoder,
};

lazy_static! {
    /// Events delivered to the sink
    pub static ref EVENTS_EMITTED_TOTAL: IntCounter = register_int_counter!(
        "ts2any_events_emitted_total",
        "Total number of events delivered to the sink"
    )
    .expect("metric can be created");

    /// Events dropped by the event filter (still acknowledged)
    pub static ref EVENTS_FILTERED_TOTAL: IntCounter = register_int_counter!(
        "ts2any_events_filtered_total",
        "Total number of events rejected by the event filter"
    )
    .expect("metric can be created");

    /// Sink emission retries
    pub static ref SINK_RETRIES_TOTAL: IntCounter = register_int_counter!(
        "ts2any_sink_retries_total",
        "Total number of sink emission retries"
    )
    .expect("metric can be created");

    /// Events received from the replication channel by kind
    pub static ref EVENTS_RECEIVED_BY_KIND: IntCounterVec = register_int_counter_vec!(
        "ts2any_events_received_total",
        "Events received from the replication channel by kind",
        &["kind"]
    )
    .expect("metric can be created");

    /// Snapshot rows read so far
    pub static ref SNAPSHOT_ROWS_TOTAL: IntCounter = register_int_counter!(
        "ts2any_snapshot_rows_total",
        "Total number of rows read by the snapshotter"
    )
    .expect("metric can be created");

    /// Highest acknowledged WAL position
    pub static ref LAST_ACKNOWLEDGED_LSN: Gauge = register_gauge!(
        "ts2any_last_acknowledged_lsn",
        "Highest acknowledged WAL position"
    )
    .expect("metric can be created");
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_metrics() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
