//! Per-event filtering after envelope construction
//!
//! Rejected events are dropped without reaching the sink but still count as
//! processed for WAL acknowledgement purposes.

use crate::catalog::TrackedTable;
use crate::error::Result;
use crate::schema::Struct;

/// Boolean predicate over `(table, key, value)`
pub trait EventFilter: Send + Sync {
    fn evaluate(&self, table: &TrackedTable, key: &Struct, value: &Struct) -> Result<bool>;
}

/// Default filter: everything passes
#[derive(Debug, Default)]
pub struct AcceptAllFilter;

impl EventFilter for AcceptAllFilter {
    fn evaluate(&self, _table: &TrackedTable, _key: &Struct, _value: &Struct) -> Result<bool> {
        Ok(true)
    }
}
