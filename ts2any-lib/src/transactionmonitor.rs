//! Tracks the transaction currently being replayed
//!
//! Registered as a logical handler so it observes Begin/Commit in the same
//! serialized order as every other handler.

use crate::error::Result;
use crate::handlers::{LogicalEventHandler, ReplicationEventHandler, TransactionBoundary};
use crate::types::XLogData;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct TransactionMonitor {
    current_transaction_id: AtomicU32,
}

impl TransactionMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transaction id of the in-flight transaction, 0 outside of one
    pub fn transaction_id(&self) -> u32 {
        self.current_transaction_id.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplicationEventHandler for TransactionMonitor {
    fn as_logical_handler(&self) -> Option<&dyn LogicalEventHandler> {
        Some(self)
    }
}

#[async_trait]
impl LogicalEventHandler for TransactionMonitor {
    async fn on_begin_event(&self, _xld: XLogData, begin: TransactionBoundary) -> Result<()> {
        self.current_transaction_id
            .store(begin.transaction_id, Ordering::SeqCst);
        Ok(())
    }

    async fn on_commit_event(&self, _xld: XLogData, _commit: TransactionBoundary) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Lsn;
    use chrono::Utc;

    #[tokio::test]
    async fn test_tracks_latest_begin() {
        let monitor = TransactionMonitor::new();
        assert_eq!(monitor.transaction_id(), 0);

        let boundary = TransactionBoundary {
            transaction_id: 777,
            commit_time: Utc::now(),
            final_lsn: Lsn::new(10),
        };
        monitor
            .on_begin_event(XLogData::synthetic(Lsn::new(10)), boundary)
            .await
            .unwrap();
        assert_eq!(monitor.transaction_id(), 777);
    }
}
