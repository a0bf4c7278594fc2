//! Initial snapshotting of newly discovered chunks
//!
//! A small worker pool reads historical rows through the side channel and
//! replays them as synthetic read events so the sink sees a complete
//! picture before live changes arrive.

use crate::catalog::{Chunk, Hypertable, TrackedTable};
use crate::dispatcher::{task, Dispatcher, HypertableEvent, SnapshotEvent};
use crate::error::Result;
use crate::monitoring::metrics;
use crate::sidechannel::SideChannel;
use crate::types::Lsn;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct SnapshotterConfig {
    pub workers: usize,
    pub batch_size: i64,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_size: 1000,
        }
    }
}

struct SnapshotRequest {
    hypertable: Arc<Hypertable>,
    chunk: Arc<Chunk>,
}

pub struct Snapshotter {
    side_channel: Arc<dyn SideChannel>,
    dispatcher: Arc<Dispatcher>,
    config: SnapshotterConfig,
    request_tx: mpsc::Sender<SnapshotRequest>,
    request_rx: Mutex<Option<mpsc::Receiver<SnapshotRequest>>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Snapshotter {
    pub fn new(
        config: SnapshotterConfig,
        side_channel: Arc<dyn SideChannel>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(64);
        Self {
            side_channel,
            dispatcher,
            config,
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let Some(request_rx) = self.request_rx.lock().unwrap().take() else {
            return;
        };
        let request_rx = Arc::new(tokio::sync::Mutex::new(request_rx));

        let mut workers = self.workers.lock().unwrap();
        for worker_id in 0..self.config.workers.max(1) {
            let request_rx = Arc::clone(&request_rx);
            let side_channel = Arc::clone(&self.side_channel);
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown = self.shutdown.clone();
            let batch_size = self.config.batch_size;

            workers.push(tokio::spawn(async move {
                debug!("Snapshot worker {} started", worker_id);
                loop {
                    let request = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        request = async { request_rx.lock().await.recv().await } => request,
                    };
                    let Some(request) = request else { break };
                    if let Err(err) =
                        snapshot_chunk(&side_channel, &dispatcher, &request, batch_size).await
                    {
                        error!(
                            "Snapshot of {} failed: {}",
                            request.chunk.canonical_name(),
                            err
                        );
                    }
                }
                debug!("Snapshot worker {} exited", worker_id);
            }));
        }
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Queue a chunk for snapshotting; applies backpressure when the
    /// worker pool is saturated.
    pub async fn request_chunk_snapshot(&self, hypertable: Arc<Hypertable>, chunk: Arc<Chunk>) {
        if self
            .request_tx
            .send(SnapshotRequest { hypertable, chunk })
            .await
            .is_err()
        {
            error!("Snapshotter is stopped, dropping snapshot request");
        }
    }
}

async fn snapshot_chunk(
    side_channel: &Arc<dyn SideChannel>,
    dispatcher: &Arc<Dispatcher>,
    request: &SnapshotRequest,
    batch_size: i64,
) -> Result<()> {
    let hypertable = &request.hypertable;
    let chunk = &request.chunk;
    info!("Snapshotting chunk {}", chunk.canonical_name());

    let started = SnapshotEvent::Started {
        hypertable: Arc::clone(hypertable),
        chunk: Arc::clone(chunk),
    };
    dispatcher
        .enqueue(task(move |n| async move {
            n.notify_chunk_snapshot_handlers(&started).await;
        }))
        .await?;

    let mut offset = 0;
    loop {
        let rows = side_channel
            .snapshot_table(chunk.entity(), batch_size, offset)
            .await?;
        let row_count = rows.len();
        offset += row_count as i64;

        for row in rows {
            metrics::SNAPSHOT_ROWS_TOTAL.inc();
            let table = TrackedTable::Hypertable(Arc::clone(hypertable));
            let chunk = chunk.as_ref().clone();
            let event = HypertableEvent::Read {
                lsn: Lsn::INVALID,
                table,
                chunk: Some(chunk),
                new_values: row,
            };
            dispatcher
                .enqueue(task(move |n| async move {
                    n.notify_hypertable_handlers(&event).await;
                }))
                .await?;
        }

        if (row_count as i64) < batch_size {
            break;
        }
    }

    let finished = SnapshotEvent::Finished {
        hypertable: Arc::clone(hypertable),
        chunk: Arc::clone(chunk),
        snapshot_lsn: Lsn::INVALID,
    };
    dispatcher
        .enqueue(task(move |n| async move {
            n.notify_chunk_snapshot_handlers(&finished).await;
        }))
        .await?;

    info!("Snapshot of {} complete", chunk.canonical_name());
    Ok(())
}
