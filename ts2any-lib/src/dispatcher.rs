//! Single-writer event dispatch
//!
//! A single background worker drains a bounded task queue. Each task gets a
//! `Notificator` over a snapshot of the registered handlers and fans the
//! event out to the capable ones. Serialising dispatch gives handlers a
//! total order matching the upstream WAL order and spares them per-handler
//! locking.

use crate::catalog::{Chunk, Hypertable, TrackedTable};
use crate::handlers::{
    RelationMetadata, ReplicationEventHandler, RowValues, TransactionBoundary,
};
use crate::types::{LogicalMessage, Lsn, XLogData};
use crate::error::{Result, StreamerError};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Row-level events fanned out to hypertable handlers
pub enum HypertableEvent {
    Read {
        lsn: Lsn,
        table: TrackedTable,
        chunk: Option<Chunk>,
        new_values: RowValues,
    },
    Insert {
        xld: XLogData,
        table: TrackedTable,
        chunk: Option<Chunk>,
        new_values: RowValues,
    },
    Update {
        xld: XLogData,
        table: TrackedTable,
        chunk: Option<Chunk>,
        old_values: Option<RowValues>,
        new_values: RowValues,
    },
    Delete {
        xld: XLogData,
        table: TrackedTable,
        chunk: Option<Chunk>,
        old_values: RowValues,
        tombstone: bool,
    },
    Truncate {
        xld: XLogData,
        table: TrackedTable,
    },
}

/// Transaction-scoped and logical message events
pub enum LogicalEvent {
    Begin {
        xld: XLogData,
        boundary: TransactionBoundary,
    },
    Commit {
        xld: XLogData,
        boundary: TransactionBoundary,
    },
    Message {
        xld: XLogData,
        message: LogicalMessage,
    },
    Type {
        xld: XLogData,
        type_oid: u32,
    },
    Origin {
        xld: XLogData,
        origin: String,
    },
}

/// Chunk compression lifecycle events
pub enum CompressionEvent {
    Compressed {
        xld: XLogData,
        table: TrackedTable,
        chunk: Option<Chunk>,
    },
    Decompressed {
        xld: XLogData,
        table: TrackedTable,
        chunk: Option<Chunk>,
    },
}

/// Catalog discovery events
pub enum SystemCatalogEvent {
    HypertableAdded(Arc<Hypertable>),
    HypertableDeleted(Arc<Hypertable>),
    ChunkAdded(Arc<Chunk>),
    ChunkDeleted(Arc<Chunk>),
}

/// Snapshot progress events
pub enum SnapshotEvent {
    Started {
        hypertable: Arc<Hypertable>,
        chunk: Arc<Chunk>,
    },
    Finished {
        hypertable: Arc<Hypertable>,
        chunk: Arc<Chunk>,
        snapshot_lsn: Lsn,
    },
}

/// Fan-out facade handed to every dispatched task
pub struct Notificator {
    handlers: Vec<Weak<dyn ReplicationEventHandler>>,
}

impl Notificator {
    fn new(handlers: Vec<Weak<dyn ReplicationEventHandler>>) -> Self {
        Self { handlers }
    }

    fn live_handlers(&self) -> impl Iterator<Item = Arc<dyn ReplicationEventHandler>> + '_ {
        self.handlers.iter().filter_map(Weak::upgrade)
    }

    fn log_handler_error(err: StreamerError) {
        error!("Error while dispatching event: {}", err);
    }

    pub async fn notify_base_handlers(&self, xld: XLogData, relation: &RelationMetadata) {
        for handler in self.live_handlers() {
            if let Err(err) = handler.on_relation_event(xld, relation).await {
                Self::log_handler_error(err);
            }
        }
    }

    pub async fn notify_system_catalog_handlers(&self, event: &SystemCatalogEvent) {
        for handler in self.live_handlers() {
            let Some(handler) = handler.as_system_catalog_handler() else {
                continue;
            };
            let result = match event {
                SystemCatalogEvent::HypertableAdded(h) => handler.on_hypertable_added(h.clone()),
                SystemCatalogEvent::HypertableDeleted(h) => {
                    handler.on_hypertable_deleted(h.clone())
                }
                SystemCatalogEvent::ChunkAdded(c) => handler.on_chunk_added(c.clone()),
                SystemCatalogEvent::ChunkDeleted(c) => handler.on_chunk_deleted(c.clone()),
            }
            .await;
            if let Err(err) = result {
                Self::log_handler_error(err);
            }
        }
    }

    pub async fn notify_compression_handlers(&self, event: &CompressionEvent) {
        for handler in self.live_handlers() {
            let Some(handler) = handler.as_compression_handler() else {
                continue;
            };
            let result = match event {
                CompressionEvent::Compressed { xld, table, chunk } => {
                    handler.on_chunk_compressed(*xld, table, chunk.as_ref())
                }
                CompressionEvent::Decompressed { xld, table, chunk } => {
                    handler.on_chunk_decompressed(*xld, table, chunk.as_ref())
                }
            }
            .await;
            if let Err(err) = result {
                Self::log_handler_error(err);
            }
        }
    }

    pub async fn notify_hypertable_handlers(&self, event: &HypertableEvent) {
        for handler in self.live_handlers() {
            let Some(handler) = handler.as_hypertable_handler() else {
                continue;
            };
            let result = match event {
                HypertableEvent::Read {
                    lsn,
                    table,
                    chunk,
                    new_values,
                } => {
                    handler
                        .on_read_event(*lsn, table, chunk.as_ref(), new_values.clone())
                        .await
                }
                HypertableEvent::Insert {
                    xld,
                    table,
                    chunk,
                    new_values,
                } => {
                    handler
                        .on_insert_event(*xld, table, chunk.as_ref(), new_values.clone())
                        .await
                }
                HypertableEvent::Update {
                    xld,
                    table,
                    chunk,
                    old_values,
                    new_values,
                } => {
                    handler
                        .on_update_event(
                            *xld,
                            table,
                            chunk.as_ref(),
                            old_values.clone(),
                            new_values.clone(),
                        )
                        .await
                }
                HypertableEvent::Delete {
                    xld,
                    table,
                    chunk,
                    old_values,
                    tombstone,
                } => {
                    handler
                        .on_delete_event(*xld, table, chunk.as_ref(), old_values.clone(), *tombstone)
                        .await
                }
                HypertableEvent::Truncate { xld, table } => {
                    handler.on_truncate_event(*xld, table).await
                }
            };
            if let Err(err) = result {
                Self::log_handler_error(err);
            }
        }
    }

    pub async fn notify_logical_handlers(&self, event: &LogicalEvent) {
        for handler in self.live_handlers() {
            let Some(handler) = handler.as_logical_handler() else {
                continue;
            };
            let result = match event {
                LogicalEvent::Begin { xld, boundary } => {
                    handler.on_begin_event(*xld, *boundary).await
                }
                LogicalEvent::Commit { xld, boundary } => {
                    handler.on_commit_event(*xld, *boundary).await
                }
                LogicalEvent::Message { xld, message } => {
                    handler.on_message_event(*xld, message).await
                }
                LogicalEvent::Type { xld, type_oid } => {
                    handler.on_type_event(*xld, *type_oid).await
                }
                LogicalEvent::Origin { xld, origin } => {
                    handler.on_origin_event(*xld, origin).await
                }
            };
            if let Err(err) = result {
                Self::log_handler_error(err);
            }
        }
    }

    pub async fn notify_chunk_snapshot_handlers(&self, event: &SnapshotEvent) {
        for handler in self.live_handlers() {
            let Some(handler) = handler.as_chunk_snapshot_handler() else {
                continue;
            };
            let result = match event {
                SnapshotEvent::Started { hypertable, chunk } => {
                    handler.on_chunk_snapshot_started(hypertable, chunk).await
                }
                SnapshotEvent::Finished {
                    hypertable,
                    chunk,
                    snapshot_lsn,
                } => {
                    handler
                        .on_chunk_snapshot_finished(hypertable, chunk, *snapshot_lsn)
                        .await
                }
            };
            if let Err(err) = result {
                Self::log_handler_error(err);
            }
        }
    }
}

/// A unit of dispatch work
pub type Task =
    Box<dyn FnOnce(Notificator) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + 'static>;

/// Build a [`Task`] from an async closure
pub fn task<F, Fut>(f: F) -> Task
where
    F: FnOnce(Notificator) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Box::new(move |notificator| Box::pin(f(notificator)))
}

enum Command {
    Run(Task),
    Drain(oneshot::Sender<()>),
}

/// Dispatcher lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DispatcherState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl DispatcherState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DispatcherState::Running,
            2 => DispatcherState::Draining,
            3 => DispatcherState::Stopped,
            _ => DispatcherState::Idle,
        }
    }
}

/// Bounded, single-worker task queue fanning out typed notifications
pub struct Dispatcher {
    command_tx: mpsc::Sender<Command>,
    command_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    handlers: Arc<Mutex<Vec<Weak<dyn ReplicationEventHandler>>>>,
    state: Arc<AtomicU8>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create a dispatcher with the given queue capacity. Enqueueing blocks
    /// once the queue is full, which backpressures the replication reader.
    pub fn new(queue_capacity: usize) -> Self {
        let (command_tx, command_rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            handlers: Arc::new(Mutex::new(Vec::new())),
            state: Arc::new(AtomicU8::new(DispatcherState::Idle as u8)),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Register a handler by identity; duplicate registration is a no-op
    pub fn register_handler(&self, handler: Arc<dyn ReplicationEventHandler>) {
        let candidate = Arc::downgrade(&handler);
        let mut handlers = self.handlers.lock().unwrap();
        handlers.retain(|existing| existing.upgrade().is_some());
        if handlers
            .iter()
            .any(|existing| Weak::ptr_eq(existing, &candidate))
        {
            return;
        }
        handlers.push(candidate);
    }

    /// Unregister by identity: removes the first match and returns
    pub fn unregister_handler(&self, handler: &Arc<dyn ReplicationEventHandler>) {
        let candidate = Arc::downgrade(handler);
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(index) = handlers
            .iter()
            .position(|existing| Weak::ptr_eq(existing, &candidate))
        {
            handlers.remove(index);
        }
    }

    /// Start the worker. Tasks enqueued before the worker runs stay queued.
    pub fn start(&self) {
        let Some(mut command_rx) = self.command_rx.lock().unwrap().take() else {
            return;
        };
        self.state
            .store(DispatcherState::Running as u8, Ordering::SeqCst);

        let handlers = Arc::clone(&self.handlers);
        let state = Arc::clone(&self.state);
        let worker = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    Command::Run(task) => {
                        let snapshot = handlers.lock().unwrap().clone();
                        let notificator = Notificator::new(snapshot);
                        // Isolate handler panics from the worker itself.
                        if let Err(err) = tokio::spawn(task(notificator)).await {
                            error!("Dispatched task panicked: {}", err);
                        }
                    }
                    Command::Drain(confirm) => {
                        let _ = confirm.send(());
                        break;
                    }
                }
            }
            state.store(DispatcherState::Stopped as u8, Ordering::SeqCst);
            debug!("Dispatcher worker exited");
        });
        *self.worker.lock().unwrap() = Some(worker);
    }

    /// Enqueue a task for serialized dispatch. Fails once draining.
    pub async fn enqueue(&self, task: Task) -> Result<()> {
        if self.state() >= DispatcherState::Draining {
            return Err(StreamerError::ShuttingDown);
        }
        self.command_tx
            .send(Command::Run(task))
            .await
            .map_err(|_| StreamerError::ShuttingDown)
    }

    /// Signal drain, let the queue empty, then stop the worker. Blocks
    /// until the worker confirms the drain and terminates.
    pub async fn stop(&self) -> Result<()> {
        let previous = self.state.swap(DispatcherState::Draining as u8, Ordering::SeqCst);
        match DispatcherState::from_u8(previous) {
            DispatcherState::Idle => {
                // Worker never started; nothing to drain.
                self.state
                    .store(DispatcherState::Stopped as u8, Ordering::SeqCst);
                return Ok(());
            }
            DispatcherState::Draining | DispatcherState::Stopped => {
                self.state.store(previous, Ordering::SeqCst);
                return Ok(());
            }
            DispatcherState::Running => {}
        }

        let (confirm_tx, confirm_rx) = oneshot::channel();
        // The drain command queues behind every pending task, so receiving
        // the confirmation implies the queue emptied first.
        if self.command_tx.send(Command::Drain(confirm_tx)).await.is_ok() {
            let _ = confirm_rx.await;
        }
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!("Dispatcher worker join failed: {}", err);
            }
        }
        self.state
            .store(DispatcherState::Stopped as u8, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        relations_seen: AtomicUsize,
    }

    impl CountingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                relations_seen: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ReplicationEventHandler for CountingHandler {
        async fn on_relation_event(
            &self,
            _xld: XLogData,
            _relation: &RelationMetadata,
        ) -> Result<()> {
            self.relations_seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn relation() -> RelationMetadata {
        RelationMetadata {
            relation_oid: 16384,
            entity: crate::catalog::SystemEntity::new("public", "metrics"),
        }
    }

    fn xld() -> XLogData {
        XLogData::synthetic(Lsn::new(1))
    }

    #[tokio::test]
    async fn test_dispatch_reaches_registered_handler() {
        let dispatcher = Dispatcher::new(8);
        let handler = CountingHandler::new();
        dispatcher.register_handler(handler.clone());
        dispatcher.start();

        let (xld, relation) = (xld(), relation());
        dispatcher
            .enqueue(task(move |n| async move {
                n.notify_base_handlers(xld, &relation).await;
            }))
            .await
            .unwrap();
        dispatcher.stop().await.unwrap();

        assert_eq!(handler.relations_seen.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_noop() {
        let dispatcher = Dispatcher::new(8);
        let handler = CountingHandler::new();
        dispatcher.register_handler(handler.clone());
        dispatcher.register_handler(handler.clone());
        dispatcher.start();

        let (xld, relation) = (xld(), relation());
        dispatcher
            .enqueue(task(move |n| async move {
                n.notify_base_handlers(xld, &relation).await;
            }))
            .await
            .unwrap();
        dispatcher.stop().await.unwrap();

        assert_eq!(handler.relations_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister_removes_handler() {
        let dispatcher = Dispatcher::new(8);
        let handler = CountingHandler::new();
        let as_dyn: Arc<dyn ReplicationEventHandler> = handler.clone();
        dispatcher.register_handler(as_dyn.clone());
        dispatcher.unregister_handler(&as_dyn);
        dispatcher.start();

        let (xld, relation) = (xld(), relation());
        dispatcher
            .enqueue(task(move |n| async move {
                n.notify_base_handlers(xld, &relation).await;
            }))
            .await
            .unwrap();
        dispatcher.stop().await.unwrap();

        assert_eq!(handler.relations_seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_enqueue_fails_after_stop() {
        let dispatcher = Dispatcher::new(8);
        dispatcher.start();
        dispatcher.stop().await.unwrap();

        let result = dispatcher.enqueue(task(|_| async {})).await;
        assert!(matches!(result, Err(StreamerError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_stop_drains_pending_tasks() {
        let dispatcher = Dispatcher::new(32);
        let handler = CountingHandler::new();
        dispatcher.register_handler(handler.clone());
        dispatcher.start();

        for _ in 0..10 {
            let (xld, relation) = (xld(), relation());
            dispatcher
                .enqueue(task(move |n| async move {
                    n.notify_base_handlers(xld, &relation).await;
                }))
                .await
                .unwrap();
        }
        dispatcher.stop().await.unwrap();

        assert_eq!(handler.relations_seen.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_kill_worker() {
        let dispatcher = Dispatcher::new(8);
        let handler = CountingHandler::new();
        dispatcher.register_handler(handler.clone());
        dispatcher.start();

        dispatcher
            .enqueue(task(|_| async {
                panic!("handler exploded");
            }))
            .await
            .unwrap();

        let (xld, relation) = (xld(), relation());
        dispatcher
            .enqueue(task(move |n| async move {
                n.notify_base_handlers(xld, &relation).await;
            }))
            .await
            .unwrap();
        dispatcher.stop().await.unwrap();

        assert_eq!(handler.relations_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_abort_walk() {
        struct FailingHandler;

        #[async_trait]
        impl ReplicationEventHandler for FailingHandler {
            async fn on_relation_event(
                &self,
                _xld: XLogData,
                _relation: &RelationMetadata,
            ) -> Result<()> {
                Err(StreamerError::fatal("boom"))
            }
        }

        let dispatcher = Dispatcher::new(8);
        let failing: Arc<dyn ReplicationEventHandler> = Arc::new(FailingHandler);
        let counting = CountingHandler::new();
        dispatcher.register_handler(failing);
        dispatcher.register_handler(counting.clone());
        dispatcher.start();

        let (xld, relation) = (xld(), relation());
        dispatcher
            .enqueue(task(move |n| async move {
                n.notify_base_handlers(xld, &relation).await;
            }))
            .await
            .unwrap();
        dispatcher.stop().await.unwrap();

        assert_eq!(counting.relations_seen.load(Ordering::SeqCst), 1);
    }
}
