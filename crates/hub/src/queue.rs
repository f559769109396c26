//! Sync queue: a FIFO of uploads drained by exactly one worker task.
//!
//! Local durability never waits on the hub: a failed upload is logged and
//! dropped, and the record stays `pending` in the store.

use membase_core::error::{HubError, SyncError};
use membase_core::hub::{HubTransport, UploadRequest};
use membase_core::store::MessageBackend;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One upload waiting in the queue.
#[derive(Debug, Clone)]
pub struct SyncItem {
    pub request: UploadRequest,
    /// Id of the stored message to mark uploaded once the hub acknowledges it
    pub message_id: Option<String>,
}

/// What happened to an item, reported to callers that wait.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Uploaded,
    Failed(HubError),
}

impl SyncOutcome {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, SyncOutcome::Uploaded)
    }
}

/// Running totals since the worker started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub uploaded: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    uploaded: AtomicU64,
    failed: AtomicU64,
}

enum Command {
    Upload {
        item: SyncItem,
        done: Option<oneshot::Sender<SyncOutcome>>,
    },
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Handle to the upload queue. Clones share the same worker.
#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncQueue {
    /// Spawn the drain worker. With a `backend`, acknowledged records are
    /// marked uploaded.
    pub fn start(
        transport: Arc<dyn HubTransport>,
        backend: Option<Arc<dyn MessageBackend>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        info!(transport = transport.name(), "Sync worker started");
        let handle = tokio::spawn(run_worker(rx, transport, backend, counters.clone()));

        Self {
            tx,
            counters,
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queue an upload. With `wait`, returns once the worker has attempted it.
    pub async fn enqueue(
        &self,
        item: SyncItem,
        wait: bool,
    ) -> Result<Option<SyncOutcome>, SyncError> {
        if !wait {
            self.tx
                .send(Command::Upload { item, done: None })
                .map_err(|_| SyncError::Closed)?;
            return Ok(None);
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Upload {
                item,
                done: Some(done_tx),
            })
            .map_err(|_| SyncError::Closed)?;
        done_rx.await.map(Some).map_err(|_| SyncError::Closed)
    }

    /// Wait until every item enqueued before this call has been attempted.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack_tx))
            .map_err(|_| SyncError::Closed)?;
        ack_rx.await.map_err(|_| SyncError::Closed)
    }

    /// Drain what is already queued, then stop the worker and join it.
    pub async fn close(&self) {
        let _ = self.tx.send(Command::Shutdown);
        let handle = self.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Sync worker ended abnormally");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            uploaded: self.counters.uploaded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Command>,
    transport: Arc<dyn HubTransport>,
    backend: Option<Arc<dyn MessageBackend>>,
    counters: Arc<Counters>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Upload { item, done } => {
                let outcome =
                    upload_one(transport.as_ref(), backend.as_deref(), &counters, item).await;
                if let Some(done) = done {
                    let _ = done.send(outcome);
                }
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown => break,
        }
    }
    info!("Sync worker stopped");
}

async fn upload_one(
    transport: &dyn HubTransport,
    backend: Option<&dyn MessageBackend>,
    counters: &Counters,
    item: SyncItem,
) -> SyncOutcome {
    let SyncItem {
        request,
        message_id,
    } = item;

    match transport.upload(&request).await {
        Ok(()) => {
            counters.uploaded.fetch_add(1, Ordering::Relaxed);
            debug!(id = %request.id, bucket = %request.bucket, "Uploaded to hub");

            if let (Some(backend), Some(message_id)) = (backend, message_id.as_deref()) {
                match backend.mark_uploaded(message_id).await {
                    Ok(true) => {}
                    Ok(false) => debug!(id = %request.id, "Uploaded record no longer stored"),
                    Err(e) => warn!(id = %request.id, error = %e, "Failed to mark record uploaded"),
                }
            }
            SyncOutcome::Uploaded
        }
        Err(source) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            let err = SyncError::Upload {
                id: request.id.clone(),
                source: source.clone(),
            };
            warn!(owner = %request.owner, error = %err, "Dropping hub upload");
            SyncOutcome::Failed(source)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Records uploads; ids listed in `reject` fail with 503.
    #[derive(Default)]
    struct RecordingTransport {
        seen: Mutex<Vec<String>>,
        reject: Vec<String>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl HubTransport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        async fn upload(&self, request: &UploadRequest) -> Result<(), HubError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().unwrap().push(request.id.clone());
            if self.reject.contains(&request.id) {
                return Err(HubError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(())
        }

        async fn list_conversations(&self, _owner: &str) -> Result<Vec<String>, HubError> {
            Ok(vec![])
        }

        async fn get_conversation(&self, _owner: &str, _id: &str) -> Result<Vec<String>, HubError> {
            Ok(vec![])
        }

        async fn download(&self, _owner: &str, _id: &str) -> Result<Vec<u8>, HubError> {
            Ok(vec![])
        }
    }

    fn item(id: &str) -> SyncItem {
        SyncItem {
            request: UploadRequest {
                owner: "alice".into(),
                bucket: "alice".into(),
                id: id.into(),
                message: "{}".into(),
            },
            message_id: None,
        }
    }

    #[tokio::test]
    async fn drains_in_fifo_order() {
        let transport = Arc::new(RecordingTransport {
            delay: Some(Duration::from_millis(2)),
            ..Default::default()
        });
        let queue = SyncQueue::start(transport.clone(), None);

        for i in 0..5 {
            queue.enqueue(item(&format!("c_{i}")), false).await.unwrap();
        }
        queue.flush().await.unwrap();

        assert_eq!(
            *transport.seen.lock().unwrap(),
            vec!["c_0", "c_1", "c_2", "c_3", "c_4"]
        );
        assert_eq!(queue.stats(), SyncStats { uploaded: 5, failed: 0 });
    }

    #[tokio::test]
    async fn wait_reports_outcome() {
        let transport = Arc::new(RecordingTransport {
            reject: vec!["bad_0".into()],
            ..Default::default()
        });
        let queue = SyncQueue::start(transport, None);

        let ok = queue.enqueue(item("good_0"), true).await.unwrap().unwrap();
        assert!(ok.is_uploaded());

        let failed = queue.enqueue(item("bad_0"), true).await.unwrap().unwrap();
        assert!(matches!(
            failed,
            SyncOutcome::Failed(HubError::Status { status: 503, .. })
        ));
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn failure_does_not_stop_the_worker() {
        let transport = Arc::new(RecordingTransport {
            reject: vec!["c_0".into()],
            ..Default::default()
        });
        let queue = SyncQueue::start(transport.clone(), None);

        queue.enqueue(item("c_0"), false).await.unwrap();
        let outcome = queue.enqueue(item("c_1"), true).await.unwrap().unwrap();
        assert!(outcome.is_uploaded());
        assert_eq!(transport.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn close_drains_then_rejects() {
        let transport = Arc::new(RecordingTransport::default());
        let queue = SyncQueue::start(transport.clone(), None);

        queue.enqueue(item("c_0"), false).await.unwrap();
        queue.enqueue(item("c_1"), false).await.unwrap();
        queue.close().await;

        assert_eq!(transport.seen.lock().unwrap().len(), 2);
        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(item("c_2"), false).await,
            Err(SyncError::Closed)
        ));
        assert!(matches!(queue.flush().await, Err(SyncError::Closed)));
    }
}
