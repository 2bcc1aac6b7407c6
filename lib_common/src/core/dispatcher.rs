//! # Announcement Dispatcher
//!
//! Decouples the upload path from the broker. An accepted upload only drops an
//! [`AnnounceRequest`] onto an unbounded channel and returns; a single
//! [`AnnounceWorker`] task drains the channel and publishes.
//!
//! ## Behaviour
//!
//! 1.  **Latest wins**: the worker always announces what the store holds at the
//!     moment it runs, not the image that triggered the request. Requests that
//!     pile up while a publish is in flight are coalesced into one announcement.
//!
//! 2.  **Never blocks uploads**: `AnnounceDispatcher::request` is a plain
//!     unbounded send. If the worker is gone the request is dropped with a
//!     warning and the upload still succeeds.
//!
//! 3.  **Best-effort**: publish failures are logged and counted by the
//!     [`Notifier`]; the next upload or the periodic loop tries again.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::core::error::AnnounceError;
use crate::core::image_store::ImageStore;
use crate::core::notifier::Notifier;

/// A request to announce the current image, tagged with the fingerprint of the
/// upload that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub fingerprint: String,
}

/// Sending half, held by the coordinator.
#[derive(Debug, Clone)]
pub struct AnnounceDispatcher {
    sender: mpsc::UnboundedSender<AnnounceRequest>,
}

/// Receiving half. Run it on its own task with [`AnnounceWorker::run`].
pub struct AnnounceWorker {
    receiver: mpsc::UnboundedReceiver<AnnounceRequest>,
    notifier: Arc<Notifier>,
    store: Arc<ImageStore>,
}

/// Creates a connected dispatcher/worker pair.
pub fn announce_channel(notifier: Arc<Notifier>, store: Arc<ImageStore>) -> (AnnounceDispatcher, AnnounceWorker) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        AnnounceDispatcher { sender },
        AnnounceWorker {
            receiver,
            notifier,
            store,
        },
    )
}

impl AnnounceDispatcher {
    /// Queues an announcement. Returns `false` if the worker has stopped.
    pub fn request(&self, fingerprint: &str) -> bool {
        match self.sender.send(AnnounceRequest {
            fingerprint: fingerprint.to_string(),
        }) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(hash = fingerprint, "announce worker is not running; announcement dropped");
                false
            }
        }
    }
}

impl AnnounceWorker {
    /// # Run
    ///
    /// Processes requests until `shutdown` fires or every dispatcher handle is
    /// dropped.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("announce worker started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("announce worker received shutdown signal");
                    break;
                }
                request = self.receiver.recv() => {
                    let Some(request) = request else {
                        tracing::info!("announce channel closed");
                        break;
                    };
                    let coalesced = self.drain_pending();
                    tracing::debug!(trigger = %request.fingerprint, coalesced, "processing announce request");
                    self.announce_latest().await;
                }
            }
        }
    }

    /// Discards requests already queued behind the current one.
    fn drain_pending(&mut self) -> usize {
        let mut drained = 0;
        while self.receiver.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    async fn announce_latest(&self) {
        match self.notifier.announce(self.store.get()).await {
            Ok(()) => {}
            Err(AnnounceError::NotReady(_)) => {
                tracing::debug!("announce requested but the store is empty");
            }
            // Logged and counted by the notifier.
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::tests::solid_image;
    use crate::core::metrics::PhatMetrics;
    use crate::core::publisher::MemoryPublisher;
    use image::ImageFormat;

    fn setup() -> (Arc<MemoryPublisher>, Arc<ImageStore>, AnnounceDispatcher, AnnounceWorker) {
        let publisher = Arc::new(MemoryPublisher::new());
        let notifier = Arc::new(Notifier::new(
            publisher.clone(),
            "phat/image",
            "http://127.0.0.1:39391",
            PhatMetrics::new().unwrap(),
        ));
        let store = Arc::new(ImageStore::default());
        let (dispatcher, worker) = announce_channel(notifier, store.clone());
        (publisher, store, dispatcher, worker)
    }

    #[tokio::test]
    async fn queued_requests_collapse_into_one_announcement_of_the_latest_image() {
        let (publisher, store, dispatcher, worker) = setup();
        store.set(&solid_image(212, 104, [255, 0, 0, 255], ImageFormat::Png), false).unwrap();
        let latest = store
            .set(&solid_image(212, 104, [0, 0, 0, 255], ImageFormat::Png), false)
            .unwrap();

        assert!(dispatcher.request("first"));
        assert!(dispatcher.request("second"));
        drop(dispatcher);

        let (_tx, rx) = broadcast::channel(1);
        worker.run(rx).await;

        let sent = publisher.messages_on("phat/image");
        assert_eq!(sent.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(body["hash"], latest.fingerprint());
    }

    #[tokio::test]
    async fn request_after_worker_exit_reports_false() {
        let (_publisher, _store, dispatcher, worker) = setup();
        drop(worker);
        assert!(!dispatcher.request("orphan"));
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let (publisher, _store, _dispatcher, worker) = setup();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(worker.run(rx));
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(publisher.messages().is_empty());
    }
}
