//! # Image Announcements
//!
//! Tells subscribed displays where the current image lives and what its
//! fingerprint is. The broker keeps no last value for this topic, so the same
//! announcement is repeated on a timer: a display that was offline during an
//! upload picks the image up at the next tick.
//!
//! Announcing is best-effort. Failures are logged and counted here and never
//! reach the uploader.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::core::error::{AnnounceError, NotReady};
use crate::core::image_store::{CachedImage, ImageStore};
use crate::core::metrics::PhatMetrics;
use crate::core::publisher::{DeliveryQos, Publisher};

/// Wire format of an announcement.
#[derive(Debug, Serialize)]
struct Announcement<'a> {
    url: &'a str,
    hash: &'a str,
}

pub struct Notifier {
    publisher: Arc<dyn Publisher>,
    image_topic: String,
    image_url: String,
    metrics: PhatMetrics,
}

impl Notifier {
    /// `external_url` is the base URL displays use to reach this server;
    /// announcements point at `<external_url>/image`.
    pub fn new(publisher: Arc<dyn Publisher>, image_topic: impl Into<String>, external_url: &str, metrics: PhatMetrics) -> Self {
        Self {
            publisher,
            image_topic: image_topic.into(),
            image_url: format!("{}/image", external_url.trim_end_matches('/')),
            metrics,
        }
    }

    pub fn image_url(&self) -> &str {
        &self.image_url
    }

    pub fn payload(&self, image: &CachedImage) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&Announcement {
            url: &self.image_url,
            hash: image.fingerprint(),
        })
    }

    /// Publishes an announcement for `image`, or reports [`NotReady`] without
    /// publishing when nothing has been uploaded yet.
    pub async fn announce(&self, image: Result<Arc<CachedImage>, NotReady>) -> Result<(), AnnounceError> {
        let image = image?;
        let payload = self.payload(&image)?;
        match self
            .publisher
            .publish(&self.image_topic, payload, DeliveryQos::AtLeastOnce, false)
            .await
        {
            Ok(()) => {
                self.metrics.record_announcement(true);
                tracing::debug!(topic = %self.image_topic, hash = image.fingerprint(), "published image announcement");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_announcement(false);
                tracing::warn!(topic = %self.image_topic, error = %e, "image announcement failed");
                Err(e.into())
            }
        }
    }

    /// Re-announces whatever `store` holds every `every`, until `shutdown`
    /// fires. The first announcement happens one full period after start.
    pub async fn run_periodic(&self, every: Duration, store: Arc<ImageStore>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = every.as_secs(), "periodic announcer started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("periodic announcer received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    match self.announce(store.get()).await {
                        Ok(()) => {}
                        Err(AnnounceError::NotReady(_)) => {
                            tracing::debug!("periodic announce skipped: no image cached yet");
                        }
                        // Already logged and counted by announce.
                        Err(_) => {}
                    }
                }
            }
        }
    }
}
