//! # Coordinator
//!
//! The single owner of the bridge's state. Built once at startup and shared as
//! `Arc<Coordinator>` between the HTTP handlers, the MQTT event loop and the
//! periodic announcer.
//!
//! It ties together:
//! - the [`ImageStore`] holding the current image,
//! - the [`PresenceRegistry`] of display liveness,
//! - the [`Notifier`] and the [`AnnounceDispatcher`] feeding it,
//! - the [`PhatMetrics`] registry.
//!
//! Every handler returns an owned result or an `Arc` snapshot. No lock is held
//! once a handler returns.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::core::dispatcher::{announce_channel, AnnounceDispatcher, AnnounceWorker};
use crate::core::error::{AnnounceError, NotReady, PresenceError, ValidationError};
use crate::core::image_store::{CachedImage, ImageStore};
use crate::core::metrics::PhatMetrics;
use crate::core::notifier::Notifier;
use crate::core::publisher::Publisher;
use crate::core::registry::{ClientPresence, PresenceRegistry, PresenceStatus};
use crate::core::topics::TopicScheme;

/// Static wiring for a [`Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Base URL displays use to reach the HTTP server.
    pub external_url: String,
    pub topics: TopicScheme,
}

pub struct Coordinator {
    store: Arc<ImageStore>,
    presence: PresenceRegistry,
    notifier: Arc<Notifier>,
    announcements: AnnounceDispatcher,
    metrics: PhatMetrics,
    topics: TopicScheme,
}

impl Coordinator {
    /// Builds a coordinator with the default image store.
    ///
    /// The returned [`AnnounceWorker`] must be spawned for upload announcements
    /// to go out.
    pub fn new(publisher: Arc<dyn Publisher>, config: CoordinatorConfig) -> Result<(Self, AnnounceWorker), prometheus::Error> {
        Self::with_store(publisher, config, Arc::new(ImageStore::default()))
    }

    pub fn with_store(
        publisher: Arc<dyn Publisher>,
        config: CoordinatorConfig,
        store: Arc<ImageStore>,
    ) -> Result<(Self, AnnounceWorker), prometheus::Error> {
        let metrics = PhatMetrics::new()?;
        metrics.set_presence_counts(&BTreeMap::new());

        let notifier = Arc::new(Notifier::new(
            publisher,
            config.topics.image_topic.clone(),
            &config.external_url,
            metrics.clone(),
        ));
        let (announcements, worker) = announce_channel(Arc::clone(&notifier), Arc::clone(&store));

        let coordinator = Self {
            store,
            presence: PresenceRegistry::new(),
            notifier,
            announcements,
            metrics,
            topics: config.topics,
        };
        Ok((coordinator, worker))
    }

    /// # Handle Upload
    ///
    /// Validates and stores `raw`. On success the upload counters move and an
    /// announcement is queued; a queueing failure never fails the upload.
    ///
    /// Decoding and palette conversion are CPU-bound; async callers should run
    /// this on a blocking thread.
    pub fn handle_upload(&self, raw: &[u8], perform_conversion: bool) -> Result<Arc<CachedImage>, ValidationError> {
        let image = self.store.set(raw, perform_conversion)?;
        self.metrics.record_upload(image.stored_at());
        tracing::info!(
            hash = image.fingerprint(),
            content_type = image.content_type(),
            size = image.len(),
            "image accepted"
        );
        self.announcements.request(image.fingerprint());
        Ok(image)
    }

    /// # Handle Download
    ///
    /// Current image, counted as a download. Conditional-request handling is
    /// left to the caller, which has `fingerprint` and `stored_at` to hand.
    pub fn handle_download(&self) -> Result<Arc<CachedImage>, NotReady> {
        let image = self.store.get()?;
        self.metrics.record_download();
        Ok(image)
    }

    /// # Handle Presence Message
    ///
    /// Records the status a display published on `<prefix>/<clientId>` and
    /// refreshes the per-status gauges. Gauges are written while the registry
    /// is still locked, so concurrent messages update them in arrival order.
    pub fn handle_presence_message(&self, topic: &str, payload: &[u8]) -> Result<ClientPresence, PresenceError> {
        let client_id = self.topics.client_id(topic)?;
        let text = std::str::from_utf8(payload).map_err(|e| PresenceError::InvalidPayload {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        let status: PresenceStatus = text.into();

        let presence = self.presence.upsert_with_counts(client_id, status, Utc::now(), |counts| {
            self.metrics.set_presence_counts(counts)
        });
        tracing::info!(client = client_id, status = %presence.status, "client status update");
        Ok(presence)
    }

    /// Owned copy of every display's last report.
    pub fn list_clients(&self) -> BTreeMap<String, ClientPresence> {
        self.presence.snapshot()
    }

    pub fn counts_by_status(&self) -> BTreeMap<PresenceStatus, usize> {
        self.presence.counts_by_status()
    }

    /// Announces the current image right now, bypassing the dispatcher.
    pub async fn announce_current(&self) -> Result<(), AnnounceError> {
        self.notifier.announce(self.store.get()).await
    }

    pub fn metrics(&self) -> &PhatMetrics {
        &self.metrics
    }

    pub fn store(&self) -> Arc<ImageStore> {
        Arc::clone(&self.store)
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        Arc::clone(&self.notifier)
    }

    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }
}
