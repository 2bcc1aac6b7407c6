//! # Prometheus Metrics
//!
//! Counters and gauges updated by the coordinator. Each coordinator owns its
//! own `prometheus::Registry`, so nothing here is process-global and several
//! coordinators can coexist (in tests, for instance).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use prometheus::{Gauge, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::core::registry::PresenceStatus;

const NAMESPACE: &str = "phatmqtt";
const SUBSYSTEM: &str = "server";

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE).subsystem(SUBSYSTEM)
}

/// All metrics exported by the bridge.
#[derive(Clone)]
pub struct PhatMetrics {
    registry: Registry,

    /// Successful uploads.
    pub images_posted: IntCounter,

    /// Successful image downloads (including conditional 304s).
    pub images_downloaded: IntCounter,

    /// UNIX time of the last successful upload.
    pub last_upload_at: Gauge,

    /// Displays per reported status - labels: status
    pub online_clients: IntGaugeVec,

    /// Announcements handed to the broker.
    pub announcements_published: IntCounter,

    /// Announcements that could not be published.
    pub announcement_failures: IntCounter,

    /// `online_clients` labels currently exported for statuses outside
    /// [`PresenceStatus::KNOWN`].
    extra_statuses: Arc<Mutex<BTreeSet<String>>>,
}

impl PhatMetrics {
    /// Create and register all metrics on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let images_posted = IntCounter::with_opts(opts("images_posted", "Images accepted by upload"))?;
        let images_downloaded = IntCounter::with_opts(opts("images_downloaded", "Images served to displays"))?;
        let last_upload_at = Gauge::with_opts(opts("last_upload_at", "UNIX time of the last accepted upload"))?;
        let online_clients = IntGaugeVec::new(opts("online_clients", "Displays by last reported status"), &["status"])?;
        let announcements_published =
            IntCounter::with_opts(opts("announcements_published", "Image announcements published"))?;
        let announcement_failures =
            IntCounter::with_opts(opts("announcement_failures", "Image announcements that failed to publish"))?;

        registry.register(Box::new(images_posted.clone()))?;
        registry.register(Box::new(images_downloaded.clone()))?;
        registry.register(Box::new(last_upload_at.clone()))?;
        registry.register(Box::new(online_clients.clone()))?;
        registry.register(Box::new(announcements_published.clone()))?;
        registry.register(Box::new(announcement_failures.clone()))?;

        Ok(Self {
            registry,
            images_posted,
            images_downloaded,
            last_upload_at,
            online_clients,
            announcements_published,
            announcement_failures,
            extra_statuses: Arc::new(Mutex::new(BTreeSet::new())),
        })
    }

    pub fn record_upload(&self, at: DateTime<Utc>) {
        self.images_posted.inc();
        self.last_upload_at.set(at.timestamp_millis() as f64 / 1000.0);
    }

    pub fn record_download(&self) {
        self.images_downloaded.inc();
    }

    pub fn record_announcement(&self, success: bool) {
        if success {
            self.announcements_published.inc();
        } else {
            self.announcement_failures.inc();
        }
    }

    /// Mirrors `counts` onto the per-status gauges.
    ///
    /// Each series is set in place, so a concurrent scrape always finds the
    /// known statuses. Known statuses missing from `counts` read 0; other
    /// statuses that no display reports any more are dropped.
    pub fn set_presence_counts(&self, counts: &BTreeMap<PresenceStatus, usize>) {
        let mut extra = self.extra_statuses.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        for status in PresenceStatus::KNOWN.iter() {
            let count = counts.get(status).copied().unwrap_or(0);
            self.online_clients.with_label_values(&[status.as_str()]).set(count as i64);
        }

        let mut current = BTreeSet::new();
        for (status, count) in counts {
            if let PresenceStatus::Other(label) = status {
                self.online_clients.with_label_values(&[label.as_str()]).set(*count as i64);
                current.insert(label.clone());
            }
        }
        for gone in extra.difference(&current) {
            if let Err(e) = self.online_clients.remove_label_values(&[gone.as_str()]) {
                tracing::debug!(status = %gone, error = %e, "presence gauge already gone");
            }
        }
        *extra = current;
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_instances_do_not_collide() {
        let a = PhatMetrics::new().unwrap();
        let b = PhatMetrics::new().unwrap();
        a.record_download();
        assert_eq!(a.images_downloaded.get(), 1);
        assert_eq!(b.images_downloaded.get(), 0);
    }

    #[test]
    fn missing_known_statuses_read_zero() {
        let metrics = PhatMetrics::new().unwrap();
        let mut counts = BTreeMap::new();
        counts.insert(PresenceStatus::Alive, 2);
        metrics.set_presence_counts(&counts);
        assert_eq!(metrics.online_clients.with_label_values(&["ALIVE"]).get(), 2);

        counts.clear();
        counts.insert(PresenceStatus::Dead, 2);
        metrics.set_presence_counts(&counts);
        assert_eq!(metrics.online_clients.with_label_values(&["ALIVE"]).get(), 0);
        assert_eq!(metrics.online_clients.with_label_values(&["DEAD"]).get(), 2);
    }

    #[test]
    fn vanished_extra_status_is_dropped() {
        let metrics = PhatMetrics::new().unwrap();
        let mut counts = BTreeMap::new();
        counts.insert(PresenceStatus::Other("ASLEEP".into()), 1);
        counts.insert(PresenceStatus::Alive, 1);
        metrics.set_presence_counts(&counts);
        let text = metrics.render().unwrap();
        assert!(text.contains(r#"phatmqtt_server_online_clients{status="ASLEEP"} 1"#), "{text}");

        counts.remove(&PresenceStatus::Other("ASLEEP".into()));
        counts.insert(PresenceStatus::Alive, 2);
        metrics.set_presence_counts(&counts);
        let text = metrics.render().unwrap();
        assert!(!text.contains("ASLEEP"), "{text}");
        assert!(text.contains(r#"phatmqtt_server_online_clients{status="ALIVE"} 2"#), "{text}");
        assert!(text.contains(r#"phatmqtt_server_online_clients{status="SHUTDOWN"} 0"#), "{text}");
    }

    #[test]
    fn scrape_during_updates_always_sees_known_series() {
        let metrics = PhatMetrics::new().unwrap();
        let mut counts = BTreeMap::new();
        counts.insert(PresenceStatus::Alive, 1);
        metrics.set_presence_counts(&counts);

        std::thread::scope(|scope| {
            let writer = metrics.clone();
            let written = counts.clone();
            scope.spawn(move || {
                for _ in 0..2_000 {
                    writer.set_presence_counts(&written);
                }
            });
            for _ in 0..500 {
                let text = metrics.render().unwrap();
                assert!(text.contains(r#"phatmqtt_server_online_clients{status="ALIVE"} 1"#), "{text}");
                assert!(text.contains(r#"phatmqtt_server_online_clients{status="DEAD"} 0"#), "{text}");
            }
        });
    }

    #[test]
    fn render_uses_the_namespaced_names() {
        let metrics = PhatMetrics::new().unwrap();
        metrics.record_upload(Utc::now());
        let text = metrics.render().unwrap();
        assert!(text.contains("phatmqtt_server_images_posted 1"), "{text}");
        assert!(text.contains("phatmqtt_server_last_upload_at"), "{text}");
    }
}
