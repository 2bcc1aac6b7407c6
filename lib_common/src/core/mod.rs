//! # Core Engine Module
//!
//! Everything the phat display bridge does that is independent of the wire:
//! holding the current image, tracking display presence, and announcing new
//! images through an abstract [`Publisher`].
//!
//! ## Core Components:
//!
//! - **`codec`**: Sniffs image headers, decodes, and re-encodes to the display's
//!   three-colour indexed PNG.
//!
//! - **`image_store`**: The single current image, swapped atomically on upload.
//!
//! - **`registry`**: Last-known status of every display, keyed by client id.
//!
//! - **`notifier`** and **`dispatcher`**: Turn uploads and timer ticks into
//!   `{"url", "hash"}` announcements without blocking the upload path.
//!
//! - **`coordinator`**: Owns all of the above and exposes the operations the
//!   HTTP and MQTT layers call.
//!
//! The transport-facing code lives in `connections`; this module never talks
//! to a broker directly.

/// Image sniffing, decoding and palette conversion.
pub mod codec;
/// Owner of all bridge state.
pub mod coordinator;
/// Queue between uploads and the announcer.
pub mod dispatcher;
/// Error types shared across the crate.
pub mod error;
/// The current image.
pub mod image_store;
/// Prometheus counters and gauges.
pub mod metrics;
/// Image announcements.
pub mod notifier;
/// Abstract publish capability.
pub mod publisher;
/// Display presence.
pub mod registry;
/// Topic names and presence-topic parsing.
pub mod topics;

// --- Public API Re-exports ---
pub use codec::{ImageCodec, ImageHeader, Palette, PhatCodec, DISPLAY_HEIGHT, DISPLAY_WIDTH, PHAT_PALETTE};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use dispatcher::{AnnounceDispatcher, AnnounceRequest, AnnounceWorker};
pub use error::{AnnounceError, NotReady, PresenceError, PublishError, TransportConnectError, ValidationError};
pub use image_store::{CachedImage, ImageStore};
pub use metrics::PhatMetrics;
pub use notifier::Notifier;
pub use publisher::{DeliveryQos, MemoryPublisher, PublishedMessage, Publisher};
pub use registry::{ClientPresence, PresenceRegistry, PresenceStatus};
pub use topics::TopicScheme;
