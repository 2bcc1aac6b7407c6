//! # Core Error Types
//!
//! Every failure the coordinator can report. Upload validation failures are
//! terminal for the request that caused them, announcement failures are
//! recovered locally, and a failed broker connection at startup is the only
//! condition that ends the process.

use thiserror::Error;

/// Why an uploaded image was refused. The previously cached image is never
/// touched when one of these is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The payload is not a recognised image encoding.
    #[error("undecodable image: {0}")]
    Undecodable(String),

    /// The image decoded but is not the size the display hardware requires.
    #[error("bad image size: {width}x{height} (display requires {expected_width}x{expected_height})")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },
}

/// Returned by reads before any upload has succeeded. This is the expected
/// steady state of a freshly started server.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no image cached yet")]
pub struct NotReady;

/// A transport-level publish failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("publish to '{topic}' failed: {reason}")]
pub struct PublishError {
    pub topic: String,
    pub reason: String,
}

impl PublishError {
    pub fn new(topic: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failure modes of a single image announcement.
#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error(transparent)]
    NotReady(#[from] NotReady),

    #[error("failed to encode announcement: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// An inbound presence message that could not be applied to the registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PresenceError {
    /// The topic is not `<prefix>/<prefix>/<clientId>` under the expected prefix.
    #[error("malformed presence topic '{0}'")]
    MalformedTopic(String),

    /// The payload is not a UTF-8 status word.
    #[error("invalid presence payload on '{topic}': {reason}")]
    InvalidPayload { topic: String, reason: String },
}

/// The broker connection could not be established at startup.
#[derive(Debug, Error)]
pub enum TransportConnectError {
    #[error("invalid broker address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("broker {address} refused or dropped the connection: {reason}")]
    Connection { address: String, reason: String },

    #[error("timed out after {seconds}s waiting for broker {address}")]
    Timeout { address: String, seconds: u64 },

    #[error("failed to subscribe to '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },
}
