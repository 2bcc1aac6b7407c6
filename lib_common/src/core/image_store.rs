//! # Image Store
//!
//! Holds the one image the displays should be showing. A successful upload
//! replaces it wholesale; readers get a shared `Arc` snapshot and never see a
//! half-written image.
//!
//! All decoding, conversion and hashing happens before the write lock is taken.
//! The lock only guards the timestamp and the pointer swap, so a slow
//! conversion never stalls concurrent downloads. `stored_at` never goes
//! backwards from one stored image to the next.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::core::codec::{
    ImageCodec, PhatCodec, DISPLAY_HEIGHT, DISPLAY_WIDTH, PALETTED_MIME, PHAT_PALETTE,
};
use crate::core::error::{NotReady, ValidationError};

/// The most recently accepted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    bytes: Vec<u8>,
    content_type: String,
    fingerprint: String,
    stored_at: DateTime<Utc>,
}

impl CachedImage {
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>, stored_at: DateTime<Utc>) -> Self {
        PendingImage::new(bytes, content_type).stamp(stored_at)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Hex SHA-256 of the stored bytes.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// An accepted image that has been hashed but not yet timestamped.
struct PendingImage {
    bytes: Vec<u8>,
    content_type: String,
    fingerprint: String,
}

impl PendingImage {
    fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        let fingerprint = fingerprint(&bytes);
        Self {
            bytes,
            content_type: content_type.into(),
            fingerprint,
        }
    }

    fn stamp(self, stored_at: DateTime<Utc>) -> CachedImage {
        CachedImage {
            bytes: self.bytes,
            content_type: self.content_type,
            fingerprint: self.fingerprint,
            stored_at,
        }
    }
}

/// Content hash used as the HTTP validator and announced to subscribers.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Single-slot cache guarded by a reader/writer lock.
pub struct ImageStore {
    codec: Arc<dyn ImageCodec>,
    current: RwLock<Option<Arc<CachedImage>>>,
}

impl Default for ImageStore {
    fn default() -> Self {
        Self::new(Arc::new(PhatCodec))
    }
}

impl ImageStore {
    pub fn new(codec: Arc<dyn ImageCodec>) -> Self {
        Self {
            codec,
            current: RwLock::new(None),
        }
    }

    /// Validates `raw`, optionally converts it to the display palette and, on
    /// success, makes it the current image.
    pub fn set(&self, raw: &[u8], perform_conversion: bool) -> Result<Arc<CachedImage>, ValidationError> {
        let header = self.codec.decode_dimensions(raw)?;
        if !header.matches_display() {
            tracing::error!(
                problem = "incorrect-size",
                imgsize = %format!("{}x{}", header.width, header.height),
                "bad image size"
            );
            return Err(ValidationError::SizeMismatch {
                width: header.width,
                height: header.height,
                expected_width: DISPLAY_WIDTH,
                expected_height: DISPLAY_HEIGHT,
            });
        }
        tracing::info!(format = header.mime_type(), "decoded image OK");

        let image = if perform_conversion {
            tracing::debug!("converting image to target palette");
            let pixels = self.codec.decode_full(raw)?;
            let converted = self.codec.encode_paletted(&pixels, &PHAT_PALETTE)?;
            PendingImage::new(converted, PALETTED_MIME)
        } else {
            PendingImage::new(raw.to_vec(), header.mime_type())
        };

        let mut slot = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Utc::now();
        let stored_at = match slot.as_ref() {
            Some(previous) if previous.stored_at > now => previous.stored_at,
            _ => now,
        };
        let image = Arc::new(image.stamp(stored_at));
        *slot = Some(Arc::clone(&image));
        Ok(image)
    }

    /// Current image, or [`NotReady`] before the first successful upload.
    pub fn get(&self) -> Result<Arc<CachedImage>, NotReady> {
        let slot = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.as_ref().map(Arc::clone).ok_or(NotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::tests::solid_image;
    use image::ImageFormat;

    fn display_png(rgba: [u8; 4]) -> Vec<u8> {
        solid_image(DISPLAY_WIDTH, DISPLAY_HEIGHT, rgba, ImageFormat::Png)
    }

    #[test]
    fn empty_store_is_not_ready() {
        let store = ImageStore::default();
        assert_eq!(store.get().unwrap_err(), NotReady);
    }

    #[test]
    fn raw_upload_is_stored_verbatim() {
        let store = ImageStore::default();
        let bytes = display_png([1, 2, 3, 255]);
        let stored = store.set(&bytes, false).unwrap();
        assert_eq!(stored.bytes(), bytes.as_slice());
        assert_eq!(stored.content_type(), "image/png");
        assert_eq!(stored.fingerprint(), fingerprint(&bytes));
        assert_eq!(store.get().unwrap(), stored);
    }

    #[test]
    fn converted_upload_is_a_decodable_display_png() {
        let store = ImageStore::default();
        let stored = store.set(&display_png([255, 255, 255, 255]), true).unwrap();
        assert_eq!(stored.content_type(), PALETTED_MIME);
        let decoded = image::load_from_memory(stored.bytes()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (DISPLAY_WIDTH, DISPLAY_HEIGHT));
    }

    #[test]
    fn jpeg_input_is_converted_to_png() {
        let store = ImageStore::default();
        let jpeg = solid_image(DISPLAY_WIDTH, DISPLAY_HEIGHT, [0, 0, 0, 255], ImageFormat::Jpeg);
        let stored = store.set(&jpeg, true).unwrap();
        assert_eq!(stored.content_type(), "image/png");

        let raw = store.set(&jpeg, false).unwrap();
        assert_eq!(raw.content_type(), "image/jpeg");
    }

    #[test]
    fn wrong_size_leaves_previous_image_in_place() {
        let store = ImageStore::default();
        let first = store.set(&display_png([0, 0, 0, 255]), true).unwrap();

        let small = solid_image(100, 100, [0, 0, 0, 255], ImageFormat::Png);
        let err = store.set(&small, true).unwrap_err();
        assert_eq!(
            err,
            ValidationError::SizeMismatch {
                width: 100,
                height: 100,
                expected_width: 212,
                expected_height: 104
            }
        );
        assert_eq!(store.get().unwrap(), first);
    }

    #[test]
    fn garbage_leaves_previous_image_in_place() {
        let store = ImageStore::default();
        let first = store.set(&display_png([0, 0, 0, 255]), false).unwrap();
        let err = store.set(b"GIF? no, just text", true).unwrap_err();
        assert!(matches!(err, ValidationError::Undecodable(_)));
        assert_eq!(store.get().unwrap(), first);
    }

    #[test]
    fn fingerprint_is_deterministic_and_sensitive() {
        let bytes = display_png([9, 9, 9, 255]);
        assert_eq!(fingerprint(&bytes), fingerprint(&bytes.clone()));

        let mut changed = bytes.clone();
        let last = changed.len() - 1;
        changed[last] ^= 0x01;
        assert_ne!(fingerprint(&bytes), fingerprint(&changed));
        assert_eq!(fingerprint(&bytes).len(), 64);
    }

    #[test]
    fn later_upload_replaces_earlier() {
        let store = ImageStore::default();
        store.set(&display_png([0, 0, 0, 255]), false).unwrap();
        let second = store.set(&display_png([255, 0, 0, 255]), false).unwrap();
        assert_eq!(store.get().unwrap().fingerprint(), second.fingerprint());
    }

    #[test]
    fn concurrent_writers_and_readers_see_whole_images() {
        use std::collections::HashSet;

        let store = ImageStore::default();
        let images: Vec<Vec<u8>> = (0..4u8).map(|i| display_png([i * 60, 10, 200 - i * 40, 255])).collect();
        let written: HashSet<String> = images.iter().map(|bytes| fingerprint(bytes)).collect();
        assert_eq!(written.len(), images.len());
        store.set(&images[0], false).unwrap();

        std::thread::scope(|scope| {
            for bytes in &images {
                let store = &store;
                scope.spawn(move || {
                    for _ in 0..25 {
                        store.set(bytes, false).unwrap();
                    }
                });
            }
            for _ in 0..4 {
                let (store, written) = (&store, &written);
                scope.spawn(move || {
                    let mut last_stored_at = None;
                    for _ in 0..200 {
                        let snapshot = store.get().unwrap();
                        assert_eq!(fingerprint(snapshot.bytes()), snapshot.fingerprint());
                        assert!(written.contains(snapshot.fingerprint()));
                        if let Some(last) = last_stored_at {
                            assert!(snapshot.stored_at() >= last, "stored_at went backwards");
                        }
                        last_stored_at = Some(snapshot.stored_at());
                    }
                });
            }
        });
    }

    #[test]
    fn stored_at_never_goes_backwards() {
        let store = ImageStore::default();
        let images = [display_png([0, 0, 0, 255]), display_png([255, 0, 0, 255])];
        let mut last = store.set(&images[0], false).unwrap().stored_at();
        for i in 0..50 {
            let stored = store.set(&images[i % 2], false).unwrap();
            assert!(stored.stored_at() >= last);
            last = stored.stored_at();
        }
    }
}
