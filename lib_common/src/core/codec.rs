//! # Display Image Codec
//!
//! The image capability used by the store: sniff a payload's format and
//! dimensions cheaply, decode it fully when conversion is requested, and
//! re-encode it as a palette-indexed PNG the e-ink display can render
//! directly.
//!
//! Everything format-specific lives behind [`ImageCodec`] so the store and the
//! coordinator only ever see success/failure and the resulting bytes.

use std::io::Cursor;

use image::{ImageFormat, ImageReader, RgbaImage};

use crate::core::error::ValidationError;

/// Width in pixels every accepted image must have.
pub const DISPLAY_WIDTH: u32 = 212;
/// Height in pixels every accepted image must have.
pub const DISPLAY_HEIGHT: u32 = 104;

/// MIME type of every palette-converted image.
pub const PALETTED_MIME: &str = "image/png";

/// A small, fixed set of colours an output pixel may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Palette {
    colors: &'static [[u8; 3]],
}

/// Black, white and red: the three inks of the display hardware.
pub const PHAT_PALETTE: Palette = Palette::new(&[[0, 0, 0], [255, 255, 255], [255, 0, 0]]);

impl Palette {
    /// Panics if `colors` has more than 256 entries, the most a PNG palette
    /// and a `u8` index can address. Checked at compile time for `const`s.
    pub const fn new(colors: &'static [[u8; 3]]) -> Self {
        assert!(colors.len() <= 256, "a palette holds at most 256 colours");
        Self { colors }
    }

    pub fn colors(&self) -> &'static [[u8; 3]] {
        self.colors
    }

    /// Index of the palette entry closest to `pixel`.
    ///
    /// Distance is the squared difference over all four channels of the
    /// alpha-premultiplied pixel, with every palette entry treated as opaque,
    /// so fully transparent pixels land on black. Ties resolve to the lower
    /// index.
    pub fn nearest(&self, pixel: [u8; 4]) -> u8 {
        let alpha = i32::from(pixel[3]);
        let mut best = 0usize;
        let mut best_distance = u32::MAX;
        for (index, color) in self.colors.iter().enumerate() {
            let mut distance = 0u32;
            for channel in 0..3 {
                let premultiplied = i32::from(pixel[channel]) * alpha / 255;
                let d = premultiplied - i32::from(color[channel]);
                distance += (d * d) as u32;
            }
            let da = 255 - alpha;
            distance += (da * da) as u32;
            if distance < best_distance {
                best_distance = distance;
                best = index;
            }
        }
        best as u8
    }

    /// PLTE chunk contents: packed RGB triples.
    fn to_plte(self) -> Vec<u8> {
        self.colors.iter().flatten().copied().collect()
    }
}

/// What a cheap header read reveals about a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

impl ImageHeader {
    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    pub fn matches_display(&self) -> bool {
        self.width == DISPLAY_WIDTH && self.height == DISPLAY_HEIGHT
    }
}

/// Decode/encode capability used by the image store.
pub trait ImageCodec: Send + Sync {
    /// Reads format and dimensions without materialising pixels.
    fn decode_dimensions(&self, bytes: &[u8]) -> Result<ImageHeader, ValidationError>;

    /// Decodes every pixel of the payload.
    fn decode_full(&self, bytes: &[u8]) -> Result<RgbaImage, ValidationError>;

    /// Encodes `pixels` as an indexed raster against `palette`.
    fn encode_paletted(&self, pixels: &RgbaImage, palette: &Palette) -> Result<Vec<u8>, ValidationError>;
}

/// Default codec: sniffs PNG, JPEG and GIF input, writes indexed PNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhatCodec;

impl ImageCodec for PhatCodec {
    fn decode_dimensions(&self, bytes: &[u8]) -> Result<ImageHeader, ValidationError> {
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ValidationError::Undecodable(e.to_string()))?;
        let format = reader
            .format()
            .ok_or_else(|| ValidationError::Undecodable("unrecognised image format".to_string()))?;
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| ValidationError::Undecodable(e.to_string()))?;
        Ok(ImageHeader { width, height, format })
    }

    fn decode_full(&self, bytes: &[u8]) -> Result<RgbaImage, ValidationError> {
        image::load_from_memory(bytes)
            .map(|img| img.to_rgba8())
            .map_err(|e| ValidationError::Undecodable(e.to_string()))
    }

    fn encode_paletted(&self, pixels: &RgbaImage, palette: &Palette) -> Result<Vec<u8>, ValidationError> {
        let (width, height) = pixels.dimensions();
        let indices: Vec<u8> = pixels.pixels().map(|p| palette.nearest(p.0)).collect();

        let mut out = Vec::new();
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(png::ColorType::Indexed);
        encoder.set_depth(png::BitDepth::Eight);
        encoder.set_palette(palette.to_plte());

        let encode_failed = |e: png::EncodingError| ValidationError::Undecodable(format!("palette encode failed: {e}"));
        let mut writer = encoder.write_header().map_err(encode_failed)?;
        writer.write_image_data(&indices).map_err(encode_failed)?;
        writer.finish().map_err(encode_failed)?;
        Ok(out)
    }
}
