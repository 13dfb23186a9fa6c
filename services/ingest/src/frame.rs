//! Validated camera frames and the JPEG codec seam.
//!
//! A [`Frame`] only exists once its payload decoded successfully, so every
//! consumer downstream of the extractor can rely on valid dimensions and
//! pixels. Buffers that outlive the request keep the cheap [`EncodedFrame`]
//! view instead of the decoded pixels.

use bytes::Bytes;
use chrono::{DateTime, Local};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use thiserror::Error;

/// JPEG start-of-image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Errors raised by the image codec.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Empty frame payload")]
    Empty,

    #[error("Payload is not a decodable JPEG: {0}")]
    Decode(#[from] image::ImageError),
}

/// A decoded frame from one device.
#[derive(Debug, Clone)]
pub struct Frame {
    payload: Bytes,
    pixels: RgbImage,
    channels: u8,
    captured_at: DateTime<Local>,
}

/// Encoded view of a frame retained by recorders and motion buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// JPEG payload as received
    pub payload: Bytes,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Capture timestamp
    pub captured_at: DateTime<Local>,
}

impl Frame {
    /// Decode and validate a JPEG payload.
    pub fn decode(payload: Bytes, captured_at: DateTime<Local>) -> Result<Self, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::Empty);
        }

        let decoded = image::load_from_memory_with_format(&payload, ImageFormat::Jpeg)?;
        let channels = decoded.color().channel_count();

        Ok(Self {
            payload,
            pixels: decoded.to_rgb8(),
            channels,
            captured_at,
        })
    }

    /// Original encoded bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decoded RGB pixels.
    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Channel count of the source image before RGB conversion.
    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn captured_at(&self) -> DateTime<Local> {
        self.captured_at
    }

    /// Cheap, pixel-free copy for buffers that outlive the request.
    pub fn encoded(&self) -> EncodedFrame {
        EncodedFrame {
            payload: self.payload.clone(),
            width: self.width(),
            height: self.height(),
            captured_at: self.captured_at,
        }
    }
}

/// Check the bit-exact single-frame framing: `FF D8` prefix and `FF D9` suffix.
pub fn has_jpeg_markers(data: &[u8]) -> bool {
    data.len() >= 4 && data.starts_with(&JPEG_SOI) && data.ends_with(&JPEG_EOI)
}

/// Encode an RGB image as JPEG.
pub fn encode_jpeg(image: RgbImage) -> Result<Bytes, CodecError> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image).write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(Bytes::from(out.into_inner()))
}

/// Black frame served by live view when a device has nothing to show.
pub fn encode_placeholder(width: u32, height: u32) -> Result<Bytes, CodecError> {
    encode_jpeg(RgbImage::new(width, height))
}
