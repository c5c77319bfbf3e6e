//! Raw frames, luma conversion and region crops.

use crate::types::BoundingBox;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel layout of an [`ImageBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit grayscale (1 byte/pixel).
    Gray8,
    /// Packed 8-bit RGB (3 bytes/pixel).
    Rgb8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Gray8 => "gray8",
            PixelFormat::Rgb8 => "rgb8",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "gray8" => Some(PixelFormat::Gray8),
            "rgb8" => Some(PixelFormat::Rgb8),
            _ => None,
        }
    }
}

/// A raw frame handed over by acquisition. Consumers copy what they retain.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    #[serde(with = "crate::types::blob")]
    pub data: Vec<u8>,
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl ImageBuffer {
    pub fn gray(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self { width, height, format: PixelFormat::Gray8, data }
    }

    pub fn rgb(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self { width, height, format: PixelFormat::Rgb8, data }
    }

    /// Decode an encoded image file (PNG, JPEG, ...) into an RGB frame.
    pub fn from_encoded(bytes: &[u8]) -> Result<Self, FrameError> {
        let rgb = image::load_from_memory(bytes)?.to_rgb8();
        let (width, height) = rgb.dimensions();
        let frame = Self::rgb(width, height, rgb.into_raw());
        frame.validate()?;
        Ok(frame)
    }

    /// Check dimensions and buffer length against the pixel format.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::EmptyDimensions);
        }
        let expected = self.width as usize * self.height as usize * self.format.channels();
        if self.data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Grayscale view of the frame (BT.601 luma for RGB input).
    pub fn to_luma(&self) -> Result<GrayImage, FrameError> {
        self.validate()?;
        let luma = match self.format {
            PixelFormat::Gray8 => self.data.clone(),
            PixelFormat::Rgb8 => self
                .data
                .chunks_exact(3)
                .map(|px| {
                    let y = 77 * px[0] as u32 + 150 * px[1] as u32 + 29 * px[2] as u32;
                    (y >> 8) as u8
                })
                .collect(),
        };
        GrayImage::from_raw(self.width, self.height, luma).ok_or(FrameError::InvalidLength {
            expected: self.width as usize * self.height as usize,
            actual: self.data.len() / self.format.channels(),
        })
    }

    /// Grayscale crop of a region. The box is rounded outward to whole pixels
    /// and clamped to the frame.
    pub fn crop_luma(&self, bbox: &BoundingBox) -> Result<GrayImage, FrameError> {
        let luma = self.to_luma()?;
        let x0 = bbox.x.max(0.0).floor() as u32;
        let y0 = bbox.y.max(0.0).floor() as u32;
        let x1 = ((bbox.x + bbox.width).ceil().max(0.0) as u32).min(self.width);
        let y1 = ((bbox.y + bbox.height).ceil().max(0.0) as u32).min(self.height);
        if x1 <= x0 || y1 <= y0 {
            return Err(FrameError::RegionOutOfBounds);
        }
        Ok(image::imageops::crop_imm(&luma, x0, y0, x1 - x0, y1 - y0).to_image())
    }
}

/// Decode a stored reference image to grayscale.
///
/// Used both to validate watchlist input and to build reference embeddings.
pub fn decode_reference(bytes: &[u8]) -> Result<GrayImage, FrameError> {
    if bytes.is_empty() {
        return Err(FrameError::MissingImage);
    }
    let gray = image::load_from_memory(bytes)?.to_luma8();
    if gray.width() == 0 || gray.height() == 0 {
        return Err(FrameError::EmptyDimensions);
    }
    Ok(gray)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame has zero width or height")]
    EmptyDimensions,
    #[error("region lies outside the frame")]
    RegionOutOfBounds,
    #[error("no image data")]
    MissingImage,
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
}
