//! Face detection capability.
//!
//! The pipeline only sees the [`Detector`] trait; a model-backed detector and
//! the deterministic variants below are interchangeable.

use crate::frame::{FrameError, ImageBuffer};
use crate::types::{BoundingBox, FaceRegion};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),
    #[error("detection failed: {0}")]
    Failed(String),
}

/// Locates face regions in a frame.
///
/// Implementations compute the full region list before returning and must not
/// retain the frame. An empty list is a valid answer.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &ImageBuffer) -> Result<Vec<FaceRegion>, DetectionError>;
}

/// Returns the same configured regions for every valid frame.
#[derive(Debug, Clone, Default)]
pub struct FixedDetector {
    regions: Vec<FaceRegion>,
}

impl FixedDetector {
    pub fn new(regions: Vec<FaceRegion>) -> Self {
        Self { regions }
    }
}

impl Detector for FixedDetector {
    fn detect(&self, frame: &ImageBuffer) -> Result<Vec<FaceRegion>, DetectionError> {
        frame.validate()?;
        Ok(self.regions.clone())
    }
}

/// Treats the whole frame as a single face. Suited to pre-cropped portraits
/// such as uploaded watchlist photos.
#[derive(Debug, Clone, Copy)]
pub struct FullFrameDetector {
    confidence: f32,
}

impl FullFrameDetector {
    pub fn new(confidence: f32) -> Self {
        Self { confidence }
    }
}

impl Default for FullFrameDetector {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl Detector for FullFrameDetector {
    fn detect(&self, frame: &ImageBuffer) -> Result<Vec<FaceRegion>, DetectionError> {
        frame.validate()?;
        let bbox = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: frame.width as f32,
            height: frame.height as f32,
        };
        Ok(vec![FaceRegion::new(bbox, self.confidence)])
    }
}
