//! Face embeddings and the embedder capability used by [`EmbeddingMatcher`](crate::matcher::EmbeddingMatcher).

use crate::matcher::MatchError;
use image::imageops::FilterType;
use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Fixed-length face descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Zero if either vector has zero norm.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// Turns a grayscale face crop into an [`Embedding`].
///
/// A recognition model plugs in here. Implementations must be deterministic
/// for a fixed model state.
pub trait Embedder: Send + Sync {
    fn embed(&self, face: &GrayImage) -> Result<Embedding, MatchError>;
}

/// Model-free embedder: resamples the crop to a square grid and normalizes it
/// to zero mean and unit norm, so matching is invariant to brightness and scale.
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailEmbedder {
    grid: u32,
}

impl ThumbnailEmbedder {
    pub const DEFAULT_GRID: u32 = 16;

    pub fn new(grid: u32) -> Self {
        Self { grid: grid.max(2) }
    }
}

impl Default for ThumbnailEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_GRID)
    }
}

impl Embedder for ThumbnailEmbedder {
    fn embed(&self, face: &GrayImage) -> Result<Embedding, MatchError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(MatchError::Embedding("empty face crop".into()));
        }

        let thumb = image::imageops::resize(face, self.grid, self.grid, FilterType::Triangle);
        let raw: Vec<f32> = thumb.pixels().map(|p| p.0[0] as f32).collect();

        let mean = raw.iter().sum::<f32>() / raw.len() as f32;
        let centered: Vec<f32> = raw.iter().map(|v| v - mean).collect();
        let norm = centered.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            centered.iter().map(|v| v / norm).collect()
        } else {
            centered
        };

        Ok(Embedding { values })
    }
}
