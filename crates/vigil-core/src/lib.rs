//! vigil-core — Watchlist data model and the detection/matching capabilities.
//!
//! Detection and matching are traits so a real face model can replace the
//! deterministic variants shipped here without touching the pipeline.

pub mod detector;
pub mod embedding;
pub mod frame;
pub mod matcher;
pub mod types;

pub use detector::{DetectionError, Detector, FixedDetector, FullFrameDetector};
pub use embedding::{Embedder, Embedding, ThumbnailEmbedder};
pub use frame::{FrameError, ImageBuffer, PixelFormat};
pub use matcher::{select_best, EmbeddingMatcher, FixedMatcher, MatchError, Matcher};
pub use types::{
    BoundingBox, Classification, DetectionResult, FaceRegion, MatchOutcome, Origin, Person,
    PersonInput, PersonStatus, PersonUpdate, ResolvedOutcome,
};

/// Default minimum match confidence for a positive identification.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.80;
