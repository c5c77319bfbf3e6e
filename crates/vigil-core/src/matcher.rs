//! Matching detected regions against a watchlist snapshot.

use crate::embedding::{Embedder, Embedding};
use crate::frame::{self, FrameError, ImageBuffer};
use crate::types::{FaceRegion, MatchOutcome, Person};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("region crop failed: {0}")]
    Frame(#[from] FrameError),
    #[error("reference image for {person_id} is unusable: {source}")]
    Reference {
        person_id: String,
        #[source]
        source: FrameError,
    },
    #[error("embedding failed: {0}")]
    Embedding(String),
}

/// Compares one region against a consistent snapshot of the watchlist.
///
/// Must be a pure function of its inputs: identical frame, region and
/// snapshot give an identical outcome. The frame is supplied so a model can
/// crop the region itself.
pub trait Matcher: Send + Sync {
    fn match_region(
        &self,
        frame: &ImageBuffer,
        region: &FaceRegion,
        candidates: &[Person],
    ) -> Result<MatchOutcome, MatchError>;
}

/// Pick the best `(person_id, confidence)` pair at or above `threshold`.
///
/// Highest confidence wins; exact ties go to the lexicographically smallest
/// id. NaN scores never win.
pub fn select_best<'a, I>(scores: I, threshold: f32) -> Option<(&'a str, f32)>
where
    I: IntoIterator<Item = (&'a str, f32)>,
{
    let mut best: Option<(&'a str, f32)> = None;

    // Always visit every candidate, no early exit.
    for (id, score) in scores {
        if score.is_nan() {
            continue;
        }
        let better = match best {
            None => true,
            Some((best_id, best_score)) => match score.partial_cmp(&best_score) {
                Some(Ordering::Greater) => true,
                Some(Ordering::Equal) => id < best_id,
                _ => false,
            },
        };
        if better {
            best = Some((id, score));
        }
    }

    best.filter(|(_, score)| *score >= threshold)
}

/// Matches one configured person whenever that person is in the snapshot.
#[derive(Debug, Clone)]
pub struct FixedMatcher {
    person_id: String,
    confidence: f32,
}

impl FixedMatcher {
    pub fn new(person_id: impl Into<String>, confidence: f32) -> Self {
        Self {
            person_id: person_id.into(),
            confidence,
        }
    }
}

impl Matcher for FixedMatcher {
    fn match_region(
        &self,
        _frame: &ImageBuffer,
        region: &FaceRegion,
        candidates: &[Person],
    ) -> Result<MatchOutcome, MatchError> {
        if candidates.iter().any(|p| p.id == self.person_id) {
            Ok(MatchOutcome::matched(*region, self.person_id.clone(), self.confidence))
        } else {
            Ok(MatchOutcome::no_match(*region))
        }
    }
}

type ReferenceKey = [u8; 32];

/// Cosine matcher over embeddings produced by an [`Embedder`].
///
/// Reference embeddings are memoized by SHA-256 of the encoded reference
/// image. The cache is content-addressed, so it never changes an outcome.
pub struct EmbeddingMatcher<E> {
    embedder: E,
    threshold: f32,
    references: Mutex<HashMap<ReferenceKey, Arc<Embedding>>>,
}

impl<E: Embedder> EmbeddingMatcher<E> {
    pub fn new(embedder: E, threshold: f32) -> Self {
        Self {
            embedder,
            threshold,
            references: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    fn reference_embedding(&self, person: &Person) -> Result<Arc<Embedding>, MatchError> {
        let key: ReferenceKey = Sha256::digest(&person.reference_image).into();

        if let Some(hit) = self
            .references
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(hit.clone());
        }

        let gray = frame::decode_reference(&person.reference_image).map_err(|source| {
            MatchError::Reference {
                person_id: person.id.clone(),
                source,
            }
        })?;
        let embedding = Arc::new(self.embedder.embed(&gray)?);

        self.references
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, embedding.clone());
        Ok(embedding)
    }

    /// Drop cached references that are no longer in the watchlist.
    fn prune(&self, candidates: &[Person]) {
        let mut cache = self.references.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.len() <= candidates.len() * 2 + 16 {
            return;
        }
        let live: Vec<ReferenceKey> = candidates
            .iter()
            .map(|p| Sha256::digest(&p.reference_image).into())
            .collect();
        cache.retain(|key, _| live.contains(key));
        tracing::debug!(entries = cache.len(), "pruned reference embedding cache");
    }
}

impl<E: Embedder> Matcher for EmbeddingMatcher<E> {
    fn match_region(
        &self,
        frame: &ImageBuffer,
        region: &FaceRegion,
        candidates: &[Person],
    ) -> Result<MatchOutcome, MatchError> {
        if candidates.is_empty() {
            return Ok(MatchOutcome::no_match(*region));
        }

        let crop = frame.crop_luma(&region.bounding_box)?;
        let live = self.embedder.embed(&crop)?;

        let mut scores = Vec::with_capacity(candidates.len());
        for person in candidates {
            let reference = match self.reference_embedding(person) {
                Ok(reference) => reference,
                Err(e) => {
                    tracing::warn!(person_id = %person.id, error = %e, "skipping candidate");
                    continue;
                }
            };
            let confidence = live.similarity(&reference).max(0.0);
            scores.push((person.id.as_str(), confidence));
        }
        self.prune(candidates);

        Ok(match select_best(scores, self.threshold) {
            Some((id, confidence)) => MatchOutcome::matched(*region, id, confidence),
            None => MatchOutcome::no_match(*region),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::ThumbnailEmbedder;
    use crate::types::{BoundingBox, PersonStatus};
    use chrono::Utc;
    use image::GrayImage;
    use std::io::Cursor;

    fn png(img: &GrayImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn ramp(w: u32, h: u32, vertical: bool) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let v = if vertical { y * 255 / (h - 1) } else { x * 255 / (w - 1) };
            image::Luma([v as u8])
        })
    }

    fn person(id: &str, image: Vec<u8>) -> Person {
        Person {
            id: id.into(),
            name: id.into(),
            status: PersonStatus::Safe,
            reference_image: image,
            notes: None,
            created_at: Utc::now(),
        }
    }

    fn full_region(w: u32, h: u32) -> FaceRegion {
        FaceRegion::new(BoundingBox { x: 0.0, y: 0.0, width: w as f32, height: h as f32 }, 1.0)
    }

    #[test]
    fn test_select_best_highest_confidence() {
        let best = select_best([("a", 0.7), ("b", 0.9), ("c", 0.8)], 0.5);
        assert_eq!(best, Some(("b", 0.9)));
    }

    #[test]
    fn test_select_best_tie_breaks_on_smallest_id() {
        let best = select_best([("zed", 0.9), ("alpha", 0.9), ("mid", 0.9)], 0.5);
        assert_eq!(best, Some(("alpha", 0.9)));
    }

    #[test]
    fn test_select_best_below_threshold_is_none() {
        assert_eq!(select_best([("a", 0.4), ("b", 0.3)], 0.5), None);
        assert_eq!(select_best(Vec::<(&str, f32)>::new(), 0.0), None);
    }

    #[test]
    fn test_select_best_ignores_nan() {
        let best = select_best([("a", f32::NAN), ("b", 0.6)], 0.5);
        assert_eq!(best, Some(("b", 0.6)));
    }

    #[test]
    fn test_fixed_matcher_requires_candidate_in_snapshot() {
        let region = full_region(2, 2);
        let frame = ImageBuffer::gray(2, 2, vec![0; 4]);
        let matcher = FixedMatcher::new("p1", 0.9);

        let hit = matcher.match_region(&frame, &region, &[person("p1", vec![])]).unwrap();
        assert!(hit.is_match);
        assert_eq!(hit.matched_person_id.as_deref(), Some("p1"));

        let miss = matcher.match_region(&frame, &region, &[person("p2", vec![])]).unwrap();
        assert!(!miss.is_match);
    }

    #[test]
    fn test_embedding_matcher_finds_same_face() {
        let face = ramp(32, 32, false);
        let frame = ImageBuffer::gray(32, 32, face.clone().into_raw());
        let candidates = vec![
            person("horizontal", png(&face)),
            person("vertical", png(&ramp(32, 32, true))),
        ];

        let matcher = EmbeddingMatcher::new(ThumbnailEmbedder::default(), 0.8);
        let outcome = matcher.match_region(&frame, &full_region(32, 32), &candidates).unwrap();
        assert!(outcome.is_match);
        assert_eq!(outcome.matched_person_id.as_deref(), Some("horizontal"));
        assert!(outcome.match_confidence > 0.99);
    }

    #[test]
    fn test_embedding_matcher_is_deterministic() {
        let face = ramp(24, 24, true);
        let frame = ImageBuffer::gray(24, 24, face.clone().into_raw());
        let candidates = vec![person("a", png(&face)), person("b", png(&face))];
        let matcher = EmbeddingMatcher::new(ThumbnailEmbedder::default(), 0.5);

        let first = matcher.match_region(&frame, &full_region(24, 24), &candidates).unwrap();
        let second = matcher.match_region(&frame, &full_region(24, 24), &candidates).unwrap();
        assert_eq!(first, second);
        // identical references tie; smallest id wins
        assert_eq!(first.matched_person_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_embedding_matcher_below_threshold() {
        let frame = ImageBuffer::gray(32, 32, ramp(32, 32, false).into_raw());
        let candidates = vec![person("vertical", png(&ramp(32, 32, true)))];
        let matcher = EmbeddingMatcher::new(ThumbnailEmbedder::default(), 0.8);
        let outcome = matcher.match_region(&frame, &full_region(32, 32), &candidates).unwrap();
        assert!(!outcome.is_match);
        assert_eq!(outcome.match_confidence, 0.0);
    }

    #[test]
    fn test_corrupt_reference_skips_only_that_candidate() {
        let frame = ImageBuffer::gray(32, 32, ramp(32, 32, false).into_raw());
        let candidates = vec![
            person("broken", b"garbage".to_vec()),
            person("horizontal", png(&ramp(32, 32, false))),
        ];
        let matcher = EmbeddingMatcher::new(ThumbnailEmbedder::default(), 0.5);
        let outcome = matcher.match_region(&frame, &full_region(32, 32), &candidates).unwrap();
        assert!(outcome.is_match);
        assert_eq!(outcome.matched_person_id.as_deref(), Some("horizontal"));

        let only_broken = vec![person("broken", b"garbage".to_vec())];
        let outcome = matcher.match_region(&frame, &full_region(32, 32), &only_broken).unwrap();
        assert!(!outcome.is_match);
    }
}
