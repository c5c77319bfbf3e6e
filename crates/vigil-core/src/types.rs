use crate::frame::ImageBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Watchlist status of a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersonStatus {
    Safe,
    /// Detection of a flagged person raises an alert. Older exports call this "criminal".
    #[serde(alias = "criminal")]
    Flagged,
}

impl PersonStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PersonStatus::Safe => "safe",
            PersonStatus::Flagged => "flagged",
        }
    }

    /// Parse a status name, accepting the legacy "criminal" spelling.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "safe" => Some(PersonStatus::Safe),
            "flagged" | "criminal" => Some(PersonStatus::Flagged),
            _ => None,
        }
    }
}

/// A watchlist entry. Only the store creates, mutates or removes these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    pub status: PersonStatus,
    /// Encoded reference image (PNG, JPEG, ...).
    #[serde(with = "blob")]
    pub reference_image: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Person {
    pub fn from_input(id: String, input: PersonInput, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: input.name,
            status: input.status,
            reference_image: input.reference_image,
            notes: input.notes,
            created_at,
        }
    }

    /// Case-insensitive substring match on name or notes.
    /// `needle` must already be lowercase.
    pub fn matches_lowercase(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
            || self
                .notes
                .as_deref()
                .is_some_and(|n| n.to_lowercase().contains(needle))
    }

    pub fn is_flagged(&self) -> bool {
        self.status == PersonStatus::Flagged
    }
}

/// Fields supplied when adding a person; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonInput {
    pub name: String,
    pub status: PersonStatus,
    #[serde(with = "blob")]
    pub reference_image: Vec<u8>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Partial update. `None` leaves a field untouched; `notes: Some("")` clears notes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonUpdate {
    pub name: Option<String>,
    pub status: Option<PersonStatus>,
    #[serde(with = "blob::option")]
    pub reference_image: Option<Vec<u8>>,
    pub notes: Option<String>,
}

impl PersonUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.status.is_none()
            && self.reference_image.is_none()
            && self.notes.is_none()
    }

    pub fn apply_to(&self, person: &mut Person) {
        if let Some(name) = &self.name {
            person.name = name.clone();
        }
        if let Some(status) = self.status {
            person.status = status;
        }
        if let Some(image) = &self.reference_image {
            person.reference_image = image.clone();
        }
        if let Some(notes) = &self.notes {
            person.notes = if notes.is_empty() { None } else { Some(notes.clone()) };
        }
    }
}

/// Axis-aligned face rectangle in source-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// True if the box has positive size and lies entirely inside a `width` x `height` frame.
    pub fn within(&self, width: u32, height: u32) -> bool {
        self.x >= 0.0
            && self.y >= 0.0
            && self.width > 0.0
            && self.height > 0.0
            && self.x + self.width <= width as f32
            && self.y + self.height <= height as f32
    }
}

/// A detected face. Has no identity of its own.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub bounding_box: BoundingBox,
    /// Detector confidence in [0, 1].
    pub detection_confidence: f32,
}

impl FaceRegion {
    pub fn new(bounding_box: BoundingBox, detection_confidence: f32) -> Self {
        Self {
            bounding_box,
            detection_confidence: clamp_unit(detection_confidence),
        }
    }
}

/// Result of comparing one region against the watchlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchOutcome {
    pub region: FaceRegion,
    pub is_match: bool,
    /// Weak reference to `Person::id`; present iff `is_match`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_person_id: Option<String>,
    /// In [0, 1]; zero when there is no match.
    pub match_confidence: f32,
}

impl MatchOutcome {
    pub fn matched(region: FaceRegion, person_id: impl Into<String>, confidence: f32) -> Self {
        Self {
            region,
            is_match: true,
            matched_person_id: Some(person_id.into()),
            match_confidence: clamp_unit(confidence),
        }
    }

    pub fn no_match(region: FaceRegion) -> Self {
        Self {
            region,
            is_match: false,
            matched_person_id: None,
            match_confidence: 0.0,
        }
    }
}

/// Where a processed frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    LiveStream,
    StaticUpload,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::LiveStream => "live-stream",
            Origin::StaticUpload => "static-upload",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "live-stream" | "camera" => Some(Origin::LiveStream),
            "static-upload" | "upload" => Some(Origin::StaticUpload),
            _ => None,
        }
    }
}

/// One processed frame that produced at least one region. Immutable once logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub id: String,
    pub source_image: Arc<ImageBuffer>,
    /// One outcome per region, in detection order.
    pub outcomes: Vec<MatchOutcome>,
    pub timestamp: DateTime<Utc>,
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
}

impl DetectionResult {
    pub fn new(
        source_image: Arc<ImageBuffer>,
        outcomes: Vec<MatchOutcome>,
        origin: Origin,
        stream_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_image,
            outcomes,
            timestamp: Utc::now(),
            origin,
            stream_id,
        }
    }

    /// Ids of matched persons in detection order, without duplicates.
    pub fn matched_person_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for id in self.outcomes.iter().filter_map(|o| o.matched_person_id.as_deref()) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }

    /// Re-resolve every outcome against the current watchlist.
    ///
    /// Outcomes never embed person details; a reference to a person that has
    /// since been deleted resolves to [`Classification::Unknown`] with
    /// `dangling = true`.
    pub fn resolve<F>(&self, lookup: F) -> Vec<ResolvedOutcome>
    where
        F: Fn(&str) -> Option<Person>,
    {
        self.outcomes
            .iter()
            .map(|outcome| ResolvedOutcome::resolve(outcome, &lookup))
            .collect()
    }
}

/// Three-way presentation classification of an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Flagged,
    Safe,
    Unknown,
}

/// An outcome joined with the person it currently refers to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedOutcome {
    pub region: FaceRegion,
    pub classification: Classification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_name: Option<String>,
    pub match_confidence: f32,
    /// The matched person no longer exists in the watchlist.
    pub dangling: bool,
}

impl ResolvedOutcome {
    fn resolve<F>(outcome: &MatchOutcome, lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<Person>,
    {
        let person = outcome
            .matched_person_id
            .as_deref()
            .filter(|_| outcome.is_match)
            .map(|id| (id, lookup(id)));

        match person {
            Some((_, Some(person))) => Self {
                region: outcome.region,
                classification: match person.status {
                    PersonStatus::Flagged => Classification::Flagged,
                    PersonStatus::Safe => Classification::Safe,
                },
                person_id: Some(person.id),
                person_name: Some(person.name),
                match_confidence: outcome.match_confidence,
                dangling: false,
            },
            Some((id, None)) => Self {
                region: outcome.region,
                classification: Classification::Unknown,
                person_id: Some(id.to_string()),
                person_name: None,
                match_confidence: outcome.match_confidence,
                dangling: true,
            },
            None => Self {
                region: outcome.region,
                classification: Classification::Unknown,
                person_id: None,
                person_name: None,
                match_confidence: 0.0,
                dangling: false,
            },
        }
    }

    /// Display label for the region.
    pub fn label(&self) -> &str {
        match (&self.person_name, self.dangling) {
            (Some(name), _) => name,
            (None, true) => "Unknown (removed)",
            (None, false) => "Unknown",
        }
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Serde adapter encoding byte blobs as standard base64 strings.
pub mod blob {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::STANDARD;
        use base64::Engine;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| STANDARD.decode(encoded.as_bytes()))
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}
