use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are in original-image pixel space once the observation has
/// passed through [`PreparedImage::restore`](crate::encoder::PreparedImage::restore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Scale every coordinate by `factor` (used to undo a preprocessing downscale).
    pub fn scaled(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * factor, ly * factor))),
        }
    }
}

/// Fixed-length face encoding produced by the detection/encoding collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encoding {
    pub values: Vec<f32>,
}

impl Encoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two encodings.
    ///
    /// Encodings of different length never match: the distance is infinite.
    pub fn euclidean_distance(&self, other: &Encoding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face detected in one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    pub encoding: Encoding,
    /// Estimated age in years, when the collaborator provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_age: Option<f32>,
}

/// A known person, loaded once per run and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonConfig {
    pub name: String,
    /// Lower rank wins; 1 is the highest precedence.
    pub priority: u32,
    pub birthdate: Option<NaiveDate>,
    pub output_path: PathBuf,
    pub reference_encodings: Vec<Encoding>,
}

impl PersonConfig {
    /// Smallest distance from `query` to any of this person's references.
    pub fn min_distance(&self, query: &Encoding) -> f32 {
        self.reference_encodings
            .iter()
            .map(|reference| reference.euclidean_distance(query))
            .fold(f32::INFINITY, f32::min)
    }
}

/// Why a person did or did not survive candidate filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Accepted,
    OutOfTolerance,
    AgeRejected,
}

/// Per-person diagnostic row of a [`MatchDecision`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub person: String,
    pub priority: u32,
    /// Best distance for this person across every face in the image.
    pub distance: f32,
    pub status: CandidateStatus,
}

/// Result of matching every face in one image against the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    pub matched_person: Option<String>,
    /// Distance of the chosen candidate, or of the closest person when unknown.
    /// `None` when the image had no faces or the registry is empty.
    pub confidence: Option<f32>,
    /// Diagnostics, ordered by ascending distance then name.
    pub all_candidates: Vec<Candidate>,
    pub faces: usize,
}

impl MatchDecision {
    pub fn unknown(faces: usize) -> Self {
        Self {
            matched_person: None,
            confidence: None,
            all_candidates: Vec::new(),
            faces,
        }
    }

    pub fn is_match(&self) -> bool {
        self.matched_person.is_some()
    }
}
