//! Resolve the faces of one image to at most one known person.

use crate::photo_date::age_on;
use crate::registry::Registry;
use crate::types::{Candidate, CandidateStatus, FaceObservation, MatchDecision, PersonConfig};
use chrono::NaiveDate;
use std::cmp::Ordering;

/// Strategy for turning an image's face observations into a decision.
pub trait Matcher {
    fn decide(
        &self,
        faces: &[FaceObservation],
        registry: &Registry,
        photo_date: Option<NaiveDate>,
    ) -> MatchDecision;
}

/// Tolerance + optional age filter, ranked by priority then distance.
///
/// A person is a candidate for a face when their closest reference is
/// strictly below `tolerance`. Among candidates across all faces of the
/// image, the lowest priority rank wins; equal ranks fall to the smaller
/// distance, then to name so the result never depends on iteration order.
#[derive(Debug, Clone, Copy)]
pub struct PriorityMatcher {
    pub tolerance: f32,
    /// Maximum allowed gap in years between a person's age at capture time
    /// and the face's estimated age. `None` disables the age filter.
    pub age_tolerance: Option<u32>,
}

impl PriorityMatcher {
    pub fn new(tolerance: f32, age_tolerance: Option<u32>) -> Self {
        Self {
            tolerance,
            age_tolerance,
        }
    }

    /// Cache context: decisions from a differently configured matcher are not reused.
    pub fn context(&self, registry_digest: &str) -> String {
        match self.age_tolerance {
            Some(years) => format!("{registry_digest}:tol={}:age={years}", self.tolerance),
            None => format!("{registry_digest}:tol={}", self.tolerance),
        }
    }

    fn age_compatible(
        &self,
        person: &PersonConfig,
        face: &FaceObservation,
        photo_date: Option<NaiveDate>,
    ) -> bool {
        let Some(max_gap) = self.age_tolerance else {
            return true;
        };
        // Anything undeterminable does not filter.
        let implied = match (person.birthdate, photo_date) {
            (Some(birth), Some(date)) => age_on(birth, date),
            _ => None,
        };
        match (implied, face.estimated_age) {
            (Some(implied), Some(estimated)) => (implied as f32 - estimated).abs() <= max_gap as f32,
            _ => true,
        }
    }

    fn evaluate(
        &self,
        person: &PersonConfig,
        faces: &[FaceObservation],
        photo_date: Option<NaiveDate>,
    ) -> Option<Candidate> {
        let mut best_accepted: Option<f32> = None;
        let mut best_any = f32::INFINITY;
        let mut age_rejected = false;

        for face in faces {
            let distance = person.min_distance(&face.encoding);
            if !distance.is_finite() {
                continue;
            }
            best_any = best_any.min(distance);
            if distance >= self.tolerance {
                continue;
            }
            if !self.age_compatible(person, face, photo_date) {
                tracing::debug!(person = %person.name, distance, "candidate rejected by age");
                age_rejected = true;
                continue;
            }
            best_accepted = Some(best_accepted.map_or(distance, |d| d.min(distance)));
        }

        let (distance, status) = match best_accepted {
            Some(d) => (d, CandidateStatus::Accepted),
            None if best_any.is_finite() && age_rejected => (best_any, CandidateStatus::AgeRejected),
            None if best_any.is_finite() => (best_any, CandidateStatus::OutOfTolerance),
            None => return None,
        };
        Some(Candidate {
            person: person.name.clone(),
            priority: person.priority,
            distance,
            status,
        })
    }
}

impl Matcher for PriorityMatcher {
    fn decide(
        &self,
        faces: &[FaceObservation],
        registry: &Registry,
        photo_date: Option<NaiveDate>,
    ) -> MatchDecision {
        if faces.is_empty() {
            return MatchDecision::unknown(0);
        }

        let mut candidates: Vec<Candidate> = registry
            .persons()
            .iter()
            .filter_map(|person| self.evaluate(person, faces, photo_date))
            .collect();

        let winner = candidates
            .iter()
            .filter(|c| c.status == CandidateStatus::Accepted)
            .min_by(|a, b| rank_order(a, b))
            .cloned();

        candidates.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.person.cmp(&b.person))
        });

        let confidence = match &winner {
            Some(w) => Some(w.distance),
            None => candidates.first().map(|c| c.distance),
        };

        MatchDecision {
            matched_person: winner.map(|w| w.person),
            confidence,
            all_candidates: candidates,
            faces: faces.len(),
        }
    }
}

fn rank_order(a: &Candidate, b: &Candidate) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.distance.total_cmp(&b.distance))
        .then_with(|| a.person.cmp(&b.person))
}
