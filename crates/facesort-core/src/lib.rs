//! facesort-core: sort photos into per-person folders by recognised faces.
//!
//! Fingerprints images, reuses cached match decisions, matches detected
//! faces against a known-face registry by priority and distance, and places
//! matched images with a verified copy/move protocol. Face detection and
//! encoding are delegated to a [`FaceEncoder`].

pub mod cache;
pub mod config;
pub mod encoder;
pub mod fingerprint;
pub mod matcher;
pub mod mover;
pub mod oplog;
pub mod photo_date;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use cache::{CacheStats, FingerprintCache};
pub use config::{Backend, PersonOverrides, SortConfig};
pub use encoder::{CommandEncoder, FaceEncoder};
pub use matcher::{Matcher, PriorityMatcher};
pub use mover::{MoveOutcome, SafeMover};
pub use pipeline::{sort_images, SortError};
pub use registry::Registry;
pub use scheduler::{BatchScheduler, CancelToken, Disposition, ImageOutcome, RunSummary};
pub use stats::RunStatistics;
pub use types::{Encoding, FaceObservation, MatchDecision, PersonConfig};
