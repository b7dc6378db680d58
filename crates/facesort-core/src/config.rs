//! Resolved run configuration.
//!
//! The CLI merges defaults, the config file, environment and flags into one
//! [`SortConfig`] before the pipeline starts; nothing in this crate reads raw
//! configuration sources.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Standard encoding tolerance.
pub const DEFAULT_TOLERANCE: f32 = 0.6;
/// Stricter tolerance that separates siblings and young children better.
pub const CHILDREN_TOLERANCE: f32 = 0.5;
pub const DEFAULT_AGE_TOLERANCE_YEARS: u32 = 5;
pub const DEFAULT_MIN_FACE_SIZE: u32 = 20;
pub const DEFAULT_MAX_IMAGE_SIZE: u32 = 2000;
/// First detection size, and the increment between sizes, when detection escalates.
pub const PROGRESSIVE_STEP: u32 = 500;
/// Batch size for the accurate backend, which amortizes per-call overhead on accelerators.
pub const DEFAULT_CNN_BATCH_SIZE: usize = 16;

/// Image extensions picked up by enumeration (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("tolerance must be a positive finite number, got {0}")]
    InvalidTolerance(f32),
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("unknown detection backend: {0} (expected \"hog\" or \"cnn\")")]
    UnknownBackend(String),
}

/// Detection/encoding backend. The pipeline is agnostic to which one runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Faster, less accurate.
    #[default]
    Hog,
    /// Slower, more accurate, benefits from batching on accelerated hardware.
    Cnn,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Hog => "hog",
            Backend::Cnn => "cnn",
        }
    }

    pub fn default_batch_size(self) -> usize {
        match self {
            Backend::Hog => 1,
            Backend::Cnn => DEFAULT_CNN_BATCH_SIZE,
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hog" => Ok(Backend::Hog),
            "cnn" => Ok(Backend::Cnn),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-person settings that override discovery defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonOverrides {
    pub birthdate: Option<NaiveDate>,
    pub priority: Option<u32>,
    pub output_path: Option<PathBuf>,
    /// Reference-photo directory when it is not `known_faces_dir/<name>`.
    pub faces_path: Option<PathBuf>,
}

/// Fully resolved, immutable configuration for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub known_faces_dir: PathBuf,
    pub cache_dir: Option<PathBuf>,
    /// Directory for the file-operation audit log; disabled when `None`.
    pub log_dir: Option<PathBuf>,
    pub backend: Backend,
    /// Explicit tolerance; overrides `use_children_settings` when set.
    pub tolerance: Option<f32>,
    pub use_children_settings: bool,
    pub min_face_size: u32,
    pub max_image_size: u32,
    /// Detect at 500, 1000, ... up to `max_image_size`, escalating only
    /// images in which no face was found. Off means a single pass.
    pub progressive_detection: bool,
    pub age_based_matching: bool,
    pub age_tolerance: u32,
    /// Worker threads; `None` means one per available CPU.
    pub workers: Option<usize>,
    /// Images per encoder call; `None` means the backend default.
    pub batch_size: Option<usize>,
    pub move_files: bool,
    pub recursive: bool,
    /// Person names in precedence order (first = rank 1).
    pub priority: Vec<String>,
    pub people: BTreeMap<String, PersonOverrides>,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("unsorted"),
            output_dir: PathBuf::from("sorted"),
            known_faces_dir: PathBuf::from("known_faces"),
            cache_dir: Some(PathBuf::from(".face_cache")),
            log_dir: None,
            backend: Backend::Hog,
            tolerance: None,
            use_children_settings: true,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
            progressive_detection: true,
            age_based_matching: false,
            age_tolerance: DEFAULT_AGE_TOLERANCE_YEARS,
            workers: None,
            batch_size: None,
            move_files: false,
            recursive: false,
            priority: Vec::new(),
            people: BTreeMap::new(),
        }
    }
}

impl SortConfig {
    /// Effective encoding tolerance.
    pub fn tolerance(&self) -> f32 {
        match self.tolerance {
            Some(t) => t,
            None if self.use_children_settings => CHILDREN_TOLERANCE,
            None => DEFAULT_TOLERANCE,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
            .unwrap_or_else(|| self.backend.default_batch_size())
    }

    /// Age tolerance in years, or `None` when age-based matching is off.
    pub fn age_tolerance(&self) -> Option<u32> {
        self.age_based_matching.then_some(self.age_tolerance)
    }

    /// Long-side sizes detection is tried at, smallest first. Never empty.
    pub fn detection_sizes(&self) -> Vec<u32> {
        let max = self.max_image_size;
        if !self.progressive_detection {
            return vec![max];
        }
        let mut sizes: Vec<u32> = (1..)
            .map(|n| n * PROGRESSIVE_STEP)
            .take_while(|&size| size < max)
            .collect();
        sizes.push(max);
        sizes
    }

    /// Settings that shape face observations. Cached encodings and
    /// decisions are only reused under the same value.
    pub fn detection_context(&self) -> String {
        let sizes: Vec<String> = self.detection_sizes().iter().map(u32::to_string).collect();
        format!("min_face={}:sizes={}", self.min_face_size, sizes.join(","))
    }

    /// The fingerprint cache only runs in copy mode.
    pub fn cache_enabled(&self) -> bool {
        !self.move_files && self.cache_dir.is_some()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let tolerance = self.tolerance();
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(ConfigError::InvalidTolerance(tolerance));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Zero("workers"));
        }
        if self.batch_size == Some(0) {
            return Err(ConfigError::Zero("batch_size"));
        }
        if self.max_image_size == 0 {
            return Err(ConfigError::Zero("max_image_size"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_sizes() {
        let mut config = SortConfig::default();
        assert_eq!(config.detection_sizes(), vec![500, 1000, 1500, 2000]);
        config.max_image_size = 1200;
        assert_eq!(config.detection_sizes(), vec![500, 1000, 1200]);
        config.max_image_size = 300;
        assert_eq!(config.detection_sizes(), vec![300]);
        config.max_image_size = 2000;
        config.progressive_detection = false;
        assert_eq!(config.detection_sizes(), vec![2000]);
    }

    #[test]
    fn test_detection_context_tracks_face_settings() {
        let mut config = SortConfig::default();
        let base = config.detection_context();
        config.min_face_size = 50;
        assert_ne!(config.detection_context(), base);
        config.min_face_size = DEFAULT_MIN_FACE_SIZE;
        config.max_image_size = 1000;
        assert_ne!(config.detection_context(), base);
    }

    #[test]
    fn test_tolerance_children_default() {
        let config = SortConfig::default();
        assert_eq!(config.tolerance(), CHILDREN_TOLERANCE);
    }

    #[test]
    fn test_tolerance_standard() {
        let config = SortConfig {
            use_children_settings: false,
            ..SortConfig::default()
        };
        assert_eq!(config.tolerance(), DEFAULT_TOLERANCE);
    }

    #[test]
    fn test_tolerance_explicit_override() {
        let config = SortConfig {
            tolerance: Some(0.42),
            ..SortConfig::default()
        };
        assert_eq!(config.tolerance(), 0.42);
    }

    #[test]
    fn test_batch_size_follows_backend() {
        let mut config = SortConfig::default();
        assert_eq!(config.batch_size(), 1);
        config.backend = Backend::Cnn;
        assert_eq!(config.batch_size(), DEFAULT_CNN_BATCH_SIZE);
        config.batch_size = Some(3);
        assert_eq!(config.batch_size(), 3);
    }

    #[test]
    fn test_cache_disabled_in_move_mode() {
        let mut config = SortConfig::default();
        assert!(config.cache_enabled());
        config.move_files = true;
        assert!(!config.cache_enabled());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = SortConfig {
            workers: Some(0),
            ..SortConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("workers"))));
    }

    #[test]
    fn test_validate_rejects_negative_tolerance() {
        let config = SortConfig {
            tolerance: Some(-0.1),
            ..SortConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTolerance(_))));
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("CNN".parse::<Backend>().unwrap(), Backend::Cnn);
        assert_eq!("hog".parse::<Backend>().unwrap(), Backend::Hog);
        assert!("dlib".parse::<Backend>().is_err());
    }
}
