//! Known-face registry: per-person reference encodings, rank and birthdate.

use crate::cache::{CachePayload, FingerprintCache};
use crate::config::{SortConfig, IMAGE_EXTENSIONS};
use crate::encoder::{decode_image, detect_faces, DecodedImage, FaceEncoder};
use crate::fingerprint::{to_hex, Fingerprint};
use crate::types::{Encoding, PersonConfig};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("known-faces directory not found: {0}")]
    MissingDirectory(PathBuf),
    #[error("cannot read known-faces directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no person has a usable reference photo")]
    Empty,
}

/// A person to load: everything but the encodings.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonSpec {
    pub name: String,
    pub priority: u32,
    pub birthdate: Option<NaiveDate>,
    pub output_path: PathBuf,
    pub reference_dir: PathBuf,
}

/// Why a reference photo was excluded.
#[derive(Debug, Clone, PartialEq)]
pub enum ReferenceRejection {
    NoFace,
    MultipleFaces(usize),
    Unreadable(String),
}

impl std::fmt::Display for ReferenceRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReferenceRejection::NoFace => f.write_str("no face detected"),
            ReferenceRejection::MultipleFaces(n) => {
                write!(f, "{n} faces detected; reference photos must show exactly one")
            }
            ReferenceRejection::Unreadable(e) => write!(f, "unreadable: {e}"),
        }
    }
}

/// Immutable set of known persons, built once per run.
#[derive(Debug, Clone)]
pub struct Registry {
    persons: Vec<PersonConfig>,
}

impl Registry {
    /// Build directly from loaded persons (sorted by rank, then name).
    pub fn from_persons(mut persons: Vec<PersonConfig>) -> Self {
        persons.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Self { persons }
    }

    /// Encode every person's reference photos and keep the usable ones.
    ///
    /// Reference photos with zero or several faces are rejected with a
    /// warning; a person left with no encodings is dropped. Encodings are
    /// cached by fingerprint when the cache is enabled.
    pub fn load(
        specs: Vec<PersonSpec>,
        encoder: &dyn FaceEncoder,
        cache: &FingerprintCache,
        config: &SortConfig,
    ) -> Result<Self, RegistryError> {
        let started = std::time::Instant::now();
        let batch_size = config.batch_size();
        let context = config.detection_context();
        let mut persons = Vec::with_capacity(specs.len());

        for spec in specs {
            let photos = list_images(&spec.reference_dir);
            let total = photos.len();
            let mut encodings = Vec::with_capacity(total);
            let mut pending: Vec<(PathBuf, Option<Fingerprint>)> = Vec::new();

            for photo in photos {
                let fingerprint = if cache.is_enabled() {
                    cache.fingerprint(&photo).ok()
                } else {
                    None
                };
                if let Some(encoding) = fingerprint.as_ref().and_then(|fp| cache.lookup_encoding(fp, &context)) {
                    tracing::debug!(person = %spec.name, photo = %photo.display(), "reference encoding from cache");
                    encodings.push(encoding);
                } else {
                    pending.push((photo, fingerprint));
                }
            }

            for chunk in pending.chunks(batch_size.max(1)) {
                for (photo, outcome) in encode_references(chunk, encoder, config) {
                    match outcome {
                        Ok((encoding, fingerprint)) => {
                            if let Some(fp) = fingerprint {
                                cache.store(
                                    &fp,
                                    CachePayload::Encoding {
                                        encoding: encoding.clone(),
                                        context: context.clone(),
                                    },
                                );
                            }
                            encodings.push(encoding);
                        }
                        Err(reason) => tracing::warn!(
                            person = %spec.name,
                            photo = %photo.display(),
                            %reason,
                            "reference photo rejected"
                        ),
                    }
                }
            }

            if encodings.is_empty() {
                tracing::warn!(person = %spec.name, dir = %spec.reference_dir.display(), "no usable reference photos; person skipped");
                continue;
            }
            tracing::info!(person = %spec.name, loaded = encodings.len(), total, "reference encodings loaded");
            persons.push(PersonConfig {
                name: spec.name,
                priority: spec.priority,
                birthdate: spec.birthdate,
                output_path: spec.output_path,
                reference_encodings: encodings,
            });
        }

        if persons.is_empty() {
            return Err(RegistryError::Empty);
        }
        let registry = Self::from_persons(persons);
        tracing::info!(
            persons = registry.len(),
            encodings = registry.persons.iter().map(|p| p.reference_encodings.len()).sum::<usize>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "known-face registry ready"
        );
        Ok(registry)
    }

    pub fn persons(&self) -> &[PersonConfig] {
        &self.persons
    }

    pub fn get(&self, name: &str) -> Option<&PersonConfig> {
        self.persons.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.persons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.persons.is_empty()
    }

    /// SHA-256 over names, ranks, birthdates and encodings. Cached match
    /// decisions are only reused under the same digest.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for person in &self.persons {
            hasher.update(person.name.as_bytes());
            hasher.update([0]);
            hasher.update(person.priority.to_le_bytes());
            if let Some(b) = person.birthdate {
                hasher.update(b.to_string().as_bytes());
            }
            hasher.update([0]);
            for encoding in &person.reference_encodings {
                for v in &encoding.values {
                    hasher.update(v.to_le_bytes());
                }
                hasher.update([0xff]);
            }
        }
        to_hex(&hasher.finalize())
    }
}

type ReferenceOutcome = Result<(Encoding, Option<Fingerprint>), ReferenceRejection>;

fn encode_references(
    chunk: &[(PathBuf, Option<Fingerprint>)],
    encoder: &dyn FaceEncoder,
    config: &SortConfig,
) -> Vec<(PathBuf, ReferenceOutcome)> {
    let mut outcomes = Vec::with_capacity(chunk.len());
    let mut decoded: Vec<DecodedImage> = Vec::new();
    let mut fingerprints = Vec::new();

    for (photo, fingerprint) in chunk {
        match decode_image(photo) {
            Ok(img) => {
                decoded.push(img);
                fingerprints.push(fingerprint.clone());
            }
            Err(e) => outcomes.push((photo.clone(), Err(ReferenceRejection::Unreadable(e.to_string())))),
        }
    }

    let results = detect_faces(encoder, &decoded, &config.detection_sizes(), config.min_face_size);
    for ((img, fingerprint), result) in decoded.into_iter().zip(fingerprints).zip(results) {
        let outcome = match result {
            Ok(mut faces) => match faces.len() {
                0 => Err(ReferenceRejection::NoFace),
                1 => Ok((faces.remove(0).encoding, fingerprint)),
                n => Err(ReferenceRejection::MultipleFaces(n)),
            },
            Err(e) => Err(ReferenceRejection::Unreadable(e.to_string())),
        };
        outcomes.push((img.source, outcome));
    }
    outcomes
}

/// Persons to load, derived from the known-faces directory and config.
///
/// With a non-empty priority list only listed persons are loaded, ranked by
/// position. Otherwise every subdirectory is a person and all share rank 1,
/// so ties fall through to distance.
pub fn discover_people(config: &SortConfig) -> Result<Vec<PersonSpec>, RegistryError> {
    let root = &config.known_faces_dir;
    if !root.is_dir() {
        return Err(RegistryError::MissingDirectory(root.clone()));
    }

    let names: Vec<String> = if config.priority.is_empty() {
        let entries = std::fs::read_dir(root).map_err(|source| RegistryError::Io {
            path: root.clone(),
            source,
        })?;
        let mut found: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        for (name, overrides) in &config.people {
            if overrides.faces_path.is_some() && !found.contains(name) {
                found.push(name.clone());
            }
        }
        found.sort();
        found
    } else {
        config.priority.clone()
    };
    let mut seen = HashSet::new();
    let names: Vec<String> = names
        .into_iter()
        .filter(|name| {
            let first = seen.insert(name.clone());
            if !first {
                tracing::warn!(person = %name, "person listed more than once in priority; later entries ignored");
            }
            first
        })
        .collect();

    let mut specs = Vec::with_capacity(names.len());
    for (index, name) in names.into_iter().enumerate() {
        let overrides = config.people.get(&name).cloned().unwrap_or_default();
        let reference_dir = overrides
            .faces_path
            .clone()
            .unwrap_or_else(|| root.join(&name));
        if !reference_dir.is_dir() {
            tracing::warn!(person = %name, dir = %reference_dir.display(), "no reference directory for person");
            continue;
        }
        let priority = if config.priority.is_empty() {
            1
        } else {
            index as u32 + 1
        };
        specs.push(PersonSpec {
            output_path: overrides
                .output_path
                .clone()
                .unwrap_or_else(|| config.output_dir.join(&name)),
            birthdate: overrides.birthdate,
            name,
            priority,
            reference_dir,
        });
    }
    Ok(specs)
}

fn list_images(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut images: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_image_file(p))
        .collect();
    images.sort();
    images
}

/// Extension check against the supported image formats, case-insensitive.
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}
