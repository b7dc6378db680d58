//! Bounded producer/worker pool that takes images from path to placement.
//!
//! A producer thread walks the input and feeds a bounded channel; each
//! worker pulls one path, opportunistically drains more up to the batch
//! size, and runs the chunk through fingerprint → cache → encoder →
//! matcher → mover. Outcomes stream back to the caller as they complete.

use crate::cache::{CachePayload, FingerprintCache};
use crate::config::SortConfig;
use crate::encoder::{decode_image, detect_faces, DecodedImage, FaceEncoder};
use crate::fingerprint::Fingerprint;
use crate::matcher::{Matcher, PriorityMatcher};
use crate::mover::{MoveOutcome, SafeMover};
use crate::oplog::{OperationLog, OperationRecord};
use crate::photo_date::photo_date;
use crate::registry::{is_image_file, Registry};
use crate::stats::{RunStatistics, StatsAggregator};
use crate::types::MatchDecision;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use walkdir::WalkDir;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SKIPPED_DIRS_LISTED: usize = 5;

/// Shared interrupt flag. Once set, no new images are taken; images already
/// in a worker's hands finish their current step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where in the per-image pipeline a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Fingerprint,
    Decode,
    Detection,
    Placement,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FailureStage::Fingerprint => "fingerprint",
            FailureStage::Decode => "decode",
            FailureStage::Detection => "detection",
            FailureStage::Placement => "placement",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Disposition {
    Sorted {
        person: String,
        decision: MatchDecision,
        placement: MoveOutcome,
    },
    /// No known person matched; the image stays where it is.
    Unknown { decision: MatchDecision },
    Failed {
        stage: FailureStage,
        reason: String,
        placement: Option<MoveOutcome>,
    },
}

/// What happened to one input image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageOutcome {
    pub source: PathBuf,
    /// Decision reused from the fingerprint cache.
    pub cached: bool,
    pub disposition: Disposition,
}

impl ImageOutcome {
    fn failed(source: PathBuf, stage: FailureStage, reason: impl ToString) -> Self {
        let reason = reason.to_string();
        tracing::error!(path = %source.display(), %stage, %reason, "image failed");
        Self {
            source,
            cached: false,
            disposition: Disposition::Failed {
                stage,
                reason,
                placement: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub statistics: RunStatistics,
    pub cancelled: bool,
}

/// Eligible images under `dir`, lazily, sorted by name within each directory.
pub fn image_paths(dir: &Path, recursive: bool) -> impl Iterator<Item = PathBuf> + Send + 'static {
    let max_depth = if recursive { usize::MAX } else { 1 };
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file() && is_image_file(e.path()))
        .map(|e| e.into_path())
}

pub fn enumerate_images(dir: &Path, recursive: bool) -> Vec<PathBuf> {
    image_paths(dir, recursive).collect()
}

/// Warn about subdirectories holding images that a non-recursive run ignores.
pub fn warn_skipped_subdirectories(dir: &Path) -> usize {
    let skipped: Vec<String> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter(|e| {
            WalkDir::new(e.path())
                .into_iter()
                .filter_map(|s| s.ok())
                .any(|s| s.file_type().is_file() && is_image_file(s.path()))
        })
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();

    if !skipped.is_empty() {
        let mut listed = skipped
            .iter()
            .take(SKIPPED_DIRS_LISTED)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        if skipped.len() > SKIPPED_DIRS_LISTED {
            listed.push_str(&format!(" and {} more", skipped.len() - SKIPPED_DIRS_LISTED));
        }
        tracing::warn!(
            count = skipped.len(),
            dirs = %listed,
            "subdirectories with images are skipped; enable recursive mode to include them"
        );
    }
    skipped.len()
}

/// State every worker reads.
struct Shared {
    registry: Registry,
    matcher: PriorityMatcher,
    context: String,
    encoder: Arc<dyn FaceEncoder>,
    cache: Arc<FingerprintCache>,
    mover: SafeMover,
    oplog: Option<Arc<OperationLog>>,
    stats: StatsAggregator,
    use_cache: bool,
    move_files: bool,
    age_matching: bool,
    batch_size: usize,
    min_face_size: u32,
    detection_sizes: Vec<u32>,
}

pub struct BatchScheduler {
    shared: Shared,
    workers: usize,
}

impl BatchScheduler {
    pub fn new(
        config: &SortConfig,
        registry: Registry,
        encoder: Arc<dyn FaceEncoder>,
        cache: Arc<FingerprintCache>,
    ) -> Self {
        let matcher = PriorityMatcher::new(config.tolerance(), config.age_tolerance());
        let context = format!("{}:{}", matcher.context(&registry.digest()), config.detection_context());
        let stats = StatsAggregator::with_persons(registry.persons().iter().map(|p| p.name.as_str()));
        let use_cache = cache.is_enabled() && !config.move_files;
        Self {
            shared: Shared {
                registry,
                matcher,
                context,
                encoder,
                cache,
                mover: SafeMover::new(),
                oplog: None,
                stats,
                use_cache,
                move_files: config.move_files,
                age_matching: config.age_based_matching,
                batch_size: config.batch_size().max(1),
                min_face_size: config.min_face_size,
                detection_sizes: config.detection_sizes(),
            },
            workers: config.workers().max(1),
        }
    }

    pub fn with_mover(mut self, mover: SafeMover) -> Self {
        self.shared.mover = mover;
        self
    }

    pub fn with_operation_log(mut self, log: Arc<OperationLog>) -> Self {
        self.shared.oplog = Some(log);
        self
    }

    /// Start the producer and worker threads over `paths`.
    pub fn spawn<I>(self, paths: I, cancel: CancelToken) -> std::io::Result<OutcomeStream>
    where
        I: IntoIterator<Item = PathBuf>,
        I::IntoIter: Send + 'static,
    {
        let shared = Arc::new(self.shared);
        let workers = self.workers;
        let (path_tx, path_rx) = crossbeam_channel::bounded::<PathBuf>(2 * workers);
        let (outcome_tx, outcome_rx) =
            crossbeam_channel::bounded::<ImageOutcome>(2 * workers * shared.batch_size);

        let producer = {
            let cancel = cancel.clone();
            let paths = paths.into_iter();
            std::thread::Builder::new()
                .name("facesort-producer".into())
                .spawn(move || produce(paths, path_tx, cancel))?
        };

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let shared = Arc::clone(&shared);
            let paths = path_rx.clone();
            let outcomes = outcome_tx.clone();
            let cancel = cancel.clone();
            let handle = std::thread::Builder::new()
                .name(format!("facesort-worker-{index}"))
                .spawn(move || worker_loop(&shared, &paths, &outcomes, &cancel))?;
            handles.push(handle);
        }
        tracing::info!(
            workers,
            batch_size = shared.batch_size,
            cache = shared.use_cache,
            move_files = shared.move_files,
            "scheduler started"
        );

        Ok(OutcomeStream {
            outcomes: outcome_rx,
            producer: Some(producer),
            workers: handles,
            shared,
            cancel,
        })
    }

    /// Process every path and collect all outcomes.
    pub fn run<I>(self, paths: I, cancel: CancelToken) -> std::io::Result<(Vec<ImageOutcome>, RunSummary)>
    where
        I: IntoIterator<Item = PathBuf>,
        I::IntoIter: Send + 'static,
    {
        let mut stream = self.spawn(paths, cancel)?;
        let outcomes: Vec<ImageOutcome> = stream.by_ref().collect();
        Ok((outcomes, stream.finish()))
    }
}

/// Outcomes in completion order. Ends once every worker has stopped.
pub struct OutcomeStream {
    outcomes: Receiver<ImageOutcome>,
    producer: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
    cancel: CancelToken,
}

impl Iterator for OutcomeStream {
    type Item = ImageOutcome;

    fn next(&mut self) -> Option<ImageOutcome> {
        self.outcomes.recv().ok()
    }
}

impl OutcomeStream {
    /// Drain what is left, join every thread and report the totals.
    pub fn finish(mut self) -> RunSummary {
        for _ in self.by_ref() {}
        for handle in std::mem::take(&mut self.workers) {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        if let Some(producer) = self.producer.take() {
            if producer.join().is_err() {
                tracing::error!("producer thread panicked");
            }
        }
        RunSummary {
            statistics: self.shared.stats.summary(),
            cancelled: self.cancel.is_cancelled(),
        }
    }
}

fn produce(paths: impl Iterator<Item = PathBuf>, tx: Sender<PathBuf>, cancel: CancelToken) {
    let mut queued = 0usize;
    for path in paths {
        if cancel.is_cancelled() {
            tracing::info!(queued, "cancellation requested; no further images queued");
            break;
        }
        if tx.send(path).is_err() {
            break;
        }
        queued += 1;
    }
    tracing::debug!(queued, "producer finished");
}

fn worker_loop(shared: &Shared, paths: &Receiver<PathBuf>, outcomes: &Sender<ImageOutcome>, cancel: &CancelToken) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let first = match paths.recv_timeout(POLL_INTERVAL) {
            Ok(path) => path,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let mut chunk = Vec::with_capacity(shared.batch_size);
        chunk.push(first);
        while chunk.len() < shared.batch_size {
            match paths.try_recv() {
                Ok(path) => chunk.push(path),
                Err(_) => break,
            }
        }

        let results = shared.process_chunk(chunk);
        for outcome in &results {
            shared.stats.record(outcome);
        }
        for outcome in results {
            if outcomes.send(outcome).is_err() {
                return;
            }
        }
    }
}

impl Shared {
    fn process_chunk(&self, chunk: Vec<PathBuf>) -> Vec<ImageOutcome> {
        let mut outcomes = Vec::with_capacity(chunk.len());
        let mut pending: Vec<(PathBuf, Option<Fingerprint>)> = Vec::with_capacity(chunk.len());

        for path in chunk {
            let fingerprint = if self.use_cache {
                match self.cache.fingerprint(&path) {
                    Ok(fp) => Some(fp),
                    Err(e) => {
                        outcomes.push(ImageOutcome::failed(path, FailureStage::Fingerprint, e));
                        continue;
                    }
                }
            } else {
                None
            };

            let cached = fingerprint
                .as_ref()
                .and_then(|fp| self.cache.lookup_decision(fp, &self.context));
            match cached {
                Some(decision) => {
                    tracing::debug!(path = %path.display(), "decision from cache");
                    outcomes.push(self.conclude(path, decision, true));
                }
                None => pending.push((path, fingerprint)),
            }
        }

        let mut decoded: Vec<DecodedImage> = Vec::with_capacity(pending.len());
        let mut fingerprints = Vec::with_capacity(pending.len());
        for (path, fingerprint) in pending {
            match decode_image(&path) {
                Ok(img) => {
                    decoded.push(img);
                    fingerprints.push(fingerprint);
                }
                Err(e) => outcomes.push(ImageOutcome::failed(path, FailureStage::Decode, e)),
            }
        }
        if decoded.is_empty() {
            return outcomes;
        }

        let results = detect_faces(
            self.encoder.as_ref(),
            &decoded,
            &self.detection_sizes,
            self.min_face_size,
        );
        for ((img, fingerprint), result) in decoded.into_iter().zip(fingerprints).zip(results) {
            let faces = match result {
                Ok(faces) => faces,
                Err(e) => {
                    outcomes.push(ImageOutcome::failed(img.source, FailureStage::Detection, e));
                    continue;
                }
            };

            let date = if self.age_matching {
                photo_date(&img.source)
            } else {
                None
            };
            let decision = self.matcher.decide(&faces, &self.registry, date);
            if let Some(fp) = fingerprint {
                self.cache.store(
                    &fp,
                    CachePayload::Decision {
                        decision: decision.clone(),
                        context: self.context.clone(),
                    },
                );
            }
            outcomes.push(self.conclude(img.source, decision, false));
        }
        outcomes
    }

    /// Place a decided image (or leave an unknown one alone).
    fn conclude(&self, source: PathBuf, decision: MatchDecision, cached: bool) -> ImageOutcome {
        let Some(person_name) = decision.matched_person.clone() else {
            tracing::info!(path = %source.display(), faces = decision.faces, "no known person matched");
            return ImageOutcome {
                source,
                cached,
                disposition: Disposition::Unknown { decision },
            };
        };
        let Some(person) = self.registry.get(&person_name) else {
            return ImageOutcome::failed(
                source,
                FailureStage::Placement,
                format!("matched person {person_name} is not in the registry"),
            );
        };

        let size = std::fs::metadata(&source).map(|m| m.len()).ok();
        let placement = self.mover.place(&source, &person.output_path, self.move_files);
        if let Some(log) = &self.oplog {
            log.record(&OperationRecord::from_outcome(
                &placement,
                &person_name,
                decision.confidence,
                self.move_files,
                size,
            ));
        }

        if !placement.is_success() {
            return ImageOutcome {
                source,
                cached,
                disposition: Disposition::Failed {
                    stage: FailureStage::Placement,
                    reason: placement.error.clone().unwrap_or_default(),
                    placement: Some(placement),
                },
            };
        }

        tracing::info!(
            path = %source.display(),
            person = %person_name,
            dest = ?placement.destination_path,
            distance = ?decision.confidence,
            moved = placement.moved,
            "image placed"
        );
        ImageOutcome {
            source,
            cached,
            disposition: Disposition::Sorted {
                person: person_name,
                decision,
                placement,
            },
        }
    }
}
