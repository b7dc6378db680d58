//! One-call entry point: startup checks, registry, scheduler, cache flush.

use crate::cache::FingerprintCache;
use crate::config::{ConfigError, SortConfig};
use crate::encoder::FaceEncoder;
use crate::mover::{ensure_writable, MoveError};
use crate::oplog::{OpLogError, OperationLog};
use crate::registry::{discover_people, Registry, RegistryError};
use crate::scheduler::{image_paths, warn_skipped_subdirectories, BatchScheduler, CancelToken, RunSummary};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors that stop a run before any image is touched.
#[derive(Error, Debug)]
pub enum SortError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("input directory not found: {0}")]
    MissingInput(PathBuf),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Unwritable(#[from] MoveError),
    #[error(transparent)]
    OperationLog(#[from] OpLogError),
    #[error("cannot start worker threads: {0}")]
    Spawn(#[source] std::io::Error),
}

/// The cache a run with `config` uses: disabled in move mode or without a cache dir.
pub fn open_cache(config: &SortConfig) -> FingerprintCache {
    match &config.cache_dir {
        Some(dir) if config.cache_enabled() => FingerprintCache::open(FingerprintCache::path_for(dir, config.backend)),
        Some(_) => {
            tracing::info!("fingerprint cache disabled in move mode");
            FingerprintCache::disabled()
        }
        None => FingerprintCache::disabled(),
    }
}

/// Sort every image under `config.input_dir` into per-person directories.
///
/// Fails only on startup problems (invalid config, missing directories, no
/// usable references, unwritable destinations). Per-image problems are
/// counted in the returned statistics. The cache is written back only after
/// an uncancelled copy-mode run.
pub fn sort_images(
    config: &SortConfig,
    encoder: Arc<dyn FaceEncoder>,
    cancel: CancelToken,
) -> Result<RunSummary, SortError> {
    let started = std::time::Instant::now();
    config.validate()?;
    if !config.input_dir.is_dir() {
        return Err(SortError::MissingInput(config.input_dir.clone()));
    }

    let cache = Arc::new(open_cache(config));
    let specs = discover_people(config)?;
    let registry = Registry::load(specs, encoder.as_ref(), &cache, config)?;

    for person in registry.persons() {
        ensure_writable(&person.output_path)?;
    }

    let mut scheduler = BatchScheduler::new(config, registry, encoder, Arc::clone(&cache));
    if let Some(dir) = &config.log_dir {
        scheduler = scheduler.with_operation_log(Arc::new(OperationLog::create(dir)?));
    }
    if !config.recursive {
        warn_skipped_subdirectories(&config.input_dir);
    }

    tracing::info!(
        input = %config.input_dir.display(),
        tolerance = config.tolerance(),
        backend = %config.backend,
        move_files = config.move_files,
        recursive = config.recursive,
        "sorting started"
    );
    let stream = scheduler
        .spawn(image_paths(&config.input_dir, config.recursive), cancel)
        .map_err(SortError::Spawn)?;
    let summary = stream.finish();

    if summary.cancelled {
        tracing::warn!("run cancelled; cache left unchanged");
    } else if let Err(e) = cache.flush() {
        tracing::warn!(error = %e, "failed to write fingerprint cache");
    }

    let stats = &summary.statistics;
    tracing::info!(
        total = stats.total,
        sorted = stats.sorted(),
        unknown = stats.unknown,
        errors = stats.errors,
        moved = stats.moved,
        copied = stats.copied,
        already_present = stats.already_present,
        cache_hits = stats.cache_hits,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "sorting finished"
    );
    for (person, count) in &stats.per_person {
        tracing::info!(person = %person, images = count, "per-person total");
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Backend;
    use crate::scheduler::enumerate_images;
    use crate::test_support::{write_face_image, ScriptedEncoder};
    use std::path::Path;

    fn layout(root: &Path) -> SortConfig {
        let config = SortConfig {
            input_dir: root.join("unsorted"),
            output_dir: root.join("sorted"),
            known_faces_dir: root.join("known_faces"),
            cache_dir: Some(root.join(".face_cache")),
            min_face_size: 0,
            workers: Some(2),
            ..SortConfig::default()
        };
        for (name, value) in [("ana", 10), ("gabe", 80)] {
            let dir = config.known_faces_dir.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            write_face_image(&dir.join("ref.png"), &[value]);
        }
        std::fs::create_dir_all(&config.input_dir).unwrap();
        write_face_image(&config.input_dir.join("one.png"), &[12]);
        write_face_image(&config.input_dir.join("two.png"), &[81]);
        write_face_image(&config.input_dir.join("three.png"), &[200]);
        config
    }

    #[test]
    fn test_copy_run_sorts_and_caches_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = layout(dir.path());
        config.log_dir = Some(dir.path().join("logs"));
        let encoder = Arc::new(ScriptedEncoder::default());

        let summary = sort_images(&config, encoder.clone(), CancelToken::new()).unwrap();
        assert_eq!(summary.statistics.total, 3);
        assert_eq!(summary.statistics.per_person["ana"], 1);
        assert_eq!(summary.statistics.per_person["gabe"], 1);
        assert_eq!(summary.statistics.unknown, 1);
        assert_eq!(encoder.images_seen(), 5);
        assert!(FingerprintCache::path_for(config.cache_dir.as_ref().unwrap(), Backend::Hog).is_file());
        assert_eq!(enumerate_images(config.log_dir.as_ref().unwrap(), false).len(), 0);
        assert_eq!(std::fs::read_dir(config.log_dir.as_ref().unwrap()).unwrap().count(), 1);

        // References and decisions both come from the cache now.
        let again = sort_images(&config, encoder.clone(), CancelToken::new()).unwrap();
        assert_eq!(encoder.images_seen(), 5);
        assert_eq!(again.statistics.cache_hits, 3);
        assert_eq!(again.statistics.per_person, summary.statistics.per_person);
        assert_eq!(enumerate_images(&config.input_dir, false).len(), 3);
    }

    #[test]
    fn test_cached_run_rechecks_minimum_face_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = layout(dir.path());
        let encoder = Arc::new(ScriptedEncoder::default());
        sort_images(&config, encoder.clone(), CancelToken::new()).unwrap();

        // Every fixture face is 40px; cached references must not bypass the new minimum.
        config.min_face_size = 50;
        let result = sort_images(&config, encoder.clone(), CancelToken::new());
        assert!(matches!(result, Err(SortError::Registry(RegistryError::Empty))));
        assert_eq!(encoder.images_seen(), 7);
    }

    #[test]
    fn test_move_run_never_writes_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = layout(dir.path());
        config.move_files = true;

        let summary = sort_images(&config, Arc::new(ScriptedEncoder::default()), CancelToken::new()).unwrap();
        assert_eq!(summary.statistics.moved, 2);
        assert!(!config.cache_dir.as_ref().unwrap().exists());
        assert_eq!(
            enumerate_images(&config.input_dir, false),
            vec![config.input_dir.join("three.png")]
        );
    }

    #[test]
    fn test_cancelled_run_leaves_cache_unwritten() {
        let dir = tempfile::tempdir().unwrap();
        let config = layout(dir.path());
        let cancel = CancelToken::new();
        cancel.cancel();

        let summary = sort_images(&config, Arc::new(ScriptedEncoder::default()), cancel).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.statistics.total, 0);
        assert!(!config.cache_dir.as_ref().unwrap().exists());
    }

    #[test]
    fn test_missing_input_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = layout(dir.path());
        std::fs::remove_dir_all(&config.input_dir).unwrap();
        let encoder = Arc::new(ScriptedEncoder::default());

        let result = sort_images(&config, encoder.clone(), CancelToken::new());
        assert!(matches!(result, Err(SortError::MissingInput(_))));
        assert_eq!(encoder.calls(), 0);
    }

    #[test]
    fn test_unwritable_destination_fails_before_sorting() {
        let dir = tempfile::tempdir().unwrap();
        let config = layout(dir.path());
        std::fs::create_dir_all(&config.output_dir).unwrap();
        std::fs::write(config.output_dir.join("gabe"), b"in the way").unwrap();

        let result = sort_images(&config, Arc::new(ScriptedEncoder::default()), CancelToken::new());
        assert!(matches!(result, Err(SortError::Unwritable(_))));
        assert!(!config.output_dir.join("ana").join("one.png").exists());
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = layout(dir.path());
        config.workers = Some(0);
        let result = sort_images(&config, Arc::new(ScriptedEncoder::default()), CancelToken::new());
        assert!(matches!(result, Err(SortError::Config(_))));
    }
}
