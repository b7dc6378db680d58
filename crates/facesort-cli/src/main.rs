use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facesort_core::registry::{discover_people, is_image_file};
use facesort_core::{sort_images, CancelToken, CommandEncoder, FaceEncoder, FingerprintCache, RunSummary};
use std::future::Future;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;

use config::{Settings, SortArgs};

#[derive(Parser)]
#[command(name = "facesort", version, about = "Sort photos into per-person folders by recognised faces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sort every image in the input directory
    Sort(SortArgs),
    /// List the people that would be loaded, with rank and destination
    People(SortArgs),
    /// Inspect or remove the fingerprint cache
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Show entry and hit counters
    Stats(SortArgs),
    /// Delete the cache file for the selected backend
    Clear(SortArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Sort(args) => run_sort(init(&args)?).await,
        Commands::People(args) => list_people(&init(&args)?),
        Commands::Cache(CacheCommand::Stats(args)) => cache_stats(&init(&args)?),
        Commands::Cache(CacheCommand::Clear(args)) => cache_clear(&init(&args)?),
    }
}

/// Resolve configuration and install the subscriber. `RUST_LOG` wins over
/// the configured verbosity.
fn init(args: &SortArgs) -> Result<Settings> {
    let settings = config::resolve(args, |key| std::env::var(key).ok())?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.verbosity));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    for warning in &settings.warnings {
        tracing::warn!("{warning}");
    }
    Ok(settings)
}

async fn run_sort(settings: Settings) -> Result<()> {
    let cancel = CancelToken::new();
    tokio::spawn(watch_interrupts(tokio::signal::ctrl_c, cancel.clone()));

    let encoder: Arc<dyn FaceEncoder> = Arc::new(CommandEncoder::new(
        settings.encoder,
        settings.encoder_args,
        settings.sort.backend,
    ));
    let config = settings.sort;
    let summary = tokio::task::spawn_blocking(move || sort_images(&config, encoder, cancel))
        .await
        .context("sorting task panicked")??;

    print_summary(&summary);
    Ok(())
}

/// The first interrupt cancels the run. Later ones are only logged: a move
/// in progress always runs to completion. Returns the interrupts seen.
async fn watch_interrupts<F, Fut>(mut interrupted: F, cancel: CancelToken) -> usize
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let mut seen = 0;
    while interrupted().await.is_ok() {
        seen += 1;
        if seen == 1 {
            tracing::warn!("interrupt received; finishing in-flight images");
            cancel.cancel();
        } else {
            tracing::warn!(interrupts = seen, "already stopping; waiting for in-flight images to finish");
        }
    }
    seen
}

fn print_summary(summary: &RunSummary) {
    let stats = &summary.statistics;
    println!("Processed {} images", stats.total);
    for (person, count) in &stats.per_person {
        println!("  {person:<20} {count}");
    }
    println!("  {:<20} {}", "unknown", stats.unknown);
    println!("  {:<20} {}", "errors", stats.errors);
    if stats.moved > 0 {
        println!("Moved {} files", stats.moved);
    }
    if stats.copied + stats.already_present > 0 {
        println!(
            "Copied {} files ({} already present)",
            stats.copied, stats.already_present
        );
    }
    if stats.cache_hits > 0 {
        println!("{} decisions reused from cache", stats.cache_hits);
    }
    if summary.cancelled {
        println!("Run interrupted; re-run to process the remaining images");
    }
}

fn list_people(settings: &Settings) -> Result<()> {
    let specs = discover_people(&settings.sort).context("cannot discover people")?;
    if specs.is_empty() {
        println!("No people found in {}", settings.sort.known_faces_dir.display());
        return Ok(());
    }
    println!("{:<5} {:<20} {:<12} {:<6} DESTINATION", "RANK", "NAME", "BIRTHDATE", "PHOTOS");
    for spec in specs {
        let photos = std::fs::read_dir(&spec.reference_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| is_image_file(&e.path()))
                    .count()
            })
            .unwrap_or(0);
        let birthdate = spec
            .birthdate
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<5} {:<20} {:<12} {:<6} {}",
            spec.priority,
            spec.name,
            birthdate,
            photos,
            spec.output_path.display()
        );
    }
    Ok(())
}

fn cache_stats(settings: &Settings) -> Result<()> {
    let Some(dir) = &settings.sort.cache_dir else {
        println!("Cache disabled (no cache directory configured)");
        return Ok(());
    };
    let path = FingerprintCache::path_for(dir, settings.sort.backend);
    if !path.is_file() {
        println!("No cache at {}", path.display());
        return Ok(());
    }
    let size = std::fs::metadata(&path)
        .with_context(|| format!("cannot stat {}", path.display()))?
        .len();
    let stats = FingerprintCache::open(path.clone()).stats();
    println!("Cache:         {}", path.display());
    println!("Size:          {size} bytes");
    println!("Entries:       {}", stats.entries);
    println!("Indexed files: {}", stats.indexed_files);
    if settings.sort.move_files {
        println!("Note: move mode is configured; the cache is not used while moving");
    }
    Ok(())
}

fn cache_clear(settings: &Settings) -> Result<()> {
    let Some(dir) = &settings.sort.cache_dir else {
        println!("Cache disabled (no cache directory configured)");
        return Ok(());
    };
    let path = FingerprintCache::path_for(dir, settings.sort.backend);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "cache cleared");
            println!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No cache at {}", path.display());
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("cannot remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["facesort", "sort", "--model", "cnn", "--move", "--workers", "2"]).unwrap();
        match cli.command {
            Commands::Sort(args) => {
                assert_eq!(args.model, Some(facesort_core::Backend::Cnn));
                assert!(args.move_files);
                assert_eq!(args.workers, Some(2));
            }
            _ => panic!("expected sort"),
        }

        let cli = Cli::try_parse_from(["facesort", "cache", "clear", "--cache-dir", "/tmp/c"]).unwrap();
        assert!(matches!(cli.command, Commands::Cache(CacheCommand::Clear(_))));
    }

    #[tokio::test]
    async fn test_repeated_interrupts_only_cancel() {
        let cancel = CancelToken::new();
        let mut remaining = 3;
        let signals = move || {
            remaining -= 1;
            let result = if remaining > 0 {
                Ok(())
            } else {
                Err(std::io::Error::other("handler closed"))
            };
            async move { result }
        };

        assert_eq!(watch_interrupts(signals, cancel.clone()).await, 2);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_cli_rejects_unknown_model() {
        assert!(Cli::try_parse_from(["facesort", "sort", "--model", "resnet"]).is_err());
    }

    #[test]
    fn test_cache_clear_removes_backend_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.sort.cache_dir = Some(dir.path().to_path_buf());
        let path = FingerprintCache::path_for(dir.path(), settings.sort.backend);
        std::fs::write(&path, b"").unwrap();

        cache_clear(&settings).unwrap();
        assert!(!path.exists());
        cache_clear(&settings).unwrap();
    }
}
