use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::Args;
use facesort_core::{Backend, PersonOverrides, SortConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "facesort.toml";
/// External detection/encoding program.
pub const DEFAULT_ENCODER: &str = "facesort-encoder";
/// Rank given to `[people]` entries without an explicit priority.
const UNRANKED_PRIORITY: u32 = 999;

/// Flags shared by every subcommand. Each one overrides file and environment.
#[derive(Args, Debug, Default, Clone)]
pub struct SortArgs {
    /// Config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Directory containing images to sort
    #[arg(long)]
    pub input: Option<PathBuf>,
    /// Base output directory for sorted images
    #[arg(long)]
    pub output: Option<PathBuf>,
    /// Directory with one reference-photo subdirectory per person
    #[arg(long)]
    pub known_faces: Option<PathBuf>,
    /// Directory for the fingerprint cache
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
    /// Directory for the file-operation log
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    /// Detection backend: hog (fast) or cnn (accurate)
    #[arg(long)]
    pub model: Option<Backend>,
    /// Move files instead of copying (disables the cache)
    #[arg(long = "move")]
    pub move_files: bool,
    /// Worker threads (default: CPU count)
    #[arg(long)]
    pub workers: Option<usize>,
    /// Images per encoder call
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Minimum face size in pixels
    #[arg(long)]
    pub min_face_size: Option<u32>,
    /// Longest image side passed to the encoder
    #[arg(long)]
    pub max_image_size: Option<u32>,
    /// Detect once at --max-image-size instead of escalating from smaller sizes
    #[arg(long)]
    pub single_pass: bool,
    /// Use the stricter tolerance tuned for children
    #[arg(long)]
    pub children: bool,
    /// Explicit match tolerance (overrides --children)
    #[arg(long)]
    pub tolerance: Option<f32>,
    /// Person names in precedence order
    #[arg(long, num_args = 1..)]
    pub priority: Vec<String>,
    /// name:birthdate:priority:output_path[:faces_path], empty fields skipped
    #[arg(long)]
    pub person: Vec<String>,
    /// Descend into subdirectories of the input
    #[arg(long)]
    pub recursive: bool,
    /// Reject candidates whose age at capture time does not fit the face
    #[arg(long)]
    pub age_based_matching: bool,
    /// Allowed age difference in years
    #[arg(long)]
    pub age_tolerance: Option<u32>,
    /// Detection/encoding program
    #[arg(long)]
    pub encoder: Option<PathBuf>,
    /// Extra argument passed to the encoder program (repeatable)
    #[arg(long, allow_hyphen_values = true)]
    pub encoder_arg: Vec<String>,
    /// Log level: trace, debug, info, warning, error
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    directories: DirectoriesSection,
    recognition: RecognitionSection,
    performance: PerformanceSection,
    behavior: BehaviorSection,
    logging: LoggingSection,
    people: BTreeMap<String, PersonOverrides>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DirectoriesSection {
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    known_faces: Option<PathBuf>,
    cache: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecognitionSection {
    model: Option<Backend>,
    tolerance: Option<f32>,
    use_children_settings: Option<bool>,
    min_face_size: Option<u32>,
    max_image_size: Option<u32>,
    progressive_detection: Option<bool>,
    age_based_matching: Option<bool>,
    age_tolerance: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PerformanceSection {
    workers: Option<usize>,
    batch_size: Option<usize>,
    encoder: Option<PathBuf>,
    encoder_args: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BehaviorSection {
    priority: Option<Vec<String>>,
    move_files: Option<bool>,
    recursive: Option<bool>,
    person_paths: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoggingSection {
    log_dir: Option<PathBuf>,
    verbosity: Option<String>,
}

/// Everything the binary needs, resolved once.
#[derive(Debug, Clone)]
pub struct Settings {
    pub sort: SortConfig,
    pub encoder: PathBuf,
    pub encoder_args: Vec<String>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub verbosity: String,
    /// Problems found while resolving; logged once logging is up.
    pub warnings: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sort: SortConfig::default(),
            encoder: PathBuf::from(DEFAULT_ENCODER),
            encoder_args: Vec::new(),
            verbosity: "info".into(),
            warnings: Vec::new(),
        }
    }
}

/// Resolve defaults → config file → `FACESORT_*` environment → flags.
pub fn resolve(args: &SortArgs, env: impl Fn(&str) -> Option<String>) -> Result<Settings> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let file = load_file(&path)?;

    let mut settings = Settings::default();
    if file.is_none() && args.config.is_some() {
        settings
            .warnings
            .push(format!("config file {} not found; using defaults", path.display()));
    }
    let mut priority = Vec::new();
    if let Some(file) = file {
        apply_file(&mut settings, &mut priority, file);
    }
    apply_env(&mut settings, &mut priority, &env)?;
    apply_args(&mut settings, &mut priority, args)?;

    settings.sort.priority = if priority.is_empty() {
        priority_from_people(&settings.sort.people)
    } else {
        priority
    };
    settings.sort.validate().context("invalid configuration")?;
    Ok(settings)
}

/// Parse the config file; `None` if it does not exist.
fn load_file(path: &Path) -> Result<Option<FileConfig>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("cannot read config file {}", path.display())),
    };
    let parsed = toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(Some(parsed))
}

fn apply_file(settings: &mut Settings, priority: &mut Vec<String>, file: FileConfig) {
    let sort = &mut settings.sort;
    let FileConfig {
        directories,
        recognition,
        performance,
        behavior,
        logging,
        people,
    } = file;

    set(&mut sort.input_dir, directories.input);
    set(&mut sort.output_dir, directories.output);
    set(&mut sort.known_faces_dir, directories.known_faces);
    if directories.cache.is_some() {
        sort.cache_dir = directories.cache;
    }

    set(&mut sort.backend, recognition.model);
    if recognition.tolerance.is_some() {
        sort.tolerance = recognition.tolerance;
    }
    set(&mut sort.use_children_settings, recognition.use_children_settings);
    set(&mut sort.min_face_size, recognition.min_face_size);
    set(&mut sort.max_image_size, recognition.max_image_size);
    set(&mut sort.progressive_detection, recognition.progressive_detection);
    set(&mut sort.age_based_matching, recognition.age_based_matching);
    set(&mut sort.age_tolerance, recognition.age_tolerance);

    if performance.workers.is_some() {
        sort.workers = performance.workers;
    }
    if performance.batch_size.is_some() {
        sort.batch_size = performance.batch_size;
    }
    set(&mut settings.encoder, performance.encoder);
    set(&mut settings.encoder_args, performance.encoder_args);

    set(priority, behavior.priority);
    set(&mut sort.move_files, behavior.move_files);
    set(&mut sort.recursive, behavior.recursive);

    if logging.log_dir.is_some() {
        sort.log_dir = logging.log_dir;
    }
    set(&mut settings.verbosity, logging.verbosity.map(|v| normalize_level(&v)));

    sort.people = people;
    for (name, path) in behavior.person_paths {
        let entry = sort.people.entry(name).or_default();
        if entry.output_path.is_none() {
            entry.output_path = Some(path);
        }
    }
}

fn apply_env(
    settings: &mut Settings,
    priority: &mut Vec<String>,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let sort = &mut settings.sort;
    set(&mut sort.input_dir, env("FACESORT_INPUT").map(PathBuf::from));
    set(&mut sort.output_dir, env("FACESORT_OUTPUT").map(PathBuf::from));
    set(&mut sort.known_faces_dir, env("FACESORT_KNOWN_FACES").map(PathBuf::from));
    if let Some(dir) = env("FACESORT_CACHE_DIR") {
        sort.cache_dir = Some(PathBuf::from(dir));
    }
    if let Some(dir) = env("FACESORT_LOG_DIR") {
        sort.log_dir = Some(PathBuf::from(dir));
    }
    set(&mut sort.backend, env_parse(env, "FACESORT_MODEL")?);
    if let Some(t) = env_parse(env, "FACESORT_TOLERANCE")? {
        sort.tolerance = Some(t);
    }
    if let Some(n) = env_parse(env, "FACESORT_WORKERS")? {
        sort.workers = Some(n);
    }
    if let Some(n) = env_parse(env, "FACESORT_BATCH_SIZE")? {
        sort.batch_size = Some(n);
    }
    set(&mut sort.move_files, env_bool(env, "FACESORT_MOVE"));
    set(&mut sort.recursive, env_bool(env, "FACESORT_RECURSIVE"));
    set(&mut sort.progressive_detection, env_bool(env, "FACESORT_PROGRESSIVE_DETECTION"));
    set(&mut sort.age_based_matching, env_bool(env, "FACESORT_AGE_BASED_MATCHING"));
    set(&mut sort.age_tolerance, env_parse(env, "FACESORT_AGE_TOLERANCE")?);
    if let Some(list) = env("FACESORT_PRIORITY") {
        *priority = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    set(&mut settings.encoder, env("FACESORT_ENCODER").map(PathBuf::from));
    set(&mut settings.verbosity, env("FACESORT_LOG_LEVEL").map(|v| normalize_level(&v)));
    Ok(())
}

fn apply_args(settings: &mut Settings, priority: &mut Vec<String>, args: &SortArgs) -> Result<()> {
    let sort = &mut settings.sort;
    set(&mut sort.input_dir, args.input.clone());
    set(&mut sort.output_dir, args.output.clone());
    set(&mut sort.known_faces_dir, args.known_faces.clone());
    if args.cache_dir.is_some() {
        sort.cache_dir = args.cache_dir.clone();
    }
    if args.log_dir.is_some() {
        sort.log_dir = args.log_dir.clone();
    }
    set(&mut sort.backend, args.model);
    if args.workers.is_some() {
        sort.workers = args.workers;
    }
    if args.batch_size.is_some() {
        sort.batch_size = args.batch_size;
    }
    set(&mut sort.min_face_size, args.min_face_size);
    set(&mut sort.max_image_size, args.max_image_size);
    if args.single_pass {
        sort.progressive_detection = false;
    }
    if args.children {
        sort.use_children_settings = true;
    }
    if args.tolerance.is_some() {
        sort.tolerance = args.tolerance;
    }
    if args.move_files {
        sort.move_files = true;
    }
    if args.recursive {
        sort.recursive = true;
    }
    if args.age_based_matching {
        sort.age_based_matching = true;
    }
    set(&mut sort.age_tolerance, args.age_tolerance);
    if !args.priority.is_empty() {
        *priority = args.priority.clone();
    }

    for spec in &args.person {
        let (name, overrides, warning) = parse_person(spec)?;
        settings.warnings.extend(warning);
        let entry = settings.sort.people.entry(name).or_default();
        merge_overrides(entry, overrides);
    }

    set(&mut settings.encoder, args.encoder.clone());
    if !args.encoder_arg.is_empty() {
        settings.encoder_args = args.encoder_arg.clone();
    }
    set(&mut settings.verbosity, args.log_level.as_deref().map(normalize_level));
    Ok(())
}

/// Parse `name:birthdate:priority:output_path[:faces_path]`.
///
/// Empty fields are skipped. A bad birthdate is an error; a bad priority only
/// produces a warning.
pub fn parse_person(spec: &str) -> Result<(String, PersonOverrides, Option<String>)> {
    let mut fields = spec.splitn(5, ':');
    let name = fields.next().unwrap_or_default().trim();
    if name.is_empty() {
        bail!("--person {spec:?}: missing name");
    }

    let mut overrides = PersonOverrides::default();
    let mut warning = None;
    if let Some(birthdate) = fields.next().filter(|s| !s.is_empty()) {
        overrides.birthdate = Some(
            NaiveDate::parse_from_str(birthdate, "%Y-%m-%d")
                .with_context(|| format!("--person {name}: birthdate {birthdate:?} is not YYYY-MM-DD"))?,
        );
    }
    if let Some(priority) = fields.next().filter(|s| !s.is_empty()) {
        match priority.parse::<u32>() {
            Ok(p) => overrides.priority = Some(p),
            Err(_) => warning = Some(format!("--person {name}: ignoring invalid priority {priority:?}")),
        }
    }
    if let Some(output) = fields.next().filter(|s| !s.is_empty()) {
        overrides.output_path = Some(PathBuf::from(output));
    }
    if let Some(faces) = fields.next().filter(|s| !s.is_empty()) {
        overrides.faces_path = Some(PathBuf::from(faces));
    }
    Ok((name.to_string(), overrides, warning))
}

fn merge_overrides(into: &mut PersonOverrides, from: PersonOverrides) {
    if from.birthdate.is_some() {
        into.birthdate = from.birthdate;
    }
    if from.priority.is_some() {
        into.priority = from.priority;
    }
    if from.output_path.is_some() {
        into.output_path = from.output_path;
    }
    if from.faces_path.is_some() {
        into.faces_path = from.faces_path;
    }
}

/// Names from `[people]` ordered by their priority, then name.
fn priority_from_people(people: &BTreeMap<String, PersonOverrides>) -> Vec<String> {
    let mut ranked: Vec<(u32, &String)> = people
        .iter()
        .map(|(name, o)| (o.priority.unwrap_or(UNRANKED_PRIORITY), name))
        .collect();
    ranked.sort();
    ranked.into_iter().map(|(_, name)| name.clone()).collect()
}

fn normalize_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".into(),
        "critical" => "error".into(),
        other => other.to_string(),
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn env_parse<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env(key) {
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}={v:?}: {e}")),
        None => Ok(None),
    }
}

fn env_bool(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    env(key).map(|v| !matches!(v.trim(), "0" | "false" | "no" | ""))
}
