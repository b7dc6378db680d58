//! Detection/encoding collaborator interface and image preprocessing.
//!
//! Face detection and encoding run outside this crate. The pipeline
//! downscales each image to a capped dimension, hands the pixels to a
//! [`FaceEncoder`], and maps the returned boxes back to original-image space.
//! [`detect_faces`] tries small sizes first and only escalates images in
//! which nothing was found.

use crate::config::Backend;
use crate::types::{BoundingBox, Encoding, FaceObservation};
use image::imageops::FilterType;
use image::RgbImage;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("cannot decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("encoder process failed: {0}")]
    Process(String),
    #[error("encoder returned malformed output: {0}")]
    MalformedOutput(String),
    #[error("expected {expected}-dim encoding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded RGB pixels, downscaled to at most `max_dimension` on the long side.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub source: PathBuf,
    pub pixels: RgbImage,
    /// Multiply prepared-space coordinates by this to get original coordinates.
    pub scale: f32,
}

impl PreparedImage {
    /// Downscale `pixels` (never upscale) so the longest side fits `max_dimension`.
    pub fn from_rgb(source: PathBuf, pixels: RgbImage, max_dimension: u32) -> Self {
        match downscale(&pixels, max_dimension) {
            Some((pixels, scale)) => Self { source, pixels, scale },
            None => Self {
                source,
                pixels,
                scale: 1.0,
            },
        }
    }

    /// Map observations from prepared space back to the original image.
    pub fn restore(&self, observations: Vec<FaceObservation>) -> Vec<FaceObservation> {
        if self.scale == 1.0 {
            return observations;
        }
        observations
            .into_iter()
            .map(|mut obs| {
                obs.bbox = obs.bbox.scaled(self.scale);
                obs
            })
            .collect()
    }
}

/// Full-resolution pixels of one input, kept while detection escalates.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub source: PathBuf,
    pub pixels: RgbImage,
}

impl DecodedImage {
    pub fn longest_side(&self) -> u32 {
        let (width, height) = self.pixels.dimensions();
        width.max(height)
    }

    pub fn prepare(&self, max_dimension: u32) -> PreparedImage {
        match downscale(&self.pixels, max_dimension) {
            Some((pixels, scale)) => PreparedImage {
                source: self.source.clone(),
                pixels,
                scale,
            },
            None => PreparedImage {
                source: self.source.clone(),
                pixels: self.pixels.clone(),
                scale: 1.0,
            },
        }
    }
}

/// Resized pixels and the restore scale, or `None` when `pixels` already fit.
fn downscale(pixels: &RgbImage, max_dimension: u32) -> Option<(RgbImage, f32)> {
    let (width, height) = pixels.dimensions();
    let longest = width.max(height);
    if longest <= max_dimension || longest == 0 || max_dimension == 0 {
        return None;
    }
    let ratio = max_dimension as f32 / longest as f32;
    let new_w = ((width as f32 * ratio).round() as u32).max(1);
    let new_h = ((height as f32 * ratio).round() as u32).max(1);
    let resized = image::imageops::resize(pixels, new_w, new_h, FilterType::Lanczos3);
    Some((resized, longest as f32 / max_dimension as f32))
}

pub fn decode_image(path: &Path) -> Result<DecodedImage, EncoderError> {
    let decoded = image::open(path).map_err(|source| EncoderError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(DecodedImage {
        source: path.to_path_buf(),
        pixels: decoded.to_rgb8(),
    })
}

/// Detect faces in `images`, one result per image in input order.
///
/// Each image is encoded at `sizes[0]` first. Images with no face of at
/// least `min_face_size` pixels are retried at the next size, in one batch
/// per size, until faces appear, the sizes run out, or the image was
/// already encoded at full resolution. Boxes are in original-image space.
pub fn detect_faces(
    encoder: &dyn FaceEncoder,
    images: &[DecodedImage],
    sizes: &[u32],
    min_face_size: u32,
) -> Vec<Result<Vec<FaceObservation>, EncoderError>> {
    let mut results: Vec<Option<Result<Vec<FaceObservation>, EncoderError>>> =
        images.iter().map(|_| None).collect();
    let mut pending: Vec<usize> = (0..images.len()).collect();

    for (step, &size) in sizes.iter().enumerate() {
        if pending.is_empty() {
            break;
        }
        let last = step + 1 == sizes.len();
        let prepared: Vec<PreparedImage> = pending.iter().map(|&i| images[i].prepare(size)).collect();
        let outputs = encoder.encode_batch(&prepared);

        let mut retry = Vec::new();
        for ((&i, img), output) in pending.iter().zip(&prepared).zip(outputs) {
            match output {
                Ok(observations) => {
                    let faces = filter_small_faces(img.restore(observations), min_face_size);
                    let exhausted = last || images[i].longest_side() <= size;
                    if faces.is_empty() && !exhausted {
                        retry.push(i);
                        continue;
                    }
                    if step > 0 && !faces.is_empty() {
                        tracing::debug!(path = %img.source.display(), size, "faces found after escalating");
                    }
                    results[i] = Some(Ok(faces));
                }
                Err(e) => results[i] = Some(Err(e)),
            }
        }
        pending = retry;
    }

    results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(EncoderError::MalformedOutput("no result for image".into()))))
        .collect()
}

/// Drop faces smaller than `min_face_size` pixels in either dimension.
pub fn filter_small_faces(observations: Vec<FaceObservation>, min_face_size: u32) -> Vec<FaceObservation> {
    if min_face_size == 0 {
        return observations;
    }
    let min = min_face_size as f32;
    let before = observations.len();
    let kept: Vec<FaceObservation> = observations
        .into_iter()
        .filter(|obs| obs.bbox.width >= min && obs.bbox.height >= min)
        .collect();
    if kept.len() < before {
        tracing::debug!(dropped = before - kept.len(), min_face_size, "filtered small faces");
    }
    kept
}

/// External face detection and encoding capability.
///
/// Implementations may batch internally; results are returned one per input
/// image, in input order, and each image succeeds or fails independently.
pub trait FaceEncoder: Send + Sync {
    fn encode_batch(&self, images: &[PreparedImage]) -> Vec<Result<Vec<FaceObservation>, EncoderError>>;

    fn encode(&self, image: &PreparedImage) -> Result<Vec<FaceObservation>, EncoderError> {
        self.encode_batch(std::slice::from_ref(image))
            .pop()
            .unwrap_or_else(|| Err(EncoderError::MalformedOutput("no result for image".into())))
    }
}

/// Face record as printed by the encoder program.
#[derive(Debug, Deserialize)]
struct RawFace {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    encoding: Vec<f32>,
    #[serde(default)]
    age: Option<f32>,
    #[serde(default)]
    landmarks: Option<[[f32; 2]; 5]>,
}

impl From<RawFace> for FaceObservation {
    fn from(raw: RawFace) -> Self {
        FaceObservation {
            bbox: BoundingBox {
                x: raw.x,
                y: raw.y,
                width: raw.width,
                height: raw.height,
                landmarks: raw.landmarks.map(|lms| lms.map(|[lx, ly]| (lx, ly))),
            },
            encoding: Encoding::new(raw.encoding),
            estimated_age: raw.age,
        }
    }
}

/// Runs an external detector/encoder program once per batch.
///
/// Invocation: `<program> [args..] --model <hog|cnn> <png>...`. Stdout must be
/// a JSON array holding, per input image, an array of faces
/// `{x, y, width, height, encoding, age?, landmarks?}` in the PNG's pixel space.
pub struct CommandEncoder {
    program: PathBuf,
    args: Vec<String>,
    backend: Backend,
}

impl CommandEncoder {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, backend: Backend) -> Self {
        Self {
            program: program.into(),
            args,
            backend,
        }
    }

    fn run(&self, images: &[PreparedImage]) -> Result<Vec<Vec<RawFace>>, EncoderError> {
        let workdir = tempfile::Builder::new().prefix("facesort-enc").tempdir()?;
        let mut inputs = Vec::with_capacity(images.len());
        for (i, img) in images.iter().enumerate() {
            let png = workdir.path().join(format!("{i:04}.png"));
            img.pixels
                .save(&png)
                .map_err(|e| EncoderError::Process(format!("writing {}: {e}", png.display())))?;
            inputs.push(png);
        }

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--model")
            .arg(self.backend.as_str())
            .args(&inputs)
            .output()
            .map_err(|e| EncoderError::Process(format!("spawning {}: {e}", self.program.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EncoderError::Process(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        let parsed: Vec<Vec<RawFace>> = serde_json::from_slice(&output.stdout)
            .map_err(|e| EncoderError::MalformedOutput(e.to_string()))?;
        if parsed.len() != images.len() {
            return Err(EncoderError::MalformedOutput(format!(
                "expected {} results, got {}",
                images.len(),
                parsed.len()
            )));
        }
        Ok(parsed)
    }
}

impl FaceEncoder for CommandEncoder {
    fn encode_batch(&self, images: &[PreparedImage]) -> Vec<Result<Vec<FaceObservation>, EncoderError>> {
        if images.is_empty() {
            return Vec::new();
        }
        match self.run(images) {
            Ok(per_image) => per_image
                .into_iter()
                .map(|faces| {
                    let observations: Vec<FaceObservation> =
                        faces.into_iter().map(FaceObservation::from).collect();
                    check_dimensions(&observations)?;
                    Ok(observations)
                })
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, batch = images.len(), "encoder batch failed");
                let reason = e.to_string();
                images
                    .iter()
                    .map(|_| Err(EncoderError::Process(reason.clone())))
                    .collect()
            }
        }
    }
}

/// Every face in one image must share the encoding dimension.
fn check_dimensions(observations: &[FaceObservation]) -> Result<(), EncoderError> {
    let Some(first) = observations.first() else {
        return Ok(());
    };
    let expected = first.encoding.dim();
    if expected == 0 {
        return Err(EncoderError::DimensionMismatch { expected: 1, actual: 0 });
    }
    for obs in observations {
        if obs.encoding.dim() != expected {
            return Err(EncoderError::DimensionMismatch {
                expected,
                actual: obs.encoding.dim(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(width: f32) -> FaceObservation {
        FaceObservation {
            bbox: BoundingBox {
                x: 10.0,
                y: 10.0,
                width,
                height: width,
                landmarks: None,
            },
            encoding: Encoding::new(vec![0.0; 4]),
            estimated_age: None,
        }
    }

    #[test]
    fn test_prepare_downscales_long_side() {
        let img = PreparedImage::from_rgb(PathBuf::from("x.png"), RgbImage::new(400, 200), 100);
        assert_eq!(img.pixels.dimensions(), (100, 50));
        assert!((img.scale - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_prepare_never_upscales() {
        let img = PreparedImage::from_rgb(PathBuf::from("x.png"), RgbImage::new(40, 20), 100);
        assert_eq!(img.pixels.dimensions(), (40, 20));
        assert_eq!(img.scale, 1.0);
    }

    #[test]
    fn test_restore_maps_back_to_original_space() {
        let img = PreparedImage::from_rgb(PathBuf::from("x.png"), RgbImage::new(400, 200), 100);
        let restored = img.restore(vec![observation(5.0)]);
        assert_eq!(restored[0].bbox.x, 40.0);
        assert_eq!(restored[0].bbox.width, 20.0);
    }

    #[test]
    fn test_filter_small_faces() {
        let kept = filter_small_faces(vec![observation(19.0), observation(20.0), observation(64.0)], 20);
        assert_eq!(kept.len(), 2);
        assert_eq!(filter_small_faces(vec![observation(1.0)], 0).len(), 1);
    }

    /// Finds one 40px face (in prepared space) only when the image is at least `min_width` wide.
    struct SizeGatedEncoder {
        min_width: u32,
        widths: std::sync::Mutex<Vec<u32>>,
    }

    impl SizeGatedEncoder {
        fn new(min_width: u32) -> Self {
            Self {
                min_width,
                widths: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn widths(&self) -> Vec<u32> {
            self.widths.lock().unwrap().clone()
        }
    }

    impl FaceEncoder for SizeGatedEncoder {
        fn encode_batch(&self, images: &[PreparedImage]) -> Vec<Result<Vec<FaceObservation>, EncoderError>> {
            images
                .iter()
                .map(|img| {
                    let width = img.pixels.width();
                    self.widths.lock().unwrap().push(width);
                    if width >= self.min_width {
                        Ok(vec![observation(40.0)])
                    } else {
                        Ok(vec![])
                    }
                })
                .collect()
        }
    }

    fn decoded(width: u32) -> DecodedImage {
        DecodedImage {
            source: PathBuf::from(format!("{width}.png")),
            pixels: RgbImage::new(width, width),
        }
    }

    #[test]
    fn test_detect_faces_escalates_until_found() {
        let encoder = SizeGatedEncoder::new(200);
        let results = detect_faces(&encoder, &[decoded(400)], &[100, 200, 400], 0);

        assert_eq!(encoder.widths(), vec![100, 200]);
        let faces = results.into_iter().next().unwrap().unwrap();
        assert_eq!(faces.len(), 1);
        // Restored from the 200px pass.
        assert_eq!(faces[0].bbox.width, 80.0);
    }

    #[test]
    fn test_detect_faces_stops_at_full_resolution() {
        let encoder = SizeGatedEncoder::new(u32::MAX);
        let results = detect_faces(&encoder, &[decoded(150), decoded(50)], &[100, 200, 400], 0);

        // The 50px image is already full size at 100; the 150px one at 200.
        assert_eq!(encoder.widths(), vec![100, 50, 150]);
        assert!(results.iter().all(|r| matches!(r, Ok(faces) if faces.is_empty())));
    }

    #[test]
    fn test_detect_faces_counts_only_faces_above_minimum() {
        let encoder = SizeGatedEncoder::new(100);
        // 40px at the 100px pass restores to 160px and at full size stays 40px; both under 200.
        let results = detect_faces(&encoder, &[decoded(400)], &[100, 400], 200);
        assert_eq!(encoder.widths(), vec![100, 400]);
        assert!(results[0].as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_prepare_image_rejects_non_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();
        assert!(matches!(decode_image(&path), Err(EncoderError::Decode { .. })));
    }

    #[test]
    fn test_check_dimensions_mismatch() {
        let mut other = observation(30.0);
        other.encoding = Encoding::new(vec![0.0; 3]);
        assert!(check_dimensions(&[observation(30.0), other]).is_err());
        assert!(check_dimensions(&[]).is_ok());
    }

    #[test]
    fn test_raw_face_parsing() {
        let json = r#"[[{"x":1,"y":2,"width":30,"height":40,"encoding":[0.1,0.2],"age":7.5}], []]"#;
        let parsed: Vec<Vec<RawFace>> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.len(), 2);
        let obs = FaceObservation::from(parsed.into_iter().next().unwrap().pop().unwrap());
        assert_eq!(obs.estimated_age, Some(7.5));
        assert_eq!(obs.encoding.dim(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_encoder_failure_fails_each_image() {
        let encoder = CommandEncoder::new("false", vec![], Backend::Hog);
        let images = vec![
            PreparedImage::from_rgb(PathBuf::from("a.png"), RgbImage::new(4, 4), 100),
            PreparedImage::from_rgb(PathBuf::from("b.png"), RgbImage::new(4, 4), 100),
        ];
        let results = encoder.encode_batch(&images);
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_err()));
    }
}
