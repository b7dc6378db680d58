//! Fixture images and a scripted encoder for exercising the pipeline
//! without an external detector.
//!
//! Fixture layout (64x64 RGB PNG):
//! - pixel (0, 0): red = face count, green = 255 marks an image the encoder fails on
//! - pixel (1 + i, 0): red = encoding value of face `i` (encoding is `[value / 100, 0]`)
//! - pixel (1 + i, 1): red = estimated age of face `i` plus one (0 = no estimate)

use crate::encoder::{EncoderError, FaceEncoder, PreparedImage};
use crate::types::{BoundingBox, Encoding, FaceObservation};
use image::{Rgb, RgbImage};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

const SIZE: u32 = 64;

pub fn write_face_image(path: &Path, values: &[u8]) {
    write_face_image_with_ages(path, values, &[]);
}

pub fn write_face_image_with_ages(path: &Path, values: &[u8], ages: &[u8]) {
    let mut img = RgbImage::from_pixel(SIZE, SIZE, Rgb([0, 0, 0]));
    img.put_pixel(0, 0, Rgb([values.len() as u8, 0, 0]));
    for (i, v) in values.iter().enumerate() {
        img.put_pixel(1 + i as u32, 0, Rgb([*v, 0, 0]));
    }
    for (i, age) in ages.iter().enumerate() {
        img.put_pixel(1 + i as u32, 1, Rgb([age + 1, 0, 0]));
    }
    img.save(path).unwrap();
}

/// An image the scripted encoder reports as a detection failure.
pub fn write_poisoned_image(path: &Path) {
    let mut img = RgbImage::from_pixel(SIZE, SIZE, Rgb([0, 0, 0]));
    img.put_pixel(0, 0, Rgb([1, 255, 0]));
    img.save(path).unwrap();
}

#[derive(Default)]
pub struct ScriptedEncoder {
    images: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedEncoder {
    /// Images passed to `encode_batch` so far.
    pub fn images_seen(&self) -> usize {
        self.images.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn decode(image: &PreparedImage) -> Result<Vec<FaceObservation>, EncoderError> {
        let header = image.pixels.get_pixel(0, 0);
        if header[1] == 255 {
            return Err(EncoderError::Process(format!(
                "scripted failure for {}",
                image.source.display()
            )));
        }
        let faces = header[0] as u32;
        Ok((0..faces)
            .map(|i| {
                let value = image.pixels.get_pixel(1 + i, 0)[0];
                let age = image.pixels.get_pixel(1 + i, 1)[0];
                FaceObservation {
                    bbox: BoundingBox {
                        x: (i * 40) as f32,
                        y: 0.0,
                        width: 40.0,
                        height: 40.0,
                        landmarks: None,
                    },
                    encoding: Encoding::new(vec![value as f32 / 100.0, 0.0]),
                    estimated_age: (age > 0).then(|| (age - 1) as f32),
                }
            })
            .collect())
    }
}

impl FaceEncoder for ScriptedEncoder {
    fn encode_batch(&self, images: &[PreparedImage]) -> Vec<Result<Vec<FaceObservation>, EncoderError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.images.fetch_add(images.len(), Ordering::SeqCst);
        images.iter().map(Self::decode).collect()
    }
}
