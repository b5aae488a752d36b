use std::io::{self, Cursor};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageError, ImageReader};
use thiserror::Error;

pub const DEFAULT_MAX_WIDTH: u32 = 1920;
pub const DEFAULT_MAX_HEIGHT: u32 = 1080;
pub const DEFAULT_QUALITY: u32 = 80;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot decode image: {0}")]
    Decode(ImageError),
    #[error("cannot encode jpeg: {0}")]
    Encode(ImageError),
    #[error("transform worker failed: {0}")]
    Worker(String),
}

/// Orientation fix, bounded downscale and JPEG re-encode for display
/// hardware with little memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransform {
    max_width: u32,
    max_height: u32,
    quality: u8,
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WIDTH, DEFAULT_MAX_HEIGHT, DEFAULT_QUALITY)
    }
}

impl ImageTransform {
    pub fn new(max_width: u32, max_height: u32, quality: u32) -> Self {
        Self {
            max_width: max_width.max(1),
            max_height: max_height.max(1),
            quality: quality.clamp(1, 100) as u8,
        }
    }

    pub fn apply(&self, bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
        let mut decoder = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .into_decoder()
            .map_err(TransformError::Decode)?;
        let orientation = decoder
            .orientation()
            .unwrap_or(Orientation::NoTransforms);
        let mut image = DynamicImage::from_decoder(decoder).map_err(TransformError::Decode)?;
        image.apply_orientation(orientation);

        let (width, height) = fit_within(
            image.width(),
            image.height(),
            self.max_width,
            self.max_height,
        );
        if (width, height) != (image.width(), image.height()) {
            image = image.resize_exact(width, height, FilterType::Lanczos3);
        }

        let rgb = image.to_rgb8();
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(&rgb)
            .map_err(TransformError::Encode)?;
        Ok(out)
    }
}

/// Largest size with the same aspect ratio that fits inside the bounds.
/// Images that already fit are returned unchanged.
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let scale = f64::min(
        max_width as f64 / width as f64,
        max_height as f64 / height as f64,
    );
    let scaled = |side: u32, bound: u32| ((side as f64 * scale).round() as u32).clamp(1, bound);
    (scaled(width, max_width), scaled(height, max_height))
}
