//! Shared image preprocessing.
//!
//! Augmentation and validation both go through [`ImagePreprocessor`], so the
//! model sees identically prepared pixels at training and evaluation time.

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};
use product_core::{ImageDimensions, Result};

use crate::loader::load_image;

/// Factor applied to 8-bit pixel values before inference.
pub const RESCALE_FACTOR: f32 = 1.0 / 255.0;

/// Normalizes color, resizes and converts images to model input.
#[derive(Debug, Clone, Copy)]
pub struct ImagePreprocessor {
    target_size: u32,
}

impl ImagePreprocessor {
    pub fn new(target_size: u32) -> Self {
        Self { target_size }
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }

    pub fn dimensions(&self) -> ImageDimensions {
        ImageDimensions::square_rgb(self.target_size)
    }

    /// Converts any color type to 8-bit RGB.
    ///
    /// Transparent pixels are composited onto a white background, so images
    /// with alpha (RGBA, LA, palette with transparency) look the same as when
    /// viewed on a white page.
    pub fn normalize(image: &DynamicImage) -> RgbImage {
        if !image.color().has_alpha() {
            return image.to_rgb8();
        }
        let rgba = image.to_rgba8();
        ImageBuffer::from_fn(rgba.width(), rgba.height(), |x, y| {
            let p = rgba.get_pixel(x, y).0;
            let alpha = p[3] as f32 / 255.0;
            let blend = |c: u8| (c as f32 * alpha + 255.0 * (1.0 - alpha)).round() as u8;
            Rgb([blend(p[0]), blend(p[1]), blend(p[2])])
        })
    }

    /// Resizes to the square target with Lanczos3, ignoring aspect ratio.
    pub fn resize(&self, image: &RgbImage) -> RgbImage {
        if image.width() == self.target_size && image.height() == self.target_size {
            return image.clone();
        }
        image::imageops::resize(image, self.target_size, self.target_size, FilterType::Lanczos3)
    }

    /// Normalized and resized image.
    pub fn prepare(&self, image: &DynamicImage) -> RgbImage {
        self.resize(&Self::normalize(image))
    }

    /// Loads `path` and prepares it; decode failures are [`product_core::Error::CorruptSample`].
    pub fn load(&self, path: &Path) -> Result<RgbImage> {
        let image = load_image(path)?;
        Ok(self.prepare(&image))
    }

    /// Flattens an image into an HWC tensor scaled by [`RESCALE_FACTOR`].
    pub fn to_tensor(image: &RgbImage) -> Vec<f32> {
        image
            .as_raw()
            .iter()
            .map(|&v| v as f32 * RESCALE_FACTOR)
            .collect()
    }

    /// Loads, prepares and converts `path` into model input.
    pub fn load_tensor(&self, path: &Path) -> Result<Vec<f32>> {
        Ok(Self::to_tensor(&self.load(path)?))
    }
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new(product_core::DEFAULT_INPUT_SIZE)
    }
}
