//! Randomized image transforms.
//!
//! An [`AugmentationPipeline`] walks its [`AugmentationSpec`] in order and
//! gates every transform on its own probability, then resizes the result to
//! the target size. All randomness comes from the caller's RNG, so a seeded
//! RNG gives a reproducible variant.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, ImageFormat, Rgb, RgbImage};
use product_core::{AugmentationSpec, Error, Result, TransformKind, TransformSpec};
use rand::Rng;

/// Applies an [`AugmentationSpec`] to RGB images.
#[derive(Debug, Clone)]
pub struct AugmentationPipeline {
    spec: AugmentationSpec,
}

impl AugmentationPipeline {
    pub fn new(spec: AugmentationSpec) -> Result<Self> {
        spec.validate().map_err(Error::Config)?;
        Ok(Self { spec })
    }

    pub fn spec(&self) -> &AugmentationSpec {
        &self.spec
    }

    /// Produces one random variant of `image` at the target size.
    pub fn augment<R: Rng + ?Sized>(&self, image: &RgbImage, rng: &mut R) -> Result<RgbImage> {
        let mut out = image.clone();
        for transform in &self.spec.transforms {
            if rng.gen_bool(transform.probability.clamp(0.0, 1.0)) {
                out = apply(&transform.kind, &out, rng)?;
            }
        }
        Ok(self.fit(&out))
    }

    /// Resizes to the target size without any random transform.
    pub fn fit(&self, image: &RgbImage) -> RgbImage {
        let size = self.spec.target_size;
        if image.dimensions() == (size, size) {
            image.clone()
        } else {
            imageops::resize(image, size, size, FilterType::Lanczos3)
        }
    }
}

/// Applies one transform unconditionally.
pub fn apply<R: Rng + ?Sized>(kind: &TransformKind, image: &RgbImage, rng: &mut R) -> Result<RgbImage> {
    let out = match kind {
        TransformKind::Rotate { limit_deg } => {
            let angle = symmetric(rng, *limit_deg);
            warp_affine(image, angle, 1.0, 0.0, 0.0)
        }
        TransformKind::ShiftScaleRotate {
            shift_limit,
            scale_limit,
            rotate_limit_deg,
        } => {
            let tx = symmetric(rng, *shift_limit) * image.width() as f32;
            let ty = symmetric(rng, *shift_limit) * image.height() as f32;
            let scale = 1.0 + symmetric(rng, *scale_limit);
            let angle = symmetric(rng, *rotate_limit_deg);
            warp_affine(image, angle, scale, tx, ty)
        }
        TransformKind::BrightnessContrast {
            brightness_limit,
            contrast_limit,
        } => {
            let alpha = 1.0 + symmetric(rng, *contrast_limit);
            let beta = symmetric(rng, *brightness_limit) * 255.0;
            map_channels(image, |v, _| v * alpha + beta)
        }
        TransformKind::HueSaturationValue {
            hue_shift,
            sat_shift,
            val_shift,
        } => {
            let dh = symmetric(rng, *hue_shift);
            let ds = symmetric(rng, *sat_shift) / 255.0;
            let dv = symmetric(rng, *val_shift) / 255.0;
            shift_hsv(image, dh, ds, dv)
        }
        TransformKind::RgbShift { limit } => {
            let shift = [
                symmetric(rng, *limit),
                symmetric(rng, *limit),
                symmetric(rng, *limit),
            ];
            map_channels(image, |v, c| v + shift[c])
        }
        TransformKind::GaussianNoise { var_min, var_max } => {
            let sigma = range(rng, *var_min, *var_max).max(0.0).sqrt();
            gaussian_noise(image, sigma, rng)
        }
        TransformKind::GaussianBlur {
            sigma_min,
            sigma_max,
        } => {
            let sigma = range(rng, *sigma_min, *sigma_max).max(0.1);
            imageops::blur(image, sigma)
        }
        TransformKind::BoxBlur => imageops::filter3x3(image, &[1.0 / 9.0; 9]),
        TransformKind::Downscale {
            scale_min,
            scale_max,
        } => {
            let scale = range(rng, *scale_min, *scale_max).clamp(0.01, 1.0);
            let (w, h) = image.dimensions();
            let small_w = ((w as f32 * scale).round() as u32).max(1);
            let small_h = ((h as f32 * scale).round() as u32).max(1);
            let small = imageops::resize(image, small_w, small_h, FilterType::Nearest);
            imageops::resize(&small, w, h, FilterType::Nearest)
        }
        TransformKind::JpegCompression {
            quality_min,
            quality_max,
        } => {
            let (lo, hi) = ordered(*quality_min, *quality_max);
            let quality = rng.gen_range(lo..=hi).clamp(1, 100);
            jpeg_roundtrip(image, quality)?
        }
        TransformKind::HorizontalFlip => imageops::flip_horizontal(image),
        TransformKind::OneOf { transforms } => match choose_weighted(transforms, rng) {
            Some(child) => apply(&child.kind, image, rng)?,
            None => image.clone(),
        },
    };
    Ok(out)
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, limit: f32) -> f32 {
    range(rng, -limit.abs(), limit.abs())
}

fn range<R: Rng + ?Sized>(rng: &mut R, a: f32, b: f32) -> f32 {
    let (lo, hi) = ordered(a, b);
    if lo == hi {
        lo
    } else {
        rng.gen_range(lo..=hi)
    }
}

fn ordered<T: PartialOrd>(a: T, b: T) -> (T, T) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Picks one child with probability proportional to its `probability`.
fn choose_weighted<'a, R: Rng + ?Sized>(
    children: &'a [TransformSpec],
    rng: &mut R,
) -> Option<&'a TransformSpec> {
    let total: f64 = children.iter().map(|c| c.probability.max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }
    let mut pick = rng.gen_range(0.0..total);
    for child in children {
        let weight = child.probability.max(0.0);
        if pick < weight {
            return Some(child);
        }
        pick -= weight;
    }
    children.last()
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

fn map_channels(image: &RgbImage, f: impl Fn(f32, usize) -> f32) -> RgbImage {
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y).0;
        Rgb([
            to_u8(f(p[0] as f32, 0)),
            to_u8(f(p[1] as f32, 1)),
            to_u8(f(p[2] as f32, 2)),
        ])
    })
}

/// Reflects an out-of-range index back into `0..len`, not repeating the edge.
fn reflect_101(i: i64, len: u32) -> u32 {
    let len = len as i64;
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let mut i = i.rem_euclid(period);
    if i >= len {
        i = period - i;
    }
    i as u32
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> [f32; 3] {
    let (w, h) = image.dimensions();
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let px = |xi: i64, yi: i64| image.get_pixel(reflect_101(xi, w), reflect_101(yi, h)).0;
    let (a, b, c, d) = (px(x0, y0), px(x0 + 1, y0), px(x0, y0 + 1), px(x0 + 1, y0 + 1));

    let mut out = [0.0; 3];
    for ch in 0..3 {
        let top = a[ch] as f32 * (1.0 - fx) + b[ch] as f32 * fx;
        let bottom = c[ch] as f32 * (1.0 - fx) + d[ch] as f32 * fx;
        out[ch] = top * (1.0 - fy) + bottom * fy;
    }
    out
}

/// Rotates by `angle_deg` and scales about the center, then translates.
/// Areas uncovered by the source are filled by reflection.
fn warp_affine(image: &RgbImage, angle_deg: f32, scale: f32, tx: f32, ty: f32) -> RgbImage {
    let (w, h) = image.dimensions();
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let scale = if scale.abs() < 1e-3 { 1e-3 } else { scale };

    ImageBuffer::from_fn(w, h, |x, y| {
        let dx = x as f32 - cx - tx;
        let dy = y as f32 - cy - ty;
        let sx = (cos * dx + sin * dy) / scale + cx;
        let sy = (-sin * dx + cos * dy) / scale + cy;
        let p = sample_bilinear(image, sx, sy);
        Rgb([to_u8(p[0]), to_u8(p[1]), to_u8(p[2])])
    })
}

fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let c = v * s;
    let hp = h.rem_euclid(360.0) / 60.0;
    let x = c * (1.0 - (hp.rem_euclid(2.0) - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = v - c;
    (r + m, g + m, b + m)
}

fn shift_hsv(image: &RgbImage, dh: f32, ds: f32, dv: f32) -> RgbImage {
    ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y).0;
        let (h, s, v) = rgb_to_hsv(p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0);
        let (r, g, b) = hsv_to_rgb(
            h + dh,
            (s + ds).clamp(0.0, 1.0),
            (v + dv).clamp(0.0, 1.0),
        );
        Rgb([to_u8(r * 255.0), to_u8(g * 255.0), to_u8(b * 255.0)])
    })
}

/// Standard normal sample via the Box-Muller transform.
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

fn gaussian_noise<R: Rng + ?Sized>(image: &RgbImage, sigma: f32, rng: &mut R) -> RgbImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        for c in pixel.0.iter_mut() {
            *c = to_u8(*c as f32 + standard_normal(rng) * sigma);
        }
    }
    out
}

fn jpeg_roundtrip(image: &RgbImage, quality: u8) -> Result<RgbImage> {
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
    let decoded = image::load_from_memory_with_format(buf.get_ref(), ImageFormat::Jpeg)?;
    Ok(decoded.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::create_test_image;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn single(kind: TransformKind, size: u32) -> AugmentationPipeline {
        AugmentationPipeline::new(AugmentationSpec {
            transforms: vec![TransformSpec::new(1.0, kind)],
            target_size: size,
        })
        .unwrap()
    }

    #[test]
    fn test_output_has_target_size() {
        let pipeline = AugmentationPipeline::new(AugmentationSpec {
            target_size: 64,
            ..AugmentationSpec::default()
        })
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..5 {
            let out = pipeline.augment(&create_test_image(), &mut rng).unwrap();
            assert_eq!(out.dimensions(), (64, 64));
        }
    }

    #[test]
    fn test_same_seed_same_variant() {
        let pipeline = AugmentationPipeline::new(AugmentationSpec {
            target_size: 48,
            ..AugmentationSpec::default()
        })
        .unwrap();
        let image = create_test_image();
        let a = pipeline
            .augment(&image, &mut ChaCha8Rng::seed_from_u64(3))
            .unwrap();
        let b = pipeline
            .augment(&image, &mut ChaCha8Rng::seed_from_u64(3))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_probability_only_resizes() {
        let pipeline = AugmentationPipeline::new(AugmentationSpec {
            transforms: vec![TransformSpec::new(0.0, TransformKind::HorizontalFlip)],
            target_size: 100,
        })
        .unwrap();
        let image = create_test_image();
        let out = pipeline
            .augment(&image, &mut ChaCha8Rng::seed_from_u64(1))
            .unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn test_horizontal_flip() {
        let pipeline = single(TransformKind::HorizontalFlip, 100);
        let out = pipeline
            .augment(&create_test_image(), &mut ChaCha8Rng::seed_from_u64(1))
            .unwrap();
        // red quadrant moves to the top right
        assert_eq!(out.get_pixel(99, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_zero_rotation_is_identity() {
        let image = create_test_image();
        let out = warp_affine(&image, 0.0, 1.0, 0.0, 0.0);
        assert_eq!(out, image);
    }

    #[test]
    fn test_rgb_shift_clamps() {
        let image: RgbImage = ImageBuffer::from_pixel(4, 4, Rgb([250, 5, 128]));
        let out = apply(
            &TransformKind::RgbShift { limit: 200.0 },
            &image,
            &mut ChaCha8Rng::seed_from_u64(9),
        )
        .unwrap();
        assert_eq!(out.dimensions(), (4, 4));
    }

    #[test]
    fn test_hsv_roundtrip() {
        for (r, g, b) in [(1.0, 0.0, 0.0), (0.2, 0.6, 0.4), (0.5, 0.5, 0.5)] {
            let (h, s, v) = rgb_to_hsv(r, g, b);
            let (r2, g2, b2) = hsv_to_rgb(h, s, v);
            assert!((r - r2).abs() < 1e-5 && (g - g2).abs() < 1e-5 && (b - b2).abs() < 1e-5);
        }
    }

    #[test]
    fn test_reflect_101() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(2, 5), 2);
        assert_eq!(reflect_101(-3, 1), 0);
    }

    #[test]
    fn test_one_of_applies_a_child() {
        let kind = TransformKind::OneOf {
            transforms: vec![
                TransformSpec::new(0.0, TransformKind::BoxBlur),
                TransformSpec::new(1.0, TransformKind::HorizontalFlip),
            ],
        };
        let out = apply(&kind, &create_test_image(), &mut ChaCha8Rng::seed_from_u64(5)).unwrap();
        assert_eq!(out.get_pixel(99, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_every_transform_keeps_size() {
        let image = create_test_image();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let kinds = [
            TransformKind::Rotate { limit_deg: 25.0 },
            TransformKind::ShiftScaleRotate {
                shift_limit: 0.1,
                scale_limit: 0.2,
                rotate_limit_deg: 15.0,
            },
            TransformKind::BrightnessContrast {
                brightness_limit: 0.3,
                contrast_limit: 0.3,
            },
            TransformKind::HueSaturationValue {
                hue_shift: 10.0,
                sat_shift: 20.0,
                val_shift: 20.0,
            },
            TransformKind::GaussianNoise {
                var_min: 10.0,
                var_max: 50.0,
            },
            TransformKind::GaussianBlur {
                sigma_min: 0.5,
                sigma_max: 1.5,
            },
            TransformKind::BoxBlur,
            TransformKind::Downscale {
                scale_min: 0.5,
                scale_max: 0.9,
            },
            TransformKind::JpegCompression {
                quality_min: 85,
                quality_max: 100,
            },
        ];
        for kind in &kinds {
            let out = apply(kind, &image, &mut rng).unwrap();
            assert_eq!(out.dimensions(), image.dimensions(), "{kind:?}");
        }
    }

    #[test]
    fn test_invalid_spec_rejected() {
        let spec = AugmentationSpec {
            transforms: vec![TransformSpec::new(2.0, TransformKind::BoxBlur)],
            target_size: 10,
        };
        assert!(AugmentationPipeline::new(spec).is_err());
    }
}
