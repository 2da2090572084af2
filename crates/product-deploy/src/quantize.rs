//! Per-tensor affine uint8 quantization.

use serde::{Deserialize, Serialize};

/// `value ≈ min + q * scale` for every stored byte `q`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationParams {
    pub dtype: String,
    pub min: f32,
    pub scale: f32,
}

/// Quantizes `data` to `u8` over its own finite range.
///
/// Constant tensors get a scale of 1 so they dequantize exactly. Non-finite
/// values are stored as 0.
pub fn quantize_uint8(data: &[f32]) -> (Vec<u8>, QuantizationParams) {
    let (min, max) = data
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let (min, max) = if min > max { (0.0, 0.0) } else { (min, max) };
    let scale = if max > min { (max - min) / 255.0 } else { 1.0 };

    let bytes = data
        .iter()
        .map(|&v| {
            if v.is_finite() {
                ((v - min) / scale).round().clamp(0.0, 255.0) as u8
            } else {
                0
            }
        })
        .collect();

    (
        bytes,
        QuantizationParams {
            dtype: "uint8".to_string(),
            min,
            scale,
        },
    )
}

pub fn dequantize_uint8(bytes: &[u8], params: &QuantizationParams) -> Vec<f32> {
    bytes
        .iter()
        .map(|&q| params.min + q as f32 * params.scale)
        .collect()
}
