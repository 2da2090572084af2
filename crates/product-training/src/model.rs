//! Layer-graph model format written by the trainer.
//!
//! A trained model directory holds `model.json` (a [`ModelTopology`]) and
//! `weights.bin`, the little-endian `f32` values of every tensor listed in
//! `ModelTopology::weights`, concatenated in that order.

use std::fs;
use std::path::Path;

use product_core::{Error, Result};
use serde::{Deserialize, Serialize};

pub const MODEL_FILE: &str = "model.json";
pub const WEIGHTS_FILE: &str = "weights.bin";

/// Name and shape of one stored tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl WeightSpec {
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    pub fn num_values(&self) -> usize {
        self.shape.iter().product()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Linear,
    Relu,
    Softmax,
}

/// One layer of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    /// Mean over height and width: `[h, w, c] -> [c]`
    GlobalAveragePool,
    /// Non-overlapping mean pooling: `[h, w, c] -> [h / p, w / p, c]`
    AveragePool2d { pool_size: usize },
    Flatten,
    /// `y = activation(x * kernel + bias)` with `kernel` shaped `[inputs, units]`
    Dense {
        units: usize,
        activation: Activation,
        kernel: String,
        bias: String,
    },
    /// An op produced by the training framework that has no local
    /// implementation. It is carried by name through conversion.
    Opaque {
        op: String,
        #[serde(default)]
        weights: Vec<String>,
        #[serde(default)]
        config: serde_json::Value,
    },
}

impl LayerSpec {
    pub fn kind(&self) -> &str {
        match self {
            LayerSpec::GlobalAveragePool => "global_average_pool",
            LayerSpec::AveragePool2d { .. } => "average_pool2d",
            LayerSpec::Flatten => "flatten",
            LayerSpec::Dense { .. } => "dense",
            LayerSpec::Opaque { op, .. } => op,
        }
    }
}

/// Contents of `model.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTopology {
    pub architecture: String,
    /// `[height, width, channels]`
    pub input_shape: Vec<usize>,
    pub layers: Vec<LayerSpec>,
    pub weights: Vec<WeightSpec>,
}

impl ModelTopology {
    pub fn weight_spec(&self, name: &str) -> Option<&WeightSpec> {
        self.weights.iter().find(|w| w.name == name)
    }

    pub fn has_opaque_layers(&self) -> bool {
        self.layers
            .iter()
            .any(|l| matches!(l, LayerSpec::Opaque { .. }))
    }

    /// Walks the layers and returns the output shape, checking every dense
    /// layer against its weight specs.
    pub fn output_shape(&self) -> Result<Vec<usize>> {
        let mut shape = self.input_shape.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            shape = match layer {
                LayerSpec::GlobalAveragePool => match shape.as_slice() {
                    [_, _, c] => vec![*c],
                    _ => return Err(shape_error(i, layer, &shape)),
                },
                LayerSpec::AveragePool2d { pool_size } => match shape.as_slice() {
                    [h, w, c] if *pool_size > 0 && h / pool_size > 0 && w / pool_size > 0 => {
                        vec![h / pool_size, w / pool_size, *c]
                    }
                    _ => return Err(shape_error(i, layer, &shape)),
                },
                LayerSpec::Flatten => vec![shape.iter().product()],
                LayerSpec::Dense {
                    units,
                    kernel,
                    bias,
                    ..
                } => {
                    if shape.len() != 1 {
                        return Err(shape_error(i, layer, &shape));
                    }
                    let inputs = shape[0];
                    let k = self.require_weight(kernel)?;
                    let b = self.require_weight(bias)?;
                    if k.shape != [inputs, *units] || b.shape != [*units] {
                        return Err(Error::InvalidArgument(format!(
                            "layer {i} (dense): kernel {:?} / bias {:?} do not fit {inputs} -> {units}",
                            k.shape, b.shape
                        )));
                    }
                    vec![*units]
                }
                LayerSpec::Opaque { op, .. } => {
                    return Err(Error::InvalidArgument(format!(
                        "layer {i}: op '{op}' has no local implementation"
                    )))
                }
            };
        }
        Ok(shape)
    }

    fn require_weight(&self, name: &str) -> Result<&WeightSpec> {
        self.weight_spec(name)
            .ok_or_else(|| Error::InvalidArgument(format!("weight '{name}' is not declared")))
    }
}

fn shape_error(index: usize, layer: &LayerSpec, shape: &[usize]) -> Error {
    Error::InvalidArgument(format!(
        "layer {index} ({}) cannot take input of shape {shape:?}",
        layer.kind()
    ))
}

/// Something that maps a preprocessed HWC image tensor to class scores.
pub trait Classifier {
    /// Width of the score vector.
    fn num_outputs(&self) -> Result<usize>;

    fn predict(&self, input: &[f32]) -> Result<Vec<f32>>;
}

/// A model directory loaded into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModel {
    pub topology: ModelTopology,
    /// Values of `topology.weights`, same order
    pub tensors: Vec<Vec<f32>>,
}

impl LoadedModel {
    pub fn new(topology: ModelTopology, tensors: Vec<Vec<f32>>) -> Result<Self> {
        if tensors.len() != topology.weights.len() {
            return Err(Error::InvalidArgument(format!(
                "{} tensors for {} weight specs",
                tensors.len(),
                topology.weights.len()
            )));
        }
        for (spec, data) in topology.weights.iter().zip(&tensors) {
            if spec.num_values() != data.len() {
                return Err(Error::InvalidArgument(format!(
                    "tensor '{}' has {} values, shape {:?} needs {}",
                    spec.name,
                    data.len(),
                    spec.shape,
                    spec.num_values()
                )));
            }
        }
        Ok(Self { topology, tensors })
    }

    /// Reads `model.json` and `weights.bin` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let model_path = dir.join(MODEL_FILE);
        let weights_path = dir.join(WEIGHTS_FILE);
        if !model_path.exists() {
            return Err(Error::missing("model topology", model_path));
        }
        if !weights_path.exists() {
            return Err(Error::missing("model weights", weights_path));
        }

        let topology: ModelTopology = serde_json::from_str(&fs::read_to_string(&model_path)?)?;
        let bytes = fs::read(&weights_path)?;
        let expected: usize = topology.weights.iter().map(WeightSpec::num_values).sum();
        if bytes.len() != expected * 4 {
            return Err(Error::InvalidArgument(format!(
                "{} holds {} bytes, topology declares {} values",
                weights_path.display(),
                bytes.len(),
                expected
            )));
        }

        let mut values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        let tensors: Vec<Vec<f32>> = topology
            .weights
            .iter()
            .map(|spec| values.by_ref().take(spec.num_values()).collect())
            .collect();
        Self::new(topology, tensors)
    }

    /// Writes `model.json` and `weights.bin` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(
            dir.join(MODEL_FILE),
            serde_json::to_string_pretty(&self.topology)?,
        )?;
        let bytes: Vec<u8> = self
            .tensors
            .iter()
            .flatten()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        fs::write(dir.join(WEIGHTS_FILE), bytes)?;
        Ok(())
    }

    pub fn tensor(&self, name: &str) -> Option<&[f32]> {
        self.topology
            .weights
            .iter()
            .position(|w| w.name == name)
            .map(|i| self.tensors[i].as_slice())
    }

    fn require_tensor(&self, name: &str) -> Result<&[f32]> {
        self.tensor(name)
            .ok_or_else(|| Error::InvalidArgument(format!("weight '{name}' is not declared")))
    }
}

impl Classifier for LoadedModel {
    fn num_outputs(&self) -> Result<usize> {
        let shape = self.topology.output_shape()?;
        match shape.as_slice() {
            [n] => Ok(*n),
            other => Err(Error::InvalidArgument(format!(
                "model output has shape {other:?}, expected a vector"
            ))),
        }
    }

    fn predict(&self, input: &[f32]) -> Result<Vec<f32>> {
        let mut shape = self.topology.input_shape.clone();
        let expected: usize = shape.iter().product();
        if input.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "input has {} values, model expects {expected} ({shape:?})",
                input.len()
            )));
        }

        let mut x = input.to_vec();
        for layer in &self.topology.layers {
            match layer {
                LayerSpec::GlobalAveragePool => {
                    let [h, w, c] = hwc(&shape)?;
                    x = average_pool(&x, h, w, c, h, w);
                    shape = vec![c];
                }
                LayerSpec::AveragePool2d { pool_size } => {
                    let [h, w, c] = hwc(&shape)?;
                    let p = (*pool_size).max(1);
                    x = average_pool(&x, h, w, c, p, p);
                    shape = vec![h / p, w / p, c];
                }
                LayerSpec::Flatten => shape = vec![x.len()],
                LayerSpec::Dense {
                    units,
                    activation,
                    kernel,
                    bias,
                } => {
                    let k = self.require_tensor(kernel)?;
                    let b = self.require_tensor(bias)?;
                    if k.len() != x.len() * units || b.len() != *units {
                        return Err(Error::InvalidArgument(format!(
                            "dense layer '{kernel}' does not fit input of {} values",
                            x.len()
                        )));
                    }
                    let mut y = b.to_vec();
                    for (i, xi) in x.iter().enumerate() {
                        let row = &k[i * units..(i + 1) * units];
                        for (yj, kij) in y.iter_mut().zip(row) {
                            *yj += xi * kij;
                        }
                    }
                    activate(&mut y, *activation);
                    x = y;
                    shape = vec![*units];
                }
                LayerSpec::Opaque { op, .. } => {
                    return Err(Error::InvalidArgument(format!(
                        "op '{op}' has no local implementation"
                    )))
                }
            }
        }
        Ok(x)
    }
}

fn hwc(shape: &[usize]) -> Result<[usize; 3]> {
    match shape {
        [h, w, c] => Ok([*h, *w, *c]),
        other => Err(Error::InvalidArgument(format!(
            "pooling needs a [h, w, c] input, got {other:?}"
        ))),
    }
}

/// Mean pooling with window `ph x pw` and equal stride, dropping remainders.
fn average_pool(x: &[f32], h: usize, w: usize, c: usize, ph: usize, pw: usize) -> Vec<f32> {
    let (oh, ow) = (h / ph, w / pw);
    let mut out = vec![0.0; oh * ow * c];
    let norm = (ph * pw) as f32;
    for oy in 0..oh {
        for ox in 0..ow {
            for dy in 0..ph {
                for dx in 0..pw {
                    let base = ((oy * ph + dy) * w + ox * pw + dx) * c;
                    for ch in 0..c {
                        out[(oy * ow + ox) * c + ch] += x[base + ch];
                    }
                }
            }
        }
    }
    for v in &mut out {
        *v /= norm;
    }
    out
}

fn activate(y: &mut [f32], activation: Activation) {
    match activation {
        Activation::Linear => {}
        Activation::Relu => y.iter_mut().for_each(|v| *v = v.max(0.0)),
        Activation::Softmax => {
            let max = y.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for v in y.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            if sum > 0.0 {
                y.iter_mut().for_each(|v| *v /= sum);
            }
        }
    }
}

/// Global average pooling followed by one softmax dense layer.
///
/// The smallest topology the interpreter can run end to end.
pub fn linear_probe(input_size: usize, kernel: Vec<f32>, bias: Vec<f32>) -> Result<LoadedModel> {
    let units = bias.len();
    let topology = ModelTopology {
        architecture: "linear_probe".to_string(),
        input_shape: vec![input_size, input_size, 3],
        layers: vec![
            LayerSpec::GlobalAveragePool,
            LayerSpec::Dense {
                units,
                activation: Activation::Softmax,
                kernel: "dense/kernel".to_string(),
                bias: "dense/bias".to_string(),
            },
        ],
        weights: vec![
            WeightSpec::new("dense/kernel", vec![3, units]),
            WeightSpec::new("dense/bias", vec![units]),
        ],
    };
    LoadedModel::new(topology, vec![kernel, bias])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Scores are the mean red, green and blue value.
    fn rgb_model(size: usize) -> LoadedModel {
        #[rustfmt::skip]
        let kernel = vec![
            1.0, 0.0, 0.0,
            0.0, 1.0, 0.0,
            0.0, 0.0, 1.0,
        ];
        let mut model = linear_probe(size, kernel, vec![0.0; 3]).unwrap();
        if let LayerSpec::Dense { activation, .. } = &mut model.topology.layers[1] {
            *activation = Activation::Linear;
        }
        model
    }

    #[test]
    fn test_forward_pass() {
        let model = rgb_model(2);
        // four pixels, all pure green
        let input: Vec<f32> = (0..4).flat_map(|_| [0.0, 1.0, 0.0]).collect();
        let out = model.predict(&input).unwrap();
        assert_eq!(out, vec![0.0, 1.0, 0.0]);
        assert_eq!(model.num_outputs().unwrap(), 3);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let model = linear_probe(1, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![0.0, 0.0]).unwrap();
        let out = model.predict(&[0.1, 0.2, 0.3]).unwrap();
        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(out[1] > out[0]);
    }

    #[test]
    fn test_average_pool2d() {
        let mut model = rgb_model(4);
        model
            .topology
            .layers
            .insert(0, LayerSpec::AveragePool2d { pool_size: 2 });
        assert_eq!(model.num_outputs().unwrap(), 3);
        let out = model.predict(&vec![0.5; 4 * 4 * 3]).unwrap();
        for v in out {
            assert!((v - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_wrong_input_size() {
        let model = rgb_model(2);
        assert!(model.predict(&[0.0; 5]).is_err());
    }

    #[test]
    fn test_save_load_preserves_model() {
        let dir = TempDir::new().unwrap();
        let model = rgb_model(8);
        model.save(dir.path()).unwrap();
        let loaded = LoadedModel::load(dir.path()).unwrap();
        assert_eq!(loaded, model);
        assert_eq!(loaded.tensor("dense/bias"), Some(&[0.0, 0.0, 0.0][..]));
    }

    #[test]
    fn test_truncated_weights_rejected() {
        let dir = TempDir::new().unwrap();
        rgb_model(2).save(dir.path()).unwrap();
        fs::write(dir.path().join(WEIGHTS_FILE), [0u8; 10]).unwrap();
        assert!(LoadedModel::load(dir.path()).is_err());
    }

    #[test]
    fn test_missing_model_files() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            LoadedModel::load(dir.path()),
            Err(Error::MissingInput { .. })
        ));
    }

    #[test]
    fn test_opaque_layer_cannot_run() {
        let mut model = rgb_model(2);
        model.topology.layers.insert(
            0,
            LayerSpec::Opaque {
                op: "CustomAttention".into(),
                weights: vec![],
                config: serde_json::Value::Null,
            },
        );
        assert!(model.topology.has_opaque_layers());
        assert!(model.num_outputs().is_err());
        assert!(model.predict(&[0.0; 12]).is_err());
    }

    #[test]
    fn test_mismatched_dense_shape_detected() {
        let mut model = rgb_model(2);
        model.topology.weights[0].shape = vec![4, 3];
        assert!(model.topology.output_shape().is_err());
    }

    #[test]
    fn test_layer_json_format() {
        let json = r#"{"type": "dense", "units": 2, "activation": "softmax", "kernel": "k", "bias": "b"}"#;
        let layer: LayerSpec = serde_json::from_str(json).unwrap();
        assert_eq!(layer.kind(), "dense");
        let opaque: LayerSpec = serde_json::from_str(r#"{"type": "opaque", "op": "Lambda"}"#).unwrap();
        assert_eq!(opaque.kind(), "Lambda");
    }
}
