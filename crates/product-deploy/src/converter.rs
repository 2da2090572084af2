//! Conversion of a trained model into the sharded web format.
//!
//! Two conversion paths exist. The direct path translates the layer graph
//! as-is and refuses anything it cannot express. The interchange path first
//! exports every tensor and op to a neutral representation on disk and
//! builds a graph model from that, carrying unknown ops by name. The
//! interchange path runs only when the direct path failed; both failing is
//! fatal.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use product_core::{ClassSet, ConversionConfig, Error, Result};
use product_training::{LayerSpec, LoadedModel, TrainedModelArtifact, WeightSpec};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::metadata::{ModelMetadata, METADATA_FILE};
use crate::publish::publish;
use crate::quantize::{dequantize_uint8, quantize_uint8, QuantizationParams};
use crate::shard::write_shards;

pub const CONVERTED_DIR: &str = "converted";
pub const WEB_MODEL_DIR: &str = "web_model";
pub const INTERCHANGE_DIR: &str = "interchange";
pub const WEB_MODEL_FILE: &str = "model.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionPathKind {
    Direct,
    Interchange,
}

impl fmt::Display for ConversionPathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionPathKind::Direct => f.write_str("direct"),
            ConversionPathKind::Interchange => f.write_str("interchange"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionErrorKind {
    /// The graph contains an op this path cannot express
    UnsupportedOp,
    /// Tensors disagree with their declared shapes or references
    InvalidWeights,
    Io,
    Serialization,
}

/// Why one conversion path failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionFailure {
    pub path: ConversionPathKind,
    pub kind: ConversionErrorKind,
    pub message: String,
}

impl ConversionFailure {
    pub fn new(path: ConversionPathKind, kind: ConversionErrorKind, message: impl Into<String>) -> Self {
        Self {
            path,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConversionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} path failed ({:?}): {}", self.path, self.kind, self.message)
    }
}

impl std::error::Error for ConversionFailure {}

/// A converted model before quantization and sharding.
#[derive(Debug, Clone)]
pub struct ConvertedGraph {
    /// `layers-model` or `graph-model`
    pub format: String,
    pub path: ConversionPathKind,
    pub topology: serde_json::Value,
    pub input_shape: Vec<usize>,
    pub weights: Vec<(WeightSpec, Vec<f32>)>,
}

/// One way of turning a loaded model into a [`ConvertedGraph`].
pub trait ConversionPath {
    fn kind(&self) -> ConversionPathKind;

    /// `work_dir` is scratch space owned by this conversion.
    fn convert(&self, model: &LoadedModel, work_dir: &Path) -> std::result::Result<ConvertedGraph, ConversionFailure>;
}

fn layer_weight_refs(layer: &LayerSpec) -> Vec<String> {
    match layer {
        LayerSpec::Dense { kernel, bias, .. } => vec![kernel.clone(), bias.clone()],
        LayerSpec::Opaque { weights, .. } => weights.clone(),
        _ => Vec::new(),
    }
}

/// Layer-by-layer translation of the topology.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectConversion;

impl ConversionPath for DirectConversion {
    fn kind(&self) -> ConversionPathKind {
        ConversionPathKind::Direct
    }

    fn convert(&self, model: &LoadedModel, _work_dir: &Path) -> std::result::Result<ConvertedGraph, ConversionFailure> {
        let fail = |kind, message: String| ConversionFailure::new(self.kind(), kind, message);

        if let Some(LayerSpec::Opaque { op, .. }) = model
            .topology
            .layers
            .iter()
            .find(|l| matches!(l, LayerSpec::Opaque { .. }))
        {
            return Err(fail(
                ConversionErrorKind::UnsupportedOp,
                format!("op '{op}' has no layers-model equivalent"),
            ));
        }
        model
            .topology
            .output_shape()
            .map_err(|e| fail(ConversionErrorKind::InvalidWeights, e.to_string()))?;

        let layers = serde_json::to_value(&model.topology.layers)
            .map_err(|e| fail(ConversionErrorKind::Serialization, e.to_string()))?;

        Ok(ConvertedGraph {
            format: "layers-model".to_string(),
            path: self.kind(),
            topology: json!({
                "class_name": "Sequential",
                "architecture": model.topology.architecture,
                "input_shape": model.topology.input_shape,
                "layers": layers,
            }),
            input_shape: model.topology.input_shape.clone(),
            weights: model
                .topology
                .weights
                .iter()
                .cloned()
                .zip(model.tensors.iter().cloned())
                .collect(),
        })
    }
}

/// Tensor as stored in the interchange directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TensorData {
    name: String,
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphNode {
    name: String,
    op: String,
    inputs: Vec<String>,
    weights: Vec<String>,
    attrs: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InterchangeGraph {
    architecture: String,
    input_shape: Vec<usize>,
    nodes: Vec<GraphNode>,
}

/// Export to `graph.json` plus `tensors.json`, then build a graph model
/// from those files.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterchangeConversion;

impl InterchangeConversion {
    const GRAPH_FILE: &'static str = "graph.json";
    const TENSORS_FILE: &'static str = "tensors.json";

    fn export(&self, model: &LoadedModel, dir: &Path) -> std::result::Result<(), ConversionFailure> {
        let io = |e: std::io::Error| ConversionFailure::new(self.kind(), ConversionErrorKind::Io, e.to_string());
        let ser = |e: serde_json::Error| {
            ConversionFailure::new(self.kind(), ConversionErrorKind::Serialization, e.to_string())
        };

        let mut previous = "input".to_string();
        let mut nodes = Vec::with_capacity(model.topology.layers.len());
        for (i, layer) in model.topology.layers.iter().enumerate() {
            let name = format!("node_{i}");
            nodes.push(GraphNode {
                name: name.clone(),
                op: layer.kind().to_string(),
                inputs: vec![previous],
                weights: layer_weight_refs(layer),
                attrs: serde_json::to_value(layer).map_err(ser)?,
            });
            previous = name;
        }
        let graph = InterchangeGraph {
            architecture: model.topology.architecture.clone(),
            input_shape: model.topology.input_shape.clone(),
            nodes,
        };
        let tensors: Vec<TensorData> = model
            .topology
            .weights
            .iter()
            .zip(&model.tensors)
            .map(|(spec, data)| TensorData {
                name: spec.name.clone(),
                shape: spec.shape.clone(),
                data: data.clone(),
            })
            .collect();

        fs::create_dir_all(dir).map_err(io)?;
        fs::write(dir.join(Self::GRAPH_FILE), serde_json::to_string_pretty(&graph).map_err(ser)?).map_err(io)?;
        fs::write(dir.join(Self::TENSORS_FILE), serde_json::to_string(&tensors).map_err(ser)?).map_err(io)?;
        Ok(())
    }

    fn import(&self, dir: &Path) -> std::result::Result<ConvertedGraph, ConversionFailure> {
        let fail = |kind, message: String| ConversionFailure::new(self.kind(), kind, message);
        let read = |file: &str| {
            fs::read_to_string(dir.join(file)).map_err(|e| fail(ConversionErrorKind::Io, e.to_string()))
        };

        let graph: InterchangeGraph = serde_json::from_str(&read(Self::GRAPH_FILE)?)
            .map_err(|e| fail(ConversionErrorKind::Serialization, e.to_string()))?;
        let tensors: Vec<TensorData> = serde_json::from_str(&read(Self::TENSORS_FILE)?)
            .map_err(|e| fail(ConversionErrorKind::Serialization, e.to_string()))?;

        for tensor in &tensors {
            let expected: usize = tensor.shape.iter().product();
            if tensor.data.len() != expected {
                return Err(fail(
                    ConversionErrorKind::InvalidWeights,
                    format!(
                        "tensor '{}' has {} values for shape {:?}",
                        tensor.name,
                        tensor.data.len(),
                        tensor.shape
                    ),
                ));
            }
        }
        for node in &graph.nodes {
            for weight in &node.weights {
                if !tensors.iter().any(|t| &t.name == weight) {
                    return Err(fail(
                        ConversionErrorKind::InvalidWeights,
                        format!("node '{}' ({}) references missing tensor '{weight}'", node.name, node.op),
                    ));
                }
            }
        }

        let topology = serde_json::to_value(&graph)
            .map_err(|e| fail(ConversionErrorKind::Serialization, e.to_string()))?;
        Ok(ConvertedGraph {
            format: "graph-model".to_string(),
            path: self.kind(),
            topology,
            input_shape: graph.input_shape,
            weights: tensors
                .into_iter()
                .map(|t| (WeightSpec::new(t.name, t.shape), t.data))
                .collect(),
        })
    }
}

impl ConversionPath for InterchangeConversion {
    fn kind(&self) -> ConversionPathKind {
        ConversionPathKind::Interchange
    }

    fn convert(&self, model: &LoadedModel, work_dir: &Path) -> std::result::Result<ConvertedGraph, ConversionFailure> {
        self.export(model, work_dir)?;
        self.import(work_dir)
    }
}

/// Entry of the weights manifest in `model.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<QuantizationParams>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightGroup {
    pub paths: Vec<String>,
    pub weights: Vec<WeightEntry>,
}

/// Contents of the web `model.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebModel {
    pub format: String,
    pub generated_by: String,
    pub conversion_path: ConversionPathKind,
    pub model_topology: serde_json::Value,
    pub weights_manifest: Vec<WeightGroup>,
}

impl WebModel {
    pub fn load(dir: &Path) -> Result<Self> {
        product_core::cli::read_json(&dir.join(WEB_MODEL_FILE), "web model")
    }

    /// Reads every shard back and dequantizes the weights.
    pub fn read_weights(&self, dir: &Path) -> Result<Vec<(String, Vec<f32>)>> {
        let mut bytes = Vec::new();
        for group in &self.weights_manifest {
            for path in &group.paths {
                bytes.extend(fs::read(dir.join(path))?);
            }
        }

        let mut offset = 0;
        let mut out = Vec::new();
        for entry in self.weights_manifest.iter().flat_map(|g| &g.weights) {
            let n: usize = entry.shape.iter().product();
            let width = if entry.quantization.is_some() { 1 } else { 4 };
            let end = offset + n * width;
            let chunk = bytes.get(offset..end).ok_or_else(|| {
                Error::InvalidArgument(format!("shards end before weight '{}'", entry.name))
            })?;
            let values = match &entry.quantization {
                Some(params) => dequantize_uint8(chunk, params),
                None => chunk
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            };
            out.push((entry.name.clone(), values));
            offset = end;
        }
        Ok(out)
    }
}

/// Outcome of one conversion path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionAttempt {
    pub path: ConversionPathKind,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ConversionFailure>,
}

/// Result of a successful conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionReport {
    pub path_used: ConversionPathKind,
    pub attempts: Vec<ConversionAttempt>,
    pub output_dir: PathBuf,
    pub shards: Vec<String>,
    pub quantized: bool,
    pub model_json_bytes: u64,
    pub weights_bytes: u64,
    pub total_bytes: u64,
    pub published_to: Option<PathBuf>,
}

impl ConversionReport {
    pub fn size_summary(&self) -> String {
        let mb = |b: u64| b as f64 / (1024.0 * 1024.0);
        format!(
            "model.json {:.2} MB, weights {:.2} MB in {} shard(s), total {:.2} MB",
            mb(self.model_json_bytes),
            mb(self.weights_bytes),
            self.shards.len(),
            mb(self.total_bytes)
        )
    }
}

/// Converts trained artifacts and optionally publishes them.
pub struct ArtifactConverter {
    config: ConversionConfig,
    classes: ClassSet,
    primary: Box<dyn ConversionPath>,
    fallback: Box<dyn ConversionPath>,
}

impl ArtifactConverter {
    pub fn new(config: ConversionConfig, classes: ClassSet) -> Self {
        Self {
            config,
            classes,
            primary: Box::new(DirectConversion),
            fallback: Box::new(InterchangeConversion),
        }
    }

    /// Replaces the conversion paths.
    pub fn with_paths(mut self, primary: Box<dyn ConversionPath>, fallback: Box<dyn ConversionPath>) -> Self {
        self.primary = primary;
        self.fallback = fallback;
        self
    }

    /// Output directory of the web model for `artifact`.
    pub fn web_model_dir(artifact: &TrainedModelArtifact) -> PathBuf {
        artifact.root().join(CONVERTED_DIR).join(WEB_MODEL_DIR)
    }

    /// Converts `artifact` into `<training_dir>/converted/web_model` and
    /// publishes it when a publish directory is configured.
    pub fn convert(&self, artifact: &TrainedModelArtifact) -> Result<ConversionReport> {
        artifact.verify_classes(&self.classes)?;
        let model = artifact.load_model()?;

        let converted_dir = artifact.root().join(CONVERTED_DIR);
        if converted_dir.exists() {
            fs::remove_dir_all(&converted_dir)?;
        }
        let web_dir = converted_dir.join(WEB_MODEL_DIR);
        let work_dir = converted_dir.join(INTERCHANGE_DIR);

        let mut attempts = Vec::with_capacity(2);
        let graph = match self.primary.convert(&model, &work_dir) {
            Ok(graph) => graph,
            Err(first) => {
                warn!(error = %first, "Primary conversion failed, trying {}", self.fallback.kind());
                attempts.push(ConversionAttempt {
                    path: first.path,
                    succeeded: false,
                    failure: Some(first.clone()),
                });
                match self.fallback.convert(&model, &work_dir) {
                    Ok(graph) => graph,
                    Err(second) => {
                        return Err(Error::ConversionFallbackExhausted {
                            direct: first.to_string(),
                            interchange: second.to_string(),
                        })
                    }
                }
            }
        };
        attempts.push(ConversionAttempt {
            path: graph.path,
            succeeded: true,
            failure: None,
        });
        info!(path = %graph.path, format = %graph.format, "Model converted");

        let (model_json_bytes, weights_bytes, shards) = self.write_web_model(&graph, &web_dir)?;

        let metadata = ModelMetadata::new(
            &self.classes,
            graph.input_shape.clone(),
            artifact.record(),
            &graph.format,
            graph.path,
            self.config.quantize,
        );
        metadata.save(&web_dir)?;
        let metadata_bytes = fs::metadata(web_dir.join(METADATA_FILE))?.len();

        let mut report = ConversionReport {
            path_used: graph.path,
            attempts,
            output_dir: web_dir.clone(),
            shards,
            quantized: self.config.quantize,
            model_json_bytes,
            weights_bytes,
            total_bytes: model_json_bytes + weights_bytes + metadata_bytes,
            published_to: None,
        };
        info!(summary = %report.size_summary(), "Web model written");

        if let Some(public_dir) = &self.config.publish_dir {
            report.published_to = Some(publish(&web_dir, public_dir)?);
        }
        Ok(report)
    }

    /// Quantizes, shards and writes `model.json`. Returns the byte sizes of
    /// the model file and the weights, and the shard names.
    fn write_web_model(&self, graph: &ConvertedGraph, dir: &Path) -> Result<(u64, u64, Vec<String>)> {
        fs::create_dir_all(dir)?;

        let mut buffer = Vec::new();
        let mut entries = Vec::with_capacity(graph.weights.len());
        for (spec, data) in &graph.weights {
            let quantization = if self.config.quantize {
                let (bytes, params) = quantize_uint8(data);
                buffer.extend_from_slice(&bytes);
                Some(params)
            } else {
                buffer.extend(data.iter().flat_map(|v| v.to_le_bytes()));
                None
            };
            entries.push(WeightEntry {
                name: spec.name.clone(),
                shape: spec.shape.clone(),
                dtype: "float32".to_string(),
                quantization,
            });
        }

        let shards = write_shards(&buffer, self.config.shard_size_bytes, dir)?;
        let web_model = WebModel {
            format: graph.format.clone(),
            generated_by: format!("product-deploy {}", env!("CARGO_PKG_VERSION")),
            conversion_path: graph.path,
            model_topology: graph.topology.clone(),
            weights_manifest: vec![WeightGroup {
                paths: shards.clone(),
                weights: entries,
            }],
        };
        let json = serde_json::to_string(&web_model)?;
        fs::write(dir.join(WEB_MODEL_FILE), &json)?;

        Ok((json.len() as u64, buffer.len() as u64, shards))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use product_core::TrainingParams;
    use product_training::artifact::FINAL_MODEL_DIR;
    use product_training::model::linear_probe;
    use product_training::TrainingRecord;
    use tempfile::TempDir;

    fn classes() -> ClassSet {
        ClassSet::new(["a", "b", "c"]).unwrap()
    }

    fn artifact_with(root: &Path, model: &LoadedModel, classes: &ClassSet) -> TrainedModelArtifact {
        model.save(&root.join(FINAL_MODEL_DIR)).unwrap();
        let params = TrainingParams {
            input_size: 4,
            ..TrainingParams::default()
        };
        let record = TrainingRecord::new(classes, &params, 10, 3, Utc::now());
        TrainedModelArtifact::write_record(root, &record).unwrap();
        TrainedModelArtifact::open(root).unwrap()
    }

    fn probe() -> LoadedModel {
        let kernel: Vec<f32> = (0..9).map(|i| i as f32 / 10.0 - 0.4).collect();
        linear_probe(4, kernel, vec![0.1, -0.2, 0.3]).unwrap()
    }

    fn with_opaque(mut model: LoadedModel, weights: Vec<String>) -> LoadedModel {
        model.topology.layers.insert(
            0,
            LayerSpec::Opaque {
                op: "RandomAugmentLayer".into(),
                weights,
                config: serde_json::Value::Null,
            },
        );
        model
    }

    fn converter(publish_dir: Option<PathBuf>) -> ArtifactConverter {
        ArtifactConverter::new(
            ConversionConfig {
                quantize: true,
                shard_size_bytes: 5,
                publish_dir,
            },
            classes(),
        )
    }

    #[test]
    fn test_direct_conversion_layout() {
        let dir = TempDir::new().unwrap();
        let artifact = artifact_with(dir.path(), &probe(), &classes());
        let report = converter(None).convert(&artifact).unwrap();

        assert_eq!(report.path_used, ConversionPathKind::Direct);
        assert_eq!(report.attempts.len(), 1);
        // 9 + 3 quantized bytes in 5-byte shards
        assert_eq!(report.shards, vec![
            "group1-shard1of3.bin",
            "group1-shard2of3.bin",
            "group1-shard3of3.bin"
        ]);
        let web = &report.output_dir;
        assert!(web.join(WEB_MODEL_FILE).exists());
        assert!(web.join(METADATA_FILE).exists());

        let metadata: ModelMetadata =
            serde_json::from_str(&fs::read_to_string(web.join(METADATA_FILE)).unwrap()).unwrap();
        assert_eq!(metadata.model_config.classes, vec!["a", "b", "c"]);
        assert_eq!(metadata.model_config.input_shape, vec![4, 4, 3]);
        assert_eq!(metadata.model_config.preprocessing.resize, [4, 4]);
        assert!((metadata.model_config.preprocessing.rescale - 1.0 / 255.0).abs() < 1e-9);
    }

    #[test]
    fn test_quantized_weights_read_back() {
        let dir = TempDir::new().unwrap();
        let model = probe();
        let artifact = artifact_with(dir.path(), &model, &classes());
        let report = converter(None).convert(&artifact).unwrap();

        let web = WebModel::load(&report.output_dir).unwrap();
        let weights = web.read_weights(&report.output_dir).unwrap();
        assert_eq!(weights.len(), 2);
        for ((name, restored), original) in weights.iter().zip(&model.tensors) {
            let step = web.weights_manifest[0]
                .weights
                .iter()
                .find(|w| &w.name == name)
                .and_then(|w| w.quantization.as_ref())
                .unwrap()
                .scale;
            for (a, b) in restored.iter().zip(original) {
                assert!((a - b).abs() <= step / 2.0 + 1e-5);
            }
        }
    }

    #[test]
    fn test_unquantized_weights_exact() {
        let dir = TempDir::new().unwrap();
        let model = probe();
        let artifact = artifact_with(dir.path(), &model, &classes());
        let converter = ArtifactConverter::new(
            ConversionConfig {
                quantize: false,
                publish_dir: None,
                ..ConversionConfig::default()
            },
            classes(),
        );
        let report = converter.convert(&artifact).unwrap();
        assert_eq!(report.weights_bytes, 12 * 4);
        let web = WebModel::load(&report.output_dir).unwrap();
        let weights = web.read_weights(&report.output_dir).unwrap();
        assert_eq!(weights[0].1, model.tensors[0]);
    }

    #[test]
    fn test_unsupported_op_falls_back_to_interchange() {
        let dir = TempDir::new().unwrap();
        let artifact = artifact_with(dir.path(), &with_opaque(probe(), vec![]), &classes());
        let report = converter(None).convert(&artifact).unwrap();

        assert_eq!(report.path_used, ConversionPathKind::Interchange);
        assert_eq!(report.attempts.len(), 2);
        let first = report.attempts[0].failure.as_ref().unwrap();
        assert_eq!(first.kind, ConversionErrorKind::UnsupportedOp);
        assert!(dir.path().join("converted/interchange/graph.json").exists());

        let web = WebModel::load(&report.output_dir).unwrap();
        assert_eq!(web.format, "graph-model");
        assert_eq!(web.model_topology["nodes"][0]["op"], "RandomAugmentLayer");
    }

    #[test]
    fn test_both_paths_failing_is_fatal() {
        let dir = TempDir::new().unwrap();
        let model = with_opaque(probe(), vec!["missing/tensor".into()]);
        let artifact = artifact_with(dir.path(), &model, &classes());
        let err = converter(None).convert(&artifact).unwrap_err();
        assert!(matches!(err, Error::ConversionFallbackExhausted { .. }));
    }

    struct Failing(ConversionPathKind);

    impl ConversionPath for Failing {
        fn kind(&self) -> ConversionPathKind {
            self.0
        }

        fn convert(&self, _: &LoadedModel, _: &Path) -> std::result::Result<ConvertedGraph, ConversionFailure> {
            Err(ConversionFailure::new(self.0, ConversionErrorKind::Io, "boom"))
        }
    }

    #[test]
    fn test_fallback_only_runs_after_primary_failure() {
        let dir = TempDir::new().unwrap();
        let artifact = artifact_with(dir.path(), &probe(), &classes());

        // A failing fallback is never consulted when the primary succeeds
        let report = converter(None)
            .with_paths(
                Box::new(DirectConversion),
                Box::new(Failing(ConversionPathKind::Interchange)),
            )
            .convert(&artifact)
            .unwrap();
        assert_eq!(report.path_used, ConversionPathKind::Direct);

        let report = converter(None)
            .with_paths(
                Box::new(Failing(ConversionPathKind::Direct)),
                Box::new(InterchangeConversion),
            )
            .convert(&artifact)
            .unwrap();
        assert_eq!(report.path_used, ConversionPathKind::Interchange);
    }

    #[test]
    fn test_class_order_mismatch() {
        let dir = TempDir::new().unwrap();
        let trained = ClassSet::new(["c", "b", "a"]).unwrap();
        let artifact = artifact_with(dir.path(), &probe(), &trained);
        let err = converter(None).convert(&artifact).unwrap_err();
        assert!(matches!(err, Error::ClassOrderMismatch { .. }));
    }

    #[test]
    fn test_convert_and_publish() {
        let dir = TempDir::new().unwrap();
        let artifact = artifact_with(&dir.path().join("run"), &probe(), &classes());
        let public = dir.path().join("public");
        let report = converter(Some(public.clone())).convert(&artifact).unwrap();

        let published = report.published_to.as_ref().unwrap();
        assert_eq!(published, &public.join("ml-model"));
        assert!(published.join(WEB_MODEL_FILE).exists());
        assert!(published.join(METADATA_FILE).exists());
        assert!(report.size_summary().contains("MB"));
    }
}
