use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{ensure, ResultExt, Snafu};

use crate::checkpoint::{CheckpointError, ParameterCheckpoint};
use crate::layers::attention::AttentionMask;
use crate::layers::dense::{Dense, DenseConfig, DenseError};
use crate::layers::encoder_block::{EncoderBlock, EncoderBlockConfig, EncoderBlockError};

/// Version of the model directory layout.
pub const FORMAT_VERSION: u32 = 1;

/// Name of the model configuration file in a model directory.
pub const CONFIG_FILENAME: &str = "config.json";

/// Name of the parameter file in a model directory.
pub const PARAMETERS_FILENAME: &str = "model.safetensors";

/// Sequential model errors.
#[derive(Debug, Snafu)]
pub enum SequentialModelError {
    #[snafu(display("Cannot create model configuration file: {path:?}"))]
    CreateConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot create model directory: {path:?}"))]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot construct encoder block"))]
    Encoder { source: EncoderBlockError },

    #[snafu(display("Cannot construct dense head"))]
    Head { source: DenseError },

    #[snafu(display("Cannot load model parameters"))]
    LoadParameters { source: CheckpointError },

    #[snafu(display("Cannot open model configuration: {path:?}"))]
    OpenConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Cannot parse model configuration: {path:?}"))]
    ParseConfig {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Cannot save model parameters"))]
    SaveParameters { source: CheckpointError },

    #[snafu(display("Model expects sequences of length {expected}, got {got}"))]
    SequenceLength { expected: usize, got: usize },

    #[snafu(display("Unsupported model format version {version}, expected {FORMAT_VERSION}"))]
    UnsupportedVersion { version: u32 },

    #[snafu(display("Cannot write model configuration: {path:?}"))]
    WriteConfig {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Shape of a single model input, without the batch dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputShape {
    /// Sequence length, `None` for variable-length inputs.
    #[serde(default)]
    pub seq_len: Option<usize>,

    /// Width of the sequence elements.
    pub feature_dim: usize,
}

impl InputShape {
    pub fn new(seq_len: Option<usize>, feature_dim: usize) -> Self {
        InputShape {
            seq_len,
            feature_dim,
        }
    }
}

/// Sequential model configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SequentialModelConfig {
    input_shape: InputShape,

    encoder: EncoderBlockConfig,

    #[serde(default)]
    head: Option<DenseConfig>,
}

impl SequentialModelConfig {
    /// Configuration of a model that applies an encoder block to inputs
    /// of the given shape.
    pub fn new(input_shape: InputShape, encoder: EncoderBlockConfig) -> Self {
        SequentialModelConfig {
            input_shape,
            encoder,
            head: None,
        }
    }

    /// Dense layer applied to the encoder output.
    ///
    /// Default: `None`
    pub fn head(mut self, head: Option<DenseConfig>) -> Self {
        self.head = head;
        self
    }

    /// Shape of the model inputs.
    pub fn input_shape(&self) -> InputShape {
        self.input_shape
    }
}

#[derive(Serialize)]
struct ManifestRef<'a> {
    format_version: u32,
    model: &'a SequentialModelConfig,
}

#[derive(Deserialize)]
struct Manifest {
    format_version: u32,
    model: Value,
}

/// Encoder block with an optional dense head.
///
/// The model owns the variable store of its parameters. The encoder
/// parameters are stored under the `encoder` prefix, the head parameters
/// under the `head` prefix. A model is persisted as a directory with the
/// configuration (`config.json`) and the parameters (`model.safetensors`).
pub struct SequentialModel {
    config: SequentialModelConfig,
    encoder: EncoderBlock<'static>,
    head: Option<Dense>,
    var_map: VarMap,
}

impl SequentialModel {
    /// Construct a model with freshly-initialized parameters.
    ///
    /// The encoder block is built eagerly for the configured feature
    /// dimension.
    pub fn new(config: SequentialModelConfig, device: &Device) -> Result<Self, SequentialModelError> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let feature_dim = config.input_shape.feature_dim;

        let encoder = EncoderBlock::new(config.encoder.clone(), vb.push_prefix("encoder"))
            .context(EncoderSnafu)?;
        encoder.build(feature_dim).context(EncoderSnafu)?;

        let head = config
            .head
            .as_ref()
            .map(|head| head.build(feature_dim, vb.push_prefix("head")))
            .transpose()
            .context(HeadSnafu)?;

        Ok(SequentialModel {
            config,
            encoder,
            head,
            var_map,
        })
    }

    /// Model configuration.
    pub fn config(&self) -> &SequentialModelConfig {
        &self.config
    }

    /// The encoder block of the model.
    pub fn encoder(&self) -> &EncoderBlock<'static> {
        &self.encoder
    }

    /// Apply the model.
    ///
    /// * `input` - Input sequences.
    ///   *Shape:* `(batch_size, seq_len, feature_dim)`
    /// * `attention_mask` - Attention mask of the encoder block.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Whether to train the model.
    ///
    /// Returns the encoder output, or the head output when the model has a
    /// head.
    /// *Shape:* `(batch_size, seq_len, feature_dim)` or
    /// `(batch_size, seq_len, units)`
    pub fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<Tensor, SequentialModelError> {
        if let (Some(expected), &[_, got, _]) = (self.config.input_shape.seq_len, input.dims()) {
            ensure!(expected == got, SequenceLengthSnafu { expected, got });
        }

        let output = self
            .encoder
            .forward_t(input, attention_mask, train)
            .context(EncoderSnafu)?;

        match &self.head {
            Some(head) => head.forward(&output).context(HeadSnafu),
            None => Ok(output),
        }
    }

    /// Trainable parameters of the model.
    pub fn trainable_variables(&self) -> Vec<Var> {
        self.var_map.all_vars()
    }

    /// Variable store that holds the model parameters.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Save the model to a directory.
    ///
    /// The directory is created if it does not exist. Existing model files
    /// in the directory are overwritten.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<(), SequentialModelError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).context(CreateDirectorySnafu { path: dir })?;

        let config_path = dir.join(CONFIG_FILENAME);
        let config_file = File::create(&config_path).context(CreateConfigSnafu {
            path: config_path.clone(),
        })?;
        serde_json::to_writer_pretty(
            BufWriter::new(config_file),
            &ManifestRef {
                format_version: FORMAT_VERSION,
                model: &self.config,
            },
        )
        .context(WriteConfigSnafu { path: &config_path })?;

        self.var_map
            .save_checkpoint(dir.join(PARAMETERS_FILENAME))
            .context(SaveParametersSnafu)?;

        tracing::info!(path = %dir.display(), "Saved model");

        Ok(())
    }

    /// Load a model from a directory written by [`SequentialModel::save`].
    ///
    /// * `dir` - Model directory.
    /// * `device` - Device to place the parameters on.
    pub fn load(dir: impl AsRef<Path>, device: &Device) -> Result<Self, SequentialModelError> {
        let dir = dir.as_ref();
        let config_path = dir.join(CONFIG_FILENAME);
        let config_file = File::open(&config_path).context(OpenConfigSnafu {
            path: config_path.clone(),
        })?;
        let manifest: Manifest = serde_json::from_reader(BufReader::new(config_file))
            .context(ParseConfigSnafu { path: &config_path })?;
        ensure!(
            manifest.format_version == FORMAT_VERSION,
            UnsupportedVersionSnafu {
                version: manifest.format_version
            }
        );
        let config: SequentialModelConfig = serde_json::from_value(manifest.model)
            .context(ParseConfigSnafu { path: &config_path })?;

        let model = Self::new(config, device)?;
        model
            .var_map
            .restore_checkpoint(dir.join(PARAMETERS_FILENAME))
            .context(LoadParametersSnafu)?;

        tracing::info!(path = %dir.display(), "Loaded model");

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use candle_core::{Device, IndexOp, Tensor};
    use candle_nn::{AdamW, Optimizer, ParamsAdamW};
    use serde_json::json;
    use snafu::{report, ResultExt, Whatever};
    use tempfile::TempDir;

    use super::{
        InputShape, SequentialModel, SequentialModelConfig, SequentialModelError, CONFIG_FILENAME,
    };
    use crate::checkpoint::CheckpointError;
    use crate::layers::activation::Activation;
    use crate::layers::dense::DenseConfig;
    use crate::layers::encoder_block::EncoderBlockConfig;
    use crate::ops::loss::binary_cross_entropy;
    use crate::util::tests::{abs_diff_sum, assert_tensor_eq, PseudoRandom};

    fn encoder_model_config() -> SequentialModelConfig {
        SequentialModelConfig::new(InputShape::new(Some(4), 6), EncoderBlockConfig::new(4, 2))
    }

    fn classifier_config() -> SequentialModelConfig {
        encoder_model_config().head(Some(DenseConfig::new(1).activation(Some(Activation::Sigmoid))))
    }

    #[test]
    #[report]
    fn saved_model_reproduces_outputs() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let model = SequentialModel::new(encoder_model_config(), &device)
            .whatever_context("Cannot construct model")?;
        let data = Tensor::pseudo_random((2, 4, 6), 1, &device);
        let output = model
            .forward_t(&data, None, false)
            .whatever_context("Cannot apply model")?;

        let dir = TempDir::new().whatever_context("Cannot create directory")?;
        let path = dir.path().join("model");
        model.save(&path).whatever_context("Cannot save model")?;
        let loaded = SequentialModel::load(&path, &device).whatever_context("Cannot load model")?;

        assert_eq!(loaded.config(), model.config());
        let loaded_output = loaded
            .forward_t(&data, None, false)
            .whatever_context("Cannot apply model")?;
        assert_tensor_eq!(output, loaded_output, epsilon = 1e-6);

        Ok(())
    }

    #[test]
    fn saved_config_has_format_version() {
        let dir = TempDir::new().unwrap();
        let model = SequentialModel::new(classifier_config(), &Device::Cpu).unwrap();
        model.save(dir.path()).unwrap();

        let config: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(CONFIG_FILENAME)).unwrap())
                .unwrap();
        assert_eq!(config["format_version"], json!(1));
        assert_eq!(config["model"]["input_shape"], json!({"seq_len": 4, "feature_dim": 6}));
        assert_eq!(config["model"]["encoder"]["num_heads"], json!(2));
        assert_eq!(config["model"]["head"]["activation"], json!("sigmoid"));
    }

    #[test]
    fn load_rejects_unsupported_version() {
        let dir = TempDir::new().unwrap();
        let model = SequentialModel::new(encoder_model_config(), &Device::Cpu).unwrap();
        model.save(dir.path()).unwrap();

        let config_path = dir.path().join(CONFIG_FILENAME);
        let mut config: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
        config["format_version"] = json!(2);
        fs::write(&config_path, config.to_string()).unwrap();

        assert!(matches!(
            SequentialModel::load(dir.path(), &Device::Cpu),
            Err(SequentialModelError::UnsupportedVersion { version: 2 })
        ));
    }

    #[test]
    fn load_rejects_parameters_of_other_architecture() {
        let dir = TempDir::new().unwrap();
        let model = SequentialModel::new(classifier_config(), &Device::Cpu).unwrap();
        model.save(dir.path()).unwrap();

        // Replace the configuration by one without a head.
        let other = SequentialModel::new(encoder_model_config(), &Device::Cpu).unwrap();
        let other_dir = TempDir::new().unwrap();
        other.save(other_dir.path()).unwrap();
        fs::copy(
            other_dir.path().join(CONFIG_FILENAME),
            dir.path().join(CONFIG_FILENAME),
        )
        .unwrap();

        assert!(matches!(
            SequentialModel::load(dir.path(), &Device::Cpu),
            Err(SequentialModelError::LoadParameters {
                source: CheckpointError::UnknownParameters { .. }
            })
        ));
    }

    #[test]
    fn load_fails_without_directory() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SequentialModel::load(dir.path().join("missing"), &Device::Cpu),
            Err(SequentialModelError::OpenConfig { .. })
        ));
    }

    #[test]
    fn model_checks_sequence_length() {
        let model = SequentialModel::new(encoder_model_config(), &Device::Cpu).unwrap();
        let data = Tensor::pseudo_random((2, 5, 6), 2, &Device::Cpu);
        assert!(matches!(
            model.forward_t(&data, None, false),
            Err(SequentialModelError::SequenceLength {
                expected: 4,
                got: 5
            })
        ));

        let model = SequentialModel::new(
            SequentialModelConfig::new(InputShape::new(None, 6), EncoderBlockConfig::new(4, 2)),
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(
            model.forward_t(&data, None, false).unwrap().dims(),
            &[2, 5, 6]
        );
    }

    #[test]
    fn model_rejects_invalid_encoder_config() {
        let config = SequentialModelConfig::new(
            InputShape::new(Some(4), 6),
            EncoderBlockConfig::new(4, 4),
        );
        assert!(matches!(
            SequentialModel::new(config, &Device::Cpu),
            Err(SequentialModelError::Encoder { .. })
        ));
    }

    #[test]
    #[report]
    fn one_training_step_updates_parameters() -> Result<(), Whatever> {
        let device = Device::Cpu;
        let model = SequentialModel::new(classifier_config(), &device)
            .whatever_context("Cannot construct model")?;

        let data = Tensor::pseudo_random((2, 4, 6), 3, &device);
        let labels = data
            .i((.., .., 0))
            .and_then(|xs| xs.ge(0.5))
            .whatever_context("Cannot create labels")?;

        let predictions = model
            .forward_t(&data, None, true)
            .whatever_context("Cannot apply model")?
            .squeeze(2)
            .whatever_context("Cannot squeeze predictions")?;
        let loss =
            binary_cross_entropy(&predictions, &labels).whatever_context("Cannot compute loss")?;
        let grads = loss.backward().whatever_context("Cannot compute gradients")?;

        let vars = model.trainable_variables();
        let n_nonzero = vars
            .iter()
            .filter_map(|var| grads.get(var.as_tensor()))
            .filter(|grad| {
                grad.abs()
                    .and_then(|grad| grad.sum_all())
                    .and_then(|sum| sum.to_scalar::<f32>())
                    .map(|sum| sum > 0.)
                    .unwrap_or(false)
            })
            .count();
        assert!(n_nonzero > 1, "Only {n_nonzero} parameters have a gradient");

        let before = model
            .var_map()
            .data()
            .lock()
            .unwrap()["head.weight"]
            .as_tensor()
            .copy()
            .whatever_context("Cannot copy weight")?;
        let mut optimizer = AdamW::new(vars, ParamsAdamW::default())
            .whatever_context("Cannot construct optimizer")?;
        optimizer
            .step(&grads)
            .whatever_context("Cannot apply optimizer step")?;

        let after = model.var_map().data().lock().unwrap()["head.weight"]
            .as_tensor()
            .clone();
        assert!(abs_diff_sum(&before, &after) > 0.);

        Ok(())
    }
}
