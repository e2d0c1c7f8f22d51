use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{ensure, ResultExt, Snafu};

use crate::layers::activation::Activation;
use crate::layers::initializer::Initializer;

/// Encoder block configuration errors.
#[derive(Debug, Snafu)]
pub enum ConfigurationError {
    #[snafu(display("Cannot deserialize encoder block configuration"))]
    Deserialize { source: serde_json::Error },

    #[snafu(display("Dropout rate must be in [0, 1), was {dropout}"))]
    DropoutRate { dropout: f32 },

    #[snafu(display(
        "Number of heads ({num_heads}) must divide the feature dimension ({feature_dim})"
    ))]
    IndivisibleHeads { feature_dim: usize, num_heads: usize },

    #[snafu(display("Intermediate dimension must be positive"))]
    IntermediateDim,

    #[snafu(display("Layer norm epsilon must be positive, was {epsilon}"))]
    LayerNormEpsilon { epsilon: f64 },

    #[snafu(display("Number of heads must be positive"))]
    NumHeads,

    #[snafu(display("Cannot serialize encoder block configuration"))]
    Serialize { source: serde_json::Error },

    #[snafu(display("Feature dimension must be positive"))]
    ZeroFeatureDim,
}

fn default_dropout() -> f32 {
    0.0
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_kernel_initializer() -> Initializer {
    Initializer::GlorotUniform
}

fn default_bias_initializer() -> Initializer {
    Initializer::Zeros
}

/// Encoder block configuration.
///
/// Serializes to a flat record with the keys `intermediate_dim`,
/// `num_heads`, `dropout`, `activation`, `layer_norm_epsilon`,
/// `kernel_initializer`, `bias_initializer` and `normalize_first`. All keys
/// but `intermediate_dim` and `num_heads` are optional when deserializing.
/// Unknown keys are rejected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncoderBlockConfig {
    pub(crate) intermediate_dim: usize,

    pub(crate) num_heads: usize,

    #[serde(default = "default_dropout")]
    pub(crate) dropout: f32,

    #[serde(default)]
    pub(crate) activation: Activation,

    #[serde(default = "default_layer_norm_epsilon")]
    pub(crate) layer_norm_epsilon: f64,

    #[serde(default = "default_kernel_initializer")]
    pub(crate) kernel_initializer: Initializer,

    #[serde(default = "default_bias_initializer")]
    pub(crate) bias_initializer: Initializer,

    #[serde(default)]
    pub(crate) normalize_first: bool,
}

impl EncoderBlockConfig {
    /// Create a configuration with the given feed-forward width and number
    /// of attention heads. Other hyperparameters take their defaults.
    pub fn new(intermediate_dim: usize, num_heads: usize) -> Self {
        EncoderBlockConfig {
            intermediate_dim,
            num_heads,
            dropout: default_dropout(),
            activation: Activation::default(),
            layer_norm_epsilon: default_layer_norm_epsilon(),
            kernel_initializer: default_kernel_initializer(),
            bias_initializer: default_bias_initializer(),
            normalize_first: false,
        }
    }

    /// Activation of the feed-forward layer.
    ///
    /// Default: `Activation::Relu`
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Initializer of the biases.
    ///
    /// Default: `Initializer::Zeros`
    pub fn bias_initializer(mut self, bias_initializer: Initializer) -> Self {
        self.bias_initializer = bias_initializer;
        self
    }

    /// Dropout rate, applied to the attention weights, the attention output
    /// and the feed-forward output.
    ///
    /// Default: `0.0`
    pub fn dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Initializer of the projection matrices.
    ///
    /// Default: `Initializer::GlorotUniform`
    pub fn kernel_initializer(mut self, kernel_initializer: Initializer) -> Self {
        self.kernel_initializer = kernel_initializer;
        self
    }

    /// Epsilon of the layer normalizations.
    ///
    /// Default: `1e-5`
    pub fn layer_norm_epsilon(mut self, layer_norm_epsilon: f64) -> Self {
        self.layer_norm_epsilon = layer_norm_epsilon;
        self
    }

    /// Normalize the inputs of the sub-layers rather than the residual sums
    /// (pre-LN).
    ///
    /// Default: `false`
    pub fn normalize_first(mut self, normalize_first: bool) -> Self {
        self.normalize_first = normalize_first;
        self
    }

    /// Check the hyperparameters that do not depend on the input shape.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        ensure!(self.intermediate_dim > 0, IntermediateDimSnafu);
        ensure!(self.num_heads > 0, NumHeadsSnafu);
        ensure!(
            (0.0..1.0).contains(&self.dropout),
            DropoutRateSnafu {
                dropout: self.dropout
            }
        );
        ensure!(
            self.layer_norm_epsilon > 0.0,
            LayerNormEpsilonSnafu {
                epsilon: self.layer_norm_epsilon
            }
        );
        Ok(())
    }

    /// Check that the configuration can be built for inputs with the given
    /// feature dimension.
    ///
    /// Returns the width of an attention head.
    pub fn validate_feature_dim(&self, feature_dim: usize) -> Result<usize, ConfigurationError> {
        ensure!(feature_dim > 0, ZeroFeatureDimSnafu);
        ensure!(
            feature_dim % self.num_heads == 0,
            IndivisibleHeadsSnafu {
                feature_dim,
                num_heads: self.num_heads
            }
        );
        Ok(feature_dim / self.num_heads)
    }

    /// Export the configuration as a JSON record.
    pub fn to_json_value(&self) -> Result<Value, ConfigurationError> {
        serde_json::to_value(self).context(SerializeSnafu)
    }

    /// Read and validate a configuration from a JSON record.
    pub fn from_json_value(value: Value) -> Result<Self, ConfigurationError> {
        let config: EncoderBlockConfig =
            serde_json::from_value(value).context(DeserializeSnafu)?;
        config.validate()?;
        Ok(config)
    }
}
