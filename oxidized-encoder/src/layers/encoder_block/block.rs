use std::sync::OnceLock;

use candle_core::{ModuleT, Tensor};
use candle_nn::VarBuilder;
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::{
    Attention, AttentionMask, BuildAttention, SDPAConfig, SelfAttentionConfig,
};
use crate::layers::build_module::BuildModule;
use crate::layers::dropout::DropoutConfig;
use crate::layers::encoder_block::{ConfigurationError, EncoderBlockConfig};
use crate::layers::feedforward::PointwiseFeedForwardConfig;
use crate::layers::layer_norm::LayerNormConfig;

/// Input shape errors.
#[derive(Debug, Snafu)]
pub enum InputShapeError {
    #[snafu(display("Input must not have empty dimensions, was {shape:?}"))]
    EmptyInput { shape: Vec<usize> },

    #[snafu(display("Cannot apply block built for feature dimension {expected} to inputs with feature dimension {got}"))]
    FeatureDimMismatch { expected: usize, got: usize },

    #[snafu(display("Input must have shape (batch_size, seq_len, feature_dim), was {shape:?}"))]
    InputRank { shape: Vec<usize> },

    #[snafu(display("Attention mask must have shape {expected:?}, was {got:?}"))]
    MaskShape { expected: Vec<usize>, got: Vec<usize> },
}

/// Encoder block errors.
#[derive(Debug, Snafu)]
pub enum EncoderBlockError {
    #[snafu(display("Cannot build attention dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot build feed-forward layer"))]
    BuildFeedForward { source: BoxedError },

    #[snafu(display("Cannot build layer normalization"))]
    BuildLayerNorm { source: BoxedError },

    #[snafu(display("Cannot build self-attention layer"))]
    BuildSelfAttention { source: BoxedError },

    #[snafu(display("Invalid encoder block configuration"))]
    Configuration { source: ConfigurationError },

    #[snafu(display("Cannot apply attention dropout"))]
    Dropout { source: candle_core::Error },

    #[snafu(display("Cannot apply point-wise feed-forward layer"))]
    FeedForward { source: candle_core::Error },

    #[snafu(display("Invalid encoder block input"))]
    InputShape { source: InputShapeError },

    #[snafu(display("Cannot apply layer normalization"))]
    LayerNorm { source: candle_core::Error },

    #[snafu(display("Cannot apply residual connection"))]
    Residual { source: candle_core::Error },

    #[snafu(display("Cannot apply self-attention"))]
    SelfAttention { source: BoxedError },
}

/// Build state of an encoder block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildState {
    /// No parameters were allocated yet.
    Unbuilt,

    /// Parameters were allocated for inputs with the given feature
    /// dimension.
    Built { feature_dim: usize },
}

/// Sub-layers of a built encoder block.
struct EncoderBlockLayers {
    feature_dim: usize,
    self_attention: Box<dyn Attention>,
    attention_dropout: Box<dyn ModuleT + Send + Sync>,
    self_attention_layer_norm: Box<dyn ModuleT + Send + Sync>,
    feedforward: Box<dyn ModuleT + Send + Sync>,
    feedforward_layer_norm: Box<dyn ModuleT + Send + Sync>,
}

/// Transformer encoder block.
///
/// The block applies multi-head self-attention followed by a point-wise
/// feed-forward layer. Each sub-layer is wrapped in a residual connection
/// and a layer normalization. By default the residual sums are normalized
/// (post-LN, _Vaswani et al., 2017_). When the configuration sets
/// `normalize_first`, the sub-layer inputs are normalized instead (pre-LN,
/// _Xiong et al., 2020_).
///
/// Parameters are allocated when the block is first built, either through
/// [`EncoderBlock::build`] or on the first call of
/// [`EncoderBlock::forward_t`], since their shapes depend on the feature
/// dimension of the input.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
/// * _Xiong et al., 2020_: https://arxiv.org/abs/2002.04745
pub struct EncoderBlock<'a> {
    config: EncoderBlockConfig,
    layers: OnceLock<EncoderBlockLayers>,
    vb: VarBuilder<'a>,
}

impl<'a> EncoderBlock<'a> {
    /// Construct an encoder block.
    ///
    /// The configuration is validated, but no parameters are allocated.
    ///
    /// * `config` - Block hyperparameters.
    /// * `vb` - Variable builder that parameters are allocated from when
    ///   the block is built.
    pub fn new(config: EncoderBlockConfig, vb: VarBuilder<'a>) -> Result<Self, EncoderBlockError> {
        config.validate().context(ConfigurationSnafu)?;
        Ok(EncoderBlock {
            config,
            layers: OnceLock::new(),
            vb,
        })
    }

    /// Construct a fresh, unbuilt encoder block with the same
    /// hyperparameters as an exported configuration.
    pub fn from_config(
        config: &EncoderBlockConfig,
        vb: VarBuilder<'a>,
    ) -> Result<Self, EncoderBlockError> {
        Self::new(config.clone(), vb)
    }

    /// Block hyperparameters.
    pub fn config(&self) -> &EncoderBlockConfig {
        &self.config
    }

    /// Get the build state of the block.
    pub fn build_state(&self) -> BuildState {
        match self.layers.get() {
            Some(layers) => BuildState::Built {
                feature_dim: layers.feature_dim,
            },
            None => BuildState::Unbuilt,
        }
    }

    /// Allocate the block's parameters for inputs with the given feature
    /// dimension.
    ///
    /// Building an already-built block with the same feature dimension is a
    /// no-op. Building it with a different feature dimension fails.
    pub fn build(&self, feature_dim: usize) -> Result<(), EncoderBlockError> {
        self.layers(feature_dim).map(|_| ())
    }

    fn layers(&self, feature_dim: usize) -> Result<&EncoderBlockLayers, EncoderBlockError> {
        if let Some(layers) = self.layers.get() {
            ensure_feature_dim(layers.feature_dim, feature_dim).context(InputShapeSnafu)?;
            return Ok(layers);
        }

        let layers = self.build_layers(feature_dim)?;
        Ok(self.layers.get_or_init(|| layers))
    }

    fn build_layers(&self, feature_dim: usize) -> Result<EncoderBlockLayers, EncoderBlockError> {
        let config = &self.config;
        let head_width = config
            .validate_feature_dim(feature_dim)
            .context(ConfigurationSnafu)?;

        tracing::debug!(
            prefix = %self.vb.prefix(),
            feature_dim,
            num_heads = config.num_heads,
            head_width,
            intermediate_dim = config.intermediate_dim,
            "Building encoder block"
        );

        let dropout = || -> Box<dyn BuildModule> {
            Box::new(DropoutConfig::default().p(config.dropout))
        };

        let self_attention = SelfAttentionConfig::default()
            .attention_scorer(Box::new(SDPAConfig::default().dropout(dropout())))
            .bias_initializer(config.bias_initializer)
            .hidden_width(feature_dim)
            .kernel_initializer(config.kernel_initializer)
            .n_heads(config.num_heads)
            .build(self.vb.push_prefix("self_attention"))
            .context(BuildSelfAttentionSnafu)?;

        let attention_dropout = dropout()
            .build(self.vb.push_prefix("attention_dropout"))
            .context(BuildDropoutSnafu)?;

        let layer_norm = LayerNormConfig::default()
            .eps(config.layer_norm_epsilon)
            .size(feature_dim);
        let self_attention_layer_norm = layer_norm
            .build(self.vb.push_prefix("self_attention_layer_norm"))
            .context(BuildLayerNormSnafu)?;

        let feedforward = PointwiseFeedForwardConfig::default()
            .activation(Box::new(config.activation))
            .bias_initializer(config.bias_initializer)
            .dropout(dropout())
            .hidden_width(feature_dim)
            .intermediate_width(config.intermediate_dim)
            .kernel_initializer(config.kernel_initializer)
            .build(self.vb.push_prefix("feedforward"))
            .context(BuildFeedForwardSnafu)?;

        let feedforward_layer_norm = layer_norm
            .build(self.vb.push_prefix("feedforward_layer_norm"))
            .context(BuildLayerNormSnafu)?;

        Ok(EncoderBlockLayers {
            feature_dim,
            self_attention,
            attention_dropout,
            self_attention_layer_norm,
            feedforward,
            feedforward_layer_norm,
        })
    }

    /// Apply the encoder block to the given hidden representations.
    ///
    /// The block is built on the first call using the feature dimension of
    /// `input`.
    ///
    /// * `input` - Hidden representations to apply the block to.
    ///   *Shape:* `(batch_size, seq_len, feature_dim)`
    /// * `attention_mask` - Attention mask. Sequence elements for which the
    ///   corresponding mask element is set to `false` are ignored during
    ///   attention calculation. When absent, all elements are attended to.
    ///   *Shape:* `(batch_size, seq_len)`
    /// * `train` - Whether to train the block. Dropout is only applied
    ///   during training.
    ///
    /// Returns the block output.
    /// *Shape:* `(batch_size, seq_len, feature_dim)`
    pub fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<Tensor, EncoderBlockError> {
        let (batch_size, seq_len, feature_dim) =
            check_input(input, attention_mask).context(InputShapeSnafu)?;
        tracing::trace!(batch_size, seq_len, feature_dim, train, "Applying encoder block");

        let layers = self.layers(feature_dim)?;

        if self.config.normalize_first {
            let normalized = layers
                .self_attention_layer_norm
                .forward_t(input, train)
                .context(LayerNormSnafu)?;
            let attn_out = layers.attention(&normalized, attention_mask, train)?;
            let residual = (input + attn_out).context(ResidualSnafu)?;

            let normalized = layers
                .feedforward_layer_norm
                .forward_t(&residual, train)
                .context(LayerNormSnafu)?;
            let ffn_out = layers
                .feedforward
                .forward_t(&normalized, train)
                .context(FeedForwardSnafu)?;
            (residual + ffn_out).context(ResidualSnafu)
        } else {
            let attn_out = layers.attention(input, attention_mask, train)?;
            let residual = (input + attn_out).context(ResidualSnafu)?;
            let residual = layers
                .self_attention_layer_norm
                .forward_t(&residual, train)
                .context(LayerNormSnafu)?;

            let ffn_out = layers
                .feedforward
                .forward_t(&residual, train)
                .context(FeedForwardSnafu)?;
            let residual = (residual + ffn_out).context(ResidualSnafu)?;
            layers
                .feedforward_layer_norm
                .forward_t(&residual, train)
                .context(LayerNormSnafu)
        }
    }

    /// Paths of the block's parameters in the variable store.
    ///
    /// The paths are prefixed with the prefix of the block's variable
    /// builder. They are the same whether or not the block is built.
    pub fn parameter_paths(&self) -> Vec<String> {
        let prefix = self.vb.prefix();
        [
            "self_attention.query",
            "self_attention.key",
            "self_attention.value",
            "self_attention.output",
            "self_attention_layer_norm",
            "feedforward.intermediate",
            "feedforward.output",
            "feedforward_layer_norm",
        ]
        .iter()
        .flat_map(|layer| ["weight", "bias"].map(|param| format!("{layer}.{param}")))
        .map(|path| {
            if prefix.is_empty() {
                path
            } else {
                format!("{prefix}.{path}")
            }
        })
        .collect()
    }
}

impl EncoderBlockLayers {
    /// Self-attention followed by dropout.
    fn attention(
        &self,
        input: &Tensor,
        attention_mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<Tensor, EncoderBlockError> {
        let attn_out = self
            .self_attention
            .forward_t(input, attention_mask, train)
            .context(SelfAttentionSnafu)?;
        self.attention_dropout
            .forward_t(&attn_out, train)
            .context(DropoutSnafu)
    }
}

fn check_input(
    input: &Tensor,
    attention_mask: Option<&AttentionMask>,
) -> Result<(usize, usize, usize), InputShapeError> {
    let dims = input.dims();
    ensure!(
        dims.len() == 3,
        InputRankSnafu {
            shape: dims.to_vec()
        }
    );
    ensure!(
        !dims.contains(&0),
        EmptyInputSnafu {
            shape: dims.to_vec()
        }
    );
    let (batch_size, seq_len, feature_dim) = (dims[0], dims[1], dims[2]);

    if let Some(attention_mask) = attention_mask {
        let mask_dims = attention_mask.bool_mask().dims();
        ensure!(
            mask_dims == [batch_size, seq_len].as_slice(),
            MaskShapeSnafu {
                expected: vec![batch_size, seq_len],
                got: mask_dims.to_vec(),
            }
        );
    }

    Ok((batch_size, seq_len, feature_dim))
}

fn ensure_feature_dim(expected: usize, got: usize) -> Result<(), InputShapeError> {
    ensure!(expected == got, FeatureDimMismatchSnafu { expected, got });
    Ok(())
}
