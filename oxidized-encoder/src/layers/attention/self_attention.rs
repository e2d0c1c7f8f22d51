use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};
use snafu::{ensure, ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::attention::{
    Attention, AttentionMask, AttentionScorer, BuildAttention, BuildAttentionScorer, SDPAConfig,
};
use crate::layers::dense::linear_with_init;
use crate::layers::initializer::Initializer;

/// Self-attention configuration.
#[derive(Debug)]
pub struct SelfAttentionConfig {
    attention_scorer: Box<dyn BuildAttentionScorer>,
    bias_initializer: Initializer,
    hidden_width: usize,
    kernel_initializer: Initializer,
    n_heads: usize,
    use_bias: bool,
}

impl SelfAttentionConfig {
    /// Attention scorer.
    ///
    /// Default: `SDPAConfig::default()`
    pub fn attention_scorer(mut self, attention_scorer: Box<dyn BuildAttentionScorer>) -> Self {
        self.attention_scorer = attention_scorer;
        self
    }

    /// Initializer of the projection biases.
    ///
    /// Default: `Initializer::Zeros`
    pub fn bias_initializer(mut self, bias_initializer: Initializer) -> Self {
        self.bias_initializer = bias_initializer;
        self
    }

    /// Hidden width, the width of the input and output.
    ///
    /// Default: `768`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Initializer of the projection matrices.
    ///
    /// Default: `Initializer::GlorotUniform`
    pub fn kernel_initializer(mut self, kernel_initializer: Initializer) -> Self {
        self.kernel_initializer = kernel_initializer;
        self
    }

    /// Number of attention heads.
    ///
    /// Must divide the hidden width.
    ///
    /// Default: `12`
    pub fn n_heads(mut self, n_heads: usize) -> Self {
        self.n_heads = n_heads;
        self
    }

    /// Use bias in the query, key, value and output projections.
    ///
    /// Default: `true`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }
}

impl Default for SelfAttentionConfig {
    fn default() -> Self {
        Self {
            attention_scorer: Box::<SDPAConfig>::default(),
            bias_initializer: Initializer::Zeros,
            hidden_width: 768,
            kernel_initializer: Initializer::GlorotUniform,
            n_heads: 12,
            use_bias: true,
        }
    }
}

impl BuildAttention for SelfAttentionConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn Attention>, BoxedError> {
        let hidden_width = self.hidden_width;
        let n_heads = self.n_heads;
        ensure!(
            n_heads > 0 && hidden_width % n_heads == 0,
            IndivisibleHeadsSnafu {
                hidden_width,
                n_heads
            }
        );

        let linear = |name: &str| {
            linear_with_init(
                hidden_width,
                hidden_width,
                self.use_bias,
                self.kernel_initializer,
                self.bias_initializer,
                vb.push_prefix(name),
            )
            .context(SelfAttentionConstructionSnafu)
        };

        Ok(Box::new(SelfAttention {
            attention_scorer: self
                .attention_scorer
                .build(vb.clone())
                .context(BuildAttentionScorerSnafu)?,
            key: linear("key")?,
            n_heads,
            output: linear("output")?,
            query: linear("query")?,
            value: linear("value")?,
        }))
    }
}

/// Errors for self-attention.
#[derive(Debug, Snafu)]
pub enum SelfAttentionError {
    #[snafu(display("Cannot apply attention scorer"))]
    AttentionScorer { source: BoxedError },

    #[snafu(display("Cannot build attention scorer"))]
    BuildAttentionScorer { source: BoxedError },

    #[snafu(display("Cannot combine heads"))]
    CombineHeads { source: candle_core::Error },

    #[snafu(display(
        "Number of heads ({n_heads}) must divide the hidden width ({hidden_width})"
    ))]
    IndivisibleHeads { hidden_width: usize, n_heads: usize },

    #[snafu(display("Cannot apply output layer"))]
    Output { source: candle_core::Error },

    #[snafu(display("Cannot calculate key, query, or value"))]
    Qkv { source: candle_core::Error },

    #[snafu(display("Cannot construct layer"))]
    SelfAttentionConstruction { source: candle_core::Error },

    #[snafu(display("Cannot split heads"))]
    SplitHeads { source: candle_core::Error },
}

/// Transformer self-attention layer.
///
/// Queries, keys and values are separate projections of the input. Their
/// outputs are split into `n_heads` heads of width
/// `hidden_width / n_heads`, scored, and projected back to the hidden
/// width.
///
/// See [Vaswani et al., 2017](https://arxiv.org/abs/1706.03762).
pub struct SelfAttention {
    attention_scorer: Box<dyn AttentionScorer>,
    key: Linear,
    n_heads: usize,
    output: Linear,
    query: Linear,
    value: Linear,
}

impl Attention for SelfAttention {
    fn forward_t(
        &self,
        input: &Tensor,
        attention_mask: Option<&AttentionMask>,
        train: bool,
    ) -> Result<Tensor, BoxedError> {
        let project = |linear: &Linear| {
            linear
                .forward(input)
                .context(QkvSnafu)?
                .split_heads(self.n_heads)
        };
        let query = project(&self.query)?;
        let key = project(&self.key)?;
        let value = project(&self.value)?;

        let attn = self
            .attention_scorer
            .forward(&query, &key, &value, attention_mask, train)
            .context(AttentionScorerSnafu)?
            .combine_heads()?;

        self.output.forward(&attn).context(OutputSnafu).boxed()
    }
}

trait CombineHeads {
    fn combine_heads(&self) -> Result<Tensor, SelfAttentionError>;
}

impl CombineHeads for Tensor {
    fn combine_heads(&self) -> Result<Tensor, SelfAttentionError> {
        let (batch_size, n_heads, seq_len, head_width) =
            self.dims4().context(CombineHeadsSnafu)?;
        self.transpose(1, 2)
            .and_then(|heads| heads.reshape((batch_size, seq_len, n_heads * head_width)))
            .context(CombineHeadsSnafu)
    }
}

trait SplitHeads {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, SelfAttentionError>;
}

impl SplitHeads for Tensor {
    fn split_heads(&self, n_heads: usize) -> Result<Tensor, SelfAttentionError> {
        let (batch_size, seq_len, hidden_width) = self.dims3().context(SplitHeadsSnafu)?;
        let head_width = hidden_width / n_heads;
        self.reshape((batch_size, seq_len, n_heads, head_width))
            .and_then(|heads| heads.transpose(1, 2))
            .context(SplitHeadsSnafu)
    }
}
