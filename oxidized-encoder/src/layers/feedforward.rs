use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{Linear, VarBuilder};
use snafu::{ResultExt, Snafu};

use crate::error::BoxedError;
use crate::layers::activation::Activation;
use crate::layers::build_module::BuildModule;
use crate::layers::dense::linear_with_init;
use crate::layers::identity::Identity;
use crate::layers::initializer::Initializer;

/// Pointwise feed-forward layer configuration.
#[derive(Debug)]
pub struct PointwiseFeedForwardConfig {
    activation: Box<dyn BuildModule>,
    bias_initializer: Initializer,
    dropout: Box<dyn BuildModule>,
    hidden_width: usize,
    intermediate_width: usize,
    kernel_initializer: Initializer,
    use_bias: bool,
}

impl PointwiseFeedForwardConfig {
    /// Activation function.
    ///
    /// Default: `Activation::Relu`
    pub fn activation(mut self, activation: Box<dyn BuildModule>) -> Self {
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

    /// Dropout to apply after the layer.
    ///
    /// Default: `Identity`
    pub fn dropout(mut self, dropout: Box<dyn BuildModule>) -> Self {
        self.dropout = dropout;
        self
    }

    /// Hidden width, the width of the input and output.
    ///
    /// Default: `768`
    pub fn hidden_width(mut self, hidden_width: usize) -> Self {
        self.hidden_width = hidden_width;
        self
    }

    /// Intermediate width.
    ///
    /// Default: `3072`
    pub fn intermediate_width(mut self, intermediate_width: usize) -> Self {
        self.intermediate_width = intermediate_width;
        self
    }

    /// Initializer of the weight matrices.
    ///
    /// Default: `Initializer::GlorotUniform`
    pub fn kernel_initializer(mut self, kernel_initializer: Initializer) -> Self {
        self.kernel_initializer = kernel_initializer;
        self
    }

    /// Use bias in linear layers.
    ///
    /// Default: `true`
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }
}

impl Default for PointwiseFeedForwardConfig {
    fn default() -> Self {
        Self {
            activation: Box::new(Activation::Relu),
            bias_initializer: Initializer::Zeros,
            dropout: Box::new(Identity),
            hidden_width: 768,
            intermediate_width: 3072,
            kernel_initializer: Initializer::GlorotUniform,
            use_bias: true,
        }
    }
}

impl BuildModule for PointwiseFeedForwardConfig {
    fn build(&self, vb: VarBuilder) -> Result<Box<dyn ModuleT + Send + Sync>, BoxedError> {
        let linear = |input_width: usize, output_width: usize, name: &str| {
            linear_with_init(
                input_width,
                output_width,
                self.use_bias,
                self.kernel_initializer,
                self.bias_initializer,
                vb.push_prefix(name),
            )
            .context(ConstructionSnafu)
        };

        Ok(Box::new(PointwiseFeedForward {
            activation: self
                .activation
                .build(vb.push_prefix("activation"))
                .context(BuildActivationSnafu)?,
            dropout: self
                .dropout
                .build(vb.push_prefix("dropout"))
                .context(BuildDropoutSnafu)?,
            intermediate: linear(self.hidden_width, self.intermediate_width, "intermediate")?,
            output: linear(self.intermediate_width, self.hidden_width, "output")?,
        }))
    }
}

/// Pointwise feed-forward layer errors.
#[derive(Debug, Snafu)]
pub enum PointwiseFeedForwardError {
    #[snafu(display("Cannot build activation"))]
    BuildActivation { source: BoxedError },

    #[snafu(display("Cannot build dropout"))]
    BuildDropout { source: BoxedError },

    #[snafu(display("Cannot construct linear layer"))]
    Construction { source: candle_core::Error },
}

/// Point-wise feed-forward layer (_Vaswani et al., 2017_).
///
/// This layer is applied pointwise, meaning that the same
/// transformation is applied to each sequence element. This
/// transformation is:
///
/// `g(xW_1 + b_1)W_2 + b_2`
///
/// `W_1` and `b_1` transform the input to an
/// intermediate width, `g` is a non-linear activation
/// function and `W_2` and `b_2` transform the
/// output of the activation back to the input width.
///
/// * _Vaswani et al., 2017_: https://arxiv.org/abs/1706.03762
pub struct PointwiseFeedForward {
    activation: Box<dyn ModuleT + Send + Sync>,
    dropout: Box<dyn ModuleT + Send + Sync>,
    intermediate: Linear,
    output: Linear,
}

impl ModuleT for PointwiseFeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor, candle_core::Error> {
        let intermediate = self.intermediate.forward(xs)?;
        let output = self
            .output
            .forward(&self.activation.forward_t(&intermediate, train)?)?;
        self.dropout.forward_t(&output, train)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, ModuleT, Tensor};
    use candle_nn::{VarBuilder, VarMap};
    use ndarray::array;

    use super::PointwiseFeedForwardConfig;
    use crate::layers::activation::Activation;
    use crate::layers::build_module::BuildModule;
    use crate::layers::initializer::Initializer;
    use crate::util::tests::assert_tensor_eq;

    #[test]
    fn feedforward_maps_back_to_hidden_width() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        let ffn = PointwiseFeedForwardConfig::default()
            .hidden_width(6)
            .intermediate_width(4)
            .build(vb.push_prefix("feedforward"))
            .unwrap();

        let xs = Tensor::ones((2, 4, 6), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(ffn.forward_t(&xs, false).unwrap().dims(), &[2, 4, 6]);

        let data = var_map.data().lock().unwrap();
        assert_eq!(data["feedforward.intermediate.weight"].dims(), &[4, 6]);
        assert_eq!(data["feedforward.intermediate.bias"].dims(), &[4]);
        assert_eq!(data["feedforward.output.weight"].dims(), &[6, 4]);
        assert_eq!(data["feedforward.output.bias"].dims(), &[6]);
        assert_eq!(data.len(), 4);
    }

    #[test]
    fn feedforward_applies_activation_between_projections() {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        // With all-one weights and no bias: relu(sum(x)) * 2 per unit.
        let ffn = PointwiseFeedForwardConfig::default()
            .activation(Box::new(Activation::Relu))
            .hidden_width(2)
            .intermediate_width(2)
            .kernel_initializer(Initializer::Ones)
            .use_bias(false)
            .build(vb)
            .unwrap();

        let xs = Tensor::new(&[[1f32, 2.], [-1., -2.]], &Device::Cpu).unwrap();
        assert_tensor_eq!(
            ffn.forward_t(&xs, false).unwrap(),
            array![[6f32, 6.], [0., 0.]]
        );
    }
}
